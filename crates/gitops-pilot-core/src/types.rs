//! Domain types for gitops-pilot
//!
//! These types describe one controller installation run: what to install,
//! where, with which credentials, and what happened.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Manifest installed when no `--install-manifest` is given
pub const DEFAULT_MANIFEST_URL: &str =
    "https://raw.githubusercontent.com/codefresh-io/argo-cd/stable/manifests/install.yaml";

/// Namespace used when none is given
pub const DEFAULT_NAMESPACE: &str = "argocd";

/// Administrative Argo CD user
pub const DEFAULT_ARGO_USERNAME: &str = "admin";

/// A string that must not show up in logs or debug output
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the underlying value. Call sites are the only places the
    /// secret leaves this wrapper.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret(***)")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Where the install manifest comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    /// `http://` or `https://` location, fetched with a GET
    Url(String),
    /// Local file
    Path(PathBuf),
}

impl ManifestSource {
    /// Classify a user supplied location by its scheme
    pub fn parse(location: &str) -> Self {
        if location.starts_with("http://") || location.starts_with("https://") {
            ManifestSource::Url(location.to_string())
        } else {
            ManifestSource::Path(PathBuf::from(location))
        }
    }
}

impl Default for ManifestSource {
    fn default() -> Self {
        ManifestSource::Url(DEFAULT_MANIFEST_URL.to_string())
    }
}

impl std::fmt::Display for ManifestSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManifestSource::Url(url) => write!(f, "{}", url),
            ManifestSource::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Target cluster for a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeTarget {
    /// Kubeconfig context, `None` means current-context
    pub context: Option<String>,
    pub namespace: String,
    /// Kubeconfig file, `None` means inferred
    pub config_path: Option<PathBuf>,
    /// Running from inside the target cluster
    pub in_cluster: bool,
}

impl Default for KubeTarget {
    fn default() -> Self {
        Self {
            context: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            config_path: None,
            in_cluster: false,
        }
    }
}

/// External account (Codefresh) API credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSettings {
    pub host: String,
    pub token: Secret,
}

/// Desired Argo CD administrative login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgoSettings {
    pub username: String,
    /// Password the autogenerated one is rotated to
    pub password: Secret,
}

/// Which importable clusters to register with Argo CD
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterSelection {
    All,
    Ids(Vec<String>),
}

impl ClusterSelection {
    pub fn includes(&self, id: &str) -> bool {
        match self {
            ClusterSelection::All => true,
            ClusterSelection::Ids(ids) => ids.iter().any(|i| i == id),
        }
    }
}

/// What a failing cluster import does to the rest of the batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ImportPolicy {
    /// First failure aborts the run
    #[default]
    FailFast,
    /// Record the failure and move on to the next cluster
    Continue,
}

impl std::str::FromStr for ImportPolicy {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail-fast" => Ok(ImportPolicy::FailFast),
            "continue" => Ok(ImportPolicy::Continue),
            other => Err(PlanError::Invalid(format!(
                "unknown cluster import policy \"{}\" (expected fail-fast or continue)",
                other
            ))),
        }
    }
}

/// Confirmed cluster import step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterImport {
    pub selection: ClusterSelection,
    pub policy: ImportPolicy,
}

/// Confirmed git repository registration step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitRegistration {
    /// Integration context name, `None` means pick the only one available
    pub integration: Option<String>,
    /// Repository to register, registration is skipped without it
    pub repo_url: Option<String>,
    /// Explicit repository username
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxySettings {
    pub http: Option<String>,
    pub https: Option<String>,
}

/// Fully resolved configuration for one install run.
///
/// Built once from flags and answers, then only read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationPlan {
    pub kube: KubeTarget,
    pub manifest: ManifestSource,
    /// Template values for manifest documents, empty means verbatim
    pub manifest_values: BTreeMap<String, String>,
    pub argo: ArgoSettings,
    pub account: Option<AccountSettings>,
    pub expose_load_balancer: bool,
    pub clusters: Option<ClusterImport>,
    pub git: Option<GitRegistration>,
    pub create_default_app: bool,
    pub proxy: ProxySettings,
    pub agent_version: Option<String>,
    /// Overall cap on the initial token exchange retries
    pub token_timeout: Option<Duration>,
}

impl InstallationPlan {
    /// Check the plan is complete enough to start executing steps
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.kube.namespace.trim().is_empty() {
            return Err(PlanError::Missing("kubernetes namespace"));
        }
        if self.argo.username.trim().is_empty() {
            return Err(PlanError::Missing("argo username"));
        }
        if self.argo.password.is_empty() {
            return Err(PlanError::Missing("argo password"));
        }
        if (self.clusters.is_some() || self.git.is_some()) && self.account.is_none() {
            return Err(PlanError::Invalid(
                "cluster or git integration requires codefresh credentials".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolved configuration for an update or uninstall run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenancePlan {
    pub kube: KubeTarget,
    /// Objects to delete on uninstall
    pub manifest: ManifestSource,
    pub manifest_values: BTreeMap<String, String>,
    pub account: Option<AccountSettings>,
    pub agent_version: Option<String>,
}

impl MaintenancePlan {
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.kube.namespace.trim().is_empty() {
            return Err(PlanError::Missing("kubernetes namespace"));
        }
        Ok(())
    }
}

/// Problems with a plan detected before any step runs
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("Missing required value: {0}")]
    Missing(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Externally reachable Argo CD address.
///
/// Only constructed from a non-empty hostname or IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint(String);

impl ServiceEndpoint {
    /// Pick the ingress hostname if present, else the IP
    pub fn from_ingress(hostname: Option<&str>, ip: Option<&str>) -> Option<Self> {
        fn pick(v: Option<&str>) -> Option<&str> {
            v.map(str::trim).filter(|s| !s.is_empty())
        }
        pick(hostname)
            .or_else(|| pick(ip))
            .map(|host| ServiceEndpoint(format!("https://{}", host)))
    }

    /// Base URL including the `https://` scheme
    pub fn url(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Argo CD login after bootstrap: rotated password and the token derived
/// from it. Lives in memory only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgoCredential {
    pub username: String,
    pub password: Secret,
    pub token: Secret,
}

/// Thing an integration step tried to register
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrationTarget {
    Cluster(String),
    Repository(String),
}

impl std::fmt::Display for IntegrationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrationTarget::Cluster(id) => write!(f, "cluster \"{}\"", id),
            IntegrationTarget::Repository(url) => write!(f, "repository \"{}\"", url),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrationResult {
    Registered(IntegrationTarget),
    Failed {
        target: IntegrationTarget,
        reason: String,
    },
}

impl IntegrationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, IntegrationResult::Registered(_))
    }

    pub fn target(&self) -> &IntegrationTarget {
        match self {
            IntegrationResult::Registered(target) => target,
            IntegrationResult::Failed { target, .. } => target,
        }
    }
}

/// Which workflow emitted an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Install,
    Update,
    Uninstall,
}

impl Phase {
    /// Event type understood by the account event endpoint
    pub fn event_type(&self) -> &'static str {
        match self {
            Phase::Install => "CONTROLLER_INSTALL",
            Phase::Update => "CONTROLLER_UPDATE",
            Phase::Uninstall => "CONTROLLER_UNINSTALL",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Install => write!(f, "install"),
            Phase::Update => write!(f, "update"),
            Phase::Uninstall => write!(f, "uninstall"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "failed")]
    Fail,
}

/// Terminal report of a run, sent exactly once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallationEvent {
    pub phase: Phase,
    pub outcome: Outcome,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl InstallationEvent {
    pub fn success(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            outcome: Outcome::Success,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn failure(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            outcome: Outcome::Fail,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}
