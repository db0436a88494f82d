//! Error types for the installation workflows
//!
//! Collaborator errors (`KubeError`, `AccountError`, ...) describe what went
//! wrong in one remote call. `InstallError` is the taxonomy the workflows
//! speak, and `RunError` pairs it with the step that failed so the event
//! sink and the CLI get a human readable phase label.

use argocd_rs::ArgoError;
use gitops_pilot_core::{IntegrationTarget, PlanError};
use std::time::Duration;
use thiserror::Error;

/// Error type for cluster operations
#[derive(Debug, Error)]
pub enum KubeError {
    #[error("Failed to read kubeconfig {path}: {reason}")]
    Kubeconfig { path: String, reason: String },

    #[error("Failed to create K8s client: {0}")]
    ClientCreate(String),

    #[error("{kind} \"{name}\" already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("{kind} \"{name}\" not found")]
    NotFound { kind: String, name: String },

    #[error("Unable to resolve resource type {api_version}/{kind}: {reason}")]
    UnknownKind {
        api_version: String,
        kind: String,
        reason: String,
    },

    #[error("Invalid object {kind} \"{name}\": {reason}")]
    InvalidObject {
        kind: String,
        name: String,
        reason: String,
    },

    #[error("No service matches selector {0}")]
    ServiceNotFound(String),

    #[error("Secret {namespace}/{name} has no usable key {key}")]
    SecretKeyMissing {
        namespace: String,
        name: String,
        key: String,
    },

    #[error("K8s API error: {0}")]
    Api(#[from] kube::Error),
}

impl KubeError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, KubeError::AlreadyExists { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, KubeError::NotFound { .. })
    }

    /// Map an API error for a named object, pulling out the two outcomes
    /// callers treat as non-fatal.
    pub fn for_object(err: kube::Error, kind: &str, name: &str) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.reason == "AlreadyExists" || resp.code == 409 => {
                KubeError::AlreadyExists {
                    kind: kind.to_string(),
                    name: name.to_string(),
                }
            }
            kube::Error::Api(resp) if resp.reason == "NotFound" || resp.code == 404 => {
                KubeError::NotFound {
                    kind: kind.to_string(),
                    name: name.to_string(),
                }
            }
            _ => KubeError::Api(err),
        }
    }
}

/// Errors from the external account API
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid account host {host}: {reason}")]
    InvalidHost { host: String, reason: String },

    #[error("Account API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to decode account response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Errors resolving configuration and answers into a plan
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Context not found: {0}")]
    ContextNotFound(String),

    #[error("Could not determine home directory")]
    NoHomeDirectory,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Missing required value: {0}")]
    Missing(String),

    #[error("Invalid value: {0}")]
    Invalid(String),

    #[error("Prompt failed: {0}")]
    Prompt(String),
}

impl From<inquire::InquireError> for ConfigError {
    fn from(err: inquire::InquireError) -> Self {
        ConfigError::Prompt(err.to_string())
    }
}

/// Errors from the external agent installer program
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} {command} exited with {code}: {stderr}")]
    Failed {
        program: String,
        command: String,
        code: String,
        stderr: String,
    },
}

/// Errors delivering an event
#[derive(Debug, Error)]
pub enum EventError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Event endpoint returned {0}")]
    Status(u16),
}

/// Everything a workflow step can fail with
#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("{0}")]
    ClusterConnect(#[source] KubeError),

    #[error("Failed to read manifest {location}: {reason}")]
    ManifestFetch { location: String, reason: String },

    #[error("Failed to decode {template}: {reason}")]
    ManifestDecode { template: String, reason: String },

    #[error("{kind} \"{name}\" failed: {source}")]
    ResourceApply {
        kind: String,
        name: String,
        #[source]
        source: KubeError,
    },

    #[error(transparent)]
    Kube(#[from] KubeError),

    #[error(
        "Failed to retrieve argocd host after {}s ({attempts} attempts): {last}",
        .elapsed.as_secs()
    )]
    HostDiscoveryTimeout {
        elapsed: Duration,
        attempts: u32,
        last: String,
    },

    #[error("Failed to get argocd token after {attempts} attempt(s): {source}")]
    CredentialExchange {
        attempts: u32,
        #[source]
        source: ArgoError,
    },

    #[error("Failed to update admin password: {0}")]
    PasswordRotation(#[source] ArgoError),

    #[error("{target}: {reason}")]
    Integration {
        target: IntegrationTarget,
        reason: String,
    },

    #[error(transparent)]
    Account(#[from] AccountError),

    #[error(transparent)]
    Argo(#[from] ArgoError),

    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// Workflow steps, named the way failures are reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    ValidatePlan,
    ConnectCluster,
    CreateNamespace(String),
    CreateResources,
    ExposeLoadBalancer,
    RetrieveHost,
    AutogeneratedPassword,
    ObtainToken,
    RotatePassword,
    ListClusters,
    ImportClusters,
    ListGitContexts,
    RegisterRepository,
    CreateDefaultApp,
    InstallAgent,
    UpdateAgent,
    DeleteResources,
    UninstallAgent,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::ValidatePlan => write!(f, "Invalid installation plan"),
            Step::ConnectCluster => write!(f, "Can't create kube client"),
            Step::CreateNamespace(ns) => write!(f, "Can't create namespace {}", ns),
            Step::CreateResources => write!(f, "Can't create argocd resources"),
            Step::ExposeLoadBalancer => write!(f, "Can't expose argocd server"),
            Step::RetrieveHost => write!(f, "Can't retrieve argo host"),
            Step::AutogeneratedPassword => write!(f, "Can't get autogenerated password"),
            Step::ObtainToken => write!(f, "Can't get argo token"),
            Step::RotatePassword => write!(f, "Can't update user pass"),
            Step::ListClusters => write!(f, "Can't get argocd clusters"),
            Step::ImportClusters => write!(f, "Can't import clusters"),
            Step::ListGitContexts => write!(f, "Can't get git contexts"),
            Step::RegisterRepository => write!(f, "Can't manage access to git repo"),
            Step::CreateDefaultApp => write!(f, "Can't create default app"),
            Step::InstallAgent => write!(f, "Can't install argocd agent"),
            Step::UpdateAgent => write!(f, "Can't update argocd agent"),
            Step::DeleteResources => write!(f, "Can't delete kube objects"),
            Step::UninstallAgent => write!(f, "Can't uninstall argocd agent"),
        }
    }
}

/// A mandatory step failed and the run stopped
#[derive(Debug, Error)]
#[error("{step}: \"{source}\"")]
pub struct RunError {
    pub step: Step,
    #[source]
    pub source: InstallError,
}

impl RunError {
    pub fn new(step: Step, source: impl Into<InstallError>) -> Self {
        Self {
            step,
            source: source.into(),
        }
    }
}

/// Attach the failing step to an error
pub trait StepContext<T> {
    fn step(self, step: Step) -> Result<T, RunError>;
}

impl<T, E: Into<InstallError>> StepContext<T> for Result<T, E> {
    fn step(self, step: Step) -> Result<T, RunError> {
        self.map_err(|e| RunError::new(step, e))
    }
}
