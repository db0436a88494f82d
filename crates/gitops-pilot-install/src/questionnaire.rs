//! Questionnaire
//!
//! Turns command line flags plus answers to prompts into a finished plan.
//! All user interaction happens here, before any workflow step runs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use gitops_pilot_core::{
    AccountSettings, ArgoSettings, ClusterImport, ClusterSelection, DEFAULT_ARGO_USERNAME,
    DEFAULT_NAMESPACE, GitRegistration, ImportPolicy, InstallationPlan, KubeTarget,
    MaintenancePlan, ManifestSource, ProxySettings, Secret,
};
use inquire::{Confirm, MultiSelect, Password, Select, Text};
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::account::{AccountApi, filter_importable};
use crate::cluster::{kubeconfig_path, list_contexts};
use crate::error::ConfigError;

/// Repository suggested when asking for a manifest repo
pub const EXAMPLE_REPO_URL: &str = "https://github.com/argoproj/argocd-example-apps";

/// Source of answers
#[cfg_attr(test, automock)]
pub trait Prompter: Send + Sync {
    fn confirm(&self, message: &str, default: bool) -> Result<bool, ConfigError>;

    fn select(&self, message: &str, options: Vec<String>) -> Result<String, ConfigError>;

    fn multi_select(&self, message: &str, options: Vec<String>) -> Result<Vec<String>, ConfigError>;

    fn text(&self, message: &str, default: &str) -> Result<String, ConfigError>;

    fn password(&self, message: &str) -> Result<String, ConfigError>;
}

/// Terminal prompts
#[derive(Debug, Default, Clone)]
pub struct InquirePrompter;

impl Prompter for InquirePrompter {
    fn confirm(&self, message: &str, default: bool) -> Result<bool, ConfigError> {
        Ok(Confirm::new(message).with_default(default).prompt()?)
    }

    fn select(&self, message: &str, options: Vec<String>) -> Result<String, ConfigError> {
        Ok(Select::new(message, options).prompt()?)
    }

    fn multi_select(
        &self,
        message: &str,
        options: Vec<String>,
    ) -> Result<Vec<String>, ConfigError> {
        Ok(MultiSelect::new(message, options).prompt()?)
    }

    fn text(&self, message: &str, default: &str) -> Result<String, ConfigError> {
        Ok(Text::new(message).with_default(default).prompt()?)
    }

    fn password(&self, message: &str) -> Result<String, ConfigError> {
        Ok(Password::new(message).prompt()?)
    }
}

/// Answers every question with its default and refuses the rest
#[derive(Debug, Default, Clone)]
pub struct NonInteractive;

impl Prompter for NonInteractive {
    fn confirm(&self, _message: &str, default: bool) -> Result<bool, ConfigError> {
        Ok(default)
    }

    fn select(&self, message: &str, _options: Vec<String>) -> Result<String, ConfigError> {
        Err(ConfigError::Missing(message.to_string()))
    }

    fn multi_select(
        &self,
        message: &str,
        _options: Vec<String>,
    ) -> Result<Vec<String>, ConfigError> {
        Err(ConfigError::Missing(message.to_string()))
    }

    fn text(&self, _message: &str, default: &str) -> Result<String, ConfigError> {
        Ok(default.to_string())
    }

    fn password(&self, message: &str) -> Result<String, ConfigError> {
        Err(ConfigError::Missing(message.to_string()))
    }
}

/// Kubernetes flags shared by every command
#[derive(Debug, Clone, Default)]
pub struct KubeFlags {
    pub namespace: Option<String>,
    pub context: Option<String>,
    pub kubeconfig: Option<PathBuf>,
    pub in_cluster: bool,
}

/// Raw `install` flags
#[derive(Debug, Clone, Default)]
pub struct InstallFlags {
    pub kube: KubeFlags,
    pub manifest: Option<String>,
    pub manifest_values: BTreeMap<String, String>,
    pub argo_username: Option<String>,
    pub argo_password: Option<String>,
    pub clusters: Vec<String>,
    pub git_integration: Option<String>,
    pub git_repo_url: Option<String>,
    pub git_username: Option<String>,
    pub proxy: ProxySettings,
    /// `None` asks
    pub load_balancer: Option<bool>,
    pub import_policy: ImportPolicy,
    pub token_timeout: Option<Duration>,
    pub skip_default_app: bool,
    pub agent_version: Option<String>,
}

impl InstallFlags {
    /// Any flag that only makes sense with an account
    fn requests_integration(&self) -> bool {
        !self.clusters.is_empty()
            || [&self.git_integration, &self.git_repo_url, &self.git_username]
                .into_iter()
                .any(|flag| flag.as_deref().is_some_and(|v| !v.is_empty()))
    }
}

/// Raw `update` and `uninstall` flags
#[derive(Debug, Clone, Default)]
pub struct MaintenanceFlags {
    pub kube: KubeFlags,
    pub manifest: Option<String>,
    pub manifest_values: BTreeMap<String, String>,
    pub agent_version: Option<String>,
}

fn ask_kube_target(flags: &KubeFlags, prompter: &dyn Prompter) -> Result<KubeTarget, ConfigError> {
    let mut context = flags.context.clone().filter(|c| !c.is_empty());

    if context.is_none() && !flags.in_cluster {
        let contexts = kubeconfig_path(flags.kubeconfig.as_deref())
            .and_then(|path| list_contexts(&path).ok())
            .unwrap_or_default();
        if contexts.len() > 1 {
            match prompter.select("Select Kubernetes context", contexts) {
                Ok(selected) => context = Some(selected),
                // current-context when nobody answers
                Err(ConfigError::Missing(_)) => {}
                Err(e) => return Err(e),
            }
        }
    }

    let namespace = match flags.namespace.clone().filter(|n| !n.is_empty()) {
        Some(ns) => ns,
        None => prompter.text("Kubernetes namespace to install into", DEFAULT_NAMESPACE)?,
    };

    Ok(KubeTarget {
        context,
        namespace,
        config_path: flags.kubeconfig.clone(),
        in_cluster: flags.in_cluster,
    })
}

fn manifest_source(location: Option<&str>) -> ManifestSource {
    location
        .filter(|l| !l.is_empty())
        .map(ManifestSource::parse)
        .unwrap_or_default()
}

/// Resolve the install plan.
///
/// `account_api` is used to offer clusters and git integrations; without
/// it those integrations are only configured from flags.
pub async fn build_install_plan(
    flags: InstallFlags,
    account: Option<AccountSettings>,
    account_api: Option<&dyn AccountApi>,
    prompter: &dyn Prompter,
) -> Result<InstallationPlan, ConfigError> {
    let kube = ask_kube_target(&flags.kube, prompter)?;
    let wants_integration = flags.requests_integration();

    let expose_load_balancer = match flags.load_balancer {
        Some(value) => value,
        None => prompter.confirm("Expose argocd server with a LoadBalancer service?", true)?,
    };

    let password = match flags.argo_password.filter(|p| !p.is_empty()) {
        Some(password) => password,
        None => prompter.password("New password for the argocd admin user")?,
    };
    if password.is_empty() {
        return Err(ConfigError::Missing("argo password".to_string()));
    }

    let (clusters, git) = match (&account, account_api) {
        (Some(_), Some(api)) => {
            let clusters = ask_clusters(&flags.clusters, flags.import_policy, api, prompter).await?;
            let git = ask_git(
                flags.git_integration,
                flags.git_repo_url,
                flags.git_username,
                api,
                prompter,
            )
            .await?;
            (clusters, git)
        }
        _ if wants_integration => {
            return Err(ConfigError::Missing(
                "codefresh account (host and token) for cluster or git integration".to_string(),
            ));
        }
        _ => (None, None),
    };

    Ok(InstallationPlan {
        kube,
        manifest: manifest_source(flags.manifest.as_deref()),
        manifest_values: flags.manifest_values,
        argo: ArgoSettings {
            username: flags
                .argo_username
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| DEFAULT_ARGO_USERNAME.to_string()),
            password: Secret::new(password),
        },
        account,
        expose_load_balancer,
        clusters,
        git,
        create_default_app: !flags.skip_default_app,
        proxy: flags.proxy,
        agent_version: flags.agent_version,
        token_timeout: flags.token_timeout,
    })
}

async fn ask_clusters(
    selected: &[String],
    policy: ImportPolicy,
    api: &dyn AccountApi,
    prompter: &dyn Prompter,
) -> Result<Option<ClusterImport>, ConfigError> {
    if !selected.is_empty() {
        return Ok(Some(ClusterImport {
            selection: ClusterSelection::Ids(selected.to_vec()),
            policy,
        }));
    }

    if !prompter.confirm(
        "Would you like to integrate clusters from your account to ArgoCD?",
        false,
    )? {
        return Ok(None);
    }

    let candidates = api
        .list_clusters()
        .await
        .map_err(|e| ConfigError::Invalid(format!("can't list account clusters: {}", e)))?;
    let selectors: Vec<String> = filter_importable(candidates)
        .into_iter()
        .map(|c| c.selector)
        .collect();
    if selectors.is_empty() {
        info!("no importable clusters in the account");
        return Ok(None);
    }

    let chosen = prompter.multi_select("Select clusters to import", selectors)?;
    if chosen.is_empty() {
        return Ok(None);
    }
    Ok(Some(ClusterImport {
        selection: ClusterSelection::Ids(chosen),
        policy,
    }))
}

async fn ask_git(
    integration: Option<String>,
    repo_url: Option<String>,
    username: Option<String>,
    api: &dyn AccountApi,
    prompter: &dyn Prompter,
) -> Result<Option<GitRegistration>, ConfigError> {
    let integration = integration.filter(|i| !i.is_empty());
    let repo_url = repo_url.filter(|r| !r.is_empty());

    if integration.is_none() && repo_url.is_none()
        && !prompter.confirm(
            "Would you like to integrate git context for manifest repo from your account to ArgoCD?",
            false,
        )?
    {
        return Ok(None);
    }

    let integration = match integration {
        Some(name) => Some(name),
        None => {
            let contexts = api
                .git_contexts()
                .await
                .map_err(|e| ConfigError::Invalid(format!("can't list git contexts: {}", e)))?;
            let names: Vec<String> = contexts.into_iter().map(|c| c.name).collect();
            match names.len() {
                0 => {
                    info!("no git integrations in the account");
                    return Ok(None);
                }
                1 => names.into_iter().next(),
                _ => Some(prompter.select("Select Git context", names)?),
            }
        }
    };

    let repo_url = match repo_url {
        Some(url) => url,
        None => prompter.text(
            "Please specify url to your manifest repository to add to ArgoCD",
            EXAMPLE_REPO_URL,
        )?,
    };

    Ok(Some(GitRegistration {
        integration,
        repo_url: Some(repo_url).filter(|u| !u.is_empty()),
        username: username.filter(|u| !u.is_empty()),
    }))
}

/// Resolve the plan for `update` and `uninstall`
pub fn build_maintenance_plan(
    flags: MaintenanceFlags,
    account: Option<AccountSettings>,
    prompter: &dyn Prompter,
) -> Result<MaintenancePlan, ConfigError> {
    Ok(MaintenancePlan {
        kube: ask_kube_target(&flags.kube, prompter)?,
        manifest: manifest_source(flags.manifest.as_deref()),
        manifest_values: flags.manifest_values,
        account,
        agent_version: flags.agent_version,
    })
}

/// Parse repeated `KEY=VALUE` flags
pub fn parse_manifest_values(pairs: &[String]) -> Result<BTreeMap<String, String>, ConfigError> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.to_string()))
            }
            _ => Err(ConfigError::Invalid(format!(
                "manifest value \"{}\" is not KEY=VALUE",
                pair
            ))),
        })
        .collect()
}
