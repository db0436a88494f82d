//! Agent installer
//!
//! The Argo CD agent is installed by an external program. Flags carry
//! non-secret settings only; tokens and passwords travel through the
//! child's environment.

use async_trait::async_trait;
use gitops_pilot_core::{
    ArgoCredential, InstallationPlan, KubeTarget, MaintenancePlan, ProxySettings, Secret,
    ServiceEndpoint,
};
use tokio::process::Command;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::error::AgentError;

/// Program run when `--agent-installer` is not given
pub const DEFAULT_AGENT_INSTALLER: &str = "argocd-agent-installer";

pub const ENV_ARGO_TOKEN: &str = "ARGO_TOKEN";
pub const ENV_ARGO_PASSWORD: &str = "ARGO_PASSWORD";
pub const ENV_CODEFRESH_TOKEN: &str = "CODEFRESH_TOKEN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentCommand {
    Install,
    Update,
    Uninstall,
}

impl std::fmt::Display for AgentCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentCommand::Install => write!(f, "install"),
            AgentCommand::Update => write!(f, "update"),
            AgentCommand::Uninstall => write!(f, "uninstall"),
        }
    }
}

/// Everything the agent installer is told about a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentOptions {
    pub version: Option<String>,
    pub argo_host: Option<String>,
    pub argo_username: Option<String>,
    pub argo_token: Option<Secret>,
    pub argo_password: Option<Secret>,
    pub codefresh_host: Option<String>,
    pub codefresh_token: Option<Secret>,
    pub kube: KubeTarget,
    pub git_integration: Option<String>,
    pub proxy: ProxySettings,
}

impl AgentOptions {
    /// Projection of a finished install: the bootstrapped credential is the
    /// only Argo CD login forwarded
    pub fn for_install(
        plan: &InstallationPlan,
        host: &ServiceEndpoint,
        credential: &ArgoCredential,
    ) -> Self {
        Self {
            version: plan.agent_version.clone(),
            argo_host: Some(host.url().to_string()),
            argo_username: Some(credential.username.clone()),
            argo_token: Some(credential.token.clone()),
            argo_password: Some(credential.password.clone()),
            codefresh_host: plan.account.as_ref().map(|a| a.host.clone()),
            codefresh_token: plan.account.as_ref().map(|a| a.token.clone()),
            kube: plan.kube.clone(),
            git_integration: plan.git.as_ref().and_then(|g| g.integration.clone()),
            proxy: plan.proxy.clone(),
        }
    }

    /// Projection for update and uninstall, which only need the cluster
    pub fn for_maintenance(plan: &MaintenancePlan) -> Self {
        Self {
            version: plan.agent_version.clone(),
            codefresh_host: plan.account.as_ref().map(|a| a.host.clone()),
            codefresh_token: plan.account.as_ref().map(|a| a.token.clone()),
            kube: plan.kube.clone(),
            ..Default::default()
        }
    }

    /// Command line for `command`, secrets excluded
    pub fn args(&self, command: AgentCommand) -> Vec<String> {
        let mut args = vec![command.to_string()];
        let mut flag = |name: &str, value: Option<&str>| {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                args.push(format!("--{}", name));
                args.push(value.to_string());
            }
        };

        flag("kube-namespace", Some(self.kube.namespace.as_str()));
        flag("kube-context-name", self.kube.context.as_deref());
        let config_path = self.kube.config_path.as_ref().map(|p| p.display().to_string());
        flag("kubeconfig", config_path.as_deref());

        if command == AgentCommand::Install {
            flag("argo-host", self.argo_host.as_deref());
            flag("argo-username", self.argo_username.as_deref());
            flag("codefresh-host", self.codefresh_host.as_deref());
            flag("codefresh-provider", Some("codefresh"));
            flag("sync-mode", Some("CONTINUE_SYNC"));
            flag("git-integration", self.git_integration.as_deref());
            flag("http-proxy", self.proxy.http.as_deref());
            flag("https-proxy", self.proxy.https.as_deref());
        }
        if command != AgentCommand::Uninstall {
            flag("version", self.version.as_deref());
        }

        if self.kube.in_cluster {
            args.push("--in-cluster".to_string());
        }
        args
    }

    /// Secrets handed to the child process
    pub fn envs(&self) -> Vec<(&'static str, String)> {
        [
            (ENV_ARGO_TOKEN, &self.argo_token),
            (ENV_ARGO_PASSWORD, &self.argo_password),
            (ENV_CODEFRESH_TOKEN, &self.codefresh_token),
        ]
        .into_iter()
        .filter_map(|(name, value)| {
            value
                .as_ref()
                .filter(|s| !s.is_empty())
                .map(|s| (name, s.expose().to_string()))
        })
        .collect()
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait AgentInstaller: Send + Sync {
    async fn run(&self, command: AgentCommand, options: &AgentOptions) -> Result<(), AgentError>;
}

/// Runs the agent installer as a child process
#[derive(Debug, Clone)]
pub struct ProcessAgentInstaller {
    program: String,
}

impl ProcessAgentInstaller {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for ProcessAgentInstaller {
    fn default() -> Self {
        Self::new(DEFAULT_AGENT_INSTALLER)
    }
}

#[async_trait]
impl AgentInstaller for ProcessAgentInstaller {
    async fn run(&self, command: AgentCommand, options: &AgentOptions) -> Result<(), AgentError> {
        let args = options.args(command);
        debug!(program = %self.program, ?args, "running agent installer");

        let output = Command::new(&self.program)
            .args(&args)
            .envs(options.envs())
            .output()
            .await
            .map_err(|source| AgentError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgentError::Failed {
                program: self.program.clone(),
                command: command.to_string(),
                code: output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr: stderr.trim().to_string(),
            });
        }

        info!(program = %self.program, "agent {} finished", command);
        Ok(())
    }
}
