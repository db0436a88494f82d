//! gitops-pilot-install: GitOps controller installation workflows
//!
//! Builds an installation plan from flags, config and prompts, then drives
//! the target cluster, Argo CD, the account API and the agent installer
//! through install, update and uninstall.

pub mod account;
pub mod agent;
pub mod apply;
pub mod argo;
pub mod cluster;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod host;
pub mod integrations;
pub mod manifest;
pub mod orchestrator;
pub mod questionnaire;

pub use account::{AccountApi, CodefreshClient};
pub use agent::{AgentInstaller, ProcessAgentInstaller, DEFAULT_AGENT_INSTALLER};
pub use argo::{ArgoApi, ArgoRest};
pub use cluster::{ClusterApi, ClusterConnector, KubeConnector};
pub use error::{InstallError, RunError, Step};
pub use events::{CodefreshEventSink, EventSink, LogEventSink};
pub use orchestrator::{Collaborators, InstallReport, Orchestrator};
pub use questionnaire::{InquirePrompter, NonInteractive, Prompter};
