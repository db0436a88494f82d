//! gitops-pilot: installs an Argo CD based GitOps controller into a cluster

use clap::{ArgAction, Args, Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::eyre;
use gitops_pilot_core::{AccountSettings, ImportPolicy, MaintenancePlan, ProxySettings};
use gitops_pilot_install::config::{default_cfconfig_path, resolve_account};
use gitops_pilot_install::questionnaire::{
    InstallFlags, KubeFlags, MaintenanceFlags, build_install_plan, build_maintenance_plan,
    parse_manifest_values,
};
use gitops_pilot_install::{
    AccountApi, ArgoRest, CodefreshClient, CodefreshEventSink, Collaborators,
    DEFAULT_AGENT_INSTALLER, EventSink, InquirePrompter, KubeConnector, LogEventSink,
    NonInteractive, Orchestrator, ProcessAgentInstaller, Prompter,
};
use std::fs::File;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, prelude::*};

/// gitops-pilot: install, update and remove the Codefresh GitOps controller
#[derive(Parser, Debug)]
#[command(name = "gitops-pilot")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Codefresh platform host (default: current context of ~/.cfconfig)
    #[arg(long, global = true, env = "CF_HOST")]
    codefresh_host: Option<String>,

    /// Codefresh API token (default: current context of ~/.cfconfig)
    #[arg(long, global = true, env = "CF_API_KEY", hide_env_values = true)]
    codefresh_token: Option<String>,

    /// Path to the Codefresh CLI config
    #[arg(long, global = true)]
    cfconfig: Option<PathBuf>,

    /// Never prompt; missing answers take their defaults or fail
    #[arg(long, global = true)]
    non_interactive: bool,

    /// Program that installs the Argo CD agent
    #[arg(long, global = true, default_value = DEFAULT_AGENT_INSTALLER)]
    agent_installer: String,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Log file path (default: stderr)
    #[arg(long, global = true)]
    log_file: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install Argo CD and the agent
    Install(InstallArgs),
    /// Update the agent of an existing installation
    Update(MaintenanceArgs),
    /// Remove the manifest objects and the agent
    Uninstall(MaintenanceArgs),
}

#[derive(Args, Debug)]
struct KubeArgs {
    /// Namespace Argo CD lives in (default: argocd)
    #[arg(long)]
    kube_namespace: Option<String>,

    /// Kubeconfig context (default: asked, or current-context)
    #[arg(long, env = "KUBE_CONTEXT")]
    kube_context_name: Option<String>,

    /// Path to kubeconfig (default: ~/.kube/config)
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Use the in-cluster service account instead of a kubeconfig
    #[arg(long)]
    in_cluster: bool,
}

impl From<KubeArgs> for KubeFlags {
    fn from(args: KubeArgs) -> Self {
        Self {
            namespace: args.kube_namespace,
            context: args.kube_context_name,
            kubeconfig: args.kubeconfig,
            in_cluster: args.in_cluster,
        }
    }
}

#[derive(Args, Debug)]
struct ManifestArgs {
    /// Install manifest, URL or local file
    #[arg(long)]
    install_manifest: Option<String>,

    /// Template value for the manifest, KEY=VALUE (repeatable)
    #[arg(long = "manifest-value", value_name = "KEY=VALUE")]
    manifest_values: Vec<String>,
}

#[derive(Args, Debug)]
struct InstallArgs {
    #[command(flatten)]
    kube: KubeArgs,

    #[command(flatten)]
    manifest: ManifestArgs,

    /// Argo CD admin username (default: admin)
    #[arg(long)]
    argo_username: Option<String>,

    /// New Argo CD admin password (default: asked)
    #[arg(long, env = "GITOPS_PILOT_ARGO_PASSWORD", hide_env_values = true)]
    argo_password: Option<String>,

    /// Account clusters to import, comma separated (default: asked)
    #[arg(long, value_delimiter = ',')]
    codefresh_clusters: Vec<String>,

    /// What a failed cluster import does to the rest: fail-fast or continue
    #[arg(long, default_value = "fail-fast")]
    cluster_import_policy: ImportPolicy,

    /// Git integration (context) to use for the manifest repository
    #[arg(long)]
    git_integration: Option<String>,

    /// Manifest repository to register with Argo CD
    #[arg(long)]
    git_repo_url: Option<String>,

    /// Username for the manifest repository
    #[arg(long)]
    git_username: Option<String>,

    #[arg(long)]
    http_proxy: Option<String>,

    #[arg(long)]
    https_proxy: Option<String>,

    /// Expose argocd-server as a LoadBalancer
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    load_balancer: bool,

    /// Stop retrying the Argo CD token after this many seconds
    #[arg(long, value_name = "SECONDS")]
    argo_token_timeout: Option<u64>,

    /// Do not create the default example application
    #[arg(long)]
    skip_default_app: bool,

    /// Agent version passed to the installer
    #[arg(long)]
    agent_version: Option<String>,
}

#[derive(Args, Debug)]
struct MaintenanceArgs {
    #[command(flatten)]
    kube: KubeArgs,

    #[command(flatten)]
    manifest: ManifestArgs,

    /// Agent version passed to the installer
    #[arg(long)]
    agent_version: Option<String>,
}

fn install_flags(args: InstallArgs) -> Result<InstallFlags> {
    Ok(InstallFlags {
        kube: args.kube.into(),
        manifest: args.manifest.install_manifest,
        manifest_values: parse_manifest_values(&args.manifest.manifest_values)?,
        argo_username: args.argo_username,
        argo_password: args.argo_password,
        clusters: args.codefresh_clusters,
        git_integration: args.git_integration,
        git_repo_url: args.git_repo_url,
        git_username: args.git_username,
        proxy: ProxySettings {
            http: args.http_proxy,
            https: args.https_proxy,
        },
        load_balancer: Some(args.load_balancer),
        import_policy: args.cluster_import_policy,
        token_timeout: args.argo_token_timeout.map(Duration::from_secs),
        skip_default_app: args.skip_default_app,
        agent_version: args.agent_version,
    })
}

fn maintenance_flags(args: MaintenanceArgs) -> Result<MaintenanceFlags> {
    Ok(MaintenanceFlags {
        kube: args.kube.into(),
        manifest: args.manifest.install_manifest,
        manifest_values: parse_manifest_values(&args.manifest.manifest_values)?,
        agent_version: args.agent_version,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize error handling
    color_eyre::install()?;

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| eyre!("a rustls crypto provider is already installed"))?;

    init_logging(cli.debug, cli.log_file.clone())?;
    tracing::debug!("Starting gitops-pilot");

    let cfconfig = match cli.cfconfig.clone() {
        Some(path) => path,
        None => default_cfconfig_path()?,
    };
    let account = resolve_account(
        cli.codefresh_host.clone(),
        cli.codefresh_token.clone(),
        &cfconfig,
    )?;
    let client = account.as_ref().map(CodefreshClient::new).transpose()?;
    if let Some(client) = &client {
        tracing::debug!(host = %client.host(), "Using codefresh account");
    }

    let prompter: Box<dyn Prompter> = if cli.non_interactive || !std::io::stdin().is_terminal() {
        Box::new(NonInteractive)
    } else {
        Box::new(InquirePrompter)
    };
    let events: Box<dyn EventSink> = match &client {
        Some(client) => Box::new(CodefreshEventSink::new(client.clone())),
        None => Box::new(LogEventSink),
    };
    let agent = ProcessAgentInstaller::new(cli.agent_installer.clone());
    let account_api = client.as_ref().map(|c| c as &dyn AccountApi);

    let orchestrator = Orchestrator::new(Collaborators {
        connector: &KubeConnector,
        argo: &ArgoRest,
        account: account_api,
        events: events.as_ref(),
        agent: &agent,
    });

    match cli.command {
        Command::Install(args) => {
            let flags = install_flags(args)?;
            let plan = build_install_plan(flags, account, account_api, prompter.as_ref()).await?;
            let report = orchestrator.install(&plan).await?;

            for failed in report.integrations.iter().filter(|r| !r.is_success()) {
                tracing::warn!("Not registered: {}", failed.target());
            }
            println!("Argo CD is available at {}", report.host);
        }
        Command::Update(args) => {
            let plan = maintenance_plan(args, account, prompter.as_ref())?;
            orchestrator.update(&plan).await?;
        }
        Command::Uninstall(args) => {
            let plan = maintenance_plan(args, account, prompter.as_ref())?;
            let report = orchestrator.uninstall(&plan).await?;
            tracing::debug!(
                deleted = report.deleted.len(),
                missing = report.missing.len(),
                "Objects removed"
            );
        }
    }

    Ok(())
}

fn maintenance_plan(
    args: MaintenanceArgs,
    account: Option<AccountSettings>,
    prompter: &dyn Prompter,
) -> Result<MaintenancePlan> {
    Ok(build_maintenance_plan(maintenance_flags(args)?, account, prompter)?)
}

/// Set up tracing: stderr unless a log file is given
fn init_logging(debug: bool, log_file: Option<String>) -> Result<()> {
    // Build filter: set base level, but quiet down noisy HTTP/kube libraries
    let filter = if debug {
        EnvFilter::from_default_env()
            .add_directive(Level::DEBUG.into())
            .add_directive("h2=info".parse()?)
            .add_directive("hyper=info".parse()?)
            .add_directive("tower=info".parse()?)
            .add_directive("rustls=info".parse()?)
            .add_directive("kube_client=info".parse()?)
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    let (writer, ansi) = match resolve_log_path(log_file) {
        Some(path) => (BoxMakeWriter::new(File::create(&path)?), false),
        None => (BoxMakeWriter::new(std::io::stderr), std::io::stderr().is_terminal()),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(ansi)
                .with_target(false),
        )
        .with(filter)
        .init();
    Ok(())
}

/// Log file to write to, `None` for stderr. An empty path counts as unset.
fn resolve_log_path(log_file: Option<String>) -> Option<PathBuf> {
    log_file.filter(|p| !p.trim().is_empty()).map(PathBuf::from)
}
