//! Installation orchestrator
//!
//! Runs the install, update and uninstall flows step by step against the
//! collaborators. The first mandatory step that fails ends the run. Every
//! run reports exactly one event, success or failure, before returning.

use std::sync::Arc;

use gitops_pilot_core::{
    ArgoCredential, InstallationEvent, InstallationPlan, IntegrationResult, KubeTarget,
    MaintenancePlan, Phase, RetryPolicy, ServiceEndpoint,
};
use tracing::{error, info, warn};

use crate::account::AccountApi;
use crate::agent::{AgentCommand, AgentInstaller, AgentOptions};
use crate::apply::{ApplyReport, DeleteReport, apply_objects, delete_objects};
use crate::argo::{ArgoApi, default_application};
use crate::cluster::{ARGO_SERVER_SELECTOR, ClusterApi, ClusterConnector};
use crate::credentials::{CredentialBootstrap, token_policy};
use crate::error::{ConfigError, InstallError, RunError, Step, StepContext};
use crate::events::{EventSink, emit};
use crate::host::{discover_host, discovery_policy};
use crate::integrations::{ArgoSession, import_clusters, register_repository};
use crate::manifest::load_objects;

/// What a successful install did
#[derive(Debug)]
pub struct InstallReport {
    pub host: ServiceEndpoint,
    pub credential: ArgoCredential,
    pub applied: ApplyReport,
    pub integrations: Vec<IntegrationResult>,
}

/// Remote systems a run talks to
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub connector: &'a dyn ClusterConnector,
    pub argo: &'a dyn ArgoApi,
    /// `None` when no account is configured
    pub account: Option<&'a dyn AccountApi>,
    pub events: &'a dyn EventSink,
    pub agent: &'a dyn AgentInstaller,
}

pub struct Orchestrator<'a> {
    deps: Collaborators<'a>,
    host_policy: RetryPolicy,
}

impl<'a> Orchestrator<'a> {
    pub fn new(deps: Collaborators<'a>) -> Self {
        Self {
            deps,
            host_policy: discovery_policy(),
        }
    }

    pub fn with_host_policy(mut self, policy: RetryPolicy) -> Self {
        self.host_policy = policy;
        self
    }

    /// Install the controller described by `plan`
    pub async fn install(&self, plan: &InstallationPlan) -> Result<InstallReport, RunError> {
        let result = self.run_install(plan).await;
        self.finish(Phase::Install, result, |report| {
            format!(
                "Successfully installed codefresh gitops controller, host: {}",
                report.host
            )
        })
        .await
    }

    /// Update the agent of an existing installation
    pub async fn update(&self, plan: &MaintenancePlan) -> Result<(), RunError> {
        let result = self.run_update(plan).await;
        self.finish(Phase::Update, result, |_| {
            "Successfully updated codefresh gitops controller".to_string()
        })
        .await
    }

    /// Remove the manifest objects and the agent
    pub async fn uninstall(&self, plan: &MaintenancePlan) -> Result<DeleteReport, RunError> {
        let result = self.run_uninstall(plan).await;
        self.finish(Phase::Uninstall, result, |_| {
            "Codefresh gitops controller uninstallation finished successfully".to_string()
        })
        .await
    }

    async fn finish<T>(
        &self,
        phase: Phase,
        result: Result<T, RunError>,
        success_message: impl FnOnce(&T) -> String,
    ) -> Result<T, RunError> {
        let event = match &result {
            Ok(value) => {
                let message = success_message(value);
                info!("{}", message);
                InstallationEvent::success(phase, message)
            }
            Err(e) => {
                error!(phase = %phase, "{}", e);
                InstallationEvent::failure(phase, e.to_string())
            }
        };
        emit(self.deps.events, &event).await;
        result
    }

    async fn connect(&self, target: &KubeTarget) -> Result<Arc<dyn ClusterApi>, RunError> {
        self.deps
            .connector
            .connect(target)
            .await
            .map_err(InstallError::ClusterConnect)
            .step(Step::ConnectCluster)
    }

    async fn run_install(&self, plan: &InstallationPlan) -> Result<InstallReport, RunError> {
        plan.validate().step(Step::ValidatePlan)?;
        let namespace = plan.kube.namespace.as_str();

        let cluster = self.connect(&plan.kube).await?;
        let cluster = cluster.as_ref();

        info!(namespace = %namespace, "Creating namespace");
        cluster
            .ensure_namespace(namespace)
            .await
            .step(Step::CreateNamespace(namespace.to_string()))?;

        info!(source = %plan.manifest, "Creating argocd resources...");
        let objects = load_objects(&plan.manifest, &plan.manifest_values)
            .await
            .step(Step::CreateResources)?;
        let applied = apply_objects(cluster, &objects, namespace)
            .await
            .step(Step::CreateResources)?;

        if plan.expose_load_balancer {
            info!("Exposing argocd server as LoadBalancer");
            cluster
                .expose_service(namespace, ARGO_SERVER_SELECTOR)
                .await
                .step(Step::ExposeLoadBalancer)?;
        }

        info!("Getting argocd ip address...");
        let host = discover_host(cluster, namespace, ARGO_SERVER_SELECTOR, &self.host_policy)
            .await
            .step(Step::RetrieveHost)?;

        let credential = CredentialBootstrap::new(cluster, self.deps.argo, &host, namespace)
            .run(&plan.argo, &token_policy(plan.token_timeout))
            .await?;

        let session = ArgoSession {
            api: self.deps.argo,
            host: &host,
            token: &credential.token,
        };
        let mut integrations = Vec::new();

        if let Some(import) = &plan.clusters {
            info!("Getting argocd clusters...");
            let account = self.account().step(Step::ListClusters)?;
            integrations.extend(import_clusters(account, session, import).await?);
        }

        if let Some(git) = &plan.git {
            let account = self.account().step(Step::ListGitContexts)?;
            integrations.extend(register_repository(account, session, git).await?);
        }

        if plan.create_default_app {
            info!("Create default argocd app...");
            match self
                .deps
                .argo
                .create_application(host.url(), credential.token.expose(), &default_application())
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_already_exists() => warn!("application \"default\" already exists"),
                Err(e) => return Err(RunError::new(Step::CreateDefaultApp, e)),
            }
        }

        info!("Install agent...");
        self.deps
            .agent
            .run(
                AgentCommand::Install,
                &AgentOptions::for_install(plan, &host, &credential),
            )
            .await
            .step(Step::InstallAgent)?;

        Ok(InstallReport {
            host,
            credential,
            applied,
            integrations,
        })
    }

    async fn run_update(&self, plan: &MaintenancePlan) -> Result<(), RunError> {
        plan.validate().step(Step::ValidatePlan)?;
        let namespace = plan.kube.namespace.as_str();

        let cluster = self.connect(&plan.kube).await?;
        cluster
            .ensure_namespace(namespace)
            .await
            .step(Step::CreateNamespace(namespace.to_string()))?;

        self.deps
            .agent
            .run(AgentCommand::Update, &AgentOptions::for_maintenance(plan))
            .await
            .step(Step::UpdateAgent)
    }

    async fn run_uninstall(&self, plan: &MaintenancePlan) -> Result<DeleteReport, RunError> {
        plan.validate().step(Step::ValidatePlan)?;
        let namespace = plan.kube.namespace.as_str();

        let cluster = self.connect(&plan.kube).await?;
        let cluster = cluster.as_ref();

        if let Err(e) = cluster.ensure_namespace(namespace).await {
            warn!(namespace = %namespace, error = %e, "can't ensure namespace, continuing");
        }

        let objects = load_objects(&plan.manifest, &plan.manifest_values)
            .await
            .step(Step::DeleteResources)?;
        let deleted = delete_objects(cluster, &objects, namespace)
            .await
            .step(Step::DeleteResources)?;

        self.deps
            .agent
            .run(AgentCommand::Uninstall, &AgentOptions::for_maintenance(plan))
            .await
            .step(Step::UninstallAgent)?;

        Ok(deleted)
    }

    fn account(&self) -> Result<&'a dyn AccountApi, InstallError> {
        self.deps.account.ok_or_else(|| {
            ConfigError::Missing("codefresh account credentials".to_string()).into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AccountCluster, ClusterAuth, ClusterCredentials, MockAccountApi};
    use crate::agent::{ENV_ARGO_TOKEN, MockAgentInstaller};
    use crate::argo::MockArgoApi;
    use crate::cluster::{INITIAL_ADMIN_SECRET, MockClusterApi, MockClusterConnector};
    use crate::error::{AgentError, KubeError};
    use crate::events::MockEventSink;
    use gitops_pilot_core::{
        AccountSettings, ArgoSettings, ClusterImport, ClusterSelection, ImportPolicy,
        ManifestSource, ProxySettings, Secret,
    };
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::sync::Mutex;

    const MANIFEST: &str = "\
apiVersion: v1
kind: ServiceAccount
metadata:
  name: argocd-server
---
apiVersion: v1
kind: Service
metadata:
  name: argocd-server
  labels:
    app.kubernetes.io/name: argocd-server
";

    fn manifest_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MANIFEST.as_bytes()).unwrap();
        file
    }

    fn plan(manifest: &tempfile::NamedTempFile) -> InstallationPlan {
        InstallationPlan {
            kube: KubeTarget::default(),
            manifest: ManifestSource::Path(manifest.path().to_path_buf()),
            manifest_values: BTreeMap::new(),
            argo: ArgoSettings {
                username: "admin".to_string(),
                password: Secret::new("newpass456"),
            },
            account: None,
            expose_load_balancer: true,
            clusters: None,
            git: None,
            create_default_app: true,
            proxy: ProxySettings::default(),
            agent_version: None,
            token_timeout: None,
        }
    }

    fn maintenance(manifest: &tempfile::NamedTempFile) -> MaintenancePlan {
        MaintenancePlan {
            kube: KubeTarget::default(),
            manifest: ManifestSource::Path(manifest.path().to_path_buf()),
            manifest_values: BTreeMap::new(),
            account: None,
            agent_version: None,
        }
    }

    fn connector_for(cluster: MockClusterApi) -> MockClusterConnector {
        let cluster: Arc<dyn ClusterApi> = Arc::new(cluster);
        let mut connector = MockClusterConnector::new();
        connector
            .expect_connect()
            .withf(|target| target.namespace == "argocd")
            .times(1)
            .returning(move |_| Ok(cluster.clone()));
        connector
    }

    /// Cluster that accepts the install up to a reachable host
    fn healthy_cluster(created: Arc<Mutex<Vec<String>>>) -> MockClusterApi {
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_ensure_namespace()
            .withf(|ns| ns == "argocd")
            .times(1)
            .returning(|_| Ok(()));
        cluster
            .expect_create_object()
            .times(2)
            .returning(move |obj, _| {
                created.lock().unwrap().push(obj.key());
                Ok(())
            });
        cluster
            .expect_expose_service()
            .withf(|ns, selector| ns == "argocd" && selector == ARGO_SERVER_SELECTOR)
            .times(1)
            .returning(|_, _| Ok(()));
        cluster
            .expect_service_endpoint()
            .returning(|_, _| Ok(ServiceEndpoint::from_ingress(None, Some("1.2.3.4"))));
        cluster
            .expect_secret_value()
            .withf(|_, name, _| name == INITIAL_ADMIN_SECRET)
            .times(1)
            .returning(|_, _, _| Ok("autogen123".to_string()));
        cluster
    }

    fn bootstrapping_argo() -> MockArgoApi {
        let mut argo = MockArgoApi::new();
        argo.expect_create_token()
            .withf(|host, user, pass| {
                host == "https://1.2.3.4" && user == "admin" && pass == "autogen123"
            })
            .times(1)
            .returning(|_, _, _| Ok("T1".to_string()));
        argo.expect_update_password()
            .withf(|_, token, req| {
                token == "T1"
                    && req.current_password == "autogen123"
                    && req.new_password == "newpass456"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        argo.expect_create_token()
            .withf(|_, user, pass| user == "admin" && pass == "newpass456")
            .times(1)
            .returning(|_, _, _| Ok("T2".to_string()));
        argo
    }

    fn single_event(phase: Phase, success: bool, fragment: &'static str) -> MockEventSink {
        let mut events = MockEventSink::new();
        events
            .expect_report()
            .withf(move |event| {
                event.phase == phase
                    && event.is_success() == success
                    && event.message.contains(fragment)
            })
            .times(1)
            .returning(|_| Ok(()));
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_end_to_end() {
        let manifest = manifest_file();
        let created = Arc::new(Mutex::new(Vec::new()));
        let connector = connector_for(healthy_cluster(created.clone()));

        let mut argo = bootstrapping_argo();
        argo.expect_create_application()
            .withf(|host, token, app| {
                host == "https://1.2.3.4" && token == "T2" && app.metadata.name == "default"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut agent = MockAgentInstaller::new();
        agent
            .expect_run()
            .withf(|command, options| {
                *command == AgentCommand::Install
                    && options.argo_host.as_deref() == Some("https://1.2.3.4")
                    && options.envs().contains(&(ENV_ARGO_TOKEN, "T2".to_string()))
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let events = single_event(Phase::Install, true, "host: https://1.2.3.4");

        let orchestrator = Orchestrator::new(Collaborators {
            connector: &connector,
            argo: &argo,
            account: None,
            events: &events,
            agent: &agent,
        });
        let report = orchestrator.install(&plan(&manifest)).await.unwrap();

        assert_eq!(report.host.url(), "https://1.2.3.4");
        assert_eq!(report.credential.token.expose(), "T2");
        assert_eq!(report.credential.password.expose(), "newpass456");
        assert_eq!(report.applied.created.len(), 2);
        assert_eq!(
            *created.lock().unwrap(),
            vec!["ServiceAccount/argocd-server", "Service/argocd-server"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_with_cluster_import() {
        let manifest = manifest_file();
        let connector = connector_for(healthy_cluster(Arc::new(Mutex::new(Vec::new()))));

        let mut argo = bootstrapping_argo();
        argo.expect_create_cluster()
            .withf(|_, token, req| token == "T2" && req.name == "A")
            .times(1)
            .returning(|_, _, _| Ok(()));
        argo.expect_create_application().returning(|_, _, _| Ok(()));

        let mut account = MockAccountApi::new();
        account.expect_list_clusters().returning(|| {
            Ok(vec![
                AccountCluster {
                    id: String::new(),
                    selector: "A".to_string(),
                    provider: "local".to_string(),
                },
                AccountCluster {
                    id: String::new(),
                    selector: "B".to_string(),
                    provider: "gke".to_string(),
                },
            ])
        });
        account.expect_cluster_credentials().returning(|_| {
            Ok(ClusterCredentials {
                url: "https://10.0.0.1".to_string(),
                ca: String::new(),
                auth: ClusterAuth {
                    bearer: "c2VjcmV0".to_string(),
                },
            })
        });

        let mut agent = MockAgentInstaller::new();
        agent.expect_run().returning(|_, _| Ok(()));
        let events = single_event(Phase::Install, true, "Successfully installed");

        let mut p = plan(&manifest);
        p.account = Some(AccountSettings {
            host: "https://g.codefresh.io".to_string(),
            token: Secret::new("cf"),
        });
        p.clusters = Some(ClusterImport {
            selection: ClusterSelection::All,
            policy: ImportPolicy::FailFast,
        });

        let orchestrator = Orchestrator::new(Collaborators {
            connector: &connector,
            argo: &argo,
            account: Some(&account),
            events: &events,
            agent: &agent,
        });
        let report = orchestrator.install(&p).await.unwrap();
        assert_eq!(report.integrations.len(), 1);
        assert!(report.integrations[0].is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_timeout_reports_one_failure() {
        let manifest = manifest_file();
        let mut cluster = MockClusterApi::new();
        cluster.expect_ensure_namespace().returning(|_| Ok(()));
        cluster.expect_create_object().returning(|_, _| Ok(()));
        cluster.expect_expose_service().returning(|_, _| Ok(()));
        cluster.expect_service_endpoint().returning(|_, _| Ok(None));
        cluster.expect_secret_value().never();
        let connector = connector_for(cluster);

        let argo = MockArgoApi::new();
        let agent = MockAgentInstaller::new();
        let events = single_event(Phase::Install, false, "Can't retrieve argo host");

        let orchestrator = Orchestrator::new(Collaborators {
            connector: &connector,
            argo: &argo,
            account: None,
            events: &events,
            agent: &agent,
        });
        let err = orchestrator.install(&plan(&manifest)).await.unwrap_err();
        assert_eq!(err.step, Step::RetrieveHost);
        assert!(matches!(err.source, InstallError::HostDiscoveryTimeout { .. }));
    }

    #[tokio::test]
    async fn test_connect_failure_is_labelled() {
        let manifest = manifest_file();
        let mut connector = MockClusterConnector::new();
        connector
            .expect_connect()
            .returning(|_| Err(KubeError::ClientCreate("no current context".to_string())));
        let argo = MockArgoApi::new();
        let agent = MockAgentInstaller::new();
        let events = single_event(Phase::Install, false, "Can't create kube client");

        let orchestrator = Orchestrator::new(Collaborators {
            connector: &connector,
            argo: &argo,
            account: None,
            events: &events,
            agent: &agent,
        });
        let err = orchestrator.install(&plan(&manifest)).await.unwrap_err();
        assert_eq!(err.step, Step::ConnectCluster);
    }

    #[tokio::test]
    async fn test_invalid_plan_runs_nothing() {
        let manifest = manifest_file();
        let connector = MockClusterConnector::new();
        let argo = MockArgoApi::new();
        let agent = MockAgentInstaller::new();
        let events = single_event(Phase::Install, false, "argo password");

        let mut p = plan(&manifest);
        p.argo.password = Secret::default();
        let orchestrator = Orchestrator::new(Collaborators {
            connector: &connector,
            argo: &argo,
            account: None,
            events: &events,
            agent: &agent,
        });
        let err = orchestrator.install(&p).await.unwrap_err();
        assert_eq!(err.step, Step::ValidatePlan);
    }

    #[tokio::test]
    async fn test_update_flow() {
        let manifest = manifest_file();
        let mut cluster = MockClusterApi::new();
        cluster.expect_ensure_namespace().times(1).returning(|_| Ok(()));
        let connector = connector_for(cluster);

        let argo = MockArgoApi::new();
        let mut agent = MockAgentInstaller::new();
        agent
            .expect_run()
            .withf(|command, _| *command == AgentCommand::Update)
            .times(1)
            .returning(|_, _| Ok(()));
        let events = single_event(Phase::Update, true, "updated");

        let orchestrator = Orchestrator::new(Collaborators {
            connector: &connector,
            argo: &argo,
            account: None,
            events: &events,
            agent: &agent,
        });
        orchestrator.update(&maintenance(&manifest)).await.unwrap();
    }

    #[tokio::test]
    async fn test_uninstall_flow() {
        let manifest = manifest_file();
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_ensure_namespace()
            .returning(|_| Err(KubeError::ClientCreate("forbidden".to_string())));
        cluster.expect_delete_object().times(2).returning(|_, _| Ok(()));
        let connector = connector_for(cluster);

        let argo = MockArgoApi::new();
        let mut agent = MockAgentInstaller::new();
        agent
            .expect_run()
            .withf(|command, _| *command == AgentCommand::Uninstall)
            .times(1)
            .returning(|_, _| Ok(()));
        let events = single_event(Phase::Uninstall, true, "uninstallation finished");

        let orchestrator = Orchestrator::new(Collaborators {
            connector: &connector,
            argo: &argo,
            account: None,
            events: &events,
            agent: &agent,
        });
        let report = orchestrator.uninstall(&maintenance(&manifest)).await.unwrap();
        assert_eq!(report.deleted.len(), 2);
    }

    #[tokio::test]
    async fn test_uninstall_agent_failure() {
        let manifest = manifest_file();
        let mut cluster = MockClusterApi::new();
        cluster.expect_ensure_namespace().returning(|_| Ok(()));
        cluster.expect_delete_object().returning(|_, _| Ok(()));
        let connector = connector_for(cluster);

        let argo = MockArgoApi::new();
        let mut agent = MockAgentInstaller::new();
        agent.expect_run().returning(|_, _| {
            Err(AgentError::Failed {
                program: "argocd-agent-installer".to_string(),
                command: "uninstall".to_string(),
                code: "1".to_string(),
                stderr: "release not found".to_string(),
            })
        });
        let events = single_event(Phase::Uninstall, false, "Can't uninstall argocd agent");

        let orchestrator = Orchestrator::new(Collaborators {
            connector: &connector,
            argo: &argo,
            account: None,
            events: &events,
            agent: &agent,
        });
        let err = orchestrator
            .uninstall(&maintenance(&manifest))
            .await
            .unwrap_err();
        assert_eq!(err.step, Step::UninstallAgent);
    }
}
