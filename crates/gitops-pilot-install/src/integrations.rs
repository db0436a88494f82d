//! External integration steps
//!
//! Imports account clusters into Argo CD and registers a git repository
//! with credentials from an account git integration. Both run only when
//! the plan confirms them.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use gitops_pilot_core::{
    ClusterImport, GitRegistration, ImportPolicy, IntegrationResult, IntegrationTarget, Secret,
    ServiceEndpoint,
};
use tracing::{info, warn};

use argocd_rs::{ClusterConfig, ClusterRequest, RepositoryRequest, TlsClientConfig};

use crate::account::{AccountApi, AccountCluster, GitContext, filter_importable, select_clusters};
use crate::argo::ArgoApi;
use crate::error::{ConfigError, InstallError, RunError, Step, StepContext};

/// Authenticated handle on the freshly bootstrapped Argo CD
#[derive(Clone, Copy)]
pub struct ArgoSession<'a> {
    pub api: &'a dyn ArgoApi,
    pub host: &'a ServiceEndpoint,
    pub token: &'a Secret,
}

/// Import the selected importable clusters.
///
/// Under [`ImportPolicy::FailFast`] the first failure aborts the run; under
/// [`ImportPolicy::Continue`] failures are collected and the batch goes on.
pub async fn import_clusters(
    account: &dyn AccountApi,
    session: ArgoSession<'_>,
    import: &ClusterImport,
) -> Result<Vec<IntegrationResult>, RunError> {
    let listed = account.list_clusters().await.step(Step::ListClusters)?;
    let candidates = select_clusters(filter_importable(listed), &import.selection);
    info!(clusters = candidates.len(), "importing clusters");

    let mut results = Vec::with_capacity(candidates.len());
    for cluster in &candidates {
        let target = IntegrationTarget::Cluster(cluster.selector.clone());
        match import_cluster(account, session, cluster).await {
            Ok(()) => {
                info!(
                    cluster = %cluster.selector,
                    "Successfully created cluster \"{}\"",
                    cluster.selector
                );
                results.push(IntegrationResult::Registered(target));
            }
            Err(reason) => match import.policy {
                ImportPolicy::FailFast => {
                    return Err(RunError::new(
                        Step::ImportClusters,
                        InstallError::Integration { target, reason },
                    ));
                }
                ImportPolicy::Continue => {
                    warn!(
                        cluster = %cluster.selector,
                        %reason,
                        "cluster import failed, continuing"
                    );
                    results.push(IntegrationResult::Failed { target, reason });
                }
            },
        }
    }

    Ok(results)
}

async fn import_cluster(
    account: &dyn AccountApi,
    session: ArgoSession<'_>,
    cluster: &AccountCluster,
) -> Result<(), String> {
    let credentials = account
        .cluster_credentials(&cluster.selector)
        .await
        .map_err(|e| e.to_string())?;
    let bearer = decode_bearer(&credentials.auth.bearer)?;

    let request = ClusterRequest {
        name: cluster.selector.clone(),
        server: credentials.url,
        config: ClusterConfig {
            bearer_token: bearer,
            tls_client_config: TlsClientConfig {
                ca_data: credentials.ca,
                insecure: false,
            },
        },
    };

    match session
        .api
        .create_cluster(session.host.url(), session.token.expose(), &request)
        .await
    {
        Ok(()) => Ok(()),
        Err(e) if e.is_already_exists() => {
            warn!(cluster = %cluster.selector, "cluster \"{}\" already exists", cluster.selector);
            Ok(())
        }
        Err(e) => Err(e.to_string()),
    }
}

/// Bearer tokens are stored base64 encoded in the account
pub fn decode_bearer(encoded: &str) -> Result<String, String> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| format!("invalid bearer token encoding: {}", e))?;
    String::from_utf8(bytes).map_err(|_| "bearer token is not valid UTF-8".to_string())
}

/// Pick the git integration to use.
///
/// A named integration must exist. Without a name, a single available
/// integration is picked automatically and none at all means there is
/// nothing to register.
pub fn choose_git_context(
    contexts: Vec<GitContext>,
    name: Option<&str>,
) -> Result<Option<GitContext>, ConfigError> {
    match name {
        Some(name) => contexts
            .into_iter()
            .find(|c| c.name == name)
            .map(Some)
            .ok_or_else(|| ConfigError::ContextNotFound(name.to_string())),
        None => match contexts.len() {
            0 => Ok(None),
            1 => Ok(contexts.into_iter().next()),
            _ => Err(ConfigError::Missing(
                "git integration (more than one is available)".to_string(),
            )),
        },
    }
}

/// Username for the repository: the explicit one, then the integration's
/// own, and the integration password only as a last resort
pub fn repository_username(explicit: Option<&str>, context: &GitContext) -> String {
    if let Some(username) = explicit.filter(|u| !u.is_empty()) {
        return username.to_string();
    }
    if let Some(username) = &context.username {
        return username.clone();
    }
    warn!(
        integration = %context.name,
        "git integration has no username, using its password as the username"
    );
    context.password.expose().to_string()
}

/// Register the repository named in the plan.
///
/// Returns `None` when there is no integration or no repository URL.
pub async fn register_repository(
    account: &dyn AccountApi,
    session: ArgoSession<'_>,
    git: &GitRegistration,
) -> Result<Option<IntegrationResult>, RunError> {
    let contexts = account.git_contexts().await.step(Step::ListGitContexts)?;
    let Some(context) =
        choose_git_context(contexts, git.integration.as_deref()).step(Step::RegisterRepository)?
    else {
        info!("no git integration available, skipping repository registration");
        return Ok(None);
    };
    info!("Use \"{}\" git integration for integrate with manifest repo", context.name);

    let Some(repo_url) = git.repo_url.as_deref().filter(|u| !u.is_empty()) else {
        info!("no repository url given, skipping repository registration");
        return Ok(None);
    };

    let request = RepositoryRequest {
        repo: repo_url.to_string(),
        username: repository_username(git.username.as_deref(), &context),
        password: context.password.expose().to_string(),
    };

    let target = IntegrationTarget::Repository(repo_url.to_string());
    session
        .api
        .create_repository(session.host.url(), session.token.expose(), &request)
        .await
        .map_err(|e| InstallError::Integration {
            target: target.clone(),
            reason: e.to_string(),
        })
        .step(Step::RegisterRepository)?;

    info!(repo = %repo_url, "repository registered");
    Ok(Some(IntegrationResult::Registered(target)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{ClusterAuth, ClusterCredentials, MockAccountApi};
    use crate::argo::MockArgoApi;
    use crate::error::AccountError;
    use argocd_rs::ArgoError;
    use gitops_pilot_core::ClusterSelection;

    fn host() -> ServiceEndpoint {
        ServiceEndpoint::from_ingress(None, Some("1.2.3.4")).unwrap()
    }

    fn account_cluster(selector: &str, provider: &str) -> AccountCluster {
        AccountCluster {
            id: String::new(),
            selector: selector.to_string(),
            provider: provider.to_string(),
        }
    }

    fn account_with_clusters() -> MockAccountApi {
        let mut account = MockAccountApi::new();
        account.expect_list_clusters().returning(|| {
            Ok(vec![
                account_cluster("A", "local"),
                account_cluster("B", "gke"),
                account_cluster("C", "local"),
            ])
        });
        account
    }

    fn credentials(bearer: &str) -> ClusterCredentials {
        ClusterCredentials {
            url: "https://10.0.0.1".to_string(),
            ca: "Y2E=".to_string(),
            auth: ClusterAuth {
                bearer: bearer.to_string(),
            },
        }
    }

    fn context(name: &str, username: Option<&str>) -> GitContext {
        GitContext {
            name: name.to_string(),
            auth_type: "basic".to_string(),
            username: username.map(str::to_string),
            password: Secret::new("ghp_secret"),
        }
    }

    #[test]
    fn test_decode_bearer() {
        assert_eq!(decode_bearer("c2VjcmV0").unwrap(), "secret");
        assert!(decode_bearer("not base64!").is_err());
    }

    #[tokio::test]
    async fn test_imports_only_local_clusters() {
        let mut account = account_with_clusters();
        account
            .expect_cluster_credentials()
            .times(2)
            .returning(|_| Ok(credentials("c2VjcmV0")));
        let mut argo = MockArgoApi::new();
        argo.expect_create_cluster()
            .withf(|host, token, req| {
                host == "https://1.2.3.4"
                    && token == "T2"
                    && req.config.bearer_token == "secret"
                    && req.config.tls_client_config.ca_data == "Y2E="
                    && !req.config.tls_client_config.insecure
            })
            .times(2)
            .returning(|_, _, _| Ok(()));

        let endpoint = host();
        let token = Secret::new("T2");
        let session = ArgoSession { api: &argo, host: &endpoint, token: &token };
        let import = ClusterImport {
            selection: ClusterSelection::All,
            policy: ImportPolicy::FailFast,
        };
        let results = import_clusters(&account, session, &import).await.unwrap();
        assert_eq!(
            results,
            vec![
                IntegrationResult::Registered(IntegrationTarget::Cluster("A".to_string())),
                IntegrationResult::Registered(IntegrationTarget::Cluster("C".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn test_fail_fast_stops_batch() {
        let mut account = account_with_clusters();
        account
            .expect_cluster_credentials()
            .withf(|s| s == "A")
            .times(1)
            .returning(|_| Ok(credentials("%%%")));
        let argo = MockArgoApi::new();

        let endpoint = host();
        let token = Secret::new("T2");
        let session = ArgoSession { api: &argo, host: &endpoint, token: &token };
        let import = ClusterImport {
            selection: ClusterSelection::All,
            policy: ImportPolicy::FailFast,
        };
        let err = import_clusters(&account, session, &import).await.unwrap_err();
        assert_eq!(err.step, Step::ImportClusters);
        assert!(err.to_string().contains("cluster \"A\""));
    }

    #[tokio::test]
    async fn test_continue_collects_failures() {
        let mut account = account_with_clusters();
        account.expect_cluster_credentials().returning(|selector| {
            if selector == "A" {
                Err(AccountError::Api {
                    status: 404,
                    message: "not found".to_string(),
                })
            } else {
                Ok(credentials("c2VjcmV0"))
            }
        });
        let mut argo = MockArgoApi::new();
        argo.expect_create_cluster()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let endpoint = host();
        let token = Secret::new("T2");
        let session = ArgoSession { api: &argo, host: &endpoint, token: &token };
        let import = ClusterImport {
            selection: ClusterSelection::All,
            policy: ImportPolicy::Continue,
        };
        let results = import_clusters(&account, session, &import).await.unwrap();
        assert!(!results[0].is_success());
        assert_eq!(results[0].target(), &IntegrationTarget::Cluster("A".to_string()));
        assert!(results[1].is_success());
    }

    #[tokio::test]
    async fn test_existing_cluster_counts_as_registered() {
        let mut account = account_with_clusters();
        account
            .expect_cluster_credentials()
            .returning(|_| Ok(credentials("c2VjcmV0")));
        let mut argo = MockArgoApi::new();
        argo.expect_create_cluster().returning(|_, _, _| {
            Err(ArgoError::Api {
                status: 409,
                message: "already exists".to_string(),
            })
        });

        let endpoint = host();
        let token = Secret::new("T2");
        let session = ArgoSession { api: &argo, host: &endpoint, token: &token };
        let import = ClusterImport {
            selection: ClusterSelection::Ids(vec!["C".to_string()]),
            policy: ImportPolicy::FailFast,
        };
        let results = import_clusters(&account, session, &import).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_success());
    }

    #[test]
    fn test_choose_git_context() {
        let one = vec![context("github", None)];
        assert_eq!(choose_git_context(one, None).unwrap().unwrap().name, "github");
        assert!(choose_git_context(vec![], None).unwrap().is_none());

        let two = vec![context("github", None), context("gitlab", None)];
        assert!(matches!(
            choose_git_context(two.clone(), None),
            Err(ConfigError::Missing(_))
        ));
        assert_eq!(
            choose_git_context(two.clone(), Some("gitlab")).unwrap().unwrap().name,
            "gitlab"
        );
        assert!(matches!(
            choose_git_context(two, Some("bitbucket")),
            Err(ConfigError::ContextNotFound(_))
        ));
    }

    #[test]
    fn test_repository_username_sources() {
        let with_user = context("github", Some("octocat"));
        let without_user = context("github", None);
        assert_eq!(repository_username(Some("explicit"), &with_user), "explicit");
        assert_eq!(repository_username(None, &with_user), "octocat");
        assert_eq!(repository_username(Some(""), &without_user), "ghp_secret");
    }

    #[tokio::test]
    async fn test_register_repository() {
        let mut account = MockAccountApi::new();
        account
            .expect_git_contexts()
            .returning(|| Ok(vec![context("github", Some("octocat"))]));
        let mut argo = MockArgoApi::new();
        argo.expect_create_repository()
            .withf(|_, token, req| {
                token == "T2"
                    && req.repo == "https://github.com/acme/manifests"
                    && req.username == "octocat"
                    && req.password == "ghp_secret"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let endpoint = host();
        let token = Secret::new("T2");
        let session = ArgoSession { api: &argo, host: &endpoint, token: &token };
        let git = GitRegistration {
            integration: None,
            repo_url: Some("https://github.com/acme/manifests".to_string()),
            username: None,
        };
        let result = register_repository(&account, session, &git).await.unwrap();
        assert_eq!(
            result,
            Some(IntegrationResult::Registered(IntegrationTarget::Repository(
                "https://github.com/acme/manifests".to_string()
            )))
        );
    }

    #[tokio::test]
    async fn test_register_without_repo_url_skips() {
        let mut account = MockAccountApi::new();
        account
            .expect_git_contexts()
            .returning(|| Ok(vec![context("github", None)]));
        let argo = MockArgoApi::new();

        let endpoint = host();
        let token = Secret::new("T2");
        let session = ArgoSession { api: &argo, host: &endpoint, token: &token };
        let result = register_repository(&account, session, &GitRegistration::default())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_repository_failure_is_fatal() {
        let mut account = MockAccountApi::new();
        account
            .expect_git_contexts()
            .returning(|| Ok(vec![context("github", None)]));
        let mut argo = MockArgoApi::new();
        argo.expect_create_repository().returning(|_, _, _| {
            Err(ArgoError::Api {
                status: 400,
                message: "repository not accessible".to_string(),
            })
        });

        let endpoint = host();
        let token = Secret::new("T2");
        let session = ArgoSession { api: &argo, host: &endpoint, token: &token };
        let git = GitRegistration {
            integration: Some("github".to_string()),
            repo_url: Some("https://github.com/acme/manifests".to_string()),
            username: None,
        };
        let err = register_repository(&account, session, &git).await.unwrap_err();
        assert_eq!(err.step, Step::RegisterRepository);
        assert!(err.to_string().starts_with("Can't manage access to git repo"));
    }
}
