//! Argo CD collaborator
//!
//! [`ArgoApi`] is the slice of the Argo CD API the workflows call. The live
//! implementation builds an [`ArgoClient`] per call; every call names the
//! host and, except the token exchange, the bearer token to use.

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use argocd_rs::{
    Application, ApplicationDestination, ApplicationMetadata, ApplicationSource, ApplicationSpec,
    ArgoClient, ArgoError, ClusterRequest, RepositoryRequest, UpdatePasswordRequest,
};

/// Destination of the default application
pub const IN_CLUSTER_SERVER: &str = "https://kubernetes.default.svc";

const DEFAULT_APP_REPO: &str = "https://github.com/argoproj/argocd-example-apps.git";

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ArgoApi: Send + Sync {
    /// Exchange a username and password for a session token
    async fn create_token(&self, host: &str, username: &str, password: &str)
    -> Result<String, ArgoError>;

    async fn update_password(
        &self,
        host: &str,
        token: &str,
        request: &UpdatePasswordRequest,
    ) -> Result<(), ArgoError>;

    async fn create_repository(
        &self,
        host: &str,
        token: &str,
        request: &RepositoryRequest,
    ) -> Result<(), ArgoError>;

    async fn create_cluster(
        &self,
        host: &str,
        token: &str,
        request: &ClusterRequest,
    ) -> Result<(), ArgoError>;

    async fn create_application(
        &self,
        host: &str,
        token: &str,
        application: &Application,
    ) -> Result<(), ArgoError>;
}

/// [`ArgoApi`] over HTTP
#[derive(Debug, Default, Clone)]
pub struct ArgoRest;

impl ArgoRest {
    fn client(host: &str, token: &str) -> Result<ArgoClient, ArgoError> {
        Ok(ArgoClient::new(host)?.with_token(token))
    }
}

#[async_trait]
impl ArgoApi for ArgoRest {
    async fn create_token(
        &self,
        host: &str,
        username: &str,
        password: &str,
    ) -> Result<String, ArgoError> {
        argocd_rs::get_token(host, username, password).await
    }

    async fn update_password(
        &self,
        host: &str,
        token: &str,
        request: &UpdatePasswordRequest,
    ) -> Result<(), ArgoError> {
        Self::client(host, token)?.update_password(request).await
    }

    async fn create_repository(
        &self,
        host: &str,
        token: &str,
        request: &RepositoryRequest,
    ) -> Result<(), ArgoError> {
        Self::client(host, token)?.create_repository(request).await
    }

    async fn create_cluster(
        &self,
        host: &str,
        token: &str,
        request: &ClusterRequest,
    ) -> Result<(), ArgoError> {
        Self::client(host, token)?.create_cluster(request).await
    }

    async fn create_application(
        &self,
        host: &str,
        token: &str,
        application: &Application,
    ) -> Result<(), ArgoError> {
        Self::client(host, token)?.create_application(application).await
    }
}

/// Guestbook sample app deployed into the local cluster
pub fn default_application() -> Application {
    Application {
        metadata: ApplicationMetadata {
            name: "default".to_string(),
        },
        spec: ApplicationSpec {
            project: "default".to_string(),
            destination: ApplicationDestination {
                name: String::new(),
                namespace: String::new(),
                server: IN_CLUSTER_SERVER.to_string(),
            },
            source: ApplicationSource {
                repo_url: DEFAULT_APP_REPO.to_string(),
                path: "guestbook".to_string(),
                target_revision: "HEAD".to_string(),
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_application() {
        let app = default_application();
        assert_eq!(app.metadata.name, "default");
        assert_eq!(app.spec.project, "default");
        assert_eq!(app.spec.destination.server, "https://kubernetes.default.svc");
        assert_eq!(app.spec.source.path, "guestbook");
        assert_eq!(app.spec.source.target_revision, "HEAD");
    }

    #[tokio::test]
    async fn test_rest_rejects_bad_host() {
        let err = ArgoRest
            .create_application("1.2.3.4", "t", &default_application())
            .await
            .unwrap_err();
        assert!(matches!(err, ArgoError::InvalidHost(_)));
    }
}
