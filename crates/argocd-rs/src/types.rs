//! Request and response bodies for the Argo CD REST API

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub(crate) struct SessionRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SessionResponse {
    #[serde(default)]
    pub token: String,
}

/// Error body returned by the API (grpc-gateway shape)
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub message: String,
}

impl ErrorBody {
    pub fn text(&self) -> Option<&str> {
        [self.message.as_str(), self.error.as_str()]
            .into_iter()
            .find(|s| !s.is_empty())
    }
}

/// `PUT /api/v1/account/password`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePasswordRequest {
    pub current_password: String,
    pub new_password: String,
    /// Account name, empty means the caller's own account
    pub name: String,
}

/// `POST /api/v1/repositories`
#[derive(Debug, Clone, Serialize)]
pub struct RepositoryRequest {
    pub repo: String,
    pub username: String,
    pub password: String,
}

/// `POST /api/v1/clusters`
#[derive(Debug, Clone, Serialize)]
pub struct ClusterRequest {
    pub name: String,
    pub server: String,
    pub config: ClusterConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub bearer_token: String,
    pub tls_client_config: TlsClientConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsClientConfig {
    /// Base64 PEM bundle
    pub ca_data: String,
    pub insecure: bool,
}

/// `POST /api/v1/applications`
#[derive(Debug, Clone, Serialize)]
pub struct Application {
    pub metadata: ApplicationMetadata,
    pub spec: ApplicationSpec,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplicationMetadata {
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplicationSpec {
    pub project: String,
    pub destination: ApplicationDestination,
    pub source: ApplicationSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplicationDestination {
    pub name: String,
    pub namespace: String,
    pub server: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplicationSource {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    pub path: String,
    #[serde(rename = "targetRevision")]
    pub target_revision: String,
}
