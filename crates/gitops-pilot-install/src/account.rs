//! Codefresh account collaborator
//!
//! Lists the clusters and git integrations stored in the account, and hands
//! out per-cluster credentials for import into Argo CD.

use std::time::Duration;

use async_trait::async_trait;
use gitops_pilot_core::{AccountSettings, ClusterSelection, Secret};
use reqwest::{Method, RequestBuilder, Response, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::AccountError;

/// Only self-managed clusters can be imported
pub const IMPORTABLE_PROVIDER: &str = "local";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Git context types listed for repository registration
const GIT_CONTEXT_TYPES: &[&str] = &[
    "git.github",
    "git.github-app",
    "git.gitlab",
    "git.bitbucket",
    "git.bitbucket-server",
    "git.stash",
];

/// Cluster record as listed by the account
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AccountCluster {
    #[serde(rename = "_id", default)]
    pub id: String,
    /// Identifier used everywhere else (selection, credentials, Argo name)
    pub selector: String,
    #[serde(default)]
    pub provider: String,
}

/// Credential bundle of one cluster
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterCredentials {
    pub url: String,
    /// Base64 PEM bundle, passed through to Argo CD
    #[serde(default)]
    pub ca: String,
    pub auth: ClusterAuth,
}

#[derive(Clone, Deserialize)]
pub struct ClusterAuth {
    /// Base64 encoded bearer token
    #[serde(default)]
    pub bearer: String,
}

impl std::fmt::Debug for ClusterAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterAuth").field("bearer", &"***").finish()
    }
}

/// Git integration stored in the account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitContext {
    pub name: String,
    pub auth_type: String,
    pub username: Option<String>,
    pub password: Secret,
}

#[derive(Deserialize)]
struct ContextPayload {
    metadata: ContextMetadata,
    spec: ContextSpec,
}

#[derive(Deserialize)]
struct ContextMetadata {
    name: String,
}

#[derive(Deserialize)]
struct ContextSpec {
    #[serde(default)]
    data: ContextData,
}

#[derive(Default, Deserialize)]
struct ContextData {
    #[serde(default)]
    auth: ContextAuth,
}

#[derive(Default, Deserialize)]
struct ContextAuth {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: String,
}

impl From<ContextPayload> for GitContext {
    fn from(payload: ContextPayload) -> Self {
        let auth = payload.spec.data.auth;
        GitContext {
            name: payload.metadata.name,
            auth_type: auth.kind,
            username: auth.username.filter(|u| !u.is_empty()),
            password: Secret::new(auth.password),
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait AccountApi: Send + Sync {
    async fn list_clusters(&self) -> Result<Vec<AccountCluster>, AccountError>;

    async fn cluster_credentials(&self, selector: &str) -> Result<ClusterCredentials, AccountError>;

    async fn git_contexts(&self) -> Result<Vec<GitContext>, AccountError>;
}

/// REST client for the Codefresh API
#[derive(Debug, Clone)]
pub struct CodefreshClient {
    http: reqwest::Client,
    host: String,
    token: Secret,
}

impl CodefreshClient {
    pub fn new(settings: &AccountSettings) -> Result<Self, AccountError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            host: settings.host.trim_end_matches('/').to_string(),
            token: settings.token.clone(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Authenticated request builder for a fixed `path` under the account host
    pub(crate) fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.authorized(self.http.request(method, format!("{}{}", self.host, path)))
    }

    /// Account URL with each of `segments` percent-encoded as one path segment
    pub(crate) fn url(&self, segments: &[&str]) -> Result<Url, AccountError> {
        let invalid = |reason: String| AccountError::InvalidHost {
            host: self.host.clone(),
            reason,
        };
        let mut url = Url::parse(&self.host).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid("cannot be a base URL".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header(reqwest::header::AUTHORIZATION, self.token.expose())
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
    ) -> Result<T, AccountError> {
        let response = check_status(builder.send().await?).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

async fn check_status(response: Response) -> Result<Response, AccountError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default().trim().to_string();
    debug!(status = status.as_u16(), %message, "account request failed");
    Err(AccountError::Api {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl AccountApi for CodefreshClient {
    async fn list_clusters(&self) -> Result<Vec<AccountCluster>, AccountError> {
        self.get_json(self.request(Method::GET, "/api/clusters"))
            .await
    }

    async fn cluster_credentials(
        &self,
        selector: &str,
    ) -> Result<ClusterCredentials, AccountError> {
        let url = self.url(&["api", "clusters", selector, "credentials"])?;
        self.get_json(self.authorized(self.http.get(url))).await
    }

    async fn git_contexts(&self) -> Result<Vec<GitContext>, AccountError> {
        let mut query: Vec<(&str, &str)> = GIT_CONTEXT_TYPES.iter().map(|t| ("type", *t)).collect();
        query.push(("decrypt", "true"));
        let payloads: Vec<ContextPayload> = self
            .get_json(self.request(Method::GET, "/api/contexts").query(&query))
            .await?;
        Ok(payloads.into_iter().map(GitContext::from).collect())
    }
}

/// Clusters that can be imported, in account order
pub fn filter_importable(clusters: Vec<AccountCluster>) -> Vec<AccountCluster> {
    clusters
        .into_iter()
        .filter(|c| c.provider == IMPORTABLE_PROVIDER)
        .collect()
}

/// Apply the user's selection to the importable candidates.
///
/// Selected identifiers that are not candidates are skipped with a warning.
pub fn select_clusters(
    candidates: Vec<AccountCluster>,
    selection: &ClusterSelection,
) -> Vec<AccountCluster> {
    if let ClusterSelection::Ids(ids) = selection {
        for id in ids {
            if !candidates.iter().any(|c| &c.selector == id) {
                warn!(cluster = %id, "cluster is not importable, skipping");
            }
        }
    }
    candidates
        .into_iter()
        .filter(|c| selection.includes(&c.selector))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(selector: &str, provider: &str) -> AccountCluster {
        AccountCluster {
            id: format!("id-{}", selector),
            selector: selector.to_string(),
            provider: provider.to_string(),
        }
    }

    fn client(host: &str) -> CodefreshClient {
        CodefreshClient::new(&AccountSettings {
            host: host.to_string(),
            token: Secret::new("cf"),
        })
        .unwrap()
    }

    #[test]
    fn test_selector_is_one_encoded_segment() {
        let url = client("https://g.codefresh.io/")
            .url(&["api", "clusters", "team/a b?x", "credentials"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://g.codefresh.io/api/clusters/team%2Fa%20b%3Fx/credentials"
        );

        let url = client("https://cf.example.com/prefix")
            .url(&["api", "clusters", "A", "credentials"])
            .unwrap();
        assert_eq!(url.as_str(), "https://cf.example.com/prefix/api/clusters/A/credentials");
    }

    #[test]
    fn test_bad_host_is_reported() {
        let err = client("not a url").url(&["api"]).unwrap_err();
        assert!(matches!(err, AccountError::InvalidHost { .. }));
    }

    #[test]
    fn test_only_local_clusters_are_importable() {
        let importable = filter_importable(vec![cluster("A", "local"), cluster("B", "gke")]);
        let selectors: Vec<_> = importable.iter().map(|c| c.selector.as_str()).collect();
        assert_eq!(selectors, vec!["A"]);
    }

    #[test]
    fn test_selection_skips_unknown_ids() {
        let candidates = vec![cluster("A", "local"), cluster("C", "local")];
        let selected = select_clusters(
            candidates.clone(),
            &ClusterSelection::Ids(vec!["C".to_string(), "B".to_string()]),
        );
        assert_eq!(selected, vec![cluster("C", "local")]);
        assert_eq!(select_clusters(candidates, &ClusterSelection::All).len(), 2);
    }

    #[test]
    fn test_cluster_list_decodes() {
        let clusters: Vec<AccountCluster> = serde_json::from_str(
            r#"[{"_id":"5f1","selector":"prod","provider":"local","cluster":{"name":"prod"}},
                {"selector":"gke-dev","provider":"gke"}]"#,
        )
        .unwrap();
        assert_eq!(clusters[0].id, "5f1");
        assert_eq!(clusters[1].provider, "gke");
    }

    #[test]
    fn test_credentials_debug_hides_bearer() {
        let creds: ClusterCredentials = serde_json::from_str(
            r#"{"url":"https://10.0.0.1","ca":"Y2E=","auth":{"bearer":"c2VjcmV0","type":"token"}}"#,
        )
        .unwrap();
        assert_eq!(creds.auth.bearer, "c2VjcmV0");
        assert!(!format!("{:?}", creds).contains("c2VjcmV0"));
    }

    #[test]
    fn test_git_context_decodes() {
        let payload: ContextPayload = serde_json::from_str(
            r#"{"metadata":{"name":"github"},
                "spec":{"type":"git.github","data":{"auth":{
                    "type":"basic","username":"","password":"ghp_x"}}}}"#,
        )
        .unwrap();
        let context = GitContext::from(payload);
        assert_eq!(context.name, "github");
        assert_eq!(context.auth_type, "basic");
        assert_eq!(context.username, None);
        assert_eq!(context.password.expose(), "ghp_x");
    }

    #[test]
    fn test_client_trims_host() {
        let client = CodefreshClient::new(&AccountSettings {
            host: "https://g.codefresh.io/".to_string(),
            token: Secret::new("t"),
        })
        .unwrap();
        assert_eq!(client.host(), "https://g.codefresh.io");
    }
}
