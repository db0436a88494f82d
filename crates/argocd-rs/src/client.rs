//! Argo CD API client
//!
//! Thin async wrapper over the Argo CD REST API. A freshly installed Argo CD
//! serves a self-signed certificate, so certificate verification is off for
//! this client.

use crate::error::ArgoError;
use crate::types::{
    Application, ClusterRequest, ErrorBody, RepositoryRequest, SessionRequest, SessionResponse,
    UpdatePasswordRequest,
};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for one Argo CD server
#[derive(Debug, Clone)]
pub struct ArgoClient {
    http: reqwest::Client,
    host: String,
    token: Option<String>,
}

impl ArgoClient {
    /// Create an unauthenticated client for `host` (e.g. `https://1.2.3.4`)
    pub fn new(host: &str) -> Result<Self, ArgoError> {
        let host = normalize_host(host)?;
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            host,
            token: None,
        })
    }

    /// Same server, authenticated with `token`
    pub fn with_token(&self, token: impl Into<String>) -> Self {
        Self {
            http: self.http.clone(),
            host: self.host.clone(),
            token: Some(token.into()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Exchange a username and password for a session token
    pub async fn create_session(
        &self,
        username: &str,
        password: &str,
    ) -> Result<String, ArgoError> {
        let body = SessionRequest { username, password };
        let response = self
            .send(self.request(Method::POST, "/api/v1/session").json(&body))
            .await?;
        let session: SessionResponse = serde_json::from_slice(&response.bytes().await?)?;
        if session.token.is_empty() {
            return Err(ArgoError::EmptyToken);
        }
        Ok(session.token)
    }

    /// Change an account password
    pub async fn update_password(&self, req: &UpdatePasswordRequest) -> Result<(), ArgoError> {
        self.send_json(Method::PUT, "/api/v1/account/password", req)
            .await
    }

    /// Register a git repository
    pub async fn create_repository(&self, req: &RepositoryRequest) -> Result<(), ArgoError> {
        self.send_json(Method::POST, "/api/v1/repositories", req)
            .await
    }

    /// Register an external cluster
    pub async fn create_cluster(&self, req: &ClusterRequest) -> Result<(), ArgoError> {
        self.send_json(Method::POST, "/api/v1/clusters", req).await
    }

    /// Create an application
    pub async fn create_application(&self, app: &Application) -> Result<(), ArgoError> {
        self.send_json(Method::POST, "/api/v1/applications", app)
            .await
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.host, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send_json<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<(), ArgoError> {
        self.send(self.request(method, path).json(body)).await?;
        Ok(())
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, ArgoError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let raw = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&raw)
            .ok()
            .and_then(|b| b.text().map(str::to_string))
            .unwrap_or_else(|| raw.trim().to_string());

        tracing::debug!(status = status.as_u16(), %message, "Argo CD request failed");

        if status == StatusCode::UNAUTHORIZED {
            return Err(ArgoError::Unauthorized(message));
        }
        Err(ArgoError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

/// Exchange credentials for a token against `host`
pub async fn get_token(host: &str, username: &str, password: &str) -> Result<String, ArgoError> {
    ArgoClient::new(host)?
        .create_session(username, password)
        .await
}

fn normalize_host(host: &str) -> Result<String, ArgoError> {
    let host = host.trim().trim_end_matches('/');
    if !(host.starts_with("https://") || host.starts_with("http://")) {
        return Err(ArgoError::InvalidHost(host.to_string()));
    }
    Ok(host.to_string())
}
