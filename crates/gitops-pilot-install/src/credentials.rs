//! Credential bootstrap
//!
//! A fresh Argo CD install only knows the admin password it generated at
//! first boot. Bootstrap walks four states:
//!
//! 1. `AutogeneratedPasswordKnown` - password read from the initial secret
//! 2. `InitialTokenObtained` - token for the autogenerated password, with
//!    exponential retry while the API server comes up
//! 3. `PasswordRotated` - admin password changed to the desired one
//! 4. `RotatedTokenObtained` - fresh token for the new password
//!
//! The result is an [`ArgoCredential`] that only lives in memory.

use std::time::Duration;

use argocd_rs::{ArgoError, UpdatePasswordRequest};
use gitops_pilot_core::{
    ArgoCredential, ArgoSettings, RetryLimit, RetryPolicy, Secret, ServiceEndpoint, retry,
};
use tracing::info;

use crate::argo::ArgoApi;
use crate::cluster::{ClusterApi, INITIAL_ADMIN_SECRET};
use crate::error::{InstallError, RunError, Step, StepContext};

/// Key of the password inside the initial admin secret
pub const INITIAL_PASSWORD_KEY: &str = "password";

/// First delay of the token retry
pub const TOKEN_RETRY_BASE: Duration = Duration::from_secs(5);

/// Longest single delay of the token retry
pub const TOKEN_RETRY_MAX_DELAY: Duration = Duration::from_secs(80);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    AutogeneratedPasswordKnown,
    InitialTokenObtained,
    PasswordRotated,
    RotatedTokenObtained,
}

impl std::fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BootstrapState::AutogeneratedPasswordKnown => "autogenerated password known",
            BootstrapState::InitialTokenObtained => "initial token obtained",
            BootstrapState::PasswordRotated => "password rotated",
            BootstrapState::RotatedTokenObtained => "rotated token obtained",
        };
        write!(f, "{}", name)
    }
}

/// Retry policy for the first token exchange, optionally capped overall
pub fn token_policy(timeout: Option<Duration>) -> RetryPolicy {
    let policy = RetryPolicy::exponential(TOKEN_RETRY_BASE).with_max_delay(TOKEN_RETRY_MAX_DELAY);
    match timeout {
        Some(budget) => policy.with_limit(RetryLimit::Elapsed(budget)),
        None => policy,
    }
}

/// Bootstrap run against one Argo CD server
pub struct CredentialBootstrap<'a> {
    cluster: &'a dyn ClusterApi,
    argo: &'a dyn ArgoApi,
    host: &'a ServiceEndpoint,
    namespace: &'a str,
    state: Option<BootstrapState>,
}

impl<'a> CredentialBootstrap<'a> {
    pub fn new(
        cluster: &'a dyn ClusterApi,
        argo: &'a dyn ArgoApi,
        host: &'a ServiceEndpoint,
        namespace: &'a str,
    ) -> Self {
        Self {
            cluster,
            argo,
            host,
            namespace,
            state: None,
        }
    }

    /// Last state reached, `None` before the password was read
    pub fn state(&self) -> Option<BootstrapState> {
        self.state
    }

    fn advance(&mut self, state: BootstrapState) {
        info!(host = %self.host, "credential bootstrap: {}", state);
        self.state = Some(state);
    }

    /// Run all four transitions, stopping at the first failure
    pub async fn run(
        &mut self,
        settings: &ArgoSettings,
        policy: &RetryPolicy,
    ) -> Result<ArgoCredential, RunError> {
        let autogenerated = self
            .cluster
            .secret_value(self.namespace, INITIAL_ADMIN_SECRET, INITIAL_PASSWORD_KEY)
            .await
            .map(Secret::from)
            .step(Step::AutogeneratedPassword)?;
        self.advance(BootstrapState::AutogeneratedPasswordKnown);

        let initial_token = self
            .initial_token(&settings.username, &autogenerated, policy)
            .await
            .step(Step::ObtainToken)?;
        self.advance(BootstrapState::InitialTokenObtained);

        let request = UpdatePasswordRequest {
            current_password: autogenerated.expose().to_string(),
            new_password: settings.password.expose().to_string(),
            name: settings.username.clone(),
        };
        self.argo
            .update_password(self.host.url(), initial_token.expose(), &request)
            .await
            .map_err(InstallError::PasswordRotation)
            .step(Step::RotatePassword)?;
        self.advance(BootstrapState::PasswordRotated);

        let token = self
            .argo
            .create_token(
                self.host.url(),
                &settings.username,
                settings.password.expose(),
            )
            .await
            .map(Secret::from)
            .map_err(|source| InstallError::CredentialExchange {
                attempts: 1,
                source,
            })
            .step(Step::ObtainToken)?;
        self.advance(BootstrapState::RotatedTokenObtained);

        Ok(ArgoCredential {
            username: settings.username.clone(),
            password: settings.password.clone(),
            token,
        })
    }

    async fn initial_token(
        &self,
        username: &str,
        password: &Secret,
        policy: &RetryPolicy,
    ) -> Result<Secret, InstallError> {
        let host = self.host.url();
        let argo = self.argo;
        let exchange = || async move { argo.create_token(host, username, password.expose()).await };

        retry(policy, "Getting argocd token", ArgoError::is_retryable_on_startup, exchange)
            .await
            .map(Secret::from)
            .map_err(|err| {
                let attempts = err.attempts();
                InstallError::CredentialExchange {
                    attempts,
                    source: err.into_last(),
                }
            })
    }
}
