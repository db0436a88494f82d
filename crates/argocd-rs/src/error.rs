//! Error types for argocd-rs

use thiserror::Error;

/// Errors that can occur when talking to the Argo CD API
#[derive(Error, Debug)]
pub enum ArgoError {
    /// Host is not an http(s) URL
    #[error("Invalid host: {0}")]
    InvalidHost(String),

    /// Transport level failure (connect, TLS, timeout)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Credentials rejected
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Non-success status returned by the API
    #[error("Argo CD API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Failed to decode a response body
    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    /// Session endpoint answered without a token
    #[error("Argo CD returned an empty session token")]
    EmptyToken,
}

impl ArgoError {
    /// Whether the failure looks like the server is not ready yet, as
    /// opposed to a request that will never succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ArgoError::Http(_) => true,
            ArgoError::Api { status, .. } => *status >= 500 || *status == 429,
            ArgoError::InvalidHost(_)
            | ArgoError::Unauthorized(_)
            | ArgoError::Decode(_)
            | ArgoError::EmptyToken => false,
        }
    }

    /// Whether a request may still succeed while a fresh install settles.
    ///
    /// Wider than [`is_transient`](Self::is_transient): a load balancer that
    /// is still converging can answer with proxy error pages (4xx or
    /// non-JSON bodies). Only rejected credentials and a malformed host
    /// are final.
    pub fn is_retryable_on_startup(&self) -> bool {
        match self {
            ArgoError::InvalidHost(_) | ArgoError::Unauthorized(_) => false,
            ArgoError::Api { status, .. } => *status != 401 && *status != 403,
            ArgoError::Http(_) | ArgoError::Decode(_) | ArgoError::EmptyToken => true,
        }
    }

    /// Whether the API reported that the object already exists
    pub fn is_already_exists(&self) -> bool {
        match self {
            ArgoError::Api { status, message } => {
                *status == 409 || message.contains("already exists")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient() {
        let err = ArgoError::Api {
            status: 503,
            message: "unavailable".to_string(),
        };
        assert!(err.is_transient());
        let err = ArgoError::Api {
            status: 400,
            message: "bad".to_string(),
        };
        assert!(!err.is_transient());
        assert!(!ArgoError::Unauthorized("nope".to_string()).is_transient());
    }

    #[test]
    fn proxy_pages_are_retryable_on_startup() {
        let not_found = ArgoError::Api {
            status: 404,
            message: "default backend - 404".to_string(),
        };
        assert!(not_found.is_retryable_on_startup());
        assert!(!not_found.is_transient());

        let html = serde_json::from_str::<serde_json::Value>("<html>502</html>").unwrap_err();
        assert!(ArgoError::Decode(html).is_retryable_on_startup());

        let forbidden = ArgoError::Api {
            status: 403,
            message: "permission denied".to_string(),
        };
        assert!(!forbidden.is_retryable_on_startup());
        assert!(!ArgoError::Unauthorized("nope".to_string()).is_retryable_on_startup());
        assert!(!ArgoError::InvalidHost("ftp://x".to_string()).is_retryable_on_startup());
    }

    #[test]
    fn conflict_is_already_exists() {
        let err = ArgoError::Api {
            status: 400,
            message: "existing repository spec is different; use upsert flag to force update"
                .to_string(),
        };
        assert!(!err.is_already_exists());
        let err = ArgoError::Api {
            status: 409,
            message: "conflict".to_string(),
        };
        assert!(err.is_already_exists());
    }
}
