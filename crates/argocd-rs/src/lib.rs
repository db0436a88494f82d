//! argocd-rs: Rust SDK for the Argo CD REST API
//!
//! Covers the calls needed to bootstrap a fresh Argo CD install: session
//! tokens, password rotation, and registering repositories, clusters and
//! applications.

pub mod client;
pub mod error;
pub mod types;

pub use client::{ArgoClient, get_token};
pub use error::ArgoError;
pub use types::{
    Application, ApplicationDestination, ApplicationMetadata, ApplicationSource, ApplicationSpec,
    ClusterConfig, ClusterRequest, RepositoryRequest, TlsClientConfig, UpdatePasswordRequest,
};
