//! Kubernetes client collaborator
//!
//! Creates a K8s client from a kubeconfig (or in-cluster config) and wraps
//! the handful of calls the workflows need behind [`ClusterApi`].

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret, Service};
use kube::api::{
    Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams, PostParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::{ApiCapabilities, ApiResource, Scope};
use kube::{Client, Config};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::error::KubeError;
use crate::manifest::ClusterObject;
use gitops_pilot_core::{KubeTarget, ServiceEndpoint};

/// Field manager recorded on server-side applied objects
pub const FIELD_MANAGER: &str = "gitops-pilot";

/// Label selector of the Argo CD API server service
pub const ARGO_SERVER_SELECTOR: &str = "app.kubernetes.io/name=argocd-server";

/// Secret holding the first-boot admin password
pub const INITIAL_ADMIN_SECRET: &str = "argocd-initial-admin-secret";

/// Cluster operations used by the install, update and uninstall flows.
///
/// Every call that targets a named object reports "already exists" and
/// "not found" as distinct [`KubeError`] variants.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create the namespace unless it already exists
    async fn ensure_namespace(&self, name: &str) -> Result<(), KubeError>;

    async fn list_namespaces(&self) -> Result<Vec<String>, KubeError>;

    /// Create one manifest object. Namespaced kinds land in the object's own
    /// namespace, or `namespace` if it names none.
    async fn create_object(&self, object: &ClusterObject, namespace: &str)
    -> Result<(), KubeError>;

    async fn delete_object(&self, object: &ClusterObject, namespace: &str)
    -> Result<(), KubeError>;

    /// Switch the first service matching `selector` to type LoadBalancer
    async fn expose_service(&self, namespace: &str, selector: &str) -> Result<(), KubeError>;

    /// Load balancer address of the first service matching `selector`,
    /// `None` while no ingress has been assigned
    async fn service_endpoint(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Option<ServiceEndpoint>, KubeError>;

    /// One value from a secret, decoded as UTF-8
    async fn secret_value(&self, namespace: &str, name: &str, key: &str)
    -> Result<String, KubeError>;
}

/// Builds a [`ClusterApi`] for a target; the first step of every flow
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, target: &KubeTarget) -> Result<Arc<dyn ClusterApi>, KubeError>;
}

/// Connector backed by kube-rs
#[derive(Debug, Default, Clone)]
pub struct KubeConnector;

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, target: &KubeTarget) -> Result<Arc<dyn ClusterApi>, KubeError> {
        let client = create_client(target).await?;
        Ok(Arc::new(KubeCluster::new(client)))
    }
}

/// Create a Kubernetes client for the target cluster
pub async fn create_client(target: &KubeTarget) -> Result<Client, KubeError> {
    let config = if target.in_cluster {
        Config::incluster().map_err(|e| KubeError::ClientCreate(e.to_string()))?
    } else {
        let options = KubeConfigOptions {
            context: target.context.clone(),
            ..Default::default()
        };
        match kubeconfig_path(target.config_path.as_deref()) {
            Some(path) => {
                let kubeconfig = read_kubeconfig(&path)?;
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| KubeError::ClientCreate(e.to_string()))?
            }
            None => Config::from_kubeconfig(&options)
                .await
                .map_err(|e| KubeError::ClientCreate(e.to_string()))?,
        }
    };

    Client::try_from(config).map_err(|e| KubeError::ClientCreate(e.to_string()))
}

/// Kubeconfig file a target without `--in-cluster` reads
pub fn kubeconfig_path(explicit: Option<&Path>) -> Option<PathBuf> {
    resolve_kubeconfig_path(
        explicit.map(Path::as_os_str),
        std::env::var_os("KUBECONFIG").as_deref(),
        dirs_next::home_dir(),
    )
}

/// Explicit path, then `KUBECONFIG`, then `~/.kube/config`.
///
/// Both explicit and environment values may be path lists; the first
/// entry wins.
fn resolve_kubeconfig_path(
    explicit: Option<&OsStr>,
    env: Option<&OsStr>,
    home: Option<PathBuf>,
) -> Option<PathBuf> {
    let first = |value: &OsStr| {
        std::env::split_paths(value).find(|p| !p.as_os_str().is_empty())
    };
    explicit
        .and_then(first)
        .or_else(|| env.and_then(first))
        .or_else(|| home.map(|home| home.join(".kube").join("config")))
}

fn read_kubeconfig(path: &Path) -> Result<Kubeconfig, KubeError> {
    Kubeconfig::read_from(path).map_err(|e| KubeError::Kubeconfig {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Context names from a kubeconfig file, in file order
pub fn list_contexts(path: &Path) -> Result<Vec<String>, KubeError> {
    let kubeconfig = read_kubeconfig(path)?;
    Ok(kubeconfig.contexts.into_iter().map(|c| c.name).collect())
}

/// [`ClusterApi`] over a live kube-rs client
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Resolve the API resource and scope for an object through discovery.
    ///
    /// Resolved per call so CRDs created earlier in the same run are seen.
    async fn resolve(
        &self,
        object: &ClusterObject,
    ) -> Result<(ApiResource, ApiCapabilities), KubeError> {
        let (group, version) = parse_api_version(&object.api_version);
        let gvk = GroupVersionKind::gvk(&group, &version, &object.kind);
        kube::discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| KubeError::UnknownKind {
                api_version: object.api_version.clone(),
                kind: object.kind.clone(),
                reason: e.to_string(),
            })
    }

    async fn dynamic_api(
        &self,
        object: &ClusterObject,
        namespace: &str,
    ) -> Result<(Api<DynamicObject>, DynamicObject), KubeError> {
        let (resource, caps) = self.resolve(object).await?;
        let mut dynamic: DynamicObject =
            serde_json::from_value(object.value.clone()).map_err(|e| KubeError::InvalidObject {
                kind: object.kind.clone(),
                name: object.name.clone(),
                reason: e.to_string(),
            })?;

        let api = match caps.scope {
            Scope::Namespaced => {
                let ns = object.namespace.as_deref().unwrap_or(namespace);
                dynamic.metadata.namespace = Some(ns.to_string());
                Api::namespaced_with(self.client.clone(), ns, &resource)
            }
            Scope::Cluster => Api::all_with(self.client.clone(), &resource),
        };
        Ok((api, dynamic))
    }

    async fn first_service(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Option<Service>, KubeError> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let list = services
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list.items.into_iter().next())
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn ensure_namespace(&self, name: &str) -> Result<(), KubeError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": name }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&ns))
            .await?;
        Ok(())
    }

    async fn list_namespaces(&self) -> Result<Vec<String>, KubeError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }

    async fn create_object(
        &self,
        object: &ClusterObject,
        namespace: &str,
    ) -> Result<(), KubeError> {
        let (api, dynamic) = self.dynamic_api(object, namespace).await?;
        api.create(&PostParams::default(), &dynamic)
            .await
            .map_err(|e| KubeError::for_object(e, &object.kind, &object.name))?;
        debug!(kind = %object.kind, name = %object.name, "created");
        Ok(())
    }

    async fn delete_object(
        &self,
        object: &ClusterObject,
        namespace: &str,
    ) -> Result<(), KubeError> {
        let (api, _) = self.dynamic_api(object, namespace).await?;
        api.delete(&object.name, &DeleteParams::default())
            .await
            .map_err(|e| KubeError::for_object(e, &object.kind, &object.name))?;
        debug!(kind = %object.kind, name = %object.name, "deleted");
        Ok(())
    }

    async fn expose_service(&self, namespace: &str, selector: &str) -> Result<(), KubeError> {
        let service = self
            .first_service(namespace, selector)
            .await?
            .ok_or_else(|| KubeError::ServiceNotFound(selector.to_string()))?;
        let name = service.metadata.name.unwrap_or_default();

        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "spec": { "type": "LoadBalancer" } });
        services
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| KubeError::for_object(e, "Service", &name))?;
        Ok(())
    }

    async fn service_endpoint(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Option<ServiceEndpoint>, KubeError> {
        let Some(service) = self.first_service(namespace, selector).await? else {
            return Ok(None);
        };
        Ok(endpoint_from_service(&service))
    }

    async fn secret_value(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<String, KubeError> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = secrets
            .get(name)
            .await
            .map_err(|e| KubeError::for_object(e, "Secret", name))?;

        let missing = || KubeError::SecretKeyMissing {
            namespace: namespace.to_string(),
            name: name.to_string(),
            key: key.to_string(),
        };
        let bytes = secret
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .map(|b| b.0.clone())
            .ok_or_else(missing)?;
        String::from_utf8(bytes).map_err(|_| missing())
    }
}

/// First load balancer ingress of a service, hostname preferred over IP
pub fn endpoint_from_service(service: &Service) -> Option<ServiceEndpoint> {
    let ingress = service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|list| list.first())?;
    ServiceEndpoint::from_ingress(ingress.hostname.as_deref(), ingress.ip.as_deref())
}

/// Parse apiVersion into (group, version)
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}
