//! Keel kubehub: the narrow cluster contract the engine depends on, and its
//! kube-rs implementation.

#![forbid(unsafe_code)]

use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use keel_core::{Platform, ResourceKey, FINALIZER};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind, ObjectMeta},
    Client, ResourceExt,
};
use once_cell::sync::OnceCell;
use tracing::{debug, info};

static CLIENT: OnceCell<Client> = OnceCell::new();

/// Shared kube client, created on first use from the ambient kubeconfig or
/// in-cluster service account.
pub async fn get_kube_client() -> anyhow::Result<Client> {
    if let Some(c) = CLIENT.get() {
        return Ok(c.clone());
    }
    let c = Client::try_default().await?;
    let _ = CLIENT.set(c.clone());
    Ok(c)
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("kube: {0}")]
    Kube(kube::Error),
    #[error("{0}")]
    Other(String),
}

impl From<kube::Error> for ClientError {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(ae) if ae.code == 404 => ClientError::NotFound(ae.message.clone()),
            kube::Error::Api(ae) if ae.code == 409 => ClientError::Conflict(ae.message.clone()),
            _ => ClientError::Kube(e),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self { ClientError::Other(e.to_string()) }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Cluster operations the engine performs outside of component hooks.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_platform(&self, key: &ResourceKey) -> ClientResult<Option<Platform>>;

    /// Replace the status subresource; the object's resourceVersion guards
    /// against lost updates and a stale one yields `ClientError::Conflict`.
    async fn replace_status(&self, platform: &Platform) -> ClientResult<Platform>;

    async fn add_finalizer(&self, key: &ResourceKey) -> ClientResult<()>;
    async fn remove_finalizer(&self, key: &ResourceKey) -> ClientResult<()>;

    /// Service account and cluster role binding lifecycle jobs run as.
    async fn ensure_lifecycle_account(&self, key: &ResourceKey) -> ClientResult<()>;
    async fn delete_lifecycle_account(&self, key: &ResourceKey) -> ClientResult<()>;

    async fn delete_namespace(&self, name: &str) -> ClientResult<()>;
    async fn namespace_exists(&self, name: &str) -> ClientResult<bool>;

    /// Remove the hosting cluster's registration from the cluster manager.
    async fn detach_local_cluster(&self) -> ClientResult<()>;
}

pub fn lifecycle_account_name(key: &ResourceKey) -> String {
    format!("keel-lifecycle-{}", key.name)
}

pub fn lifecycle_binding_name(key: &ResourceKey) -> String {
    format!("keel-lifecycle-{}-{}", key.namespace, key.name)
}

/// `ClusterClient` over a live API server.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> anyhow::Result<Self> {
        Ok(Self::new(get_kube_client().await?))
    }

    fn platforms(&self, key: &ResourceKey) -> Api<Platform> {
        Api::namespaced(self.client.clone(), &key.namespace)
    }

    async fn set_finalizers(&self, key: &ResourceKey, finalizers: Vec<String>) -> ClientResult<()> {
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        self.platforms(key).patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    }
}

fn ignore_not_found<T>(r: ClientResult<T>) -> ClientResult<()> {
    match r {
        Ok(_) | Err(ClientError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

fn ignore_exists<T>(r: ClientResult<T>) -> ClientResult<()> {
    match r {
        Ok(_) | Err(ClientError::Conflict(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

#[async_trait::async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_platform(&self, key: &ResourceKey) -> ClientResult<Option<Platform>> {
        Ok(self.platforms(key).get_opt(&key.name).await?)
    }

    async fn replace_status(&self, platform: &Platform) -> ClientResult<Platform> {
        let key = platform.key();
        let body = serde_json::to_vec(platform)?;
        let out = self.platforms(&key).replace_status(&key.name, &PostParams::default(), body).await?;
        metrics::counter!("keel_status_writes_total", 1u64);
        Ok(out)
    }

    async fn add_finalizer(&self, key: &ResourceKey) -> ClientResult<()> {
        let Some(p) = self.get_platform(key).await? else { return Err(ClientError::NotFound(key.to_string())) };
        if p.has_finalizer() {
            return Ok(());
        }
        let mut f = p.finalizers().to_vec();
        f.push(FINALIZER.to_string());
        self.set_finalizers(key, f).await?;
        debug!(resource = %key, "finalizer added");
        Ok(())
    }

    async fn remove_finalizer(&self, key: &ResourceKey) -> ClientResult<()> {
        let Some(p) = self.get_platform(key).await? else { return Ok(()) };
        if !p.has_finalizer() {
            return Ok(());
        }
        let f: Vec<String> = p.finalizers().iter().filter(|f| *f != FINALIZER).cloned().collect();
        ignore_not_found(self.set_finalizers(key, f).await)?;
        info!(resource = %key, "finalizer removed");
        Ok(())
    }

    async fn ensure_lifecycle_account(&self, key: &ResourceKey) -> ClientResult<()> {
        let sa_name = lifecycle_account_name(key);
        let sa = ServiceAccount {
            metadata: ObjectMeta { name: Some(sa_name.clone()), namespace: Some(key.namespace.clone()), ..Default::default() },
            ..Default::default()
        };
        let sas: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &key.namespace);
        ignore_exists(sas.create(&PostParams::default(), &sa).await.map_err(ClientError::from))?;

        let crb = ClusterRoleBinding {
            metadata: ObjectMeta { name: Some(lifecycle_binding_name(key)), ..Default::default() },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: "cluster-admin".to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: sa_name,
                namespace: Some(key.namespace.clone()),
                ..Default::default()
            }]),
        };
        let crbs: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        ignore_exists(crbs.create(&PostParams::default(), &crb).await.map_err(ClientError::from))?;
        debug!(resource = %key, "lifecycle account ensured");
        Ok(())
    }

    async fn delete_lifecycle_account(&self, key: &ResourceKey) -> ClientResult<()> {
        let crbs: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        ignore_not_found(crbs.delete(&lifecycle_binding_name(key), &DeleteParams::default()).await.map_err(ClientError::from))?;
        let sas: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &key.namespace);
        ignore_not_found(sas.delete(&lifecycle_account_name(key), &DeleteParams::default()).await.map_err(ClientError::from))?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> ClientResult<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        ignore_not_found(api.delete(name, &DeleteParams::default()).await.map_err(ClientError::from))
    }

    async fn namespace_exists(&self, name: &str) -> ClientResult<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn detach_local_cluster(&self) -> ClientResult<()> {
        let gvk = GroupVersionKind::gvk("management.cattle.io", "v3", "Cluster");
        let ar = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        ignore_not_found(api.delete("local", &DeleteParams::default()).await.map_err(ClientError::from))?;
        info!("local cluster registration removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: format!("code {code}"), reason: String::new(), code })
    }

    #[test]
    fn maps_api_errors() {
        assert!(matches!(ClientError::from(api_err(404)), ClientError::NotFound(_)));
        assert!(matches!(ClientError::from(api_err(409)), ClientError::Conflict(_)));
        assert!(matches!(ClientError::from(api_err(500)), ClientError::Kube(_)));
    }

    #[test]
    fn tolerant_helpers() {
        assert!(ignore_not_found::<()>(Err(ClientError::NotFound("x".into()))).is_ok());
        assert!(ignore_not_found::<()>(Err(ClientError::Conflict("x".into()))).is_err());
        assert!(ignore_exists::<()>(Err(ClientError::Conflict("x".into()))).is_ok());
    }

    #[test]
    fn lifecycle_names_are_scoped() {
        let k = ResourceKey::new("keel-install", "platform");
        assert_eq!(lifecycle_account_name(&k), "keel-lifecycle-platform");
        assert_eq!(lifecycle_binding_name(&k), "keel-lifecycle-keel-install-platform");
    }
}
