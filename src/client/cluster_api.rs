//! Kubernetes object access used by the reconcilers.
//!
//! The orchestration code only touches the API server through [`ClusterApi`].
//! Reads of single objects return `None` when the object does not exist, and
//! writes rejected for a stale resourceVersion come back as
//! [`Error::Conflict`] so callers can re-fetch and retry.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::crd::VerticaDB;

/// Access to the objects of one namespace.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_vdb(&self, name: &str) -> Result<Option<VerticaDB>>;
    /// Replace the VerticaDB object (metadata and spec).
    async fn replace_vdb(&self, vdb: &VerticaDB) -> Result<VerticaDB>;
    /// Replace the status subresource of the VerticaDB.
    async fn replace_vdb_status(&self, vdb: &VerticaDB) -> Result<VerticaDB>;

    async fn get_statefulset(&self, name: &str) -> Result<Option<StatefulSet>>;
    async fn list_statefulsets(&self, label_selector: &str) -> Result<Vec<StatefulSet>>;
    async fn create_statefulset(&self, sts: &StatefulSet) -> Result<StatefulSet>;
    async fn replace_statefulset(&self, sts: &StatefulSet) -> Result<StatefulSet>;
    async fn delete_statefulset(&self, name: &str) -> Result<()>;

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>>;
    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>>;
    async fn delete_pod(&self, name: &str) -> Result<()>;

    async fn get_service(&self, name: &str) -> Result<Option<Service>>;
    async fn list_services(&self, label_selector: &str) -> Result<Vec<Service>>;
    async fn replace_service(&self, svc: &Service) -> Result<Service>;

    async fn get_secret(&self, name: &str) -> Result<Option<Secret>>;
}

/// [`ClusterApi`] backed by the kube client.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
    namespace: String,
}

impl KubeClusterApi {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Map a 409 into [`Error::Conflict`].
fn classify(err: kube::Error, what: &str) -> Error {
    match err {
        kube::Error::Api(ref resp) if resp.code == 409 => Error::Conflict(what.to_string()),
        other => Error::Kube(other),
    }
}

async fn get_opt<K>(api: &Api<K>, name: &str) -> Result<Option<K>>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    Ok(api.get_opt(name).await?)
}

async fn replace<K>(api: &Api<K>, obj: &K) -> Result<K>
where
    K: kube::Resource + Clone + DeserializeOwned + Serialize + std::fmt::Debug,
{
    let name = obj.name_any();
    api.replace(&name, &PostParams::default(), obj)
        .await
        .map_err(|e| classify(e, &name))
}

async fn delete<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => {
            debug!(name = %name, "Object already deleted");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn list<K>(api: &Api<K>, label_selector: &str) -> Result<Vec<K>>
where
    K: Clone + DeserializeOwned + std::fmt::Debug,
{
    let lp = ListParams::default().labels(label_selector);
    Ok(api.list(&lp).await?.items)
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_vdb(&self, name: &str) -> Result<Option<VerticaDB>> {
        get_opt(&self.api::<VerticaDB>(), name).await
    }

    async fn replace_vdb(&self, vdb: &VerticaDB) -> Result<VerticaDB> {
        replace(&self.api::<VerticaDB>(), vdb).await
    }

    async fn replace_vdb_status(&self, vdb: &VerticaDB) -> Result<VerticaDB> {
        let name = vdb.name_any();
        let data = serde_json::to_vec(vdb)?;
        self.api::<VerticaDB>()
            .replace_status(&name, &PostParams::default(), data)
            .await
            .map_err(|e| classify(e, &name))
    }

    async fn get_statefulset(&self, name: &str) -> Result<Option<StatefulSet>> {
        get_opt(&self.api::<StatefulSet>(), name).await
    }

    async fn list_statefulsets(&self, label_selector: &str) -> Result<Vec<StatefulSet>> {
        list(&self.api::<StatefulSet>(), label_selector).await
    }

    async fn create_statefulset(&self, sts: &StatefulSet) -> Result<StatefulSet> {
        let name = sts.name_any();
        self.api::<StatefulSet>()
            .create(&PostParams::default(), sts)
            .await
            .map_err(|e| classify(e, &name))
    }

    async fn replace_statefulset(&self, sts: &StatefulSet) -> Result<StatefulSet> {
        replace(&self.api::<StatefulSet>(), sts).await
    }

    async fn delete_statefulset(&self, name: &str) -> Result<()> {
        delete(&self.api::<StatefulSet>(), name).await
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>> {
        get_opt(&self.api::<Pod>(), name).await
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>> {
        list(&self.api::<Pod>(), label_selector).await
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        delete(&self.api::<Pod>(), name).await
    }

    async fn get_service(&self, name: &str) -> Result<Option<Service>> {
        get_opt(&self.api::<Service>(), name).await
    }

    async fn list_services(&self, label_selector: &str) -> Result<Vec<Service>> {
        list(&self.api::<Service>(), label_selector).await
    }

    async fn replace_service(&self, svc: &Service) -> Result<Service> {
        replace(&self.api::<Service>(), svc).await
    }

    async fn get_secret(&self, name: &str) -> Result<Option<Secret>> {
        get_opt(&self.api::<Secret>(), name).await
    }
}
