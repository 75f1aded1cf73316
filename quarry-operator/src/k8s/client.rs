//! The engine's sole I/O surface for cluster state.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::core::NamespaceResourceScope;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::timeout;

use quarry_core::{Error, Result};

/// The default timeout to use for interacting with the K8s API.
const API_TIMEOUT: Duration = Duration::from_secs(10);

/// Any namespaced K8s object which the engine reads or writes.
pub trait Object: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + Debug + DeserializeOwned + Serialize + Send + Sync + 'static {}

impl<K> Object for K where K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + Debug + DeserializeOwned + Serialize + Send + Sync + 'static {}

/// The version of the platform's API server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlatformVersion {
    pub major: u32,
    pub minor: u32,
}

impl PlatformVersion {
    /// Parse the version strings reported by the API server.
    ///
    /// Managed platforms report minors such as `25+`, so only the leading digits are considered.
    pub fn parse(major: &str, minor: &str) -> Result<Self> {
        let leading = |val: &str| -> Result<u32> {
            let digits: String = val.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("unparsable platform version {}.{}", major, minor)))
        };
        Ok(Self { major: leading(major)?, minor: leading(minor)? })
    }
}

/// A typed client of the platform's declarative object API.
///
/// Absence is never an error: `get` returns `None` and `delete` of an absent object succeeds.
/// Optimistic concurrency failures surface as `Error::Conflict`.
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// Fetch the named object.
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>>;
    /// List objects matching the given label selector.
    async fn list<K: Object>(&self, namespace: &str, selector: &str) -> Result<Vec<K>>;
    /// Create the given object.
    async fn create<K: Object>(&self, namespace: &str, obj: &K) -> Result<K>;
    /// Replace the named object, guarded by the resource version carried by `obj`.
    async fn replace<K: Object>(&self, namespace: &str, name: &str, obj: &K) -> Result<K>;
    /// Replace the status subresource of the named object.
    async fn replace_status<K: Object>(&self, namespace: &str, name: &str, obj: &K) -> Result<K>;
    /// Delete the named object.
    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<()>;
    /// The version of the platform's API server.
    async fn server_version(&self) -> Result<PlatformVersion>;
}

/// A `ClusterClient` backed by a live K8s API server.
#[derive(Clone)]
pub struct KubeClient {
    client: kube::Client,
}

impl KubeClient {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api<K: Object>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Classify an error returned from the API server.
    fn classify<K: Object>(err: kube::Error, name: &str) -> Error {
        match err {
            kube::Error::Api(resp) if resp.code == 409 => Error::Conflict { kind: K::kind(&()).into_owned(), name: name.into() },
            kube::Error::Api(resp) if resp.code == 404 => Error::NotFound { kind: K::kind(&()).into_owned(), name: name.into() },
            err => Error::Kube(err),
        }
    }

    fn timeout_err<K: Object>(action: &str, name: &str) -> Error {
        Error::Timeout(format!("{} {} {}", action, K::kind(&()), name))
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    #[tracing::instrument(level = "trace", skip(self))]
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        timeout(API_TIMEOUT, self.api::<K>(namespace).get_opt(name))
            .await
            .map_err(|_| Self::timeout_err::<K>("fetching", name))?
            .map_err(|err| Self::classify::<K>(err, name))
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn list<K: Object>(&self, namespace: &str, selector: &str) -> Result<Vec<K>> {
        let params = ListParams::default().labels(selector);
        let list = timeout(API_TIMEOUT, self.api::<K>(namespace).list(&params))
            .await
            .map_err(|_| Self::timeout_err::<K>("listing", selector))?
            .map_err(|err| Self::classify::<K>(err, selector))?;
        Ok(list.items)
    }

    #[tracing::instrument(level = "trace", skip(self, obj))]
    async fn create<K: Object>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.meta().name.clone().unwrap_or_default();
        timeout(API_TIMEOUT, self.api::<K>(namespace).create(&PostParams::default(), obj))
            .await
            .map_err(|_| Self::timeout_err::<K>("creating", &name))?
            .map_err(|err| Self::classify::<K>(err, &name))
    }

    #[tracing::instrument(level = "trace", skip(self, obj))]
    async fn replace<K: Object>(&self, namespace: &str, name: &str, obj: &K) -> Result<K> {
        timeout(API_TIMEOUT, self.api::<K>(namespace).replace(name, &PostParams::default(), obj))
            .await
            .map_err(|_| Self::timeout_err::<K>("replacing", name))?
            .map_err(|err| Self::classify::<K>(err, name))
    }

    #[tracing::instrument(level = "trace", skip(self, obj))]
    async fn replace_status<K: Object>(&self, namespace: &str, name: &str, obj: &K) -> Result<K> {
        let data = serde_json::to_vec(obj)?;
        timeout(API_TIMEOUT, self.api::<K>(namespace).replace_status(name, &PostParams::default(), data))
            .await
            .map_err(|_| Self::timeout_err::<K>("replacing status of", name))?
            .map_err(|err| Self::classify::<K>(err, name))
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<()> {
        let res = timeout(API_TIMEOUT, self.api::<K>(namespace).delete(name, &DeleteParams::default()))
            .await
            .map_err(|_| Self::timeout_err::<K>("deleting", name))?;
        match res.map_err(|err| Self::classify::<K>(err, name)) {
            Ok(_) | Err(Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn server_version(&self) -> Result<PlatformVersion> {
        let info = timeout(API_TIMEOUT, self.client.apiserver_version())
            .await
            .map_err(|_| Error::Timeout("fetching platform version".into()))??;
        PlatformVersion::parse(&info.major, &info.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_version_parses_managed_platform_suffixes() {
        let version = PlatformVersion::parse("1", "25+").expect("error parsing version");
        assert_eq!(version, PlatformVersion { major: 1, minor: 25 });
        assert!(PlatformVersion::parse("1", "beta").is_err(), "expected unparsable minor to error");
    }
}
