//! Shared test fixtures.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerStatus, EndpointAddress, EndpointSubset, Endpoints, EnvVar, Pod, PodSpec, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::Value;

use crate::config::Config;
use crate::hooks::{AdminConnector, AdminSession, AdminTarget, HookRunner, ScriptRunner};
use crate::k8s::client::{ClusterClient, Object, PlatformVersion};
use crate::reconcile::Orchestrator;
use quarry_core::crd::{ClusterSpec, ComputeSpec, FrontendSpec, QuarryCluster, TierSpec};
use quarry_core::{Error, Result, TierKind, TierNames};

pub const NAMESPACE: &str = "default";

type ObjectKey = (String, String, String);

#[derive(Default)]
struct FakeState {
    objects: BTreeMap<ObjectKey, Value>,
    writes: usize,
    write_log: Vec<String>,
    next_version: u64,
    platform: Option<PlatformVersion>,
    replace_conflicts: u32,
    delete_failures: u32,
}

/// An in-memory `ClusterClient` which counts every write call.
///
/// Objects are keyed by API group & kind, so all versions of a kind alias the same object as they
/// do on a real API server.
#[derive(Default)]
pub struct FakeClient {
    state: Mutex<FakeState>,
}

impl FakeClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The number of write calls made so far.
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    /// Every write call made so far as `kind/name`, in call order. Status writes carry a
    /// `/status` suffix.
    pub fn write_log(&self) -> Vec<String> {
        self.lock().write_log.clone()
    }

    /// Set the version reported by the fake API server.
    pub fn set_version(&self, major: u32, minor: u32) {
        self.lock().platform = Some(PlatformVersion { major, minor });
    }

    /// Make the next `count` replace calls fail with a conflict.
    pub fn fail_next_replaces(&self, count: u32) {
        self.lock().replace_conflicts = count;
    }

    /// Make the next `count` delete calls fail.
    pub fn fail_next_deletes(&self, count: u32) {
        self.lock().delete_failures = count;
    }

    /// Insert or overwrite an object without counting a write.
    pub fn insert<K: Object>(&self, obj: &K) {
        let mut state = self.lock();
        let mut val = serde_json::to_value(obj).expect("error encoding fixture object");
        state.next_version += 1;
        val["metadata"]["resourceVersion"] = Value::String(state.next_version.to_string());
        let ns = obj.meta().namespace.clone().unwrap_or_else(|| NAMESPACE.into());
        let name = obj.meta().name.clone().unwrap_or_default();
        state.objects.insert(key::<K>(&ns, &name), val);
    }

    /// Fetch an object without going through the client surface.
    pub fn fetch<K: Object>(&self, name: &str) -> Option<K> {
        self.lock().objects.get(&key::<K>(NAMESPACE, name)).cloned().map(|val| decode(val).expect("error decoding fixture object"))
    }

    /// Remove an object without counting a write.
    pub fn remove<K: Object>(&self, name: &str) {
        self.lock().objects.remove(&key::<K>(NAMESPACE, name));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake client mutex poisoned")
    }
}

fn key<K: Object>(namespace: &str, name: &str) -> ObjectKey {
    let api_version = K::api_version(&());
    let group = api_version.rsplit_once('/').map(|(group, _)| group).unwrap_or("");
    (format!("{}/{}", group, K::kind(&())), namespace.into(), name.into())
}

fn decode<K: Object>(mut val: Value) -> Result<K> {
    val["apiVersion"] = Value::String(K::api_version(&()).into_owned());
    val["kind"] = Value::String(K::kind(&()).into_owned());
    Ok(serde_json::from_value(val)?)
}

fn matches_selector(val: &Value, selector: &str) -> bool {
    selector.split(',').filter(|term| !term.is_empty()).all(|term| match term.split_once('=') {
        Some((key, expected)) => val["metadata"]["labels"][key].as_str() == Some(expected),
        None => false,
    })
}

fn check_version(stored: &Value, incoming: &Value, kind: &str, name: &str) -> Result<()> {
    match incoming["metadata"]["resourceVersion"].as_str() {
        Some(version) if Some(version) != stored["metadata"]["resourceVersion"].as_str() => Err(Error::Conflict { kind: kind.into(), name: name.into() }),
        _ => Ok(()),
    }
}

#[async_trait]
impl ClusterClient for FakeClient {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let val = self.lock().objects.get(&key::<K>(namespace, name)).cloned();
        val.map(decode).transpose()
    }

    async fn list<K: Object>(&self, namespace: &str, selector: &str) -> Result<Vec<K>> {
        let (kind, _, _) = key::<K>(namespace, "");
        let vals: Vec<Value> = self
            .lock()
            .objects
            .iter()
            .filter(|((obj_kind, obj_ns, _), val)| obj_kind == &kind && obj_ns == namespace && matches_selector(val, selector))
            .map(|(_, val)| val.clone())
            .collect();
        vals.into_iter().map(decode).collect()
    }

    async fn create<K: Object>(&self, namespace: &str, obj: &K) -> Result<K> {
        let name = obj.meta().name.clone().unwrap_or_default();
        let mut state = self.lock();
        state.writes += 1;
        state.write_log.push(format!("{}/{}", K::kind(&()), name));
        let key = key::<K>(namespace, &name);
        if state.objects.contains_key(&key) {
            return Err(Error::Conflict { kind: K::kind(&()).into_owned(), name });
        }
        let mut val = serde_json::to_value(obj)?;
        state.next_version += 1;
        val["metadata"]["namespace"] = Value::String(namespace.into());
        val["metadata"]["resourceVersion"] = Value::String(state.next_version.to_string());
        val["metadata"]["generation"] = Value::from(1);
        if val["metadata"]["uid"].is_null() {
            val["metadata"]["uid"] = Value::String(format!("uid-{}", state.next_version));
        }
        state.objects.insert(key, val.clone());
        decode(val)
    }

    async fn replace<K: Object>(&self, namespace: &str, name: &str, obj: &K) -> Result<K> {
        let mut state = self.lock();
        state.writes += 1;
        let kind = K::kind(&()).into_owned();
        state.write_log.push(format!("{}/{}", kind, name));
        if state.replace_conflicts > 0 {
            state.replace_conflicts -= 1;
            return Err(Error::Conflict { kind, name: name.into() });
        }
        let key = key::<K>(namespace, name);
        let stored = state.objects.get(&key).cloned().ok_or_else(|| Error::NotFound { kind: kind.clone(), name: name.into() })?;
        let mut val = serde_json::to_value(obj)?;
        check_version(&stored, &val, &kind, name)?;
        val["status"] = stored["status"].clone();
        let generation = stored["metadata"]["generation"].as_i64().unwrap_or(1);
        val["metadata"]["generation"] = Value::from(if val["spec"] != stored["spec"] { generation + 1 } else { generation });
        val["metadata"]["uid"] = stored["metadata"]["uid"].clone();
        state.next_version += 1;
        val["metadata"]["resourceVersion"] = Value::String(state.next_version.to_string());
        state.objects.insert(key, val.clone());
        decode(val)
    }

    async fn replace_status<K: Object>(&self, namespace: &str, name: &str, obj: &K) -> Result<K> {
        let mut state = self.lock();
        state.writes += 1;
        let kind = K::kind(&()).into_owned();
        state.write_log.push(format!("{}/{}/status", kind, name));
        let key = key::<K>(namespace, name);
        let mut stored = state.objects.get(&key).cloned().ok_or_else(|| Error::NotFound { kind: kind.clone(), name: name.into() })?;
        let val = serde_json::to_value(obj)?;
        check_version(&stored, &val, &kind, name)?;
        stored["status"] = val["status"].clone();
        state.next_version += 1;
        stored["metadata"]["resourceVersion"] = Value::String(state.next_version.to_string());
        state.objects.insert(key, stored.clone());
        decode(stored)
    }

    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.writes += 1;
        state.write_log.push(format!("{}/{}", K::kind(&()), name));
        if state.delete_failures > 0 {
            state.delete_failures -= 1;
            return Err(Error::Timeout(format!("deleting {}", name)));
        }
        state.objects.remove(&key::<K>(namespace, name));
        Ok(())
    }

    async fn server_version(&self) -> Result<PlatformVersion> {
        Ok(self.lock().platform.unwrap_or(PlatformVersion { major: 1, minor: 27 }))
    }
}

/// An `AdminConnector` which records executed statements.
#[derive(Default)]
pub struct FakeConnector {
    /// When set, every connection attempt fails.
    pub unreachable: Mutex<bool>,
    /// Statements which fail when executed.
    pub failing: Mutex<BTreeSet<String>>,
    /// Statements on which the session is dropped.
    pub dropping: Mutex<BTreeSet<String>>,
    /// Every statement executed, in order.
    pub executed: Arc<Mutex<Vec<String>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        *self.unreachable.lock().expect("mutex poisoned") = unreachable;
    }

    pub fn fail_statement(&self, statement: &str) {
        self.failing.lock().expect("mutex poisoned").insert(statement.into());
    }

    pub fn drop_connection_on(&self, statement: &str) {
        self.dropping.lock().expect("mutex poisoned").insert(statement.into());
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().expect("mutex poisoned").clone()
    }
}

#[async_trait]
impl AdminConnector for FakeConnector {
    async fn connect(&self, target: &AdminTarget) -> Result<Box<dyn AdminSession>> {
        if *self.unreachable.lock().expect("mutex poisoned") {
            return Err(Error::AdminChannel(format!("connection refused by {}", target)));
        }
        Ok(Box::new(FakeSession {
            failing: self.failing.lock().expect("mutex poisoned").clone(),
            dropping: self.dropping.lock().expect("mutex poisoned").clone(),
            executed: self.executed.clone(),
        }))
    }
}

struct FakeSession {
    failing: BTreeSet<String>,
    dropping: BTreeSet<String>,
    executed: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl AdminSession for FakeSession {
    async fn execute(&mut self, statement: &str) -> Result<()> {
        if self.failing.contains(statement) {
            return Err(Error::HookFailed { hook: String::new(), reason: format!("statement rejected: {}", statement) });
        }
        if self.dropping.contains(statement) {
            return Err(Error::AdminChannel("connection reset by peer".into()));
        }
        self.executed.lock().expect("mutex poisoned").push(statement.into());
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// A `ScriptRunner` which records script names & fails scripts whose body is `exit 1`.
#[derive(Default)]
pub struct FakeScriptRunner {
    pub ran: Mutex<Vec<String>>,
}

#[async_trait]
impl ScriptRunner for FakeScriptRunner {
    async fn run(&self, name: &str, script: &str, _env: &BTreeMap<String, String>, _deadline: Duration) -> Result<()> {
        self.ran.lock().expect("mutex poisoned").push(name.into());
        if script.trim() == "exit 1" {
            return Err(Error::HookFailed { hook: name.into(), reason: "script exited with 1".into() });
        }
        Ok(())
    }
}

/// Build a hook runner over the given fake connector.
pub fn hook_runner(connector: Arc<FakeConnector>) -> HookRunner {
    HookRunner::new(connector, Arc::new(FakeScriptRunner::default()))
}

/// Build an orchestrator over the given fakes.
pub fn orchestrator(client: Arc<FakeClient>, connector: Arc<FakeConnector>) -> Result<Orchestrator<FakeClient>> {
    let config = Config::new_test()?;
    Ok(Orchestrator::new(client, config, hook_runner(connector)))
}

/// A tier spec running the given image.
pub fn tier(image: &str, replicas: i32) -> TierSpec {
    TierSpec {
        replicas: Some(replicas),
        image: image.into(),
        ..Default::default()
    }
}

/// A cluster with a 3 replica frontend tier & a 1 replica compute tier, both running `image`.
pub fn cluster(name: &str, image: &str) -> QuarryCluster {
    let mut cluster = QuarryCluster::new(
        name,
        ClusterSpec {
            frontend: Some(FrontendSpec { tier: tier(image, 3), disaster_recovery: None }),
            compute: Some(ComputeSpec { tier: tier(image, 1), auto_scaling_policy: None }),
            ..Default::default()
        },
    );
    cluster.metadata.namespace = Some(NAMESPACE.into());
    cluster.metadata.uid = Some(format!("{}-uid", name));
    cluster
}

/// Endpoints of the frontend tier's external service with one ready address.
pub fn ready_frontend_endpoints(cluster: &str) -> Endpoints {
    let names = TierNames::new(cluster, TierKind::Frontend);
    Endpoints {
        metadata: ObjectMeta {
            name: Some(names.external_service),
            namespace: Some(NAMESPACE.into()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(vec![EndpointAddress { ip: "10.1.0.4".into(), ..Default::default() }]),
            ..Default::default()
        }]),
    }
}

/// A pod of the given tier in the given lifecycle state.
pub fn pod(cluster: &str, tier: TierKind, idx: usize, phase: &str, ready: bool) -> Pod {
    pod_with_env(cluster, tier, idx, phase, ready, vec![])
}

/// A pod of the given tier in the given lifecycle state, carrying the given container env.
pub fn pod_with_env(cluster: &str, tier: TierKind, idx: usize, phase: &str, ready: bool, env: Vec<(&str, &str)>) -> Pod {
    let names = TierNames::new(cluster, tier);
    Pod {
        metadata: ObjectMeta {
            name: Some(format!("{}-{}", names.workload, idx)),
            namespace: Some(NAMESPACE.into()),
            labels: Some(names.labels()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: tier.short_name().into(),
                env: Some(
                    env.into_iter()
                        .map(|(name, value)| EnvVar { name: name.into(), value: Some(value.into()), ..Default::default() })
                        .collect(),
                ),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.into()),
            container_statuses: Some(vec![ContainerStatus {
                name: tier.short_name().into(),
                ready,
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}
