//! Leader election built around the `coordination.k8s.io/v1` `Lease` API.
//!
//! Only one replica of the operator converges clusters at a time. Replicas race to hold a shared
//! lease; the holder renews it before `renew_deadline` elapses, and followers may only take over
//! once a full `lease_duration` has passed without observing a change to the lease.
//!
//! The protocol follows the upstream client-go leader election implementation found here:
//! https://github.com/kubernetes/client-go/blob/master/tools/leaderelection/leaderelection.go

use anyhow::{ensure, Context, Result};
use chrono::{prelude::*, Duration};
use futures::prelude::*;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::client::Client;
use kube::runtime::watcher::{self, Event};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::Config;
use quarry_core::tier::{LABEL_COMPONENT, LABEL_MANAGED_BY};
use quarry_core::OPERATOR_NAME;

type DateTimeUtc = DateTime<Utc>;

const JITTER_FACTOR: f64 = 1.2;
/// The duration between retries of lease actions. Core K8s clients default this to 2 seconds.
const LEASE_RETRY_SECONDS: i64 = 2;
/// The timeout applied to each lease API call.
const API_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

const METRIC_IS_LEADER: &str = "quarry_operator_is_leader";
const METRIC_LEADERSHIP_CHANGE: &str = "quarry_operator_leadership_changes";

/// The states of a leader elector.
#[derive(Clone, Debug, PartialEq)]
pub enum LeaderState {
    /// This replica holds the lease.
    Leading,
    /// Another replica, identified by the encapsulated string, holds the lease.
    Following(String),
    /// The lease state is unknown, or the elector is starting or stopping.
    Standby,
}

/// Configuration for leader election.
pub struct LeaderElectionConfig {
    /// The name of the lease object.
    name: String,
    /// The namespace of the lease object.
    namespace: String,
    /// The identity recorded on the lease when acquired.
    identity: String,
    /// The duration followers wait, measured from the last observed change, before forcing
    /// acquisition of the lease.
    lease_duration: Duration,
    /// The duration after which the holder renews the lease.
    renew_deadline: Duration,
}

impl LeaderElectionConfig {
    /// Build the election config of this replica from the runtime config.
    pub fn from_config(config: &Config) -> Result<Self> {
        let lease_duration = Duration::seconds(config.lease_duration_seconds as i64);
        let renew_deadline = Duration::seconds(config.lease_renew_seconds as i64);
        ensure!(lease_duration > renew_deadline, "lease duration must be greater than renew deadline");
        ensure!(
            renew_deadline > Duration::seconds((JITTER_FACTOR * LEASE_RETRY_SECONDS as f64) as i64),
            "renew deadline must be greater than {}s",
            JITTER_FACTOR * LEASE_RETRY_SECONDS as f64,
        );
        Ok(Self {
            name: lease_name(),
            namespace: config.namespace.clone(),
            identity: config.pod_name.clone(),
            lease_duration,
            renew_deadline,
        })
    }

    /// The initial form of the lease, claiming it for this replica.
    pub fn initial_lease(&self) -> Lease {
        let now = Utc::now();
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(maplit::btreemap! {
                    LABEL_COMPONENT.into() => "leader-election".into(),
                    LABEL_MANAGED_BY.into() => OPERATOR_NAME.into(),
                }),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                acquire_time: Some(MicroTime(now)),
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.num_seconds() as i32),
                lease_transitions: Some(0),
                renew_time: Some(MicroTime(now)),
            }),
        }
    }
}

/// The name of the lease shared by all operator replicas.
fn lease_name() -> String {
    format!("{}-leader", OPERATOR_NAME)
}

/// A task which acquires & maintains the operator's lease, publishing the resulting leader state.
pub struct LeaderElector {
    api: Api<Lease>,
    /// The field manager used for server-side apply of the lease.
    manager: String,
    config: LeaderElectionConfig,
    state_tx: watch::Sender<LeaderState>,
    state: LeaderState,
    shutdown: BroadcastStream<()>,

    /// The lease as last observed from the API.
    last_observed_lease: Lease,
    /// The last time a change to the lease was observed.
    last_observed_change: DateTimeUtc,
}

impl LeaderElector {
    pub fn new(config: LeaderElectionConfig, client: Client, shutdown: broadcast::Receiver<()>) -> (Self, watch::Receiver<LeaderState>) {
        metrics::describe_gauge!(METRIC_LEADERSHIP_CHANGE, metrics::Unit::Count, "the number of leadership changes of the operator lease");
        metrics::describe_gauge!(METRIC_IS_LEADER, metrics::Unit::Count, "1 if this replica holds the operator lease, else 0");
        let (state_tx, state_rx) = watch::channel(LeaderState::Standby);
        (
            LeaderElector {
                api: Api::namespaced(client, &config.namespace),
                manager: OPERATOR_NAME.into(),
                last_observed_lease: config.initial_lease(),
                last_observed_change: Utc::now(),
                config,
                state_tx,
                state: LeaderState::Standby,
                shutdown: BroadcastStream::new(shutdown),
            },
            state_rx,
        )
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::info!(lease = %self.config.name, "leader elector task started");
        if let Err(err) = self.try_acquire_or_renew().await {
            tracing::error!(error = ?err, "error attempting to acquire/renew lease");
        }

        let lease_watcher = watcher::watcher(self.api.clone(), watcher::Config::default().fields(&format!("metadata.name={}", self.config.name)));
        tokio::pin!(lease_watcher);

        loop {
            let delay = tokio::time::sleep(self.next_acquire_renew_delay());
            tokio::pin!(delay);
            tokio::select! {
                Some(res) = lease_watcher.next() => self.handle_lease_event(res),
                _ = &mut delay => {
                    if let Err(err) = self.try_acquire_or_renew().await {
                        tracing::error!(error = ?err, "error during call to try_acquire_or_renew");
                        if self.state != LeaderState::Standby {
                            self.set_state(LeaderState::Standby);
                        }
                        self.last_observed_change = Utc::now();
                    }
                }
                _ = self.shutdown.next() => break,
            }
        }

        self.set_state(LeaderState::Standby);
        tracing::info!("leader elector task stopped");
    }

    fn handle_lease_event(&mut self, res: Result<Event<Lease>, watcher::Error>) {
        let lease = match res {
            Ok(Event::Applied(lease)) => lease,
            Ok(_) => return,
            Err(err) => {
                tracing::error!(error = ?err, "error from lease watcher stream");
                return;
            }
        };
        if lease != self.last_observed_lease {
            tracing::debug!("lease update observed from watcher stream");
            self.last_observed_change = Utc::now();
            self.observe_lease(lease);
        }
    }

    /// Ensure the lease exists, recording any change observed on it.
    async fn ensure_lease(&mut self) -> Result<()> {
        let now = Utc::now();
        let existing = timeout(API_TIMEOUT, self.api.get_opt(&self.config.name))
            .await
            .context("timeout fetching lease")?
            .context("error fetching lease")?;
        if let Some(lease) = existing {
            if lease != self.last_observed_lease {
                self.last_observed_change = now;
                self.observe_lease(lease);
            }
            return Ok(());
        }

        let lease = timeout(API_TIMEOUT, self.api.create(&PostParams::default(), &self.config.initial_lease()))
            .await
            .context("timeout creating lease")?
            .context("error creating lease")?;
        self.last_observed_change = now;
        self.observe_lease(lease);
        Ok(())
    }

    /// Attempt to acquire or renew the lease.
    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn try_acquire_or_renew(&mut self) -> Result<()> {
        self.ensure_lease().await.context("error ensuring lease exists")?;

        // Following an unexpired leader, nothing to do.
        let now = Utc::now();
        if let LeaderState::Following(holder) = &self.state {
            if self.last_observed_change + self.config.lease_duration > now {
                tracing::debug!(%holder, "lease is held by another replica and has not yet expired");
                return Ok(());
            }
        }

        let mut lease = self.last_observed_lease.clone();
        let spec = lease.spec.get_or_insert_with(Default::default);
        spec.lease_duration_seconds = Some(self.config.lease_duration.num_seconds() as i32);
        spec.renew_time = Some(MicroTime(now));
        if self.state != LeaderState::Leading {
            spec.holder_identity = Some(self.config.identity.clone());
            spec.acquire_time = Some(MicroTime(now));
            spec.lease_transitions = Some(spec.lease_transitions.map(|val| val + 1).unwrap_or(0));
        }
        lease.metadata.managed_fields = None;

        // Forced apply is still rejected by the server if our view of the lease is stale.
        let mut params = PatchParams::apply(&self.manager);
        params.force = true;
        let lease = timeout(API_TIMEOUT, self.api.patch(&self.config.name, &params, &Patch::Apply(lease)))
            .await
            .context("timeout updating lease")?
            .context("error updating lease")?;
        self.last_observed_change = now;
        self.observe_lease(lease);
        Ok(())
    }

    /// Record the lease as observed from the API, updating leader state as needed.
    fn observe_lease(&mut self, lease: Lease) {
        self.last_observed_lease = lease;
        let spec = self.last_observed_lease.spec.as_ref();
        if let Some(transitions) = spec.and_then(|spec| spec.lease_transitions) {
            metrics::gauge!(METRIC_LEADERSHIP_CHANGE, transitions as f64);
        }
        let holder = spec.and_then(|spec| spec.holder_identity.clone()).unwrap_or_default();
        let next = next_state(&self.state, &holder, &self.config.identity);
        if let Some(state) = next {
            self.set_state(state);
        }
    }

    /// The delay before the next attempt to acquire or renew the lease.
    fn next_acquire_renew_delay(&self) -> std::time::Duration {
        let addend = match self.state {
            LeaderState::Leading => self.config.renew_deadline,
            _ => self.config.lease_duration,
        };
        (self.last_observed_change + addend - Utc::now()).to_std().unwrap_or_default()
    }

    fn set_state(&mut self, state: LeaderState) {
        if state != self.state {
            tracing::info!(?state, "leader state changed");
        }
        self.state = state;
        let _ = self.state_tx.send(self.state.clone());
        metrics::gauge!(METRIC_IS_LEADER, if self.state == LeaderState::Leading { 1.0 } else { 0.0 });
    }
}

/// The leader state following an observation of the lease held by `holder`, if it changed.
fn next_state(current: &LeaderState, holder: &str, identity: &str) -> Option<LeaderState> {
    let held = holder == identity;
    match current {
        LeaderState::Leading if held => None,
        LeaderState::Following(id) if id == holder => None,
        _ if held => Some(LeaderState::Leading),
        _ => Some(LeaderState::Following(holder.into())),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn leader_state_follows_lease_holder() {
        assert_eq!(next_state(&LeaderState::Standby, "pod-0", "pod-0"), Some(LeaderState::Leading));
        assert_eq!(next_state(&LeaderState::Leading, "pod-0", "pod-0"), None);
        assert_eq!(next_state(&LeaderState::Leading, "pod-1", "pod-0"), Some(LeaderState::Following("pod-1".into())));
        assert_eq!(next_state(&LeaderState::Following("pod-1".into()), "pod-1", "pod-0"), None);
        assert_eq!(next_state(&LeaderState::Following("pod-1".into()), "pod-0", "pod-0"), Some(LeaderState::Leading));
    }

    #[test]
    fn election_config_requires_renew_below_duration() {
        let mut config = (*Config::new_test().expect("error building test config")).clone();
        config.lease_duration_seconds = 10;
        config.lease_renew_seconds = 10;
        assert!(LeaderElectionConfig::from_config(&config).is_err(), "expected equal durations to be rejected");
    }
}
