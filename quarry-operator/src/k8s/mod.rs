//! Kubernetes controller.
//!
//! This controller participates in leader election with the other replicas of the operator. While
//! this replica is the leader it runs the reconcile loop: `QuarryCluster` objects & the children
//! they own are watched, and every change to either queues a convergence pass for the owning
//! cluster. Passes for distinct clusters run concurrently, while a single cluster is never
//! reconciled by two passes at once.

pub mod client;
mod coordination;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::prelude::*;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::Service;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller as Runtime};
use kube::runtime::watcher;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};

use crate::config::Config;
use crate::hooks::{HookRunner, MySqlConnector, ShellScriptRunner};
use crate::k8s::client::KubeClient;
use crate::k8s::coordination::{LeaderElectionConfig, LeaderElector, LeaderState};
use crate::reconcile::{Orchestrator, Outcome};
use quarry_core::crd::{QuarryCluster, RequiredMetadata};
use quarry_core::{Error, QUARRY_OPERATOR_LABEL_SELECTORS};

/// The requeue delay after a transient error.
const TRANSIENT_ERROR_REQUEUE: Duration = Duration::from_secs(5);
/// The requeue delay after any other error.
const ERROR_REQUEUE: Duration = Duration::from_secs(60);

const METRIC_RECONCILE_TOTAL: &str = "quarry_reconcile_total";
const METRIC_RECONCILE_DURATION: &str = "quarry_reconcile_duration_seconds";

/// State shared by every reconcile invocation.
struct ReconcileContext {
    orchestrator: Orchestrator<KubeClient>,
}

/// Kubernetes controller for `QuarryCluster` objects.
pub struct Controller {
    /// K8s client.
    client: kube::Client,
    /// Runtime config.
    config: Arc<Config>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
    /// The configuration used to drive the leader election system, moved out after being spawned.
    leader_election_config: Option<LeaderElectionConfig>,
    /// The context handed to each reconcile invocation.
    context: Arc<ReconcileContext>,
}

impl Controller {
    /// Create a new instance.
    pub fn new(client: kube::Client, config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        let elect_conf = LeaderElectionConfig::from_config(&config).context("invalid lease coordination config")?;
        let hooks = HookRunner::new(Arc::new(MySqlConnector::new(&config)), Arc::new(ShellScriptRunner::new(&config)));
        let orchestrator = Orchestrator::new(Arc::new(KubeClient::new(client.clone())), config.clone(), hooks);
        metrics::describe_counter!(METRIC_RECONCILE_TOTAL, metrics::Unit::Count, "the number of cluster reconcile passes by result");
        metrics::describe_histogram!(METRIC_RECONCILE_DURATION, metrics::Unit::Seconds, "the duration of cluster reconcile passes");
        Ok(Self {
            client,
            config,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            leader_election_config: Some(elect_conf),
            context: Arc::new(ReconcileContext { orchestrator }),
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let elect_config = match self.leader_election_config.take() {
            Some(elect_config) => elect_config,
            None => {
                let _ = self.shutdown_tx.send(());
                anyhow::bail!("error accessing leader election config, this should never happen");
            }
        };
        let (elector, state_rx) = LeaderElector::new(elect_config, self.client.clone(), self.shutdown_tx.subscribe());
        let (elector, mut state_rx) = (elector.spawn(), WatchStream::new(state_rx));

        tracing::info!("k8s controller initialized");
        let mut runner: Option<JoinHandle<()>> = None;
        loop {
            tokio::select! {
                Some(state) = state_rx.next() => {
                    tracing::debug!(?state, "new leader state detected");
                    match (state, runner.is_some()) {
                        (LeaderState::Leading, false) => {
                            tracing::info!("acquired leadership, starting reconcile loop");
                            runner = Some(self.spawn_runner());
                        }
                        (LeaderState::Leading, true) => (),
                        (_, true) => {
                            tracing::info!("lost leadership, stopping reconcile loop");
                            if let Some(runner) = runner.take() {
                                runner.abort();
                            }
                        }
                        (_, false) => (),
                    }
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("k8s controller shutting down");
        if let Some(runner) = runner.take() {
            runner.abort();
        }
        if let Err(err) = elector.await {
            tracing::error!(error = ?err, "error shutting down leader elector");
        }
        tracing::debug!("k8s controller shutdown");
        Ok(())
    }

    /// Spawn the reconcile loop over all watched clusters & their children.
    fn spawn_runner(&self) -> JoinHandle<()> {
        let owned = watcher::Config::default().labels(QUARRY_OPERATOR_LABEL_SELECTORS);
        let runtime = Runtime::new(self.api::<QuarryCluster>(), watcher::Config::default())
            .owns(self.api::<StatefulSet>(), owned.clone())
            .owns(self.api::<Deployment>(), owned.clone())
            .owns(self.api::<Service>(), owned.clone())
            .owns(self.api::<HorizontalPodAutoscaler>(), owned)
            .run(reconcile, error_policy, self.context.clone())
            .for_each(|res| async move {
                match res {
                    Ok((obj, _)) => tracing::debug!(name = %obj.name, namespace = ?obj.namespace, "reconciled cluster"),
                    Err(err) => tracing::warn!(error = %err, "reconcile failed"),
                }
            });
        tokio::spawn(runtime)
    }

    /// An API handle scoped to the watched namespace, or to all namespaces.
    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        match self.config.watch_namespace.as_deref() {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }
}

/// Run one convergence pass of the given cluster.
async fn reconcile(cluster: Arc<QuarryCluster>, ctx: Arc<ReconcileContext>) -> Result<Action, Error> {
    let start = Instant::now();
    let res = ctx.orchestrator.reconcile(cluster.namespace(), cluster.name()).await;
    metrics::histogram!(METRIC_RECONCILE_DURATION, start.elapsed().as_secs_f64());
    match res {
        Ok(outcome) => {
            metrics::increment_counter!(METRIC_RECONCILE_TOTAL, "result" => "success");
            Ok(match outcome {
                Outcome::Done => Action::await_change(),
                Outcome::Requeue(delay) => Action::requeue(delay),
            })
        }
        Err(err) => {
            metrics::increment_counter!(METRIC_RECONCILE_TOTAL, "result" => "error");
            Err(err)
        }
    }
}

/// Map a failed pass to its requeue delay.
fn error_policy(cluster: Arc<QuarryCluster>, err: &Error, _ctx: Arc<ReconcileContext>) -> Action {
    let delay = if err.is_transient() { TRANSIENT_ERROR_REQUEUE } else { ERROR_REQUEUE };
    tracing::error!(error = %err, name = cluster.name(), namespace = cluster.namespace(), ?delay, "error reconciling cluster");
    Action::requeue(delay)
}
