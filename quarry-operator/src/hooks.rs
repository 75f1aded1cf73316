//! Upgrade hook execution.
//!
//! Hooks are idempotent administrative actions run around an upgrade. `Sql` hooks are sent over
//! a short-lived administrative session against the frontend tier, `Script` hooks are run by an
//! injectable command executor.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

use crate::config::Config;
use quarry_core::crd::{Hook, HookKind};
use quarry_core::{Error, Result};

const METRIC_HOOK_EXECUTIONS: &str = "quarry_hook_executions_total";
/// The timeout used for establishing an administrative session.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The address of the frontend tier's administrative channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdminTarget {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for AdminTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A factory of administrative sessions.
#[async_trait]
pub trait AdminConnector: Send + Sync {
    /// Open a new session against the given target.
    async fn connect(&self, target: &AdminTarget) -> Result<Box<dyn AdminSession>>;
}

/// A short-lived administrative session.
#[async_trait]
pub trait AdminSession: Send {
    /// Execute a single administrative statement, discarding any result set.
    async fn execute(&mut self, statement: &str) -> Result<()>;
    /// Close this session.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// An `AdminConnector` speaking the MySQL protocol served by the frontend tier.
pub struct MySqlConnector {
    user: String,
    password: String,
}

impl MySqlConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            user: config.admin_user.clone(),
            password: config.admin_password.clone(),
        }
    }
}

#[async_trait]
impl AdminConnector for MySqlConnector {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn connect(&self, target: &AdminTarget) -> Result<Box<dyn AdminSession>> {
        let mut opts = OptsBuilder::default().ip_or_hostname(target.host.clone()).tcp_port(target.port).user(Some(self.user.clone()));
        if !self.password.is_empty() {
            opts = opts.pass(Some(self.password.clone()));
        }
        let conn = timeout(CONNECT_TIMEOUT, Conn::new(opts))
            .await
            .map_err(|_| Error::AdminChannel(format!("timeout while connecting to {}", target)))?
            .map_err(|err| Error::AdminChannel(format!("error connecting to {}: {}", target, err)))?;
        Ok(Box::new(MySqlSession { conn }))
    }
}

struct MySqlSession {
    conn: Conn,
}

#[async_trait]
impl AdminSession for MySqlSession {
    async fn execute(&mut self, statement: &str) -> Result<()> {
        self.conn.query_drop(statement).await.map_err(|err| match err {
            // The session itself is gone, not the statement.
            mysql_async::Error::Io(_) | mysql_async::Error::Driver(_) => Error::AdminChannel(format!("administrative session lost: {}", err)),
            err => Error::HookFailed {
                hook: String::new(),
                reason: err.to_string(),
            },
        })
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let MySqlSession { conn } = *self;
        conn.disconnect().await.context("error closing administrative session")?;
        Ok(())
    }
}

/// An injectable executor of user-supplied hook scripts.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Run the given script body with the given extra environment, bounded by `deadline`.
    async fn run(&self, name: &str, script: &str, env: &BTreeMap<String, String>, deadline: Duration) -> Result<()>;
}

/// A `ScriptRunner` which executes scripts with `/bin/sh`.
///
/// Scripts are written to an owner-only temp file, run with a cleared environment holding only
/// allow-listed variables plus the hook environment, and killed once the deadline elapses.
pub struct ShellScriptRunner {
    shell: String,
    env_allowlist: Vec<String>,
}

impl ShellScriptRunner {
    pub fn new(config: &Config) -> Self {
        Self {
            shell: "/bin/sh".into(),
            env_allowlist: config.hook_env_allowlist.clone(),
        }
    }
}

#[async_trait]
impl ScriptRunner for ShellScriptRunner {
    #[tracing::instrument(level = "debug", skip(self, script, env))]
    async fn run(&self, name: &str, script: &str, env: &BTreeMap<String, String>, deadline: Duration) -> Result<()> {
        let file = tempfile::Builder::new()
            .prefix("quarry-hook-")
            .suffix(".sh")
            .tempfile()
            .context("error creating hook script file")?;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o700)).context("error setting hook script permissions")?;
        let mut handle = tokio::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(file.path())
            .await
            .context("error opening hook script file")?;
        handle.write_all(script.as_bytes()).await.context("error writing hook script")?;
        handle.flush().await.context("error flushing hook script")?;
        drop(handle);

        let mut cmd = tokio::process::Command::new(&self.shell);
        cmd.arg(file.path()).env_clear().kill_on_drop(true);
        for key in self.env_allowlist.iter() {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd.envs(env);

        let output = match timeout(deadline, cmd.output()).await {
            Ok(res) => res.context("error spawning hook script")?,
            Err(_) => return Err(Error::Timeout(format!("running hook script {}", name))),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::HookFailed {
                hook: name.into(),
                reason: format!("script exited with {}: {}", output.status, stderr.trim()),
            });
        }
        Ok(())
    }
}

/// The phase of the upgrade in which hooks are run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookPhase {
    Pre,
    Post,
}

impl HookPhase {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Pre => "pre",
            Self::Post => "post",
        }
    }
}

/// A failed hook.
#[derive(Clone, Debug, PartialEq)]
pub struct HookFailure {
    pub hook: String,
    pub reason: String,
    pub critical: bool,
}

/// The outcome of running a list of hooks.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HookReport {
    /// Names of hooks which completed successfully, in execution order.
    pub executed: Vec<String>,
    /// Every hook failure, in execution order.
    pub failures: Vec<HookFailure>,
}

impl HookReport {
    /// The critical failure which aborted the run, as an error.
    pub fn critical_failure(&self) -> Option<Error> {
        self.failures.iter().find(|failure| failure.critical).map(|failure| Error::HookFailed {
            hook: failure.hook.clone(),
            reason: failure.reason.clone(),
        })
    }

    /// A human readable summary of the failures of this run.
    pub fn failure_summary(&self) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        Some(
            self.failures
                .iter()
                .map(|failure| format!("hook {} failed: {}", failure.hook, failure.reason))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Runs lists of hooks, strictly in declared order.
#[derive(Clone)]
pub struct HookRunner {
    connector: Arc<dyn AdminConnector>,
    scripts: Arc<dyn ScriptRunner>,
}

impl HookRunner {
    pub fn new(connector: Arc<dyn AdminConnector>, scripts: Arc<dyn ScriptRunner>) -> Self {
        Self { connector, scripts }
    }

    /// Run the given hooks in order.
    ///
    /// A session is only opened if there is at least one `Sql` hook, and failure to open it is
    /// returned as `Error::AdminChannel` before any hook runs. Losing the session mid-run is
    /// returned the same way, so the caller retries the whole list. A critical hook failure stops
    /// the run; non-critical failures are recorded and the run continues.
    #[tracing::instrument(level = "debug", skip(self, hooks), fields(hooks = hooks.len()))]
    pub async fn run(&self, phase: HookPhase, hooks: &[Hook], target: &AdminTarget, deadline: Duration) -> Result<HookReport> {
        let mut report = HookReport::default();
        if hooks.is_empty() {
            return Ok(report);
        }
        let mut session = match hooks.iter().any(|hook| hook.kind == HookKind::Sql) {
            true => Some(self.connector.connect(target).await?),
            false => None,
        };
        let mut env = BTreeMap::new();
        env.insert("FE_SERVICE_NAME".to_string(), target.host.clone());
        env.insert("FE_QUERY_PORT".to_string(), target.port.to_string());

        for hook in hooks {
            let res = match (hook.kind, session.as_mut()) {
                (HookKind::Sql, Some(session)) => match timeout(deadline, session.execute(&hook.command)).await {
                    Ok(res) => res,
                    Err(_) => Err(Error::Timeout(format!("executing hook {}", hook.name))),
                },
                (HookKind::Sql, None) => Err(Error::AdminChannel("no administrative session".into())),
                (HookKind::Script, _) => self.scripts.run(&hook.name, &hook.command, &env, deadline).await,
            };
            match res {
                Ok(()) => {
                    tracing::info!(hook = %hook.name, phase = phase.as_str(), "hook executed");
                    metrics::increment_counter!(METRIC_HOOK_EXECUTIONS, "phase" => phase.as_str(), "result" => "success");
                    report.executed.push(hook.name.clone());
                }
                Err(Error::AdminChannel(reason)) => {
                    tracing::warn!(hook = %hook.name, phase = phase.as_str(), %reason, "administrative channel lost, aborting");
                    close_session(session).await;
                    return Err(Error::AdminChannel(reason));
                }
                Err(err) => {
                    let reason = match err {
                        Error::HookFailed { reason, .. } => reason,
                        err => err.to_string(),
                    };
                    metrics::increment_counter!(METRIC_HOOK_EXECUTIONS, "phase" => phase.as_str(), "result" => "failure");
                    report.failures.push(HookFailure {
                        hook: hook.name.clone(),
                        reason: reason.clone(),
                        critical: hook.critical,
                    });
                    if hook.critical {
                        tracing::error!(hook = %hook.name, phase = phase.as_str(), %reason, "critical hook failed, aborting");
                        break;
                    }
                    tracing::warn!(hook = %hook.name, phase = phase.as_str(), %reason, "non-critical hook failed, continuing");
                }
            }
        }

        close_session(session).await;
        Ok(report)
    }
}

async fn close_session(session: Option<Box<dyn AdminSession>>) {
    if let Some(session) = session {
        if let Err(err) = session.close().await {
            tracing::debug!(error = ?err, "error closing administrative session");
        }
    }
}

/// The built-in hooks which pause tablet scheduling & balancing before an upgrade.
pub fn default_pre_upgrade_hooks() -> Vec<Hook> {
    vec![
        sql_hook("disable-tablet-scheduling", r#"ADMIN SET FRONTEND CONFIG ("tablet_sched_max_scheduling_tablets" = "0")"#, true),
        sql_hook("disable-balance", r#"ADMIN SET FRONTEND CONFIG ("disable_balance" = "true")"#, true),
        sql_hook("disable-colocate-balance", r#"ADMIN SET FRONTEND CONFIG ("disable_colocate_balance" = "true")"#, false),
    ]
}

/// The built-in hooks which resume tablet scheduling & balancing after an upgrade.
pub fn default_post_upgrade_hooks() -> Vec<Hook> {
    vec![
        sql_hook("enable-tablet-scheduling", r#"ADMIN SET FRONTEND CONFIG ("tablet_sched_max_scheduling_tablets" = "10000")"#, false),
        sql_hook("enable-balance", r#"ADMIN SET FRONTEND CONFIG ("disable_balance" = "false")"#, false),
        sql_hook("enable-colocate-balance", r#"ADMIN SET FRONTEND CONFIG ("disable_colocate_balance" = "false")"#, false),
    ]
}

fn sql_hook(name: &str, command: &str, critical: bool) -> Hook {
    Hook {
        name: name.into(),
        command: command.into(),
        critical,
        kind: HookKind::Sql,
    }
}
