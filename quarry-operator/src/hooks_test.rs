use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::Config;
use crate::fixtures::{FakeConnector, FakeScriptRunner};
use crate::hooks::{AdminTarget, HookPhase, HookRunner, ScriptRunner, ShellScriptRunner};
use quarry_core::crd::{Hook, HookKind};
use quarry_core::Error;

fn target() -> AdminTarget {
    AdminTarget { host: "qc-fe-service.default".into(), port: 9030 }
}

fn hook(name: &str, kind: HookKind, command: &str, critical: bool) -> Hook {
    Hook { name: name.into(), command: command.into(), critical, kind }
}

#[tokio::test]
async fn hooks_run_in_declared_order() -> Result<()> {
    let connector = FakeConnector::new();
    let scripts = Arc::new(FakeScriptRunner::default());
    let runner = HookRunner::new(connector.clone(), scripts.clone());
    let hooks = vec![
        hook("first", HookKind::Sql, "SELECT 1", true),
        hook("second", HookKind::Script, "exit 0", false),
        hook("third", HookKind::Sql, "SELECT 3", false),
    ];

    let report = runner.run(HookPhase::Pre, &hooks, &target(), Duration::from_secs(5)).await?;

    assert!(report.executed == vec!["first", "second", "third"], "unexpected execution order {:?}", report.executed);
    assert!(report.failures.is_empty(), "expected no failures got {:?}", report.failures);
    assert!(connector.executed() == vec!["SELECT 1", "SELECT 3"], "unexpected statements {:?}", connector.executed());
    Ok(())
}

#[tokio::test]
async fn critical_failure_stops_the_run() -> Result<()> {
    let connector = FakeConnector::new();
    connector.fail_statement("SELECT 2");
    let runner = HookRunner::new(connector.clone(), Arc::new(FakeScriptRunner::default()));
    let hooks = vec![
        hook("first", HookKind::Sql, "SELECT 1", false),
        hook("second", HookKind::Sql, "SELECT 2", true),
        hook("third", HookKind::Sql, "SELECT 3", false),
    ];

    let report = runner.run(HookPhase::Pre, &hooks, &target(), Duration::from_secs(5)).await?;

    assert!(report.executed == vec!["first"], "expected only the first hook to run, got {:?}", report.executed);
    assert!(
        matches!(report.critical_failure(), Some(Error::HookFailed { ref hook, .. }) if hook == "second"),
        "expected a critical failure of hook second got {:?}",
        report.critical_failure()
    );
    Ok(())
}

#[tokio::test]
async fn non_critical_failure_is_recorded_and_run_continues() -> Result<()> {
    let connector = FakeConnector::new();
    let runner = HookRunner::new(connector, Arc::new(FakeScriptRunner::default()));
    let hooks = vec![
        hook("flaky", HookKind::Script, "exit 1", false),
        hook("after", HookKind::Script, "exit 0", false),
    ];

    let report = runner.run(HookPhase::Post, &hooks, &target(), Duration::from_secs(5)).await?;

    assert!(report.executed == vec!["after"], "expected hook after to run, got {:?}", report.executed);
    assert!(report.critical_failure().is_none(), "expected no critical failure");
    let summary = report.failure_summary().unwrap_or_default();
    assert!(summary.contains("hook flaky failed"), "unexpected failure summary {}", summary);
    Ok(())
}

#[tokio::test]
async fn unreachable_admin_channel_fails_before_any_hook() -> Result<()> {
    let connector = FakeConnector::new();
    connector.set_unreachable(true);
    let scripts = Arc::new(FakeScriptRunner::default());
    let runner = HookRunner::new(connector, scripts.clone());
    let hooks = vec![hook("script", HookKind::Script, "exit 0", true), hook("sql", HookKind::Sql, "SELECT 1", true)];

    let res = runner.run(HookPhase::Pre, &hooks, &target(), Duration::from_secs(5)).await;

    assert!(matches!(res, Err(Error::AdminChannel(_))), "expected an admin channel error got {:?}", res);
    let ran = scripts.ran.lock().expect("mutex poisoned").clone();
    assert!(ran.is_empty(), "expected no scripts to run got {:?}", ran);
    Ok(())
}

#[tokio::test]
async fn lost_session_mid_run_is_an_admin_channel_error() -> Result<()> {
    let connector = FakeConnector::new();
    connector.drop_connection_on("SELECT 2");
    let runner = HookRunner::new(connector.clone(), Arc::new(FakeScriptRunner::default()));
    let hooks = vec![
        hook("first", HookKind::Sql, "SELECT 1", true),
        hook("second", HookKind::Sql, "SELECT 2", false),
        hook("third", HookKind::Sql, "SELECT 3", false),
    ];

    let res = runner.run(HookPhase::Pre, &hooks, &target(), Duration::from_secs(5)).await;

    assert!(matches!(res, Err(Error::AdminChannel(_))), "expected an admin channel error got {:?}", res);
    assert!(connector.executed() == vec!["SELECT 1"], "expected the run to stop at the lost session, got {:?}", connector.executed());
    Ok(())
}

#[tokio::test]
async fn script_only_hooks_never_open_a_session() -> Result<()> {
    let connector = FakeConnector::new();
    connector.set_unreachable(true);
    let runner = HookRunner::new(connector, Arc::new(FakeScriptRunner::default()));
    let hooks = vec![hook("script", HookKind::Script, "exit 0", true)];

    let report = runner.run(HookPhase::Post, &hooks, &target(), Duration::from_secs(5)).await?;

    assert!(report.executed == vec!["script"], "expected the script hook to run, got {:?}", report.executed);
    Ok(())
}

#[tokio::test]
async fn shell_runner_reports_exit_status() -> Result<()> {
    let config = Config::new_test()?;
    let runner = ShellScriptRunner::new(&config);
    let mut env = BTreeMap::new();
    env.insert("FE_QUERY_PORT".to_string(), "9030".to_string());

    runner.run("ok", "test \"$FE_QUERY_PORT\" = 9030", &env, Duration::from_secs(10)).await?;

    let res = runner.run("bad", "echo boom >&2; exit 3", &env, Duration::from_secs(10)).await;
    match res {
        Err(Error::HookFailed { hook, reason }) => {
            assert!(hook == "bad", "expected hook bad got {}", hook);
            assert!(reason.contains("boom"), "expected stderr in reason got {}", reason);
        }
        other => panic!("expected a hook failure got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn shell_runner_enforces_deadline() -> Result<()> {
    let config = Config::new_test()?;
    let runner = ShellScriptRunner::new(&config);

    let res = runner.run("slow", "while :; do :; done", &BTreeMap::new(), Duration::from_millis(200)).await;

    assert!(matches!(res, Err(Error::Timeout(_))), "expected a timeout got {:?}", res);
    Ok(())
}
