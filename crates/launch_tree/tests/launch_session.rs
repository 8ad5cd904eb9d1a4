//! End-to-end launch sessions with real processes
//!
//! Uses `sh` to stand in for nodes, so these only run on unix.

#![cfg(unix)]

use launch_tree::{
    Executor, ExecutorConfig, FileSource, LaunchContext, OsBackend, ProcessStatus,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn write(dir: &Path, name: &str, yaml: &str) {
    std::fs::write(dir.join(name), yaml).unwrap();
}

fn executor(dir: &Path) -> Executor {
    Executor::new(
        Arc::new(FileSource::new(dir)),
        Arc::new(OsBackend::new()),
        ExecutorConfig {
            shutdown_timeout: Duration::from_secs(2),
        },
    )
}

#[tokio::test]
async fn exit_handler_chains_processes_across_includes() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "root.launch.yaml",
        r#"
actions:
  - arg: { name: code, default: "0" }
  - include:
      path: nodes/worker.launch.yaml
      args: { code: "$(arg code)" }
  - on_event:
      event: exit
      target: /workers/worker
      actions:
        - process:
            name: cleanup
            executable: sh
            args: ["-c", "exit 0"]
"#,
    );
    std::fs::create_dir(dir.path().join("nodes")).unwrap();
    write(
        dir.path(),
        "nodes/worker.launch.yaml",
        r#"
actions:
  - arg: { name: code, default: "1" }
  - group:
      namespace: workers
      actions:
        - process:
            name: worker
            executable: sh
            args: ["-c", "echo working; exit $(arg code)"]
            output: quiet
"#,
    );

    let mut executor = executor(dir.path());
    let report = executor
        .run(
            "root.launch.yaml",
            LaunchContext::from_arguments([("code", "4")]),
        )
        .unwrap();
    assert_eq!(report.launched.len(), 1);
    assert!(report.failures.is_empty());

    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::time::timeout(Duration::from_secs(10), executor.wait(shutdown_rx))
        .await
        .expect("session did not go idle")
        .unwrap();

    let status = executor.status();
    assert_eq!(
        status,
        vec![
            ("/workers/worker".to_string(), ProcessStatus::Exited(Some(4))),
            ("cleanup".to_string(), ProcessStatus::Exited(Some(0))),
        ]
    );
}

#[tokio::test]
async fn output_handler_triggers_shutdown_of_long_running_process() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "root.launch.yaml",
        r#"
actions:
  - process:
      name: server
      executable: sh
      args: ["-c", "echo listening; exec sleep 30"]
  - on_event:
      event: output
      target: server
      pattern: "^listening$"
      actions:
        - shutdown: { reason: "server is up" }
"#,
    );

    let mut executor = executor(dir.path());
    executor
        .run("root.launch.yaml", LaunchContext::new())
        .unwrap();

    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::time::timeout(Duration::from_secs(10), executor.wait(shutdown_rx))
        .await
        .expect("output handler never fired")
        .unwrap();
    assert_eq!(executor.shutdown_reason(), Some("server is up"));

    executor.shutdown().await;
    assert!(matches!(
        executor.status()[0].1,
        ProcessStatus::Exited(_)
    ));
}

#[tokio::test]
async fn external_shutdown_signal_stops_wait() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "root.launch.yaml",
        r#"
actions:
  - process: { name: sleeper, executable: sleep, args: ["30"] }
"#,
    );

    let mut executor = executor(dir.path());
    executor
        .run("root.launch.yaml", LaunchContext::new())
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = shutdown_tx.send(());
    });

    tokio::time::timeout(Duration::from_secs(10), executor.wait(shutdown_rx))
        .await
        .expect("shutdown signal ignored")
        .unwrap();

    executor.shutdown().await;
    assert!(executor.is_idle());
}

#[tokio::test]
async fn missing_executable_does_not_stop_siblings() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "root.launch.yaml",
        r#"
actions:
  - process: { name: ghost, executable: /nonexistent/launch_tree/ghost }
  - process: { name: ok, executable: sh, args: ["-c", "exit 0"] }
"#,
    );

    let mut executor = executor(dir.path());
    let report = executor
        .run("root.launch.yaml", LaunchContext::new())
        .unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.launched.len(), 1);

    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::time::timeout(Duration::from_secs(10), executor.wait(shutdown_rx))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        executor.status(),
        vec![
            ("ghost".to_string(), ProcessStatus::Failed),
            ("ok".to_string(), ProcessStatus::Exited(Some(0))),
        ]
    );
}
