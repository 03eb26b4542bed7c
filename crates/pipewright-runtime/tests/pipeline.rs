//! End-to-end runs against a filesystem object store and real processes.
#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pipewright_config::{PipelineDef, StageCategory};
use pipewright_runtime::{
  ChannelNotifier, ExecutionEvent, Pipeline, RunStatus, RuntimeConfig, StageStatus,
};
use pipewright_secrets::{EnvBackend, MemoryBackend, SecretsBackend};
use pipewright_storage::FsObjectStore;
use pipewright_trigger::{InboundEvent, Position, TriggerError};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Harness {
  dir: TempDir,
}

impl Harness {
  fn new() -> Self {
    Self {
      dir: TempDir::new().unwrap(),
    }
  }

  fn store_root(&self) -> PathBuf {
    self.dir.path().join("store")
  }

  fn data_dir(&self) -> PathBuf {
    self.dir.path().join("data")
  }

  fn upload(&self, bucket: &str, key: &str, bytes: &[u8]) {
    let path = self.store_root().join(bucket).join(key);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
  }

  fn pipeline(&self, def: Value) -> Pipeline {
    self.pipeline_with_secrets(def, MemoryBackend::new())
  }

  fn pipeline_with_secrets(&self, def: Value, secrets: impl SecretsBackend + 'static) -> Pipeline {
    let def: PipelineDef = serde_json::from_value(def).unwrap();
    Pipeline::new(
      def,
      RuntimeConfig::from_data_dir(&self.data_dir()),
      Arc::new(FsObjectStore::new(self.store_root())),
      Arc::new(secrets),
    )
    .unwrap()
  }
}

fn sh(name: &str, script: &str) -> Value {
  json!({ "name": name, "type": "exec", "command": "sh", "args": ["-c", script] })
}

fn webhook(key: &str) -> InboundEvent {
  InboundEvent::Webhook(json!({ "bucket": "uploads", "key": key }))
}

fn tar_bytes(files: &[(&str, &str)]) -> Vec<u8> {
  let mut builder = tar::Builder::new(Vec::new());
  for (name, body) in files {
    let mut header = tar::Header::new_gnu();
    header.set_size(body.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, name, body.as_bytes()).unwrap();
  }
  builder.into_inner().unwrap()
}

fn read(path: &Path) -> String {
  std::fs::read_to_string(path).unwrap()
}

#[tokio::test]
async fn test_successful_run_produces_artifact() {
  let h = Harness::new();
  h.upload("uploads", "Lab-01/dump.sdmp", &tar_bytes(&[("version", "8.1")]));

  let pipeline = h.pipeline(json!({
    "pipeline_id": "logs",
    "name": "Log analysis",
    "trigger": { "mode": "webhook" },
    "stages": [
      { "name": "fetch", "type": "fetch" },
      { "name": "unpack", "type": "extract", "dir": "machines" },
      sh("analyze", "mkdir -p output/{{ machine }} && cp machines/Lab-01/version output/{{ machine }}/version"),
      { "name": "archive", "type": "package" }
    ]
  }));

  let report = pipeline
    .handle(webhook("Lab-01/dump.sdmp"), CancellationToken::new())
    .await
    .unwrap();

  assert!(report.is_success(), "{}", report.message);
  assert_eq!(report.message, "pipeline 'logs' completed: 4 of 4 stages ok");
  assert!(report.stages.iter().all(|s| s.status == StageStatus::Ok));
  assert_eq!(report.event["key"], "Lab-01/dump.sdmp");

  let artifact = report.artifact.expect("artifact");
  assert!(artifact.path.exists());
  assert!(artifact.path.starts_with(h.data_dir().join("artifacts")));
  assert_eq!(
    artifact.entries,
    vec!["output", "output/lab-01", "output/lab-01/version", "processed"]
  );
  assert_eq!(read(&report.workspace.join("output/lab-01/version")), "8.1");
}

#[tokio::test]
async fn test_missing_key_is_rejected_before_any_work() {
  let h = Harness::new();
  let pipeline = h.pipeline(json!({
    "pipeline_id": "logs",
    "name": "Log analysis",
    "trigger": { "mode": "webhook" },
    "stages": [{ "name": "fetch", "type": "fetch" }]
  }));

  let err = pipeline
    .handle(
      InboundEvent::Webhook(json!({ "bucket": "uploads" })),
      CancellationToken::new(),
    )
    .await
    .unwrap_err();

  assert!(matches!(err, TriggerError::Validation { ref field, .. } if field == "key"));
  assert!(!h.data_dir().join("workspaces").exists());
  assert!(!h.data_dir().join("runs").exists());
}

#[tokio::test]
async fn test_failed_fetch_starts_no_external_stage() {
  let h = Harness::new();
  let marker = h.dir.path().join("ran");
  let pipeline = h.pipeline(json!({
    "pipeline_id": "logs",
    "name": "Log analysis",
    "trigger": { "mode": "webhook" },
    "stages": [
      { "name": "fetch", "type": "fetch" },
      sh("analyze", &format!("touch {}", marker.display())),
      {
        "name": "notify",
        "type": "exec",
        "command": "sh",
        "args": ["-c", format!("touch {}", marker.display())],
        "run_always": true
      },
      { "name": "archive", "type": "package" }
    ]
  }));

  let report = pipeline
    .handle(webhook("missing/object.tar"), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(report.status, RunStatus::Failure);
  assert_eq!(report.stage("fetch").unwrap().status, StageStatus::Failed);
  assert_eq!(report.started_count(StageCategory::External), 0);
  assert_eq!(report.stage("notify").unwrap().status, StageStatus::Skipped);
  assert!(!marker.exists());
  // Packaging still runs, over whatever the workspace holds.
  assert_eq!(report.stage("archive").unwrap().status, StageStatus::Ok);
}

#[tokio::test]
async fn test_failing_program_skips_the_rest_but_packages() {
  let h = Harness::new();
  h.upload("uploads", "m1/data.tar", &tar_bytes(&[("a", "a")]));
  let pipeline = h.pipeline(json!({
    "pipeline_id": "logs",
    "name": "Log analysis",
    "trigger": { "mode": "webhook" },
    "stages": [
      { "name": "fetch", "type": "fetch" },
      sh("program1", "echo partial > output/partial.txt; exit 4"),
      sh("program2", "echo never > output/never.txt"),
      { "name": "archive", "type": "package" }
    ]
  }));

  let report = pipeline
    .handle(webhook("m1/data.tar"), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(report.status, RunStatus::Failure);
  assert!(report.message.contains("program1"), "{}", report.message);

  let program1 = report.stage("program1").unwrap();
  assert_eq!(program1.status, StageStatus::Failed);
  assert_eq!(program1.exit_code, Some(4));
  assert_eq!(report.stage("program2").unwrap().status, StageStatus::Skipped);
  assert_eq!(report.stage("archive").unwrap().status, StageStatus::Ok);

  let artifact = report.artifact.expect("partial output is still packaged");
  assert_eq!(artifact.entries, vec!["output", "output/partial.txt", "processed"]);
}

#[tokio::test]
async fn test_best_effort_failure_keeps_run_successful() {
  let h = Harness::new();
  let pipeline = h.pipeline(json!({
    "pipeline_id": "logs",
    "name": "Log analysis",
    "trigger": { "mode": "webhook" },
    "stages": [
      { "name": "cleanup", "type": "exec", "command": "sh", "args": ["-c", "exit 1"], "best_effort": true },
      sh("after", "true")
    ]
  }));

  let report = pipeline
    .handle(webhook("m1/data.tar"), CancellationToken::new())
    .await
    .unwrap();

  assert!(report.is_success());
  assert_eq!(report.stage("cleanup").unwrap().status, StageStatus::Failed);
  assert_eq!(report.stage("after").unwrap().status, StageStatus::Ok);
  assert_eq!(report.message, "pipeline 'logs' completed: 1 of 2 stages ok");
}

#[tokio::test]
async fn test_global_timeout_kills_stage_and_halts() {
  let h = Harness::new();
  let pipeline = h.pipeline(json!({
    "pipeline_id": "logs",
    "name": "Log analysis",
    "trigger": { "mode": "webhook" },
    "timeout_ms": 300,
    "stages": [
      sh("slow", "sleep 5"),
      { "name": "archive", "type": "package" }
    ]
  }));

  let started = Instant::now();
  let report = pipeline
    .handle(webhook("m1/data.tar"), CancellationToken::new())
    .await
    .unwrap();

  assert!(started.elapsed() < Duration::from_secs(4));
  assert_eq!(report.status, RunStatus::Failure);
  assert!(report.message.contains("global timeout"), "{}", report.message);
  assert_eq!(report.stage("slow").unwrap().status, StageStatus::TimedOut);
  assert_eq!(report.stage("archive").unwrap().status, StageStatus::Skipped);
}

#[tokio::test]
async fn test_stage_timeout_fails_run_but_packages() {
  let h = Harness::new();
  let pipeline = h.pipeline(json!({
    "pipeline_id": "logs",
    "name": "Log analysis",
    "trigger": { "mode": "webhook" },
    "stages": [
      { "name": "slow", "type": "exec", "command": "sleep", "args": ["5"], "timeout_ms": 200 },
      sh("next", "true"),
      { "name": "archive", "type": "package" }
    ]
  }));

  let report = pipeline
    .handle(webhook("m1/data.tar"), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(report.status, RunStatus::Failure);
  assert_eq!(report.stage("slow").unwrap().status, StageStatus::TimedOut);
  assert_eq!(report.stage("next").unwrap().status, StageStatus::Skipped);
  assert_eq!(report.stage("archive").unwrap().status, StageStatus::Ok);
}

#[tokio::test]
async fn test_cancellation_stops_in_flight_stage() {
  let h = Harness::new();
  let pipeline = h.pipeline(json!({
    "pipeline_id": "logs",
    "name": "Log analysis",
    "trigger": { "mode": "webhook" },
    "stages": [sh("slow", "sleep 5"), sh("next", "true")]
  }));

  let cancel = CancellationToken::new();
  let trigger = cancel.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(200)).await;
    trigger.cancel();
  });

  let started = Instant::now();
  let report = pipeline.handle(webhook("m1/data.tar"), cancel).await.unwrap();

  assert!(started.elapsed() < Duration::from_secs(4));
  assert_eq!(report.status, RunStatus::Failure);
  assert_eq!(report.message, "run cancelled");
  let slow = report.stage("slow").unwrap();
  assert_eq!(slow.status, StageStatus::Failed);
  assert_eq!(slow.error.as_deref(), Some("execution cancelled"));
  assert_eq!(report.stage("next").unwrap().status, StageStatus::Skipped);
}

#[tokio::test]
async fn test_timeout_kills_processes_the_stage_forked() {
  let h = Harness::new();
  let marker = h.dir.path().join("late-write");
  let pipeline = h.pipeline(json!({
    "pipeline_id": "logs",
    "name": "Log analysis",
    "trigger": { "mode": "webhook" },
    "stages": [{
      "name": "forks",
      "type": "exec",
      "command": "sh",
      "args": ["-c", format!("(sleep 1; touch {}) ; wait", marker.display())],
      "timeout_ms": 200
    }]
  }));

  let report = pipeline
    .handle(webhook("m1/data.tar"), CancellationToken::new())
    .await
    .unwrap();
  assert_eq!(report.stage("forks").unwrap().status, StageStatus::TimedOut);

  tokio::time::sleep(Duration::from_millis(1500)).await;
  assert!(!marker.exists(), "forked process outlived the timed-out stage");
}

#[tokio::test]
async fn test_cancellation_kills_processes_the_stage_forked() {
  let h = Harness::new();
  let marker = h.dir.path().join("late-write");
  let pipeline = h.pipeline(json!({
    "pipeline_id": "logs",
    "name": "Log analysis",
    "trigger": { "mode": "webhook" },
    "stages": [sh("forks", &format!("(sleep 1; touch {}) & wait", marker.display()))]
  }));

  let cancel = CancellationToken::new();
  let trigger = cancel.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(200)).await;
    trigger.cancel();
  });

  let report = pipeline.handle(webhook("m1/data.tar"), cancel).await.unwrap();
  assert_eq!(report.message, "run cancelled");

  tokio::time::sleep(Duration::from_millis(1500)).await;
  assert!(!marker.exists(), "forked process outlived the cancelled run");
}

#[tokio::test]
async fn test_uploaded_symlink_cannot_redirect_extraction() {
  let h = Harness::new();
  let outside = TempDir::new().unwrap();
  std::fs::write(
    outside.path().join("victim.tar"),
    tar_bytes(&[("pwned.txt", "x")]),
  )
  .unwrap();

  let mut builder = tar::Builder::new(Vec::new());
  let mut header = tar::Header::new_gnu();
  header.set_entry_type(tar::EntryType::Symlink);
  header.set_size(0);
  header.set_mode(0o777);
  builder
    .append_link(&mut header, "escape", outside.path())
    .unwrap();
  h.upload("uploads", "m1/data.tar", &builder.into_inner().unwrap());

  let pipeline = h.pipeline(json!({
    "pipeline_id": "logs",
    "name": "Log analysis",
    "trigger": { "mode": "webhook" },
    "stages": [
      { "name": "fetch", "type": "fetch" },
      { "name": "unpack", "type": "extract", "dir": "machines" },
      { "name": "unpack-nested", "type": "extract", "dir": "machines" }
    ]
  }));

  let report = pipeline
    .handle(webhook("m1/data.tar"), CancellationToken::new())
    .await
    .unwrap();

  assert!(report.is_success(), "{}", report.message);
  assert!(!outside.path().join("pwned.txt").exists());
}

#[tokio::test]
async fn test_credentials_in_own_environment_never_leak() {
  let h = Harness::new();
  let out = h.dir.path().join("seen.log");
  // Unique to this test; nothing else reads or writes it.
  unsafe { std::env::set_var("PIPEWRIGHT_TEST_LEAK_PASSWORD", "hunter2-leak") };

  let pipeline = h.pipeline_with_secrets(
    json!({
      "pipeline_id": "logs",
      "name": "Log analysis",
      "trigger": { "mode": "webhook" },
      "secrets": [{ "id": "pipewright-test-leak-password", "env": "DB_PASS" }],
      "stages": [
        sh("check", r#"test "$DB_PASS" = hunter2-leak && test -z "${PIPEWRIGHT_TEST_LEAK_PASSWORD:-}""#)
      ],
      "hooks": {
        "always": [{
          "name": "report",
          "command": "sh",
          "args": ["-c", format!(
            "echo \"${{PIPEWRIGHT_TEST_LEAK_PASSWORD:-none}} ${{DB_PASS:-none}}\" > {}",
            out.display()
          )]
        }]
      }
    }),
    EnvBackend::new(),
  );

  let report = pipeline
    .handle(webhook("m1/data.tar"), CancellationToken::new())
    .await
    .unwrap();

  assert!(report.is_success(), "{}", report.message);
  assert_eq!(read(&out), "none none\n");
}

#[tokio::test]
async fn test_secrets_reach_stages_but_never_the_report() {
  let h = Harness::new();
  let secrets = MemoryBackend::new().with("db-password", "s3cr3t-value");
  let pipeline = h.pipeline_with_secrets(
    json!({
      "pipeline_id": "logs",
      "name": "Log analysis",
      "trigger": { "mode": "webhook" },
      "secrets": [{ "id": "db-password" }],
      "stages": [
        sh("check", r#"test "$DB_PASSWORD" = s3cr3t-value && echo "using $DB_PASSWORD""#),
        { "name": "leak", "type": "exec", "command": "sh", "args": ["-c", "exit 9"], "env": { "HINT": "x" } }
      ]
    }),
    secrets,
  );

  let report = pipeline
    .handle(webhook("m1/data.tar"), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(report.stage("check").unwrap().status, StageStatus::Ok);
  assert_eq!(report.stage("leak").unwrap().exit_code, Some(9));

  let serialized = serde_json::to_string(&report).unwrap();
  assert!(!serialized.contains("s3cr3t-value"));
  let persisted = read(&h.data_dir().join("runs").join(format!("{}.json", report.run_id)));
  assert!(!persisted.contains("s3cr3t-value"));
}

#[tokio::test]
async fn test_unavailable_secret_fails_before_workspace() {
  let h = Harness::new();
  let pipeline = h.pipeline(json!({
    "pipeline_id": "logs",
    "name": "Log analysis",
    "trigger": { "mode": "webhook" },
    "secrets": [{ "id": "mongo-user" }],
    "stages": [sh("analyze", "true"), { "name": "archive", "type": "package" }]
  }));

  let report = pipeline
    .handle(webhook("m1/data.tar"), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(report.status, RunStatus::Failure);
  assert!(report.message.contains("mongo-user"), "{}", report.message);
  assert!(report.stages.iter().all(|s| s.status == StageStatus::Skipped));
  assert!(!report.workspace.exists());
}

#[tokio::test]
async fn test_concurrent_runs_use_disjoint_workspaces() {
  let h = Harness::new();
  let pipeline = h.pipeline(json!({
    "pipeline_id": "logs",
    "name": "Log analysis",
    "trigger": { "mode": "webhook" },
    "stages": [sh("mark", "sleep 0.2; echo {{ key }} > output/marker")]
  }));

  let (a, b) = tokio::join!(
    pipeline.handle(webhook("a/one.tar"), CancellationToken::new()),
    pipeline.handle(webhook("b/two.tar"), CancellationToken::new()),
  );
  let (a, b) = (a.unwrap(), b.unwrap());

  assert_ne!(a.run_id, b.run_id);
  assert_ne!(a.workspace, b.workspace);
  assert_eq!(read(&a.workspace.join("output/marker")).trim(), "a/one.tar");
  assert_eq!(read(&b.workspace.join("output/marker")).trim(), "b/two.tar");
}

#[tokio::test]
async fn test_hooks_see_status_but_no_credentials() {
  let h = Harness::new();
  let out = h.dir.path().join("hooks.log");
  let hook = |name: &str| {
    json!({
      "name": name,
      "command": "sh",
      "args": ["-c", format!(
        "echo \"{} $PIPEWRIGHT_STATUS ${{DB_PASSWORD:-none}}\" >> {}",
        name,
        out.display()
      )]
    })
  };

  let pipeline = h.pipeline_with_secrets(
    json!({
      "pipeline_id": "logs",
      "name": "Log analysis",
      "trigger": { "mode": "webhook" },
      "secrets": [{ "id": "db-password" }],
      "stages": [sh("fail", "exit 1")],
      "hooks": {
        "on_success": [hook("success")],
        "on_failure": [hook("failure")],
        "always": [hook("always")]
      }
    }),
    MemoryBackend::new().with("db-password", "s3cr3t-value"),
  );

  let report = pipeline
    .handle(webhook("m1/data.tar"), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(report.status, RunStatus::Failure);
  assert_eq!(read(&out), "failure failure none\nalways failure none\n");
}

#[tokio::test]
async fn test_workspace_removed_when_configured() {
  let h = Harness::new();
  let pipeline = h.pipeline(json!({
    "pipeline_id": "logs",
    "name": "Log analysis",
    "trigger": { "mode": "webhook" },
    "workspace": { "remove_on_finish": true },
    "stages": [sh("write", "echo hi > output/hi.txt"), { "name": "archive", "type": "package" }]
  }));

  let report = pipeline
    .handle(webhook("m1/data.tar"), CancellationToken::new())
    .await
    .unwrap();

  assert!(report.is_success());
  assert!(!report.workspace.exists());
  // The bundle lives outside the workspace.
  assert!(report.artifact.unwrap().path.exists());
}

#[tokio::test]
async fn test_events_bracket_the_run() {
  let h = Harness::new();
  let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
  let pipeline = h
    .pipeline(json!({
      "pipeline_id": "logs",
      "name": "Log analysis",
      "trigger": { "mode": "webhook" },
      "stages": [sh("one", "true"), sh("two", "exit 2")]
    }))
    .with_notifier(Arc::new(ChannelNotifier::new(tx)));

  let report = pipeline
    .handle(webhook("m1/data.tar"), CancellationToken::new())
    .await
    .unwrap();
  drop(pipeline);

  let mut events = Vec::new();
  while let Some(event) = rx.recv().await {
    events.push(event);
  }

  assert!(matches!(events.first(), Some(ExecutionEvent::RunStarted { .. })));
  assert!(events.iter().any(|e| matches!(
    e,
    ExecutionEvent::StageFailed { stage, status: StageStatus::Failed, .. } if stage == "two"
  )));
  match events.last() {
    Some(ExecutionEvent::RunFinished { run_id, status, .. }) => {
      assert_eq!(run_id, &report.run_id);
      assert_eq!(*status, RunStatus::Failure);
    }
    other => panic!("unexpected last event: {:?}", other),
  }
}

#[tokio::test]
async fn test_poll_admission_records_watermark() {
  let h = Harness::new();
  h.upload("uploads", "incoming/a.tar", b"a");
  let pipeline = h.pipeline(json!({
    "pipeline_id": "logs",
    "name": "Log analysis",
    "trigger": { "mode": "poll", "bucket": "uploads", "prefix": "incoming/" },
    "stages": [{ "name": "fetch", "type": "fetch" }]
  }));

  let listing = vec![pipewright_storage::ObjectInfo {
    key: "incoming/a.tar".to_string(),
    size: 1,
    last_modified: 42,
  }];
  let report = pipeline
    .handle(InboundEvent::Poll(listing), CancellationToken::new())
    .await
    .unwrap();

  assert!(report.is_success(), "{}", report.message);
  assert_eq!(report.watermark, Some(Position::new(42, "incoming/a.tar")));
  assert_eq!(read(&report.workspace.join("machines/incoming/a.tar")), "a");
}
