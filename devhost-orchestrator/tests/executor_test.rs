//! DevcontainerCliExecutor against stand-in shell scripts
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use devhost_orchestrator::test_utils::{
    create_test_db, test_config, wait_for_removal, wait_for_state, TestHarness,
};
use devhost_orchestrator::{
    BuildContext, BuildError, BuildExecutor, BuildLog, CreateInstanceRequest, CreatePayload,
    DevcontainerCliExecutor, InstanceState, OrchestratorConfig,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const IMAGE: &str = "localhost:32000/vscode-devcontainer-alice-0a1b2c3d:latest";

fn script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("Failed to write script");
    let mut permissions = fs::metadata(&path).unwrap().permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(&path, permissions).expect("Failed to chmod script");
    path.display().to_string()
}

struct Fixture {
    dir: TempDir,
    log: BuildLog,
}

impl Fixture {
    async fn new() -> Self {
        let pool = create_test_db().await;
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
            log: BuildLog::open(pool, "alice-0a1b2c3d-build-logs"),
        }
    }

    fn executor(
        &self,
        devcontainer: &str,
        docker: &str,
        build_timeout_secs: u64,
    ) -> DevcontainerCliExecutor {
        let config = OrchestratorConfig {
            devcontainer_bin: script(self.dir.path(), "devcontainer", devcontainer),
            docker_bin: script(self.dir.path(), "docker", docker),
            build_daemon: "tcp://builder:2375".to_string(),
            build_timeout_secs,
            push_timeout_secs: 30,
            build_kill_grace_secs: 1,
            ..OrchestratorConfig::default()
        };
        DevcontainerCliExecutor::new(&config)
    }

    fn context(&self) -> BuildContext {
        BuildContext {
            instance_id: "alice-0a1b2c3d".to_string(),
            workspace_folder: self.dir.path().to_path_buf(),
            config_path: self.dir.path().join(".devcontainer/devcontainer.json"),
            image_name: IMAGE.to_string(),
        }
    }

    async fn lines(&self) -> Vec<String> {
        self.log.read(0).await.expect("Failed to read log").lines
    }
}

const PUSH_OK: &str = r#"echo "The push refers to repository [$2]""#;

#[tokio::test]
async fn test_successful_build_and_push() {
    let fixture = Fixture::new().await;
    let executor = fixture.executor(
        r#"
echo "DOCKER_HOST=$DOCKER_HOST"
echo "args: $*"
echo "Step 1/3 : FROM mcr.microsoft.com/devcontainers/base" >&2
echo '{"outcome":"success","imageName":["registry.local/custom:1"]}'
"#,
        PUSH_OK,
        30,
    );

    let image = executor
        .run(&fixture.context(), &fixture.log, CancellationToken::new())
        .await
        .expect("Build should succeed");
    assert_eq!(image, "registry.local/custom:1");

    let lines = fixture.lines().await;
    assert!(lines.contains(&"DOCKER_HOST=tcp://builder:2375".to_string()));
    assert!(lines
        .iter()
        .any(|l| l.starts_with("args: build --workspace-folder") && l.ends_with("--no-cache")));
    assert!(lines.iter().any(|l| l.starts_with("Step 1/3")));
    assert!(lines.contains(&"The push refers to repository [registry.local/custom:1]".to_string()));
    assert_eq!(lines.last().map(String::as_str), Some("pushed registry.local/custom:1"));
}

#[tokio::test]
async fn test_missing_outcome_falls_back_to_requested_name() {
    let fixture = Fixture::new().await;
    let executor = fixture.executor("echo building", PUSH_OK, 30);

    let image = executor
        .run(&fixture.context(), &fixture.log, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(image, IMAGE);
}

#[tokio::test]
async fn test_build_failure_reports_tool_output() {
    let fixture = Fixture::new().await;
    let executor = fixture.executor(
        r#"
echo "resolving devcontainer.json"
echo "Error: Dockerfile parse error line 3: unknown instruction: FORM" >&2
exit 2
"#,
        PUSH_OK,
        30,
    );

    let err = executor
        .run(&fixture.context(), &fixture.log, CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        BuildError::ToolFailed { code, message, .. } => {
            assert_eq!(code, 2);
            assert!(message.contains("unknown instruction: FORM"), "{message}");
        }
        other => panic!("expected ToolFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_push_failure_is_a_build_failure() {
    let fixture = Fixture::new().await;
    let executor = fixture.executor(
        "echo ok",
        r#"echo "denied: requested access to the resource is denied" >&2; exit 1"#,
        30,
    );

    let err = executor
        .run(&fixture.context(), &fixture.log, CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        BuildError::PushFailed { image, message } => {
            assert_eq!(image, IMAGE);
            assert!(message.contains("denied"));
        }
        other => panic!("expected PushFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cancel_kills_process_that_ignores_sigterm() {
    let fixture = Fixture::new().await;
    let executor = fixture.executor(
        r#"
trap '' TERM
echo "building forever"
sleep 30
"#,
        PUSH_OK,
        60,
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = executor.run(&fixture.context(), &fixture.log, cancel).await;

    assert!(matches!(result, Err(BuildError::Cancelled)));
    // Grace period is one second
    assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
    assert!(fixture
        .lines()
        .await
        .iter()
        .any(|l| l.ends_with("cancelled")));
}

#[tokio::test]
async fn test_build_timeout_terminates_tool() {
    let fixture = Fixture::new().await;
    let executor = fixture.executor("sleep 30", PUSH_OK, 1);

    let started = Instant::now();
    let result = executor
        .run(&fixture.context(), &fixture.log, CancellationToken::new())
        .await;

    assert!(matches!(result, Err(BuildError::Timeout(limit)) if limit == Duration::from_secs(1)));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_background_child_holding_pipes_does_not_stall_build() {
    let fixture = Fixture::new().await;
    let executor = fixture.executor(
        r#"
sleep 30 &
echo '{"outcome":"success","imageName":["registry.local/custom:2"]}'
"#,
        PUSH_OK,
        60,
    );

    let started = Instant::now();
    let image = executor
        .run(&fixture.context(), &fixture.log, CancellationToken::new())
        .await
        .expect("Build should succeed");

    assert_eq!(image, "registry.local/custom:2");
    assert!(started.elapsed() < Duration::from_secs(10), "{:?}", started.elapsed());
}

#[tokio::test]
async fn test_missing_tool_is_a_spawn_error() {
    let fixture = Fixture::new().await;
    let config = OrchestratorConfig {
        devcontainer_bin: fixture
            .dir
            .path()
            .join("no-such-devcontainer")
            .display()
            .to_string(),
        ..OrchestratorConfig::default()
    };
    let executor = DevcontainerCliExecutor::new(&config);

    let result = executor
        .run(&fixture.context(), &fixture.log, CancellationToken::new())
        .await;
    assert!(matches!(result, Err(BuildError::Spawn { .. })));
}

#[tokio::test]
async fn test_delete_mid_build_leaves_no_log_lines_behind() {
    let harness = TestHarness::new().await;
    let tools = TempDir::new().expect("Failed to create temp dir");
    let config = OrchestratorConfig {
        devcontainer_bin: script(
            tools.path(),
            "devcontainer",
            r#"
trap 'echo "stopping build"; sleep 0.3; echo "build stopped"; exit 143' TERM
echo "building"
while true; do sleep 0.1; done
"#,
        ),
        docker_bin: script(tools.path(), "docker", PUSH_OK),
        ..test_config(harness.build_root.path())
    };
    let executor = Arc::new(DevcontainerCliExecutor::new(&config));
    let manager = harness.manager_with(config, executor);

    let created = manager
        .create_instance(CreateInstanceRequest::new(
            "alice",
            CreatePayload::DevContainerSpec {
                spec: serde_json::json!({"image": "ubuntu:22.04"}),
            },
        ))
        .await
        .expect("Failed to create instance");
    let id = created.instance_id.clone();
    wait_for_state(&manager, &id, InstanceState::Building).await;

    let mut building = false;
    for _ in 0..500 {
        let chunk = manager.get_build_log(&id, 0).await.unwrap();
        if chunk.lines.iter().any(|l| l == "building") {
            building = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(building, "build tool never started");

    manager.delete_instance(&id).await.unwrap();
    wait_for_removal(&manager, &id).await;
    // Past the kill grace period, in case anything was still writing
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let handle = BuildLog::handle_for(&id);
    let (rows,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM build_log_lines WHERE log_handle = ?")
            .bind(&handle)
            .fetch_one(&harness.pool)
            .await
            .expect("Failed to count log lines");
    assert_eq!(rows, 0);
}
