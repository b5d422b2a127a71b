use async_trait::async_trait;
use replgate_core::config::{GatewayConfig, InterpreterConfig, TimingConfig};
use replgate_core::errors::GatewayError;
use replgate_core::gateway::Gateway;
use replgate_core::packages::DependencyInstaller;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn shell_interpreter() -> InterpreterConfig {
    InterpreterConfig::new("/bin/sh")
        .with_env("PATH", "/usr/bin:/bin")
        .with_marker_command("echo {marker}")
        .with_exit_command("exit")
}

fn shell_config(artifact_dir: &Path) -> GatewayConfig {
    let mut config = GatewayConfig::for_interpreter(shell_interpreter());
    config.timing = TimingConfig {
        idle_ms: 200,
        max_wait_ms: 3_000,
        init_timeout_ms: 5_000,
        init_idle_ms: 150,
        marker_timeout_ms: 1_000,
        kill_grace_ms: 1_000,
    };
    config.artifacts.dir = Some(artifact_dir.to_path_buf());
    config.artifacts.poll_attempts = 2;
    config.artifacts.poll_interval_ms = 50;
    config
}

fn shell_gateway(artifact_dir: &Path) -> Gateway {
    Gateway::from_config(shell_config(artifact_dir)).unwrap()
}

#[cfg(target_os = "linux")]
fn process_exists(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

#[tokio::test]
async fn test_session_lifecycle_scenario() {
    let dir = TempDir::new().unwrap();
    let gateway = shell_gateway(dir.path());

    let info = gateway.create_session("s1").await.unwrap();
    assert_eq!(info.id, "s1");

    let result = gateway.execute(Some("s1"), "echo $((2+2))").await.unwrap();
    assert!(result.is_success(), "unexpected error: {:?}", result.error);
    assert_eq!(result.text, vec!["4"]);

    let result = gateway.execute(Some("s1"), "v=41; echo defined").await.unwrap();
    assert_eq!(result.text, vec!["defined"]);

    let result = gateway.execute(Some("s1"), "echo $((v+1))").await.unwrap();
    assert!(result.is_success());
    assert_eq!(result.text, vec!["42"]);

    assert!(gateway.terminate_session("s1").await);

    let err = gateway.execute(Some("s1"), "echo $v").await.err().unwrap();
    assert!(matches!(err, GatewayError::SessionNotFound(id) if id == "s1"));
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let dir = TempDir::new().unwrap();
    let gateway = shell_gateway(dir.path());
    gateway.create_session("a").await.unwrap();
    gateway.create_session("b").await.unwrap();

    gateway.execute(Some("a"), "v=alpha; echo ok").await.unwrap();
    gateway.execute(Some("b"), "v=beta; echo ok").await.unwrap();

    let a = gateway.execute(Some("a"), "echo value=$v").await.unwrap();
    let b = gateway.execute(Some("b"), "echo value=$v").await.unwrap();
    assert_eq!(a.text, vec!["value=alpha"]);
    assert_eq!(b.text, vec!["value=beta"]);

    gateway.shutdown().await;
    assert!(gateway.list_sessions().is_empty());
}

#[tokio::test]
async fn test_duplicate_create_keeps_first_session() {
    let dir = TempDir::new().unwrap();
    let gateway = shell_gateway(dir.path());

    let first = gateway.create_session("dup").await.unwrap();
    gateway.execute(Some("dup"), "marker=first; echo ok").await.unwrap();

    let err = gateway.create_session("dup").await.err().unwrap();
    assert!(matches!(err, GatewayError::SessionAlreadyExists(id) if id == "dup"));

    let sessions = gateway.list_sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].pid, first.pid);

    let result = gateway.execute(Some("dup"), "echo $marker").await.unwrap();
    assert_eq!(result.text, vec!["first"]);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_terminate_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let gateway = shell_gateway(dir.path());
    let info = gateway.create_session("t").await.unwrap();

    assert!(gateway.terminate_session(&info.id).await);
    assert!(!gateway.terminate_session(&info.id).await);
    assert!(!gateway.terminate_session("never-created").await);
    assert!(gateway.list_sessions().is_empty());

    #[cfg(target_os = "linux")]
    if let Some(pid) = info.pid {
        assert!(!process_exists(pid), "interpreter {} still present", pid);
    }
}

#[tokio::test]
async fn test_stderr_output_is_reported_as_error() {
    let dir = TempDir::new().unwrap();
    let gateway = shell_gateway(dir.path());
    gateway.create_session("err").await.unwrap();

    let result = gateway
        .execute(Some("err"), "echo before; ls /replgate-does-not-exist")
        .await
        .unwrap();
    let error = result.error.expect("stderr should produce an error");
    assert_eq!(error.kind, "child_stderr_output");
    assert!(error.message.contains("replgate-does-not-exist"));
    assert_eq!(result.text, vec!["before"]);

    // the session survives diagnostics
    let result = gateway.execute(Some("err"), "echo still here").await.unwrap();
    assert!(result.is_success());
    assert_eq!(result.text, vec!["still here"]);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_artifact_round_trip() {
    let dir = TempDir::new().unwrap();
    let gateway = shell_gateway(dir.path());
    gateway.create_session("plot").await.unwrap();

    let svg = "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"10\" height=\"10\">\
               <rect width=\"10\" height=\"10\" fill=\"red\"/><!-- replgate artifact --></svg>";
    let path = dir.path().join("output_plot.svg");
    let code = format!("printf '%s' '{}' > '{}'; echo saved", svg, path.display());

    let result = gateway.execute(Some("plot"), &code).await.unwrap();
    assert!(result.is_success(), "unexpected error: {:?}", result.error);
    assert_eq!(result.text, vec!["saved"]);

    let artifact = result.artifact.expect("artifact should be collected");
    let payload = artifact.to_payload();
    assert_eq!(payload.kind, "svg");
    assert_eq!(payload.decode().unwrap(), svg.as_bytes());
    assert!(!path.exists());

    // nothing written, nothing returned
    let result = gateway.execute(Some("plot"), "echo no plot").await.unwrap();
    assert!(result.artifact.is_none());
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_submission_timeout_is_bounded() {
    let dir = TempDir::new().unwrap();
    let mut config = shell_config(dir.path());
    config.timing.max_wait_ms = 1_000;
    let gateway = Gateway::from_config(config).unwrap();
    gateway.create_session("slow").await.unwrap();

    let started = Instant::now();
    let result = gateway.execute(Some("slow"), "sleep 3").await.unwrap();
    let elapsed = started.elapsed();

    let error = result.error.expect("silent command should time out");
    assert_eq!(error.kind, "submission_timeout");
    assert!(elapsed >= Duration::from_millis(1_000), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2_500), "returned after {:?}", elapsed);

    // the interpreter is left running
    assert_eq!(gateway.list_sessions().len(), 1);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_completion_waits_for_idle_period() {
    let dir = TempDir::new().unwrap();
    let gateway = shell_gateway(dir.path());
    gateway.create_session("idle").await.unwrap();

    let started = Instant::now();
    let result = gateway
        .execute(Some("idle"), "echo one; sleep 0.1; echo two")
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.text, vec!["one", "two"]);
    assert!(elapsed >= Duration::from_millis(300), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2_000), "returned after {:?}", elapsed);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_interpreter_exit_removes_session() {
    let dir = TempDir::new().unwrap();
    let gateway = shell_gateway(dir.path());
    gateway.create_session("crash").await.unwrap();

    let result = gateway
        .execute(Some("crash"), "echo bye; exit 3")
        .await
        .unwrap();
    let error = result.error.expect("exit should be reported");
    assert_eq!(error.kind, "process_crashed");
    assert!(gateway.list_sessions().is_empty());

    let err = gateway.execute(Some("crash"), "echo again").await.err().unwrap();
    assert!(matches!(err, GatewayError::SessionNotFound(_)));

    // the id can be reused
    gateway.create_session("crash").await.unwrap();
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_ephemeral_execution_cleans_up() {
    let dir = TempDir::new().unwrap();
    let gateway = shell_gateway(dir.path());

    let result = gateway.execute(None, "echo hello").await.unwrap();
    assert!(result.session_id.starts_with("temp_"));
    assert_eq!(result.text, vec!["hello"]);
    assert!(gateway.list_sessions().is_empty());
}

#[tokio::test]
async fn test_concurrent_submission_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut config = shell_config(dir.path());
    config.artifacts.enabled = false;
    let gateway = Gateway::from_config(config).unwrap();
    gateway.create_session("busy").await.unwrap();

    let (first, second) = tokio::join!(
        gateway.execute(Some("busy"), "sleep 0.3; echo done"),
        gateway.execute(Some("busy"), "echo intruder"),
    );

    assert_eq!(first.unwrap().text, vec!["done"]);
    assert!(matches!(second, Err(GatewayError::SessionBusy(_))));
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_ready_sentinel_and_init_timeout() {
    let dir = TempDir::new().unwrap();

    let mut config = shell_config(dir.path());
    config.interpreter = shell_interpreter()
        .with_init_script("echo REPLGATE_READY")
        .with_ready_sentinel("REPLGATE_READY");
    let gateway = Gateway::from_config(config).unwrap();
    gateway.create_session("ready").await.unwrap();
    let result = gateway.execute(Some("ready"), "echo up").await.unwrap();
    assert_eq!(result.text, vec!["up"]);
    gateway.shutdown().await;

    let mut config = shell_config(dir.path());
    config.interpreter = shell_interpreter().with_ready_sentinel("NEVER_PRINTED");
    config.timing.init_timeout_ms = 500;
    config.timing.init_idle_ms = 100;
    let gateway = Gateway::from_config(config).unwrap();

    let started = Instant::now();
    let err = gateway.create_session("stuck").await.err().unwrap();
    assert!(matches!(err, GatewayError::InitializationTimeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(gateway.list_sessions().is_empty());
}

#[tokio::test]
async fn test_exit_is_detected_while_a_background_child_holds_the_pipes() {
    let dir = TempDir::new().unwrap();
    let gateway = shell_gateway(dir.path());
    gateway.create_session("orphan").await.unwrap();

    let started = Instant::now();
    let result = gateway
        .execute(Some("orphan"), "echo bye; sleep 5 & exit 3")
        .await
        .unwrap();

    let error = result.error.expect("exit should be reported");
    assert_eq!(error.kind, "process_crashed");
    assert_eq!(result.text, vec!["bye"]);
    assert!(started.elapsed() < Duration::from_secs(2), "returned after {:?}", started.elapsed());
    assert!(gateway.list_sessions().is_empty());

    let err = gateway.execute(Some("orphan"), "echo again").await.err().unwrap();
    assert!(matches!(err, GatewayError::SessionNotFound(_)));
}

#[tokio::test]
async fn test_concurrent_create_has_single_winner() {
    let dir = TempDir::new().unwrap();
    let gateway = shell_gateway(dir.path());

    let (first, second) = tokio::join!(
        gateway.create_session("race"),
        gateway.create_session("race"),
    );

    let winners = [&first, &second].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = if first.is_ok() { second } else { first };
    assert!(matches!(loser, Err(GatewayError::SessionAlreadyExists(id)) if id == "race"));
    assert_eq!(gateway.list_sessions().len(), 1);

    let result = gateway.execute(Some("race"), "echo alive").await.unwrap();
    assert_eq!(result.text, vec!["alive"]);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_busy_request_leaves_running_artifact_alone() {
    let dir = TempDir::new().unwrap();
    let gateway = shell_gateway(dir.path());
    gateway.create_session("chart").await.unwrap();

    let svg = "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"10\" height=\"10\">\
               <circle cx=\"5\" cy=\"5\" r=\"4\"/><!-- written before the pause --></svg>";
    let path = dir.path().join("output_chart.svg");
    let code = format!("printf '%s' '{}' > '{}'; sleep 0.6; echo saved", svg, path.display());

    let (first, second) = tokio::join!(gateway.execute(Some("chart"), &code), async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        gateway.execute(Some("chart"), "echo intruder").await
    });

    assert!(matches!(second, Err(GatewayError::SessionBusy(_))));
    let first = first.unwrap();
    assert!(first.is_success(), "unexpected error: {:?}", first.error);
    assert_eq!(first.text, vec!["saved"]);
    let artifact = first.artifact.expect("artifact should survive the busy request");
    assert_eq!(artifact.to_payload().decode().unwrap(), svg.as_bytes());
    gateway.shutdown().await;
}

struct ScriptedInstaller;

#[async_trait]
impl DependencyInstaller for ScriptedInstaller {
    async fn ensure(&self, code: &str) -> Result<Vec<String>, GatewayError> {
        if code.contains("Unavailable") {
            return Err(GatewayError::PackageInstallFailed("Unavailable: not in registry".into()));
        }
        if code.contains("Example") {
            return Ok(vec!["Example".to_string()]);
        }
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_installer_runs_before_submission() {
    let dir = TempDir::new().unwrap();
    let gateway = shell_gateway(dir.path()).with_installer(Box::new(ScriptedInstaller));
    gateway.create_session("pkg").await.unwrap();

    let result = gateway
        .execute(Some("pkg"), "echo using Unavailable")
        .await
        .unwrap();
    let error = result.error.expect("install failure should be reported");
    assert_eq!(error.kind, "package_install_failed");
    assert!(result.text.is_empty());

    // the failed install released the session
    let result = gateway
        .execute(Some("pkg"), "echo using Example")
        .await
        .unwrap();
    assert!(result.is_success(), "unexpected error: {:?}", result.error);
    assert_eq!(result.installed, vec!["Example"]);
    assert_eq!(result.text, vec!["using Example"]);
    gateway.shutdown().await;
}
