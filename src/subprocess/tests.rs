use super::*;
use std::time::Duration;

#[tokio::test]
async fn test_production_runner_success() {
    let runner = runner::TokioProcessRunner;
    let command = ProcessCommandBuilder::new("echo")
        .arg("hello world")
        .build();

    let output = runner.run(command).await.unwrap();
    assert!(output.status.success());
    assert_eq!(output.stdout.trim(), "hello world");
    assert!(output.stderr.is_empty());
}

#[tokio::test]
async fn test_production_runner_failure() {
    let runner = runner::TokioProcessRunner;
    let command = ProcessCommandBuilder::new("false").build();

    let output = runner.run(command).await.unwrap();
    assert!(!output.status.success());
    assert_eq!(output.status.code(), Some(1));
}

#[tokio::test]
async fn test_production_runner_working_dir() {
    let temp = tempfile::TempDir::new().unwrap();
    let runner = runner::TokioProcessRunner;
    let command = ProcessCommandBuilder::new("pwd")
        .current_dir(temp.path())
        .build();

    let output = runner.run(command).await.unwrap();
    assert!(output
        .stdout
        .trim_end()
        .ends_with(temp.path().file_name().unwrap().to_str().unwrap()));
}

#[tokio::test]
async fn test_production_runner_captures_raw_bytes() {
    let temp = tempfile::TempDir::new().unwrap();
    let stdout = temp.path().join("stdout.txt");
    let stderr = temp.path().join("stderr.txt");
    let command = ProcessCommandBuilder::new("sh")
        .args(["-c", "printf '\\377\\376'; printf 'warn\\n' >&2"])
        .capture_to(&stdout, &stderr)
        .build();

    let output = runner::TokioProcessRunner.run(command).await.unwrap();
    assert!(output.status.success());
    assert!(output.stdout.is_empty());
    assert_eq!(std::fs::read(&stdout).unwrap(), vec![0xff, 0xfe]);
    assert_eq!(std::fs::read_to_string(&stderr).unwrap(), "warn\n");
}

#[tokio::test]
async fn test_production_runner_captured_timeout() {
    let temp = tempfile::TempDir::new().unwrap();
    let command = ProcessCommandBuilder::new("sh")
        .args(["-c", "echo started; sleep 5"])
        .capture_to(temp.path().join("out"), temp.path().join("err"))
        .maybe_timeout(Some(Duration::from_millis(200)))
        .build();

    let started = std::time::Instant::now();
    let result = runner::TokioProcessRunner.run(command).await;
    assert!(matches!(result.unwrap_err(), ProcessError::Timeout(_)));
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn test_production_runner_command_not_found() {
    let runner = runner::TokioProcessRunner;
    let command = ProcessCommandBuilder::new("nonexistent-command-12345").build();

    let result = runner.run(command).await;
    assert!(matches!(
        result.unwrap_err(),
        ProcessError::CommandNotFound(_)
    ));
}

#[tokio::test]
async fn test_production_runner_timeout() {
    let runner = runner::TokioProcessRunner;
    let command = ProcessCommandBuilder::new("sleep")
        .arg("5")
        .maybe_timeout(Some(Duration::from_millis(100)))
        .build();

    let result = runner.run(command).await;
    assert!(matches!(result.unwrap_err(), ProcessError::Timeout(_)));
}

#[tokio::test]
async fn test_mock_runner_basic() {
    let mock = MockProcessRunner::new();

    mock.expect_command("squeue")
        .with_args(|args| args.iter().any(|a| a == "42"))
        .returns_stdout("RUNNING\n")
        .returns_success()
        .finish();

    let output = mock
        .run(ProcessCommandBuilder::new("squeue").args(["-h", "-j", "42"]).build())
        .await
        .unwrap();

    assert!(output.status.success());
    assert_eq!(output.stdout, "RUNNING\n");
    assert!(mock.verify_called("squeue", 1));
}

#[tokio::test]
async fn test_mock_runner_echoes_args() {
    let mock = MockProcessRunner::new();
    mock.expect_command("echo").echoes_args().finish();

    let output = mock
        .run(ProcessCommandBuilder::new("echo").arg("two").build())
        .await
        .unwrap();
    assert_eq!(output.stdout, "two\n");
}

#[tokio::test]
async fn test_mock_runner_writes_capture_files() {
    let temp = tempfile::TempDir::new().unwrap();
    let mock = MockProcessRunner::new();
    mock.expect_command("echo").echoes_args().returns_stderr("note\n").finish();

    let output = mock
        .run(
            ProcessCommandBuilder::new("echo")
                .arg("one")
                .capture_to(temp.path().join("stdout.txt"), temp.path().join("stderr.txt"))
                .build(),
        )
        .await
        .unwrap();

    assert!(output.stdout.is_empty());
    assert_eq!(
        std::fs::read_to_string(temp.path().join("stdout.txt")).unwrap(),
        "one\n"
    );
    assert_eq!(
        std::fs::read_to_string(temp.path().join("stderr.txt")).unwrap(),
        "note\n"
    );
}

#[tokio::test]
async fn test_mock_runner_times_limit() {
    let mock = MockProcessRunner::new();
    mock.expect_command("sbatch").times(1).finish();

    let first = mock.run(ProcessCommandBuilder::new("sbatch").build()).await;
    let second = mock.run(ProcessCommandBuilder::new("sbatch").build()).await;

    assert!(first.is_ok());
    assert!(matches!(
        second.unwrap_err(),
        ProcessError::MockExpectationNotMet(_)
    ));
    assert_eq!(mock.call_count("sbatch"), 2);
}

#[tokio::test]
async fn test_mock_runner_unexpected_command() {
    let mock = MockProcessRunner::new();
    let result = mock.run(ProcessCommandBuilder::new("scancel").build()).await;
    assert!(result.is_err());
}
