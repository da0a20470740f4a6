use super::*;
use std::sync::Mutex;
use tempfile::TempDir;

/// Write an executable shell script that stands in for the CLI binary.
fn fake_cli(dir: &TempDir, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.path().join("fake-cli");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn executor(bin: PathBuf, workdir: &TempDir, timeout_secs: u64) -> CliExecutor {
    CliExecutor::new(&crate::config::ProxyConfig {
        cli_path: bin,
        workspace_dir: workdir.path().to_path_buf(),
        subprocess_timeout_secs: timeout_secs,
        ..Default::default()
    })
}

#[test]
fn build_args_matches_cli_contract() {
    let args = CliExecutor::build_args("Hello Claude", "You are a helpful AI.", true);
    assert_eq!(
        args,
        vec![
            "-p",
            "Hello Claude",
            "--output-format",
            "stream-json",
            "--verbose",
            "--system-prompt",
            "You are a helpful AI.",
        ]
    );

    let no_verbose = CliExecutor::build_args("Hi", "sys", false);
    assert!(!no_verbose.contains(&"--verbose".to_string()));
}

#[test]
fn child_env_predicate_admits_runtime_vars_only() {
    assert!(child_env_allowed("PATH"));
    assert!(child_env_allowed("HOME"));
    assert!(child_env_allowed("LC_ALL"));
    assert!(child_env_allowed("XDG_RUNTIME_DIR"));

    assert!(!child_env_allowed("OPENAI_API_KEY"));
    assert!(!child_env_allowed("ANTHROPIC_API_KEY"));
    assert!(!child_env_allowed("AWS_SECRET_ACCESS_KEY"));
}

#[test]
fn command_rebuilds_environment_from_scratch() {
    use std::ffi::OsStr;

    unsafe { std::env::set_var("MODELGATE_FAKE_CREDENTIAL", "sk-should-not-leak") };
    let dir = TempDir::new().unwrap();
    let bin = fake_cli(&dir, "true");
    let cmd = executor(bin, &dir, 5).command();
    let envs: Vec<_> = cmd.as_std().get_envs().collect();

    assert!(
        !envs
            .iter()
            .any(|(k, _)| *k == OsStr::new("MODELGATE_FAKE_CREDENTIAL")),
        "parent secrets must not reach the CLI binary"
    );
    assert!(
        envs.iter()
            .any(|(k, v)| *k == OsStr::new("NO_COLOR") && *v == Some(OsStr::new("1"))),
        "color output must be suppressed for stream parsing"
    );
    if std::env::var("PATH").is_ok() {
        assert!(
            envs.iter()
                .any(|(k, v)| *k == OsStr::new("PATH") && v.is_some()),
            "the child needs PATH to spawn its tool servers"
        );
    }
}

#[test]
fn parse_line_handles_event_taxonomy() {
    let chunk = parse_stream_line(
        r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#,
    );
    assert!(matches!(&chunk[0], ExecEvent::TextChunk { chunk } if chunk == "hi"));

    let init = parse_stream_line(r#"{"type":"system","subtype":"init","session_id":"s1"}"#);
    assert!(matches!(&init[0], ExecEvent::StatusUpdate { status, .. } if status == "init"));

    let tool = parse_stream_line(r#"{"type":"tool_use","tool":{"name":"perplexity-ask"}}"#);
    assert!(matches!(&tool[0], ExecEvent::ToolCall { name } if name == "perplexity-ask"));

    let success = parse_stream_line(r#"{"type":"result","subtype":"success","result":"done"}"#);
    assert!(
        matches!(&success[0], ExecEvent::FinalResult { success: true, content, .. } if content == "done")
    );

    let failure = parse_stream_line(r#"{"type":"result","subtype":"error_max_turns"}"#);
    assert!(matches!(
        &failure[0],
        ExecEvent::FinalResult { success: false, .. }
    ));

    let garbage = parse_stream_line("not json");
    assert!(matches!(&garbage[0], ExecEvent::StreamParseError { .. }));

    assert!(parse_stream_line(r#"{"type":"something_else"}"#).is_empty());
}

#[tokio::test]
async fn streams_events_and_prefers_final_result() {
    let dir = TempDir::new().unwrap();
    let bin = fake_cli(
        &dir,
        r#"echo '{"type":"system","subtype":"init","session_id":"s1"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"chunk one "}]}}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"chunk two"}]}}'
echo '{"type":"result","subtype":"success","result":"the full assembled answer"}'"#,
    );

    let result = executor(bin, &dir, 30)
        .run_to_completion("prompt".into(), "sys".into(), None)
        .await
        .unwrap();
    assert_eq!(result, "the full assembled answer");
}

#[tokio::test]
async fn falls_back_to_accumulated_chunks() {
    let dir = TempDir::new().unwrap();
    let bin = fake_cli(
        &dir,
        r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"partial "}]}}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"answer"}]}}'"#,
    );

    let result = executor(bin, &dir, 30)
        .run_to_completion("prompt".into(), "sys".into(), None)
        .await
        .unwrap();
    assert_eq!(result, "partial answer");
}

#[tokio::test]
async fn nonzero_exit_without_result_is_an_error() {
    let dir = TempDir::new().unwrap();
    let bin = fake_cli(
        &dir,
        r#"echo "something broke" >&2
exit 3"#,
    );

    let err = executor(bin, &dir, 30)
        .run_to_completion("prompt".into(), "sys".into(), None)
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains('3'), "exit code should be reported: {message}");
    assert!(message.contains("something broke"));
}

#[tokio::test]
async fn emits_start_and_exit_events() {
    let dir = TempDir::new().unwrap();
    let bin = fake_cli(&dir, r#"echo '{"type":"result","subtype":"success","result":"ok"}'"#);

    let mut events = executor(bin, &dir, 30)
        .run("prompt".into(), "sys".into())
        .unwrap();

    let mut saw_start = false;
    let mut saw_exit_zero = false;
    while let Some(event) = events.recv().await {
        match event {
            ExecEvent::SubprocessStart { pid } => {
                assert!(pid > 0);
                saw_start = true;
            }
            ExecEvent::SubprocessExit { code, .. } => {
                assert_eq!(code, Some(0));
                saw_exit_zero = true;
            }
            _ => {}
        }
    }
    assert!(saw_start);
    assert!(saw_exit_zero);
}

#[tokio::test]
async fn progress_callback_sees_tools_and_text() {
    let dir = TempDir::new().unwrap();
    let bin = fake_cli(
        &dir,
        r#"echo '{"type":"tool_use","tool":{"name":"desktop-commander"}}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"working"}]}}'
echo '{"type":"result","subtype":"success","result":"done"}'"#,
    );

    let seen: Arc<Mutex<Vec<ExecProgress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let progress: ProgressFn = Arc::new(move |p| sink.lock().unwrap().push(p));

    executor(bin, &dir, 30)
        .run_to_completion("prompt".into(), "sys".into(), Some(progress))
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert!(seen.iter().any(|p| p.stage == "tool_execution" && p.tool_calls == Some(1)));
    assert!(seen
        .iter()
        .any(|p| p.stage == "generating_response"
            && p.partial_response_prefix.as_deref() == Some("working")));
}

#[tokio::test]
async fn hard_timeout_kills_the_subprocess() {
    let dir = TempDir::new().unwrap();
    let bin = fake_cli(&dir, "sleep 60");

    let start = std::time::Instant::now();
    let err = executor(bin, &dir, 1)
        .run_to_completion("prompt".into(), "sys".into(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Timeout(_)));
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn missing_binary_is_config_error() {
    let dir = TempDir::new().unwrap();
    let executor = executor(PathBuf::from("/nonexistent/llm-binary"), &dir, 5);
    let err = executor.run("p".into(), "s".into()).unwrap_err();
    assert!(matches!(err, GatewayError::Config(_)));
}

#[tokio::test]
async fn missing_workdir_is_config_error() {
    let dir = TempDir::new().unwrap();
    let bin = fake_cli(&dir, "true");
    let executor = CliExecutor::new(&crate::config::ProxyConfig {
        cli_path: bin,
        workspace_dir: PathBuf::from("/nonexistent/workdir"),
        ..Default::default()
    });
    let err = executor.run("p".into(), "s".into()).unwrap_err();
    assert!(err.to_string().contains("working directory"));
}
