use crate::EngineError;
use std::ffi::OsStr;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

pub fn command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    cmd.stdin(Stdio::null());
    // Dropping the child future must not leave a stray tool running.
    cmd.kill_on_drop(true);
    configure_for_background(&mut cmd);
    cmd
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    // Prevent console windows from stealing focus on Windows while running tools.
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn configure_for_background(_cmd: &mut Command) {}

#[derive(Debug)]
pub enum CommandRunError {
    Spawn(std::io::Error),
    Wait(std::io::Error),
    Canceled,
    TimedOut(Duration),
}

impl CommandRunError {
    pub fn into_engine_error(self, tool: &str) -> EngineError {
        match self {
            CommandRunError::Spawn(e) if e.kind() == std::io::ErrorKind::NotFound => {
                EngineError::ExternalToolMissing {
                    tool: tool.to_string(),
                }
            }
            CommandRunError::Spawn(e) | CommandRunError::Wait(e) => EngineError::Io(e),
            CommandRunError::Canceled => EngineError::Canceled,
            CommandRunError::TimedOut(limit) => EngineError::ProcessTimeout {
                tool: tool.to_string(),
                seconds: limit.as_secs(),
            },
        }
    }
}

/// Runs `cmd` to completion, capturing stdout/stderr.
///
/// The child is killed when `timeout` elapses or `cancel` fires; both are
/// optional.
pub async fn run_output_with_control(
    cmd: &mut Command,
    timeout: Option<Duration>,
    cancel: Option<&CancellationToken>,
) -> std::result::Result<Output, CommandRunError> {
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let child = cmd.spawn().map_err(CommandRunError::Spawn)?;

    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    let canceled = async {
        match cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending::<()>().await,
        }
    };

    // Losing the race drops `wait_with_output`, and with it the child (kill_on_drop).
    tokio::select! {
        output = child.wait_with_output() => output.map_err(CommandRunError::Wait),
        _ = deadline => Err(CommandRunError::TimedOut(timeout.unwrap_or_default())),
        _ = canceled => Err(CommandRunError::Canceled),
    }
}

pub fn stderr_text(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        "unknown error".to_string()
    } else {
        stderr
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_output_of_successful_command() {
        let mut cmd = command("sh");
        cmd.args(["-c", "echo hello; echo oops 1>&2"]);
        let output = run_output_with_control(&mut cmd, Some(Duration::from_secs(10)), None)
            .await
            .expect("run");
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
        assert_eq!(stderr_text(&output), "oops");
    }

    #[tokio::test]
    async fn slow_command_is_killed_on_timeout() {
        let mut cmd = command("sh");
        cmd.args(["-c", "sleep 5"]);
        let started = std::time::Instant::now();
        let err = run_output_with_control(&mut cmd, Some(Duration::from_millis(100)), None)
            .await
            .expect_err("should time out");
        assert!(matches!(err, CommandRunError::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn cancellation_stops_the_command() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let mut cmd = command("sh");
        cmd.args(["-c", "sleep 5"]);
        let err = run_output_with_control(&mut cmd, None, Some(&token))
            .await
            .expect_err("should cancel");
        assert!(matches!(err, CommandRunError::Canceled));
    }

    #[tokio::test]
    async fn missing_program_reports_spawn_error() {
        let mut cmd = command("definitely-not-a-real-tool-4821");
        let err = run_output_with_control(&mut cmd, None, None)
            .await
            .expect_err("spawn should fail");
        match err {
            CommandRunError::Spawn(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn run_errors_map_onto_engine_errors() {
        let missing = CommandRunError::Spawn(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(matches!(
            missing.into_engine_error("yt-dlp"),
            EngineError::ExternalToolMissing { tool } if tool == "yt-dlp"
        ));
        let timeout = CommandRunError::TimedOut(Duration::from_secs(120));
        assert!(matches!(
            timeout.into_engine_error("ffmpeg"),
            EngineError::ProcessTimeout { seconds: 120, .. }
        ));
        assert!(matches!(
            CommandRunError::Canceled.into_engine_error("ffmpeg"),
            EngineError::Canceled
        ));
    }
}
