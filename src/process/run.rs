use super::signal::{platform_signaller, Signaller};
use super::terminate::{escalate, ExitWaiter};
use super::types::{ExitInfo, KillResult, SpawnRequest, WaitOutcome};
use super::{Launcher, ProcessHandle};
use async_trait::async_trait;
use log_buffer::LogBuffer;
use parking_lot::Mutex;
use std::fmt::Write;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

/// Bytes of combined stdout/stderr kept per child.
const OUTPUT_CACHE_SIZE: usize = 16 * 1024;

type OutputCache = Arc<Mutex<LogBuffer<Vec<u8>>>>;

/// Launcher backed by `tokio::process`.
pub struct TokioLauncher {
    signaller: Arc<dyn Signaller>,
}

impl TokioLauncher {
    pub fn new() -> Self {
        Self::with_signaller(platform_signaller())
    }

    pub fn with_signaller(signaller: Arc<dyn Signaller>) -> Self {
        Self { signaller }
    }
}

impl Default for TokioLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Launcher for TokioLauncher {
    #[instrument(skip(self, request), fields(program = ?request.program))]
    async fn spawn(&self, request: SpawnRequest) -> Arc<dyn ProcessHandle> {
        let output = Arc::new(Mutex::new(LogBuffer::new(vec![0; OUTPUT_CACHE_SIZE])));
        let mut command = Command::new(&request.program);
        command
            .args(&request.args)
            .env_clear()
            .envs(&request.env)
            .stdin(Stdio::null());
        if let Some(dir) = &request.working_directory {
            command.current_dir(dir);
        }
        if request.capture_output {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        #[cfg(unix)]
        command.process_group(0);

        debug!(
            "Spawning: {} {}",
            request.program.display(),
            shell_words::join(&request.args)
        );
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(?err, "Failed to spawn child");
                return Arc::new(ChildHandle::failed(err.to_string(), self.signaller.clone()));
            }
        };
        let Some(pid) = child.id() else {
            warn!("Child exited instantly");
            return Arc::new(ChildHandle::failed(
                "child exited before its pid could be read".into(),
                self.signaller.clone(),
            ));
        };

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(
                read_lines(stdout, output.clone()).instrument(info_span!("read_stdout", pid)),
            );
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(
                read_lines(stderr, output.clone()).instrument(info_span!("read_stderr", pid)),
            );
        }

        let (exit_sender, exit_receiver) = watch::channel(None);
        tokio::spawn(
            async move {
                let info = match child.wait().await {
                    Ok(status) => ExitInfo::from(status),
                    Err(err) => {
                        error!(?err, "Wait error");
                        ExitInfo::default()
                    }
                };
                debug!(%info, "Child exited");
                let _ = exit_sender.send(Some(info));
            }
            .instrument(info_span!("wait_child", pid)),
        );

        info!("Child started: {}", pid);
        Arc::new(ChildHandle {
            pid: Some(pid),
            spawn_error: None,
            exit: exit_receiver,
            output,
            signaller: self.signaller.clone(),
        })
    }
}

async fn read_lines<R: AsyncRead + Unpin>(stream: R, cache: OutputCache) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                error!(?err, "Reading output failed");
                // The pipe must stay open or the child dies of SIGPIPE
                if let Err(err) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
                    error!(?err, "Draining output failed");
                }
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf);
        debug!("Output: {line:?}");
        if let Err(err) = cache.lock().write_str(&line) {
            error!(?err, "Cache error");
        }
    }
    debug!("Output closed");
}

/// Handle to a child spawned by [`TokioLauncher`].
///
/// The exit status is published once through a watch channel, so every
/// `wait` after exit sees the same cached result.
pub struct ChildHandle {
    pid: Option<u32>,
    spawn_error: Option<String>,
    exit: watch::Receiver<Option<ExitInfo>>,
    output: OutputCache,
    signaller: Arc<dyn Signaller>,
}

impl ChildHandle {
    fn failed(reason: String, signaller: Arc<dyn Signaller>) -> Self {
        // Never ran: report a settled, status-less exit
        let (_, exit) = watch::channel(Some(ExitInfo::default()));
        Self {
            pid: None,
            spawn_error: Some(reason),
            exit,
            output: Arc::new(Mutex::new(LogBuffer::new(vec![0; 64]))),
            signaller,
        }
    }
}

#[async_trait]
impl ProcessHandle for ChildHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn spawn_error(&self) -> Option<String> {
        self.spawn_error.clone()
    }

    async fn wait(&self, timeout: Option<Duration>) -> WaitOutcome {
        let current = *self.exit.borrow();
        if let Some(info) = current {
            return WaitOutcome::Exited(info);
        }
        let mut exit = self.exit.clone();
        let settled = async move {
            exit.wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|info| *info)
        };
        let info = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, settled).await {
                Ok(info) => info,
                Err(_) => return WaitOutcome::Running,
            },
            None => settled.await,
        };
        WaitOutcome::Exited(info.unwrap_or_default())
    }

    async fn kill(&self, graceful_timeout: Duration, forceful_timeout: Duration) -> KillResult {
        let Some(pid) = self.pid else {
            return KillResult::already_exited();
        };
        escalate(
            pid,
            self.signaller.as_ref(),
            self,
            graceful_timeout,
            forceful_timeout,
        )
        .await
    }

    fn output(&self) -> String {
        self.output.lock().extract().to_string()
    }
}

#[async_trait]
impl ExitWaiter for ChildHandle {
    async fn exited_within(&self, timeout: Duration) -> bool {
        self.wait(Some(timeout)).await.has_exited()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::types::KillTier;
    use std::collections::HashMap;
    use tokio::time::Instant;

    fn sh(script: &str) -> SpawnRequest {
        SpawnRequest {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            working_directory: None,
            env: HashMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())]),
            capture_output: true,
        }
    }

    #[tokio::test]
    async fn missing_executable_has_no_pid() {
        let launcher = TokioLauncher::new();
        let handle = launcher
            .spawn(SpawnRequest {
                program: "/nonexistent/vigil-test-binary".into(),
                ..Default::default()
            })
            .await;

        assert_eq!(handle.pid(), None);
        assert!(handle.spawn_error().is_some());
    }

    #[tokio::test]
    async fn crash_has_pid_and_abnormal_exit() {
        let launcher = TokioLauncher::new();
        let handle = launcher.spawn(sh("echo boom; exit 3")).await;

        assert!(handle.pid().is_some());
        assert!(handle.spawn_error().is_none());
        let outcome = handle.wait(None).await;
        assert_eq!(
            outcome,
            WaitOutcome::Exited(ExitInfo {
                code: Some(3),
                signal: None
            })
        );
        // Cached after exit
        assert_eq!(handle.wait(Some(Duration::ZERO)).await, outcome);
    }

    #[tokio::test]
    async fn wait_timeout_reports_running_and_can_wait_again() {
        let launcher = TokioLauncher::new();
        let handle = launcher.spawn(sh("sleep 0.3")).await;

        assert_eq!(
            handle.wait(Some(Duration::from_millis(20))).await,
            WaitOutcome::Running
        );
        let outcome = handle.wait(Some(Duration::from_secs(5))).await;
        assert!(outcome.has_exited());
    }

    #[tokio::test]
    async fn captures_output() {
        let launcher = TokioLauncher::new();
        let handle = launcher.spawn(sh("echo hello; echo oops 1>&2")).await;
        handle.wait(None).await;
        // Readers may trail the exit slightly
        tokio::time::sleep(Duration::from_millis(100)).await;

        let output = handle.output();
        assert!(output.contains("hello"));
        assert!(output.contains("oops"));
    }

    #[tokio::test]
    async fn non_utf8_output_keeps_child_alive() {
        let launcher = TokioLauncher::new();
        let handle = launcher
            .spawn(sh("printf '\\377\\n'; sleep 0.3; echo still-alive; exit 0"))
            .await;

        let outcome = handle.wait(Some(Duration::from_secs(5))).await;
        assert_eq!(
            outcome,
            WaitOutcome::Exited(ExitInfo {
                code: Some(0),
                signal: None
            })
        );
        tokio::time::sleep(Duration::from_millis(100)).await;

        let output = handle.output();
        assert!(output.contains('\u{FFFD}'), "{output:?}");
        assert!(output.contains("still-alive"), "{output:?}");
    }

    #[tokio::test]
    async fn sigterm_ends_cooperative_process() {
        let launcher = TokioLauncher::new();
        let handle = launcher.spawn(sh("sleep 30")).await;

        let result = handle
            .kill(Duration::from_secs(2), Duration::from_secs(2))
            .await;
        assert_eq!(result, KillResult::terminated_by(KillTier::Graceful));
    }

    #[tokio::test]
    async fn sigkill_ends_process_ignoring_sigterm() {
        let launcher = TokioLauncher::new();
        let handle = launcher.spawn(sh("trap '' TERM; sleep 1.5")).await;
        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        let result = handle
            .kill(Duration::from_millis(1000), Duration::from_millis(1000))
            .await;
        let elapsed = started.elapsed();

        assert_eq!(result, KillResult::terminated_by(KillTier::Forceful));
        assert!(elapsed >= Duration::from_millis(1000), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(2000), "{elapsed:?}");
    }

    #[tokio::test]
    async fn kill_after_exit_is_already_exited() {
        let launcher = TokioLauncher::new();
        let handle = launcher.spawn(sh("exit 0")).await;
        handle.wait(None).await;

        let result = handle
            .kill(Duration::from_millis(100), Duration::from_millis(100))
            .await;
        assert_eq!(result, KillResult::already_exited());
    }
}
