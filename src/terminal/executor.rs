use crate::config::ExecuteTiming;
use crate::error::AppError;
use crate::terminal::classifier::{
    CompletionClassifier, CompletionState, PromptClassifier, Verdict, TAIL_WINDOW_BYTES,
};
use crate::terminal::registry::SessionRegistry;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExecuteParams {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

impl ExecuteParams {
    /// Bytes written to the terminal: `command` plus a carriage return, else `input` verbatim.
    pub fn payload(&self) -> String {
        match (self.command.as_deref(), self.input.as_deref()) {
            (Some(command), _) if !command.is_empty() => format!("{}\r", command),
            (_, Some(input)) => input.to_string(),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteResult {
    pub output: String,
    pub active: bool,
    pub status: CompletionState,
}

/// Runs a command in the active session and waits until it looks finished
/// or is waiting for input.
pub struct CommandExecutor {
    registry: Arc<SessionRegistry>,
    classifier: Arc<dyn CompletionClassifier>,
    timing: ExecuteTiming,
}

impl CommandExecutor {
    pub fn new(registry: Arc<SessionRegistry>, timing: ExecuteTiming) -> Self {
        let classifier = Arc::new(PromptClassifier::new(timing.silence_ceiling));
        Self::with_classifier(registry, classifier, timing)
    }

    pub fn with_classifier(
        registry: Arc<SessionRegistry>,
        classifier: Arc<dyn CompletionClassifier>,
        timing: ExecuteTiming,
    ) -> Self {
        Self {
            registry,
            classifier,
            timing,
        }
    }

    #[instrument(skip(self, params), fields(command = ?params.command, cwd = ?params.cwd))]
    pub async fn execute(&self, params: &ExecuteParams) -> Result<ExecuteResult, AppError> {
        let session = self.registry.active().ok_or(AppError::NoActiveSession)?;

        if let Some(requested) = params.cwd.as_deref().filter(|c| !c.is_empty()) {
            if Path::new(requested) != session.bound_directory() {
                warn!(
                    active = %session.bound_directory().display(),
                    requested = %requested,
                    "Execute rejected: directory mismatch"
                );
                return Err(AppError::DirectoryMismatch {
                    active: session.bound_directory().display().to_string(),
                    requested: requested.to_string(),
                });
            }
        }

        let _turn = session.lock_exec().await;
        let mut output_rx = session.process().subscribe();

        let payload = params.payload();
        if !payload.is_empty() {
            session.process().write(payload.into_bytes()).await?;
        }

        let started = Instant::now();
        let (capture, status) = self.wait_for_completion(&mut output_rx).await;
        info!(
            session_id = %session.id(),
            status = ?status,
            bytes = capture.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Execute completed"
        );

        Ok(ExecuteResult {
            output: String::from_utf8_lossy(&capture).into_owned(),
            active: true,
            status,
        })
    }

    async fn wait_for_completion(
        &self,
        output_rx: &mut broadcast::Receiver<Bytes>,
    ) -> (Vec<u8>, CompletionState) {
        let started = Instant::now();
        let mut capture = Vec::new();
        let mut last_data = Instant::now();
        let mut stream_open = true;

        let poll = self.timing.poll_interval;
        let mut ticker = time::interval_at(Instant::now() + poll, poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                chunk = output_rx.recv(), if stream_open => match chunk {
                    Ok(bytes) => {
                        capture.extend_from_slice(&bytes);
                        last_data = Instant::now();
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Execute capture lagged behind terminal output");
                    }
                    Err(RecvError::Closed) => {
                        debug!("Terminal output closed while executing");
                        stream_open = false;
                    }
                },
                _ = ticker.tick() => {
                    let verdict = self
                        .classifier
                        .classify(&capture_tail(&capture), last_data.elapsed());
                    match verdict {
                        Verdict::Prompt(state) => {
                            collect_for(output_rx, &mut capture, self.timing.grace_period, stream_open).await;
                            return (capture, state);
                        }
                        Verdict::Silence => return (capture, verdict.state()),
                        Verdict::Pending => {}
                    }
                    if let Some(max_wait) = self.timing.max_wait {
                        if started.elapsed() >= max_wait {
                            debug!("Execute reached its wait limit without a verdict");
                            return (capture, CompletionState::Unknown);
                        }
                    }
                }
            }
        }
    }
}

/// Keeps appending output for `window`, so trailing bytes after a prompt are not lost.
async fn collect_for(
    output_rx: &mut broadcast::Receiver<Bytes>,
    capture: &mut Vec<u8>,
    window: Duration,
    mut stream_open: bool,
) {
    let deadline = time::sleep(window);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            chunk = output_rx.recv(), if stream_open => match chunk {
                Ok(bytes) => capture.extend_from_slice(&bytes),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => stream_open = false,
            },
        }
    }
}

/// Decodes only the end of the capture that the classifier can see. Trailing
/// whitespace is dropped first so a prompt followed by padding stays in view.
fn capture_tail(capture: &[u8]) -> Cow<'_, str> {
    let end = capture
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |last| last + 1);
    // A few extra bytes so a character split at the cut does not eat into the window.
    let start = end.saturating_sub(TAIL_WINDOW_BYTES + 4);
    String::from_utf8_lossy(&capture[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn payload_prefers_command_over_input() {
        let both = ExecuteParams {
            command: Some("ls".into()),
            input: Some("y".into()),
            cwd: None,
        };
        assert_eq!(both.payload(), "ls\r");

        let input_only = ExecuteParams {
            command: Some(String::new()),
            input: Some("y\n".into()),
            cwd: None,
        };
        assert_eq!(input_only.payload(), "y\n");
        assert_eq!(ExecuteParams::default().payload(), "");
    }

    #[test]
    fn only_the_end_of_a_large_capture_is_classified() {
        let mut capture = "y\r\n".repeat(350_000).into_bytes();
        capture.extend_from_slice("agent@test:/tmp$ ".as_bytes());
        capture.extend_from_slice(&[b' '; 4096]);

        let tail = capture_tail(&capture);
        assert!(tail.len() <= TAIL_WINDOW_BYTES + 4);
        assert!(tail.ends_with("agent@test:/tmp$"));

        let classifier = PromptClassifier::new(Duration::from_secs(3));
        assert_eq!(
            classifier.classify(&tail, Duration::ZERO),
            Verdict::Prompt(CompletionState::Finished)
        );
    }

    #[test]
    fn tail_of_a_short_or_blank_capture() {
        assert_eq!(capture_tail(b"ls\r\nfile\r\n"), "ls\r\nfile");
        assert_eq!(capture_tail(b" \r\n\t"), "");
        assert_eq!(capture_tail("caf\u{e9}> ".as_bytes()), "caf\u{e9}>");
    }

    #[tokio::test]
    async fn no_active_session_is_rejected() {
        let registry = Arc::new(SessionRegistry::new(&Config::default()));
        let executor = CommandExecutor::new(Arc::clone(&registry), ExecuteTiming::default());
        let params = ExecuteParams {
            command: Some("ls".into()),
            ..Default::default()
        };
        let err = executor.execute(&params).await.unwrap_err();
        assert!(matches!(err, AppError::NoActiveSession));
        assert!(registry.list_sessions().is_empty());
    }

    #[cfg(unix)]
    mod with_shell {
        use super::*;
        use crate::config::SupersedePolicy;
        use crate::terminal::registry::TerminalSession;
        use tokio::time::timeout;

        const PROMPT: &str = "agent@test:/tmp$ ";

        fn shell_config(silence_ceiling: Duration) -> Config {
            Config {
                default_shell: "bash".to_string(),
                shell_args: vec!["--norc".to_string(), "--noprofile".to_string()],
                shell_env: vec![
                    ("PS1".to_string(), PROMPT.to_string()),
                    ("TERM".to_string(), "dumb".to_string()),
                ],
                supersede_policy: SupersedePolicy::Detach,
                execute: ExecuteTiming {
                    silence_ceiling,
                    ..ExecuteTiming::default()
                },
                ..Config::default()
            }
        }

        /// Waits until the shell has printed a prompt and then stayed quiet.
        async fn settle(session: &TerminalSession) {
            let mut rx = session.process().take_output();
            session.process().write(b"\r".to_vec()).await.unwrap();
            let mut seen = String::new();
            for _ in 0..50 {
                match timeout(Duration::from_millis(400), rx.recv()).await {
                    Ok(Ok(chunk)) => seen.push_str(&String::from_utf8_lossy(&chunk)),
                    Ok(Err(RecvError::Lagged(_))) => continue,
                    Ok(Err(RecvError::Closed)) => panic!("shell exited while settling"),
                    Err(_) if seen.contains(PROMPT.trim_end()) => return,
                    Err(_) => continue,
                }
            }
            panic!("shell never printed its prompt: {seen:?}");
        }

        async fn harness(
            silence_ceiling: Duration,
        ) -> Option<(Arc<SessionRegistry>, CommandExecutor, Arc<TerminalSession>, tempfile::TempDir)> {
            if which::which("bash").is_err() {
                return None;
            }
            let config = shell_config(silence_ceiling);
            let registry = Arc::new(SessionRegistry::new(&config));
            let executor = CommandExecutor::new(Arc::clone(&registry), config.execute);
            let dir = tempfile::tempdir().unwrap();
            let session = registry.create_session(dir.path()).unwrap();
            settle(&session).await;
            Some((registry, executor, session, dir))
        }

        fn command(cmd: &str) -> ExecuteParams {
            ExecuteParams {
                command: Some(cmd.to_string()),
                ..Default::default()
            }
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn simple_command_finishes_at_prompt() {
            let Some((registry, executor, _session, dir)) = harness(Duration::from_secs(15)).await else {
                return;
            };
            let params = ExecuteParams {
                command: Some("echo $((40+2))".into()),
                cwd: Some(dir.path().display().to_string()),
                ..Default::default()
            };
            let result = executor.execute(&params).await.unwrap();

            assert_eq!(result.status, CompletionState::Finished);
            assert!(result.active);
            assert!(result.output.contains("42"), "{:?}", result.output);
            assert!(result.output.trim_end().ends_with('$'));
            registry.shutdown();
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn question_prompt_is_interactive_and_input_answers_it() {
            let Some((registry, executor, _session, dir)) = harness(Duration::from_secs(15)).await else {
                return;
            };
            std::fs::write(dir.path().join("victim.txt"), b"").unwrap();

            let asked = executor.execute(&command("rm -i victim.txt")).await.unwrap();
            assert_eq!(asked.status, CompletionState::Interactive);
            assert!(asked.output.trim_end().ends_with('?'), "{:?}", asked.output);

            let answered = executor
                .execute(&ExecuteParams {
                    input: Some("n\r".into()),
                    ..Default::default()
                })
                .await
                .unwrap();
            assert_eq!(answered.status, CompletionState::Finished);
            assert!(dir.path().join("victim.txt").exists());
            registry.shutdown();
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn silent_command_resolves_after_the_ceiling() {
            let ceiling = Duration::from_millis(800);
            let Some((registry, executor, _session, _dir)) = harness(ceiling).await else {
                return;
            };
            let started = Instant::now();
            let result = executor.execute(&command("sleep 5")).await.unwrap();
            let elapsed = started.elapsed();

            assert_eq!(result.status, CompletionState::Interactive);
            assert!(elapsed >= ceiling, "{elapsed:?}");
            assert!(elapsed < Duration::from_secs(4), "{elapsed:?}");
            registry.shutdown();
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn directory_mismatch_writes_nothing() {
            let Some((registry, executor, session, _dir)) = harness(Duration::from_secs(15)).await else {
                return;
            };
            let mut observer = session.process().subscribe();
            let params = ExecuteParams {
                command: Some("touch should-not-exist".into()),
                cwd: Some("/definitely/elsewhere".into()),
                ..Default::default()
            };

            let err = executor.execute(&params).await.unwrap_err();
            let message = err.to_string();
            assert!(message.contains("Active Directory:"));
            assert!(message.contains("Requested Directory: /definitely/elsewhere"));

            time::sleep(Duration::from_millis(300)).await;
            assert!(matches!(observer.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
            registry.shutdown();
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn consecutive_captures_do_not_overlap() {
            let Some((registry, executor, _session, _dir)) = harness(Duration::from_secs(15)).await else {
                return;
            };
            let first = executor.execute(&command("echo first$((1))")).await.unwrap();
            let second = executor.execute(&command("echo second$((2))")).await.unwrap();

            assert!(first.output.contains("first1"));
            assert!(!first.output.contains("second"));
            assert!(second.output.contains("second2"));
            assert!(!second.output.contains("first"));
            registry.shutdown();
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn concurrent_executes_take_turns() {
            let Some((registry, executor, _session, _dir)) = harness(Duration::from_secs(15)).await else {
                return;
            };
            let alpha = command("echo alpha$((1))");
            let beta = command("echo beta$((2))");
            let (a, b) = tokio::join!(executor.execute(&alpha), executor.execute(&beta));
            let (a, b) = (a.unwrap(), b.unwrap());

            assert!(a.output.contains("alpha1") && !a.output.contains("beta"));
            assert!(b.output.contains("beta2") && !b.output.contains("alpha"));
            registry.shutdown();
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn max_wait_yields_unknown() {
            let Some((registry, _executor, _session, _dir)) = harness(Duration::from_secs(15)).await else {
                return;
            };
            let timing = ExecuteTiming {
                max_wait: Some(Duration::from_millis(500)),
                ..ExecuteTiming::default()
            };
            let executor = CommandExecutor::new(Arc::clone(&registry), timing);
            let result = executor.execute(&command("sleep 3; echo la$((0))te")).await.unwrap();

            assert_eq!(result.status, CompletionState::Unknown);
            assert!(!result.output.contains("la0te"));
            registry.shutdown();
        }
    }
}
