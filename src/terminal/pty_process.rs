use crate::config::Config;
use crate::error::AppError;
use bytes::Bytes;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

const OUTPUT_CHANNEL_CAPACITY: usize = 1024;
const INPUT_CHANNEL_CAPACITY: usize = 128;
const READ_BUFFER_SIZE: usize = 8192;
const TERM_NAME: &str = "xterm-color";

/// Program, arguments and extra environment used to start a session shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ShellCommand {
    pub fn from_config(config: &Config) -> Self {
        Self {
            program: config.default_shell.clone(),
            args: config.shell_args.clone(),
            env: config.shell_env.clone(),
        }
    }
}

type OutputSlot = Arc<StdMutex<Option<broadcast::Sender<Bytes>>>>;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One shell process attached to a pseudo-terminal.
///
/// Output is published on a broadcast channel: every subscriber gets its own cursor
/// into the stream and sees only chunks emitted after it subscribed. Once the shell
/// exits and the last chunk has been read, every receiver observes `Closed`.
pub struct PtyProcess {
    pid: Option<u32>,
    input_tx: mpsc::Sender<Vec<u8>>,
    output: OutputSlot,
    primary_rx: StdMutex<Option<broadcast::Receiver<Bytes>>>,
    master: StdMutex<Box<dyn MasterPty + Send>>,
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,
    exit_rx: watch::Receiver<Option<u32>>,
    killed: AtomicBool,
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("pid", &self.pid)
            .field("exit_code", &*self.exit_rx.borrow())
            .field("killed", &self.killed.load(Ordering::SeqCst))
            .finish()
    }
}

impl PtyProcess {
    /// Starts `shell` in `cwd`. Must be called from within a tokio runtime.
    pub fn spawn(shell: &ShellCommand, cwd: &Path, cols: u16, rows: u16) -> Result<Self, AppError> {
        let spawn_error = |reason: String| AppError::Spawn {
            cwd: cwd.display().to_string(),
            reason,
        };

        if !cwd.is_dir() {
            return Err(spawn_error("not an existing directory".to_string()));
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| spawn_error(format!("failed to open pty: {}", e)))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| spawn_error(format!("failed to clone pty reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| spawn_error(format!("failed to take pty writer: {}", e)))?;

        let mut command = CommandBuilder::new(&shell.program);
        command.args(&shell.args);
        command.cwd(cwd);
        command.env("TERM", TERM_NAME);
        for (key, value) in &shell.env {
            command.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| spawn_error(format!("{}: {}", shell.program, e)))?;
        // The reader only sees EOF once every handle to the slave side is gone.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let (output_tx, primary_rx) = broadcast::channel::<Bytes>(OUTPUT_CHANNEL_CAPACITY);
        let output: OutputSlot = Arc::new(StdMutex::new(Some(output_tx.clone())));
        spawn_reader(reader, output_tx, Arc::clone(&output), pid);

        let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(INPUT_CHANNEL_CAPACITY);
        spawn_writer(writer, input_rx, pid);

        let (exit_tx, exit_rx) = watch::channel(None::<u32>);
        tokio::task::spawn_blocking(move || {
            let code = match child.wait() {
                Ok(status) => status.exit_code(),
                Err(e) => {
                    warn!(pid = ?pid, error = %e, "Failed to wait for terminal process");
                    u32::MAX
                }
            };
            info!(pid = ?pid, exit_code = code, "Terminal process exited");
            let _ = exit_tx.send(Some(code));
        });

        Ok(Self {
            pid,
            input_tx,
            output,
            primary_rx: StdMutex::new(Some(primary_rx)),
            master: StdMutex::new(pair.master),
            killer: StdMutex::new(killer),
            exit_rx,
            killed: AtomicBool::new(false),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the receiver created together with the process, which has observed the
    /// stream since spawn. Later calls fall back to [`PtyProcess::subscribe`].
    pub fn take_output(&self) -> broadcast::Receiver<Bytes> {
        match lock(&self.primary_rx).take() {
            Some(rx) => rx,
            None => self.subscribe(),
        }
    }

    /// Subscribes to output emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        match lock(&self.output).as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                // Stream already ended: hand out a receiver that is closed immediately.
                let (_tx, rx) = broadcast::channel(1);
                rx
            }
        }
    }

    pub async fn write(&self, data: impl Into<Vec<u8>>) -> Result<(), AppError> {
        self.input_tx
            .send(data.into())
            .await
            .map_err(|_| AppError::ProcessWrite("terminal input is closed".to_string()))
    }

    /// Best-effort resize. Returns `false` when nothing was applied.
    pub fn resize(&self, cols: u16, rows: u16) -> bool {
        if self.has_exited() {
            debug!(pid = ?self.pid, "Ignoring resize for exited terminal process");
            return false;
        }
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        match lock(&self.master).resize(size) {
            Ok(()) => true,
            Err(e) => {
                debug!(pid = ?self.pid, error = %e, "Failed to resize terminal");
                false
            }
        }
    }

    /// Current `(cols, rows)` of the pseudo-terminal.
    pub fn size(&self) -> Option<(u16, u16)> {
        lock(&self.master)
            .get_size()
            .ok()
            .map(|size| (size.cols, size.rows))
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    pub fn exit_code(&self) -> Option<u32> {
        *self.exit_rx.borrow()
    }

    pub async fn wait_for_exit(&self, timeout: Duration) -> Option<u32> {
        let mut exit_rx = self.exit_rx.clone();
        let code = match tokio::time::timeout(timeout, exit_rx.wait_for(|code| code.is_some())).await {
            Ok(Ok(code)) => *code,
            _ => None,
        };
        code
    }

    /// Terminates the process. Safe to call repeatedly and after a natural exit.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) || self.has_exited() {
            return;
        }
        if let Err(e) = lock(&self.killer).kill() {
            debug!(pid = ?self.pid, error = %e, "Kill signal not delivered (process may have exited)");
        } else {
            info!(pid = ?self.pid, "Terminal process killed");
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    output_tx: broadcast::Sender<Bytes>,
    output: OutputSlot,
    pid: Option<u32>,
) {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    // No subscribers is not an error; output is simply not observed.
                    let _ = output_tx.send(Bytes::copy_from_slice(&buf[..n]));
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                    continue;
                }
                Err(e) => {
                    debug!(pid = ?pid, error = %e, "Terminal output stream ended");
                    break;
                }
            }
        }
        lock(&output).take();
        drop(output_tx);
    });
}

fn spawn_writer(
    writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
    pid: Option<u32>,
) {
    let writer = Arc::new(StdMutex::new(writer));
    tokio::spawn(async move {
        while let Some(bytes) = input_rx.recv().await {
            let writer = Arc::clone(&writer);
            let result = tokio::task::spawn_blocking(move || {
                let mut guard = lock(&writer);
                guard.write_all(&bytes)?;
                guard.flush()
            })
            .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(pid = ?pid, error = %e, "Terminal input stream closed");
                    break;
                }
                Err(e) => {
                    warn!(pid = ?pid, error = %e, "Terminal writer task failed");
                    break;
                }
            }
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::time::{timeout, Instant};

    fn sh() -> ShellCommand {
        ShellCommand {
            program: "/bin/sh".to_string(),
            args: Vec::new(),
            env: vec![("PS1".to_string(), "$ ".to_string())],
        }
    }

    async fn read_until(rx: &mut broadcast::Receiver<Bytes>, needle: &str) -> String {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            match timeout(Duration::from_millis(200), rx.recv()).await {
                Ok(Ok(chunk)) => {
                    seen.extend_from_slice(&chunk);
                    if String::from_utf8_lossy(&seen).contains(needle) {
                        break;
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => break,
                Err(_) => continue,
            }
        }
        String::from_utf8_lossy(&seen).into_owned()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn output_is_broadcast_to_every_subscriber() {
        let dir = tempfile::tempdir().unwrap();
        let process = PtyProcess::spawn(&sh(), dir.path(), 80, 24).unwrap();
        let mut first = process.take_output();
        let mut second = process.subscribe();

        process.write(b"echo broad$((1+1))cast\n".to_vec()).await.unwrap();

        assert!(read_until(&mut first, "broad2cast").await.contains("broad2cast"));
        assert!(read_until(&mut second, "broad2cast").await.contains("broad2cast"));
        process.kill();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shell_starts_in_requested_directory() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = dunce::canonicalize(dir.path()).unwrap();
        let process = PtyProcess::spawn(&sh(), &canonical, 80, 24).unwrap();
        let mut rx = process.take_output();

        process.write(b"pwd\n".to_vec()).await.unwrap();
        let needle = canonical.display().to_string();
        assert!(read_until(&mut rx, &needle).await.contains(&needle));
    }

    #[tokio::test]
    async fn missing_directory_is_a_spawn_error() {
        let err = PtyProcess::spawn(&sh(), Path::new("/definitely/not/here"), 80, 24).unwrap_err();
        assert!(matches!(err, AppError::Spawn { .. }));
    }

    #[tokio::test]
    async fn missing_shell_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let shell = ShellCommand {
            program: "/definitely/not/a/shell".to_string(),
            args: Vec::new(),
            env: Vec::new(),
        };
        let err = PtyProcess::spawn(&shell, dir.path(), 80, 24).unwrap_err();
        assert!(matches!(err, AppError::Spawn { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resize_updates_terminal_size() {
        let dir = tempfile::tempdir().unwrap();
        let process = PtyProcess::spawn(&sh(), dir.path(), 80, 24).unwrap();
        assert_eq!(process.size(), Some((80, 24)));
        assert!(process.resize(132, 40));
        assert_eq!(process.size(), Some((132, 40)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn kill_is_idempotent_and_closes_output() {
        let dir = tempfile::tempdir().unwrap();
        let process = PtyProcess::spawn(&sh(), dir.path(), 80, 24).unwrap();
        let mut rx = process.take_output();

        process.kill();
        process.kill();
        assert!(process.wait_for_exit(Duration::from_secs(5)).await.is_some());
        process.kill();

        let closed = timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Err(broadcast::error::RecvError::Closed) => break true,
                    _ => continue,
                }
            }
        })
        .await
        .unwrap_or(false);
        assert!(closed);
        assert!(!process.resize(100, 30));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn subscribe_after_exit_yields_closed_receiver() {
        let dir = tempfile::tempdir().unwrap();
        let process = PtyProcess::spawn(&sh(), dir.path(), 80, 24).unwrap();
        let mut primary = process.take_output();
        process.write(b"exit\n".to_vec()).await.unwrap();
        assert!(process.wait_for_exit(Duration::from_secs(5)).await.is_some());

        // Drain the primary receiver so the reader has certainly finished.
        while !matches!(primary.recv().await, Err(broadcast::error::RecvError::Closed)) {}

        let mut late = process.subscribe();
        assert!(matches!(late.recv().await, Err(broadcast::error::RecvError::Closed)));
    }
}
