//! Supervisor for one launched process

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Supervisor errors
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process already started")]
    AlreadyStarted,

    #[error("Process was never started")]
    NotStarted,

    #[error("Supervisor task ended without recording an outcome")]
    Lost,
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// What to run
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Set on top of the inherited environment
    pub env: BTreeMap<String, String>,
    /// Append `--verbose` after the positional arguments
    pub verbose: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            verbose: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Full argument vector passed to the program
    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.args.clone();
        if self.verbose {
            argv.push("--verbose".to_string());
        }
        argv
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in self.argv() {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Lifecycle of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    /// Exited on its own; a negative code is the terminating signal
    Completed { code: i32 },
    /// Killed after exceeding its wall-clock limit
    TimedOut,
    /// Killed on request
    Killed,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::Running => write!(f, "running"),
            Self::Completed { code } => write!(f, "completed with code {}", code),
            Self::TimedOut => write!(f, "timed out"),
            Self::Killed => write!(f, "killed"),
        }
    }
}

/// Terminal status and captured output
#[derive(Debug, Clone)]
pub struct Outcome {
    pub state: ProcessState,
    /// Exit code, or the negated signal number
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Outcome {
    pub fn success(&self) -> bool {
        self.state == ProcessState::Completed { code: 0 }
    }

    pub fn signal_name(&self) -> Option<&'static str> {
        super::signal_name(self.code)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Runs a process with a deadline and captures its output.
///
/// `stop` and `collect` take `&self`, so a supervisor can be shared behind
/// an `Arc` between the test body and its teardown.
pub struct Supervisor {
    spec: CommandSpec,
    state: Arc<watch::Sender<ProcessState>>,
    outcome_rx: Mutex<Option<watch::Receiver<Option<Arc<Outcome>>>>>,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl Supervisor {
    pub fn new(spec: CommandSpec) -> Self {
        let (state, _) = watch::channel(ProcessState::NotStarted);
        Self {
            spec,
            state: Arc::new(state),
            outcome_rx: Mutex::new(None),
            stop_tx: Mutex::new(None),
        }
    }

    /// Create and start in one step
    pub async fn launch(
        spec: CommandSpec,
        timeout: Duration,
        teardown: Duration,
    ) -> SupervisorResult<Self> {
        let supervisor = Self::new(spec);
        supervisor.start(timeout, teardown).await?;
        Ok(supervisor)
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// Spawn the process. `timeout` bounds its run time; `teardown` bounds
    /// the wait for it to exit after a kill and for its pipes to drain.
    pub async fn start(&self, timeout: Duration, teardown: Duration) -> SupervisorResult<()> {
        let mut outcome_slot = self.outcome_rx.lock().await;
        if outcome_slot.is_some() {
            return Err(SupervisorError::AlreadyStarted);
        }

        let mut child = Command::new(&self.spec.program)
            .args(self.spec.argv())
            .envs(&self.spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: self.spec.program.display().to_string(),
                source,
            })?;
        tracing::info!("Launched {} (pid {:?})", self.spec, child.id());

        let pipes = Pipes {
            _stdin: child.stdin.take(),
            stdout: Capture::spawn(child.stdout.take()),
            stderr: Capture::spawn(child.stderr.take()),
        };

        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        self.state.send_replace(ProcessState::Running);

        let state = self.state.clone();
        let name = self.spec.program.display().to_string();
        tokio::spawn(async move {
            let outcome = supervise(child, pipes, stop_rx, timeout, teardown).await;
            tracing::info!("{} {}", name, outcome.state);
            state.send_replace(outcome.state);
            outcome_tx.send_replace(Some(Arc::new(outcome)));
        });

        *self.stop_tx.lock().await = Some(stop_tx);
        *outcome_slot = Some(outcome_rx);
        Ok(())
    }

    /// Request termination. Returns immediately; `collect` waits for it.
    pub async fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().await.take() {
            let _ = tx.try_send(());
        }
    }

    /// Wait until the process has terminated. Idempotent.
    pub async fn collect(&self) -> SupervisorResult<Outcome> {
        let mut rx = self
            .outcome_rx
            .lock()
            .await
            .clone()
            .ok_or(SupervisorError::NotStarted)?;

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| SupervisorError::Lost)?;
        outcome
            .as_deref()
            .cloned()
            .ok_or(SupervisorError::Lost)
    }
}

struct Pipes {
    // Held open until the process exits
    _stdin: Option<ChildStdin>,
    stdout: Capture,
    stderr: Capture,
}

/// Background reader accumulating one output pipe
struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl Capture {
    fn spawn<R>(reader: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let task = reader.map(|mut reader| {
            let buf = buf.clone();
            tokio::spawn(async move {
                let mut chunk = [0u8; 4096];
                loop {
                    match reader.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.lock().await.extend_from_slice(&chunk[..n]),
                    }
                }
            })
        });
        Self { buf, task }
    }

    /// Wait up to `grace` for end of stream, then return what was read
    async fn finish(mut self, grace: Duration) -> Vec<u8> {
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                tracing::debug!("Output pipe still open after {:?}", grace);
                task.abort();
            }
        }
        let out = self.buf.lock().await.clone();
        out
    }
}

async fn supervise(
    mut child: Child,
    pipes: Pipes,
    mut stop_rx: mpsc::Receiver<()>,
    timeout: Duration,
    teardown: Duration,
) -> Outcome {
    let (state, code) = tokio::select! {
        status = child.wait() => {
            let code = match status {
                Ok(status) => exit_code(status),
                Err(e) => {
                    tracing::warn!("Failed to wait for process: {}", e);
                    -1
                }
            };
            (ProcessState::Completed { code }, code)
        }
        _ = tokio::time::sleep(timeout) => {
            tracing::warn!("Process exceeded {:?}, killing it", timeout);
            (ProcessState::TimedOut, terminate(&mut child, teardown).await)
        }
        _ = stop_rx.recv() => {
            tracing::debug!("Stop requested, killing process");
            (ProcessState::Killed, terminate(&mut child, teardown).await)
        }
    };

    let Pipes { _stdin: stdin, stdout, stderr } = pipes;
    drop(stdin);
    let (stdout, stderr) = tokio::join!(stdout.finish(teardown), stderr.finish(teardown));

    Outcome {
        state,
        code,
        stdout,
        stderr,
    }
}

/// Kill and reap, bounded by `grace`
async fn terminate(child: &mut Child, grace: Duration) -> i32 {
    if let Err(e) = child.start_kill() {
        tracing::warn!("Failed to kill process: {}", e);
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => exit_code(status),
        Ok(Err(e)) => {
            tracing::warn!("Failed to reap killed process: {}", e);
            -1
        }
        Err(_) => {
            tracing::warn!("Process did not exit within {:?} of being killed", grace);
            -1
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const LONG: Duration = Duration::from_secs(10);
    const GRACE: Duration = Duration::from_secs(1);

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").args(["-c", script])
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let sup = Supervisor::launch(sh("exit 3"), LONG, GRACE).await.unwrap();
        let outcome = sup.collect().await.unwrap();
        assert_eq!(outcome.state, ProcessState::Completed { code: 3 });
        assert_eq!(outcome.code, 3);
        assert!(!outcome.success());
        assert_eq!(sup.state(), ProcessState::Completed { code: 3 });
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let sup = Supervisor::launch(sh("echo out; echo err >&2"), LONG, GRACE)
            .await
            .unwrap();
        let outcome = sup.collect().await.unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.stdout_lossy(), "out\n");
        assert_eq!(outcome.stderr_lossy(), "err\n");
    }

    #[tokio::test]
    async fn test_env_overrides_keep_inherited_environment() {
        let spec = sh("printf '%s' \"$TESTBENCH_VALUE\"; [ -n \"$PATH\" ]").env("TESTBENCH_VALUE", "abc");
        let sup = Supervisor::launch(spec, LONG, GRACE).await.unwrap();
        let outcome = sup.collect().await.unwrap();
        assert_eq!(outcome.stdout_lossy(), "abc");
        assert!(outcome.success());
    }

    #[tokio::test]
    async fn test_verbose_flag_is_appended() {
        let spec = sh("printf '%s' \"$1\"").arg("sh").verbose(true);
        assert_eq!(spec.argv().last().map(String::as_str), Some("--verbose"));

        let sup = Supervisor::launch(spec, LONG, GRACE).await.unwrap();
        assert_eq!(sup.collect().await.unwrap().stdout_lossy(), "--verbose");
    }

    #[tokio::test]
    async fn test_hanging_process_times_out_with_output() {
        let sup = Supervisor::launch(sh("echo started; exec sleep 30"), Duration::from_secs(1), GRACE)
            .await
            .unwrap();
        assert_eq!(sup.state(), ProcessState::Running);

        let outcome = tokio::time::timeout(Duration::from_secs(5), sup.collect())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.state, ProcessState::TimedOut);
        assert_eq!(outcome.stdout_lossy(), "started\n");
        assert_eq!(outcome.signal_name(), Some("SIGKILL"));
    }

    #[tokio::test]
    async fn test_stop_kills_process() {
        let sup = Supervisor::launch(CommandSpec::new("sleep").arg("30"), LONG, GRACE)
            .await
            .unwrap();
        sup.stop().await;

        let outcome = tokio::time::timeout(Duration::from_secs(5), sup.collect())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.state, ProcessState::Killed);
        assert_eq!(outcome.code, -9);

        // Idempotent
        let again = sup.collect().await.unwrap();
        assert_eq!(again.state, ProcessState::Killed);
        sup.stop().await;
    }

    #[tokio::test]
    async fn test_signal_exit_is_named() {
        let sup = Supervisor::launch(sh("kill -TERM $$"), LONG, GRACE).await.unwrap();
        let outcome = sup.collect().await.unwrap();
        assert_eq!(outcome.state, ProcessState::Completed { code: -15 });
        assert_eq!(outcome.signal_name(), Some("SIGTERM"));
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let err = Supervisor::launch(CommandSpec::new("/nonexistent/peer"), LONG, GRACE)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let sup = Supervisor::new(sh("exit 0"));
        assert_eq!(sup.state(), ProcessState::NotStarted);
        assert!(matches!(sup.collect().await, Err(SupervisorError::NotStarted)));

        sup.start(LONG, GRACE).await.unwrap();
        assert!(matches!(
            sup.start(LONG, GRACE).await,
            Err(SupervisorError::AlreadyStarted)
        ));
        assert!(sup.collect().await.unwrap().success());
    }
}
