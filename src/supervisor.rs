/// Watch-process supervision: spawn the compiler in watch mode, relay its
/// output, recover once from an "already running" conflict, and make sure the
/// process is killed when the build session ends.
///
/// Lifecycle: `Idle -> Launching -> Running -> {Exited | Terminated}`. A
/// conflict reported by the first attempt goes back to `Launching` exactly
/// once; a conflict or any other stderr output from the retry ends in `Failed`.
use crate::compiler::CompilerCommand;
use crate::conflict;
use crate::relay::{self, Stream};
use crate::sink::LogSink;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::process::Child;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Whether a launch may still recover from a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    First,
    Retry,
}

/// A failure that ends the session after `launch` has already returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// The restarted process reported a conflict as well.
    ConflictOnRetry { stale_pid: i32 },
    /// The restarted process wrote something else to stderr.
    ErrorOnRetry { message: String },
    /// The first process could not be spawned.
    Spawn { message: String },
    /// The restart after a conflict could not be spawned.
    Respawn { message: String },
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Failure::ConflictOnRetry { stale_pid } => write!(
                f,
                "watch process still conflicts with PID {} after restarting",
                stale_pid
            ),
            Failure::ErrorOnRetry { message } => {
                write!(f, "watch process failed after restarting: {}", message)
            }
            Failure::Spawn { message } => write!(f, "{}", message),
            Failure::Respawn { message } => write!(f, "restart after conflict failed: {}", message),
        }
    }
}

impl std::error::Error for Failure {}

/// Observable supervisor state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Launching,
    Running { pid: u32, attempt: Attempt },
    Exited { pid: u32, code: i32 },
    Terminated,
    Failed(Failure),
}

impl Phase {
    /// True once there is no watch process left to wait for.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            Phase::Exited { .. } | Phase::Terminated | Phase::Failed(_)
        )
    }
}

/// Errors returned by [`ProcessSupervisor::launch`].
#[derive(Debug)]
pub enum SupervisorError {
    /// The OS refused to create the process.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// The child was created but reported no PID.
    MissingPid { program: String },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Spawn { program, source } => {
                write!(f, "failed to spawn {}: {}", program, source)
            }
            SupervisorError::MissingPid { program } => {
                write!(f, "spawned {} but it reported no PID", program)
            }
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Spawn { source, .. } => Some(source),
            SupervisorError::MissingPid { .. } => None,
        }
    }
}

/// Handle to the spawned process. The child itself lives in its exit
/// observer task; this side only holds the kill switch.
struct SupervisedProcess {
    pid: u32,
    attempt: Attempt,
    kill: oneshot::Sender<()>,
}

impl SupervisedProcess {
    /// Ask the observer to SIGKILL the child. False if it already exited.
    fn kill(self) -> bool {
        self.kill.send(()).is_ok()
    }
}

/// What the stderr inspector saw first.
#[derive(Debug, PartialEq, Eq)]
enum Report {
    Conflict(i32),
    Error(String),
}

impl Report {
    /// First attempts only care about conflicts; a retry gives up on any
    /// non-blank stderr.
    fn from_chunk(chunk: &str, attempt: Attempt) -> Option<Report> {
        if let Some(stale) = conflict::detect(chunk) {
            return Some(Report::Conflict(stale));
        }
        let text = chunk.trim();
        if attempt == Attempt::Retry && !text.is_empty() {
            return Some(Report::Error(text.to_string()));
        }
        None
    }
}

/// Everything the exit observer needs besides the child itself.
struct Exit {
    pid: u32,
    attempt: Attempt,
    relays: Vec<JoinHandle<u64>>,
    /// Set once stderr produced a report.
    reported: Arc<AtomicBool>,
    reporter: Option<JoinHandle<()>>,
}

enum Termination {
    Kill(SupervisedProcess),
    Deferred,
    Noop,
}

struct State {
    active: Option<SupervisedProcess>,
    kill_on_settle: bool,
    phase: watch::Sender<Phase>,
}

impl State {
    fn new(phase: watch::Sender<Phase>) -> Self {
        Self {
            active: None,
            kill_on_settle: false,
            phase,
        }
    }

    fn phase(&self) -> Phase {
        self.phase.borrow().clone()
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.send_replace(phase);
    }

    fn active_pid(&self) -> Option<u32> {
        self.active.as_ref().map(|p| p.pid)
    }

    fn begin_launch(&mut self) {
        self.set_phase(Phase::Launching);
    }

    /// Adopt a freshly spawned process. Hands it back if termination was
    /// requested while the launch was in flight.
    fn settle(&mut self, process: SupervisedProcess) -> Option<SupervisedProcess> {
        if std::mem::take(&mut self.kill_on_settle) {
            self.set_phase(Phase::Terminated);
            return Some(process);
        }
        self.set_phase(Phase::Running {
            pid: process.pid,
            attempt: process.attempt,
        });
        self.active = Some(process);
        None
    }

    fn launch_failed(&mut self, failure: Failure) {
        self.kill_on_settle = false;
        self.set_phase(Phase::Failed(failure));
    }

    fn request_termination(&mut self) -> Termination {
        if let Some(process) = self.active.take() {
            self.set_phase(Phase::Terminated);
            return Termination::Kill(process);
        }
        if self.phase() == Phase::Launching {
            self.kill_on_settle = true;
            return Termination::Deferred;
        }
        Termination::Noop
    }

    /// Record a natural exit. Ignored unless `pid` is still the active process.
    fn observe_exit(&mut self, pid: u32, code: i32) -> bool {
        if self.active_pid() != Some(pid) {
            return false;
        }
        self.active = None;
        if !matches!(self.phase(), Phase::Failed(_)) {
            self.set_phase(Phase::Exited { pid, code });
        }
        true
    }

    /// Mark the session failed on behalf of `pid`. Ignored unless `pid` is
    /// still the active process.
    fn fail(&mut self, pid: u32, failure: Failure) -> bool {
        if self.active_pid() != Some(pid) {
            return false;
        }
        self.set_phase(Phase::Failed(failure));
        true
    }
}

/// Owns the watch process for one build session.
///
/// Cloning yields another handle to the same supervisor; the background
/// relay, observer, and recovery tasks each hold one.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    command: CompilerCommand,
    sink: Arc<dyn LogSink>,
    state: Mutex<State>,
    phase: watch::Receiver<Phase>,
    spawned: AtomicU32,
}

impl ProcessSupervisor {
    pub fn new(command: CompilerCommand, sink: Arc<dyn LogSink>) -> Self {
        let (tx, rx) = watch::channel(Phase::Idle);
        Self {
            inner: Arc::new(Inner {
                command,
                sink,
                state: Mutex::new(State::new(tx)),
                phase: rx,
                spawned: AtomicU32::new(0),
            }),
        }
    }

    pub fn phase(&self) -> Phase {
        self.inner.phase.borrow().clone()
    }

    /// Receiver that sees every phase transition from now on.
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.inner.phase.clone()
    }

    /// Number of processes spawned over the supervisor's lifetime.
    pub fn spawn_count(&self) -> u32 {
        self.inner.spawned.load(Ordering::SeqCst)
    }

    /// Spawn the compiler in watch mode and return its PID.
    ///
    /// Returns as soon as the OS hands back a PID; it does not wait for the
    /// compiler to become ready. Output relays, the exit observer and, when
    /// the tool reports conflicts, the stderr report handler are wired before
    /// returning. Only [`Attempt::First`] launches may recover from a conflict.
    pub async fn launch(&self, attempt: Attempt) -> Result<u32, SupervisorError> {
        let inner = &self.inner;
        let command = &inner.command;
        inner.state.lock().await.begin_launch();

        let mut child = match spawn(command) {
            Ok(child) => child,
            Err(source) => {
                let err = SupervisorError::Spawn {
                    program: command.program.clone(),
                    source,
                };
                return Err(self.launch_failed(err, attempt).await);
            }
        };
        let Some(pid) = child.id() else {
            let err = SupervisorError::MissingPid {
                program: command.program.clone(),
            };
            return Err(self.launch_failed(err, attempt).await);
        };

        inner.spawned.fetch_add(1, Ordering::SeqCst);
        inner
            .sink
            .info(&format!("Spawned {} ({}) in watch mode", command.label, pid));
        tracing::debug!(pid, ?attempt, command = %command.display(), "watch process spawned");

        // Adopt the process before any output is read, so a conflict
        // reported right away finds it active.
        let (kill_tx, kill_rx) = oneshot::channel();
        let process = SupervisedProcess {
            pid,
            attempt,
            kill: kill_tx,
        };
        if let Some(process) = inner.state.lock().await.settle(process) {
            process.kill();
            inner.sink.info(&format!(
                "{} process with PID: {} has been killed",
                command.label, pid
            ));
        }

        let mut relays = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            relays.push(tokio::spawn(relay::relay(
                stdout,
                Stream::Stdout,
                inner.sink.clone(),
                |_: &str| {},
            )));
        }

        let reported = Arc::new(AtomicBool::new(false));
        let mut reporter = None;
        if let Some(stderr) = child.stderr.take() {
            let mut report = None;
            if command.detect_conflicts {
                let (tx, rx) = oneshot::channel();
                reporter = Some(tokio::spawn(self.clone().handle_report(pid, attempt, rx)));
                report = Some(tx);
            }
            let flag = Arc::clone(&reported);
            let inspect = move |chunk: &str| {
                if report.is_none() {
                    return;
                }
                if let Some(found) = Report::from_chunk(chunk, attempt) {
                    if let Some(tx) = report.take() {
                        flag.store(true, Ordering::SeqCst);
                        let _ = tx.send(found);
                    }
                }
            };
            relays.push(tokio::spawn(relay::relay(
                stderr,
                Stream::Stderr,
                inner.sink.clone(),
                inspect,
            )));
        }

        let exit = Exit {
            pid,
            attempt,
            relays,
            reported,
            reporter,
        };
        tokio::spawn(self.clone().observe(child, kill_rx, exit));

        Ok(pid)
    }

    /// Forcefully kill the active watch process, if any.
    ///
    /// Safe to call repeatedly and before any launch. If a launch is in
    /// flight the process is killed as soon as it has been spawned.
    pub async fn terminate(&self) {
        let termination = self.inner.state.lock().await.request_termination();
        match termination {
            Termination::Kill(process) => {
                let pid = process.pid;
                if !process.kill() {
                    tracing::debug!(pid, "watch process exited before the kill was delivered");
                }
                self.inner.sink.info(&format!(
                    "{} process with PID: {} has been killed",
                    self.inner.command.label, pid
                ));
            }
            Termination::Deferred => {
                tracing::debug!("launch in flight, watch process will be killed once spawned");
            }
            Termination::Noop => {
                tracing::debug!("no active watch process to terminate");
            }
        }
    }

    async fn launch_failed(&self, err: SupervisorError, attempt: Attempt) -> SupervisorError {
        let message = err.to_string();
        self.inner.sink.error(&message);
        let failure = match attempt {
            Attempt::First => Failure::Spawn { message },
            Attempt::Retry => Failure::Respawn { message },
        };
        self.inner.state.lock().await.launch_failed(failure);
        err
    }

    /// Wait for the child to exit or for a kill request, whichever comes first.
    async fn observe(self, mut child: Child, kill: oneshot::Receiver<()>, exit: Exit) {
        let pid = exit.pid;
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill => {
                // SIGKILL on unix; the compiler gets no chance to clean up.
                if let Err(e) = child.start_kill() {
                    tracing::debug!(pid, error = %e, "kill failed, process already gone");
                }
                let status = child.wait().await;
                tracing::debug!(pid, ?status, "killed watch process reaped");
                return;
            }
        };

        // Let the relays drain so the exit line comes after the last output.
        for relay in exit.relays {
            let _ = relay.await;
        }

        let code = match status {
            Ok(status) => status.code().unwrap_or(0),
            Err(e) => {
                tracing::warn!(pid, error = %e, "failed to wait on watch process");
                0
            }
        };
        self.inner.sink.info(&format!(
            "{} process ({}) exited with code {}",
            self.inner.command.label, pid, code
        ));

        if exit.reported.load(Ordering::SeqCst) {
            match exit.attempt {
                Attempt::First => {
                    tracing::debug!(pid, "conflicted launch exited, recovery owns the state");
                    return;
                }
                // The failure must land before the exit does.
                Attempt::Retry => {
                    if let Some(reporter) = exit.reporter {
                        let _ = reporter.await;
                    }
                }
            }
        }
        self.inner.state.lock().await.observe_exit(pid, code);
    }

    fn handle_report(
        self,
        pid: u32,
        attempt: Attempt,
        reported: oneshot::Receiver<Report>,
    ) -> BoxFuture {
        Box::pin(async move {
            // Dropped sender: stderr closed with nothing to report.
            let Ok(report) = reported.await else {
                return;
            };
            let label = &self.inner.command.label;
            let failure = match (attempt, report) {
                (Attempt::First, Report::Conflict(stale)) => {
                    self.recover(pid, stale).await;
                    return;
                }
                (Attempt::First, Report::Error(_)) => return,
                (Attempt::Retry, Report::Conflict(stale)) => {
                    self.inner.sink.error(&format!(
                        "{} still reports PID {} after restarting, giving up",
                        label, stale
                    ));
                    Failure::ConflictOnRetry { stale_pid: stale }
                }
                (Attempt::Retry, Report::Error(message)) => {
                    self.inner.sink.error(&format!(
                        "{} reported an error after restarting, giving up",
                        label
                    ));
                    Failure::ErrorOnRetry { message }
                }
            };
            self.inner.state.lock().await.fail(pid, failure);
        })
    }

    /// Kill the stale instance and the conflicted process, then relaunch once.
    async fn recover(&self, pid: u32, stale: i32) {
        let label = &self.inner.command.label;
        {
            let mut state = self.inner.state.lock().await;
            if state.active_pid() != Some(pid) {
                tracing::debug!(pid, stale, "conflicted process no longer active, not restarting");
                return;
            }

            self.inner.sink.warn(&format!(
                "{} was already running on {}, trying to kill it and restart.",
                label, stale
            ));
            if let Err(e) = kill_stale(stale) {
                self.inner
                    .sink
                    .warn(&format!("could not kill {} process {}: {}", label, stale, e));
            }
            if let Some(first) = state.active.take() {
                first.kill();
            }
            state.begin_launch();
        }

        if let Err(e) = self.launch(Attempt::Retry).await {
            tracing::debug!(error = %e, "restart after conflict failed");
        }
    }
}

fn spawn(command: &CompilerCommand) -> std::io::Result<Child> {
    command
        .to_command()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

/// SIGKILL a PID reported by the compiler. A process that no longer exists
/// counts as killed.
fn kill_stale(pid: i32) -> nix::Result<()> {
    if pid as u32 == std::process::id() {
        return Err(Errno::EPERM);
    }
    match signal::kill(Pid::from_raw(pid), Signal::SIGKILL) {
        Err(Errno::ESRCH) => {
            tracing::debug!(pid, "stale process already gone");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::testing::{Level, MemorySink};
    use std::os::unix::process::ExitStatusExt;
    use std::path::Path;
    use std::time::Duration;

    fn script(body: &str, detect_conflicts: bool) -> CompilerCommand {
        CompilerCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), body.to_string()],
            label: "rewatch".to_string(),
            detect_conflicts,
        }
    }

    fn supervisor(body: &str, detect_conflicts: bool) -> (ProcessSupervisor, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let sup = ProcessSupervisor::new(script(body, detect_conflicts), sink.clone());
        (sup, sink)
    }

    async fn wait_phase(sup: &ProcessSupervisor, pred: impl FnMut(&Phase) -> bool) -> Phase {
        let mut rx = sup.subscribe();
        let phase = tokio::time::timeout(Duration::from_secs(10), rx.wait_for(pred))
            .await
            .expect("timed out waiting for phase")
            .expect("phase channel closed")
            .clone();
        phase
    }

    fn is_alive(pid: u32) -> bool {
        signal::kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    async fn wait_gone(pid: u32) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while is_alive(pid) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("process was never reaped");
    }

    /// Shell body that runs `first` on its first start and `then` afterwards.
    fn first_then(marker: &Path, first: &str, then: &str) -> String {
        format!(
            "if [ -e '{m}' ]; then {then}; else touch '{m}'; {first}; fi",
            m = marker.display()
        )
    }

    async fn wait_log(sink: &MemorySink, needle: &str) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while sink.count_containing(needle) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("missing log line: {needle}"));
    }

    /// PID of a process that has already exited and been reaped.
    async fn dead_pid() -> u32 {
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();
        pid
    }

    #[tokio::test]
    async fn test_launch_and_terminate_single_process() {
        let (sup, sink) = supervisor("sleep 30", true);
        assert_eq!(sup.phase(), Phase::Idle);

        let pid = sup.launch(Attempt::First).await.unwrap();
        assert_eq!(
            sup.phase(),
            Phase::Running {
                pid,
                attempt: Attempt::First
            }
        );
        assert!(is_alive(pid));

        sup.terminate().await;
        assert_eq!(sup.phase(), Phase::Terminated);
        wait_gone(pid).await;

        assert_eq!(sup.spawn_count(), 1);
        assert_eq!(
            sink.messages(Level::Info),
            vec![
                format!("Spawned rewatch ({pid}) in watch mode"),
                format!("rewatch process with PID: {pid} has been killed"),
            ]
        );
    }

    #[tokio::test]
    async fn test_terminate_twice_sends_one_kill() {
        let (sup, sink) = supervisor("sleep 30", true);
        let pid = sup.launch(Attempt::First).await.unwrap();

        sup.terminate().await;
        sup.terminate().await;
        wait_gone(pid).await;

        assert_eq!(sink.count_containing("has been killed"), 1);
        assert_eq!(sup.phase(), Phase::Terminated);
    }

    #[tokio::test]
    async fn test_terminate_before_launch_is_noop() {
        let (sup, sink) = supervisor("sleep 30", true);
        sup.terminate().await;
        assert_eq!(sup.phase(), Phase::Idle);
        assert!(sink.entries().is_empty());

        let pid = sup.launch(Attempt::First).await.unwrap();
        assert_eq!(
            sup.phase(),
            Phase::Running {
                pid,
                attempt: Attempt::First
            }
        );

        sup.terminate().await;
        wait_gone(pid).await;
        assert_eq!(sink.count_containing("has been killed"), 1);
    }

    #[tokio::test]
    async fn test_output_relayed_and_exit_logged() {
        let (sup, sink) = supervisor("echo Compiling...; echo 'oops' >&2; exit 0", true);
        let pid = sup.launch(Attempt::First).await.unwrap();

        let phase = wait_phase(&sup, Phase::is_settled).await;
        assert_eq!(phase, Phase::Exited { pid, code: 0 });

        let info = sink.messages(Level::Info);
        assert!(info.contains(&"Compiling...".to_string()));
        assert_eq!(
            info.last().unwrap(),
            &format!("rewatch process ({pid}) exited with code 0")
        );
        assert_eq!(sink.messages(Level::Error), vec!["oops"]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_then_terminate_is_noop() {
        let (sup, sink) = supervisor("exit 3", true);
        let pid = sup.launch(Attempt::First).await.unwrap();

        let phase = wait_phase(&sup, Phase::is_settled).await;
        assert_eq!(phase, Phase::Exited { pid, code: 3 });

        sup.terminate().await;
        assert_eq!(sink.count_containing("has been killed"), 0);
        assert_eq!(sup.phase(), Phase::Exited { pid, code: 3 });
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let sink = Arc::new(MemorySink::new());
        let command = CompilerCommand {
            program: "nonexistent-binary-xyz".to_string(),
            args: vec!["watch".to_string()],
            label: "rewatch".to_string(),
            detect_conflicts: true,
        };
        let sup = ProcessSupervisor::new(command, sink.clone());

        let err = sup.launch(Attempt::First).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn nonexistent-binary-xyz"));
        assert!(matches!(sup.phase(), Phase::Failed(Failure::Spawn { .. })));
        assert_eq!(sup.spawn_count(), 0);
        assert_eq!(sink.messages(Level::Error).len(), 1);

        sup.terminate().await;
        assert_eq!(sink.count_containing("has been killed"), 0);
    }

    #[tokio::test]
    async fn test_conflict_kills_stale_and_relaunches_once() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("started");
        let mut stale = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let stale_pid = stale.id().unwrap();

        let body = format!(
            "if [ -e '{m}' ]; then echo recovered; sleep 30; \
             else touch '{m}'; \
             echo 'Error: Rewatch is already running with PID {p}' >&2; sleep 30; fi",
            m = marker.display(),
            p = stale_pid
        );
        let (sup, sink) = supervisor(&body, true);
        let first = sup.launch(Attempt::First).await.unwrap();

        let phase = wait_phase(&sup, |p| {
            matches!(p, Phase::Running { attempt: Attempt::Retry, .. })
        })
        .await;
        let Phase::Running { pid: second, .. } = phase else {
            unreachable!()
        };
        assert_ne!(first, second);

        let status = tokio::time::timeout(Duration::from_secs(10), stale.wait())
            .await
            .expect("stale process was not killed")
            .unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
        wait_gone(first).await;
        assert_eq!(sup.spawn_count(), 2);

        sup.terminate().await;
        wait_gone(second).await;

        let entries = sink.entries();
        let position = |needle: &str| {
            entries
                .iter()
                .position(|(_, m)| m.contains(needle))
                .unwrap_or_else(|| panic!("missing log line: {needle}"))
        };
        let warned = position(&format!("was already running on {stale_pid}"));
        let respawned = position(&format!("Spawned rewatch ({second})"));
        let killed = position(&format!("PID: {second} has been killed"));
        assert!(warned < respawned && respawned < killed);
        assert_eq!(entries[warned].0, Level::Warn);
        assert_eq!(sup.phase(), Phase::Terminated);
    }

    #[tokio::test]
    async fn test_conflict_on_retry_is_terminal() {
        let stale_pid = dead_pid().await;
        let body = format!(
            "echo 'Rewatch is already running with PID {}' >&2; sleep 30",
            stale_pid
        );
        let (sup, sink) = supervisor(&body, true);
        sup.launch(Attempt::First).await.unwrap();

        let phase = wait_phase(&sup, |p| matches!(p, Phase::Failed(_))).await;
        assert_eq!(
            phase,
            Phase::Failed(Failure::ConflictOnRetry {
                stale_pid: stale_pid as i32
            })
        );
        assert_eq!(sup.spawn_count(), 2);

        // Both diagnostics are relayed verbatim; only the first one restarted.
        let relayed = sink
            .messages(Level::Error)
            .into_iter()
            .filter(|m| m.contains("already running with PID"))
            .count();
        assert_eq!(relayed, 2);
        assert_eq!(sink.messages(Level::Warn).len(), 1);

        sup.terminate().await;
        assert_eq!(sink.count_containing("has been killed"), 1);
    }

    #[tokio::test]
    async fn test_no_recovery_when_tool_does_not_report_conflicts() {
        let (sup, sink) = supervisor(
            "echo 'Rewatch is already running with PID 1' >&2; sleep 30",
            false,
        );
        let pid = sup.launch(Attempt::First).await.unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            while sink.messages(Level::Error).is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(sup.spawn_count(), 1);
        assert!(sink.messages(Level::Warn).is_empty());
        assert_eq!(
            sup.phase(),
            Phase::Running {
                pid,
                attempt: Attempt::First
            }
        );

        sup.terminate().await;
        wait_gone(pid).await;
    }

    #[tokio::test]
    async fn test_error_on_retry_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let stale_pid = dead_pid().await;
        let body = first_then(
            &dir.path().join("started"),
            &format!("echo 'Rewatch is already running with PID {stale_pid}' >&2; sleep 30"),
            "echo 'Error: cannot open lib/bs' >&2; exit 1",
        );
        let (sup, sink) = supervisor(&body, true);
        sup.launch(Attempt::First).await.unwrap();

        let failure = Failure::ErrorOnRetry {
            message: "Error: cannot open lib/bs".to_string(),
        };
        let phase = wait_phase(&sup, |p| matches!(p, Phase::Failed(_))).await;
        assert_eq!(phase, Phase::Failed(failure.clone()));

        // The retry's own exit does not replace the failure.
        wait_log(&sink, "exited with code 1").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sup.phase(), Phase::Failed(failure));

        assert_eq!(sup.spawn_count(), 2);
        assert_eq!(sink.messages(Level::Warn).len(), 1);
        assert_eq!(sink.count_containing("reported an error after restarting"), 1);
    }

    #[tokio::test]
    async fn test_respawn_failure_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("rewatch");
        std::os::unix::fs::symlink("/bin/sh", &program).unwrap();
        let stale_pid = dead_pid().await;

        // The first run removes its own executable, so the restart cannot spawn.
        let sink = Arc::new(MemorySink::new());
        let command = CompilerCommand {
            program: program.display().to_string(),
            args: vec![
                "-c".to_string(),
                format!(
                    "rm -f '{}'; echo 'Rewatch is already running with PID {}' >&2; sleep 30",
                    program.display(),
                    stale_pid
                ),
            ],
            label: "rewatch".to_string(),
            detect_conflicts: true,
        };
        let sup = ProcessSupervisor::new(command, sink.clone());
        let first = sup.launch(Attempt::First).await.unwrap();

        let phase = wait_phase(&sup, |p| matches!(p, Phase::Failed(_))).await;
        let Phase::Failed(Failure::Respawn { message }) = phase else {
            panic!("unexpected phase {phase:?}");
        };
        assert!(message.contains("failed to spawn"));
        assert_eq!(sup.spawn_count(), 1);
        assert_eq!(sink.count_containing("failed to spawn"), 1);
        wait_gone(first).await;

        sup.terminate().await;
        assert_eq!(sink.count_containing("has been killed"), 0);
    }

    #[tokio::test]
    async fn test_stale_kill_failure_still_retries() {
        let dir = tempfile::tempdir().unwrap();
        let own = std::process::id();
        let body = first_then(
            &dir.path().join("started"),
            &format!("echo 'Rewatch is already running with PID {own}' >&2; sleep 30"),
            "echo recovered; sleep 30",
        );
        let (sup, sink) = supervisor(&body, true);
        let first = sup.launch(Attempt::First).await.unwrap();

        let phase = wait_phase(&sup, |p| {
            matches!(p, Phase::Running { attempt: Attempt::Retry, .. })
        })
        .await;
        let Phase::Running { pid: second, .. } = phase else {
            unreachable!()
        };
        wait_gone(first).await;

        let warnings = sink.messages(Level::Warn);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains(&format!("was already running on {own}")));
        assert!(warnings[1].starts_with(&format!("could not kill rewatch process {own}")));
        assert_eq!(sup.spawn_count(), 2);

        sup.terminate().await;
        wait_gone(second).await;
    }

    fn process(pid: u32) -> (SupervisedProcess, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            SupervisedProcess {
                pid,
                attempt: Attempt::First,
                kill: tx,
            },
            rx,
        )
    }

    #[test]
    fn test_termination_during_launch_is_deferred_until_settle() {
        let (tx, rx) = watch::channel(Phase::Idle);
        let mut state = State::new(tx);
        assert!(matches!(state.request_termination(), Termination::Noop));

        state.begin_launch();
        assert!(matches!(state.request_termination(), Termination::Deferred));

        let (p, mut kill_rx) = process(42);
        let returned = state.settle(p).expect("settle should hand back the process");
        assert!(returned.kill());
        assert!(kill_rx.try_recv().is_ok());
        assert_eq!(*rx.borrow(), Phase::Terminated);
        assert!(state.active.is_none());

        // The deferred request is consumed by that one launch.
        state.begin_launch();
        let (p, _kill_rx) = process(43);
        assert!(state.settle(p).is_none());
        assert_eq!(state.active_pid(), Some(43));
    }

    #[test]
    fn test_exit_of_inactive_pid_is_ignored() {
        let (tx, rx) = watch::channel(Phase::Idle);
        let mut state = State::new(tx);
        let (p, _kill_rx) = process(1);
        state.begin_launch();
        assert!(state.settle(p).is_none());

        assert!(!state.observe_exit(2, 0));
        assert_eq!(
            *rx.borrow(),
            Phase::Running {
                pid: 1,
                attempt: Attempt::First
            }
        );

        assert!(state.observe_exit(1, 0));
        assert_eq!(*rx.borrow(), Phase::Exited { pid: 1, code: 0 });
        assert!(matches!(state.request_termination(), Termination::Noop));
    }

    #[test]
    fn test_exit_after_failure_keeps_failure() {
        let (tx, rx) = watch::channel(Phase::Idle);
        let mut state = State::new(tx);
        let (p, _kill_rx) = process(7);
        state.begin_launch();
        state.settle(p);

        let failure = Failure::ConflictOnRetry { stale_pid: 100 };
        assert!(state.fail(7, failure.clone()));
        assert!(state.observe_exit(7, 1));
        assert_eq!(*rx.borrow(), Phase::Failed(failure));
    }

    #[test]
    fn test_failure_after_termination_is_ignored() {
        let (tx, rx) = watch::channel(Phase::Idle);
        let mut state = State::new(tx);
        let (p, _kill_rx) = process(7);
        state.begin_launch();
        state.settle(p);
        assert!(matches!(state.request_termination(), Termination::Kill(_)));

        assert!(!state.fail(7, Failure::ConflictOnRetry { stale_pid: 1 }));
        assert_eq!(*rx.borrow(), Phase::Terminated);
    }

    #[test]
    fn test_failure_from_killed_process_spares_next_launch() {
        let (tx, rx) = watch::channel(Phase::Idle);
        let mut state = State::new(tx);
        let (p, _kill_rx) = process(7);
        state.begin_launch();
        state.settle(p);
        assert!(matches!(state.request_termination(), Termination::Kill(_)));

        state.begin_launch();
        assert!(!state.fail(7, Failure::ConflictOnRetry { stale_pid: 1 }));
        assert_eq!(*rx.borrow(), Phase::Launching);
    }

    #[test]
    fn test_report_depends_on_attempt() {
        let conflict = "Error: Rewatch is already running with PID 4821\n";
        assert_eq!(
            Report::from_chunk(conflict, Attempt::First),
            Some(Report::Conflict(4821))
        );
        assert_eq!(
            Report::from_chunk(conflict, Attempt::Retry),
            Some(Report::Conflict(4821))
        );

        let error = "  Error: cannot open lib/bs\n";
        assert_eq!(Report::from_chunk(error, Attempt::First), None);
        assert_eq!(
            Report::from_chunk(error, Attempt::Retry),
            Some(Report::Error("Error: cannot open lib/bs".to_string()))
        );
        assert_eq!(Report::from_chunk(" \n", Attempt::Retry), None);
    }

    #[test]
    fn test_kill_stale_missing_pid_counts_as_success() {
        // Max pid_t is never handed out.
        assert!(kill_stale(i32::MAX).is_ok());
    }

    #[test]
    fn test_kill_stale_refuses_own_pid() {
        assert_eq!(kill_stale(std::process::id() as i32), Err(Errno::EPERM));
    }
}
