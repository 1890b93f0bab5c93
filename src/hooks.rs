/// Build-tool lifecycle hooks.
///
/// A host drives one session through four calls, in order:
/// `on_configure`, `on_config_resolved`, `on_build_start`, `on_build_end`.
/// In watch mode the hooks own a [`ProcessSupervisor`] for the session; in
/// one-shot mode they run a single blocking build and log its output.
use crate::compiler::CompilerCommand;
use crate::config::PluginConfig;
use crate::host::HostConfig;
use crate::sink::{LogSink, TracingSink};
use crate::supervisor::{Attempt, Failure, Phase, ProcessSupervisor, SupervisorError};
use std::process::Stdio;
use std::sync::Arc;
use tokio::sync::watch;

/// How the host is running this session. Fixed once configuration resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    OneShot,
    Watch,
}

/// What the host hands over once its configuration is final.
pub struct ResolvedConfig {
    pub sink: Arc<dyn LogSink>,
    pub mode: Mode,
}

/// Errors that abort a build session.
#[derive(Debug)]
pub enum PluginError {
    /// The watch process could not be launched.
    Launch(SupervisorError),
    /// The one-shot build could not be run at all.
    Build {
        program: String,
        source: std::io::Error,
    },
    /// The one-shot build ran and failed.
    BuildFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    /// The watch process failed after it had been launched.
    Session(Failure),
}

impl std::fmt::Display for PluginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginError::Launch(e) => write!(f, "failed to start watch mode: {}", e),
            PluginError::Build { program, source } => {
                write!(f, "failed to run {}: {}", program, source)
            }
            PluginError::BuildFailed {
                program,
                code,
                stderr,
            } => {
                match code {
                    Some(code) => write!(f, "{} exited with code {}", program, code)?,
                    None => write!(f, "{} was killed by a signal", program)?,
                }
                if !stderr.is_empty() {
                    write!(f, ": {}", stderr)?;
                }
                Ok(())
            }
            PluginError::Session(failure) => write!(f, "watch session failed: {}", failure),
        }
    }
}

impl std::error::Error for PluginError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PluginError::Launch(e) => Some(e),
            PluginError::Build { source, .. } => Some(source),
            PluginError::BuildFailed { .. } => None,
            PluginError::Session(failure) => Some(failure),
        }
    }
}

pub struct BuildHooks {
    watch_command: CompilerCommand,
    build_command: CompilerCommand,
    exclusion: String,
    sink: Arc<dyn LogSink>,
    mode: Mode,
    supervisor: Option<ProcessSupervisor>,
}

impl BuildHooks {
    /// Hooks that log through `tracing` and default to one-shot mode until
    /// the host resolves its configuration.
    pub fn new(
        watch_command: CompilerCommand,
        build_command: CompilerCommand,
        exclusion: impl Into<String>,
    ) -> Self {
        Self {
            watch_command,
            build_command,
            exclusion: exclusion.into(),
            sink: Arc::new(TracingSink),
            mode: Mode::default(),
            supervisor: None,
        }
    }

    pub fn from_config(config: &PluginConfig) -> Self {
        let tool = config.compiler.tool;
        let program = config.compiler.command.as_deref();
        Self::new(
            tool.watch_command(program),
            tool.build_command(program),
            config.watch.ignore.clone(),
        )
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Keep the host's own file watcher away from files the compiler watches.
    pub fn on_configure(&self, host: &mut HostConfig) {
        host.add_watch_exclusion(&self.exclusion);
        tracing::debug!(ignored = ?host.watch_exclusions(), "host watch exclusions");
    }

    /// Capture the host's sink and mode for the rest of the session.
    ///
    /// A supervisor left over from an earlier resolution is terminated first.
    pub async fn on_config_resolved(&mut self, resolved: ResolvedConfig) {
        if let Some(previous) = self.supervisor.take() {
            previous.terminate().await;
        }
        self.sink = resolved.sink;
        self.mode = resolved.mode;
        tracing::debug!(mode = ?self.mode, "configuration resolved");
    }

    pub async fn on_build_start(&mut self) -> Result<(), PluginError> {
        match self.mode {
            Mode::OneShot => {
                let output = run_build(&self.build_command).await?;
                if !output.is_empty() {
                    self.sink.info(&output);
                }
                Ok(())
            }
            Mode::Watch => {
                let supervisor = self.supervisor.get_or_insert_with(|| {
                    ProcessSupervisor::new(self.watch_command.clone(), self.sink.clone())
                });
                // A rebuild without a matching build end must not leave the old watcher behind.
                supervisor.terminate().await;
                let pid = supervisor
                    .launch(Attempt::First)
                    .await
                    .map_err(PluginError::Launch)?;
                tracing::debug!(pid, spawned = supervisor.spawn_count(), "watch session started");
                Ok(())
            }
        }
    }

    pub async fn on_build_end(&mut self) {
        if let Some(supervisor) = &self.supervisor {
            supervisor.terminate().await;
        }
    }

    /// Wait until the watch process is gone for good.
    ///
    /// Returns at once when no watch session was started. A failure after
    /// launch, such as a second conflict, comes back as [`PluginError::Session`].
    pub async fn watcher_stopped(&self) -> Result<(), PluginError> {
        let Some(mut phase) = self.subscribe() else {
            return Ok(());
        };
        let settled = match phase.wait_for(Phase::is_settled).await {
            Ok(settled) => settled.clone(),
            Err(_) => return Ok(()),
        };
        match settled {
            Phase::Failed(failure) => Err(PluginError::Session(failure)),
            phase => {
                tracing::info!(?phase, "watcher stopped");
                Ok(())
            }
        }
    }

    /// Phase updates for the current watch session, if one was started.
    pub fn subscribe(&self) -> Option<watch::Receiver<Phase>> {
        self.supervisor.as_ref().map(ProcessSupervisor::subscribe)
    }
}

/// Run the compiler once and return its trimmed stdout.
async fn run_build(command: &CompilerCommand) -> Result<String, PluginError> {
    tracing::info!(command = %command.display(), "running one-shot build");
    let output = command
        .to_command()
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| PluginError::Build {
            program: command.program.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(PluginError::BuildFailed {
            program: command.program.clone(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
