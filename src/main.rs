mod compiler;
mod config;
mod conflict;
mod hooks;
mod host;
mod relay;
mod signals;
mod sink;
mod supervisor;

use clap::Parser;
use compiler::Compiler;
use config::PluginConfig;
use hooks::{BuildHooks, Mode, PluginError, ResolvedConfig};
use sink::TracingSink;
use std::path::PathBuf;
use std::sync::Arc;

/// Run the ReScript compiler for one build session: a single build, or a
/// supervised watch process that is killed when the session ends.
#[derive(Parser, Debug)]
#[command(name = "rescript-watch", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "rescript-watch.toml")]
    config: PathBuf,

    /// Build once and exit instead of watching
    #[arg(long)]
    build: bool,

    /// Use rewatch regardless of the configured tool
    #[arg(long)]
    rewatch: bool,

    /// Print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (spawn details, phase transitions)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match PluginConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("rescript-watch: {e}");
            std::process::exit(2);
        }
    };
    if cli.rewatch {
        config.compiler.tool = Compiler::Rewatch;
    }

    let level = if cli.verbose { "debug" } else { config.log.level.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    if let Err(e) = run(&cli, &config).await {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

async fn run(cli: &Cli, config: &PluginConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mode = if cli.build { Mode::OneShot } else { Mode::Watch };
    let mut hooks = BuildHooks::from_config(config);

    let mut host = config.host_config();
    hooks.on_configure(&mut host);

    if cli.dry_run {
        let tool = config.compiler.tool;
        let program = config.compiler.command.as_deref();
        let command = match mode {
            Mode::Watch => tool.watch_command(program),
            Mode::OneShot => tool.build_command(program),
        };
        println!("rescript-watch v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file: {}", cli.config.display());
        println!("Mode:        {:?}", mode);
        println!("Command:     {}", command.display());
        let conflicts = if command.detect_conflicts {
            "recover once"
        } else {
            "not detected"
        };
        println!("Conflicts:   {}", conflicts);
        println!("Ignored:     {}", host.watch_exclusions().join(", "));
        return Ok(());
    }

    hooks
        .on_config_resolved(ResolvedConfig {
            sink: Arc::new(TracingSink),
            mode,
        })
        .await;
    hooks.on_build_start().await?;

    if hooks.mode() == Mode::Watch {
        let outcome = wait_for_session_end(&hooks).await;
        hooks.on_build_end().await;
        outcome?;
    }
    Ok(())
}

/// Block until the user stops the session or the watcher is gone for good.
async fn wait_for_session_end(hooks: &BuildHooks) -> Result<(), PluginError> {
    tokio::select! {
        signal = signals::shutdown_requested() => {
            match signal {
                Ok(name) => tracing::info!("received {name}, stopping watcher"),
                Err(e) => tracing::warn!(error = %e, "no signal handlers, stopping watcher"),
            }
            Ok(())
        }
        stopped = hooks.watcher_stopped() => stopped,
    }
}
