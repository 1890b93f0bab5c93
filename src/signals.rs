/// Shutdown signals for the CLI host.
///
/// SIGINT (Ctrl-C) and SIGTERM both end the build session; the watch
/// process is then killed through the normal build-end hook.
use tokio::signal::unix::{signal, SignalKind};

/// Resolve once SIGINT or SIGTERM arrives. Returns the signal's name.
pub async fn shutdown_requested() -> std::io::Result<&'static str> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => Ok("SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}
