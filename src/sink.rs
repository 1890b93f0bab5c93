/// Host-facing log sink.
///
/// The build host hands the plugin a logger when its configuration resolves.
/// Everything the user should see (spawn notices, relayed compiler output,
/// conflict warnings, exit codes) goes through this trait rather than
/// straight to `tracing`, so a host can route it wherever it likes.
pub trait LogSink: Send + Sync {
    fn info(&self, msg: &str);
    fn warn(&self, msg: &str);
    fn error(&self, msg: &str);
}

/// Default sink: writes through `tracing` under the `rescript` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn info(&self, msg: &str) {
        tracing::info!(target: "rescript", "{msg}");
    }

    fn warn(&self, msg: &str) {
        tracing::warn!(target: "rescript", "{msg}");
    }

    fn error(&self, msg: &str) {
        tracing::error!(target: "rescript", "{msg}");
    }
}
