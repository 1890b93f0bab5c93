/// Conflict detection: spot the diagnostic a watch-mode compiler prints when a
/// previous instance still holds its lock, and pull out that instance's PID.
///
/// The diagnostic looks like `Rewatch is already running with PID 4821`. The
/// error stream is not line-buffered, so the phrase may sit anywhere inside a
/// larger chunk.
use regex::Regex;
use std::sync::LazyLock;

static ALREADY_RUNNING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"already running with PID (\d+)").unwrap());

/// Return the stale PID named in `chunk`, if any.
///
/// A PID of zero, or one too large for the platform's `pid_t`, is no match.
pub fn detect(chunk: &str) -> Option<i32> {
    let caps = ALREADY_RUNNING.captures(chunk)?;
    let pid: i32 = caps[1].parse().ok()?;
    if pid <= 0 {
        return None;
    }
    tracing::debug!(pid, "conflict pattern matched");
    Some(pid)
}
