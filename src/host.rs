use serde::Deserialize;

/// The slice of the host's dev-server configuration the plugin touches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub server: Option<ServerOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    pub watch: Option<WatchOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WatchOptions {
    pub ignored: Option<Vec<String>>,
}

impl HostConfig {
    /// Append `pattern` to `server.watch.ignored`, creating the intermediate
    /// tables as needed. Existing entries are kept; a pattern already present
    /// is not added twice.
    pub fn add_watch_exclusion(&mut self, pattern: &str) {
        let ignored = self
            .server
            .get_or_insert_with(ServerOptions::default)
            .watch
            .get_or_insert_with(WatchOptions::default)
            .ignored
            .get_or_insert_with(Vec::new);

        if !ignored.iter().any(|p| p == pattern) {
            ignored.push(pattern.to_string());
        }
    }

    /// Current exclusion list, empty if none is configured.
    pub fn watch_exclusions(&self) -> &[String] {
        self.server
            .as_ref()
            .and_then(|s| s.watch.as_ref())
            .and_then(|w| w.ignored.as_deref())
            .unwrap_or(&[])
    }
}
