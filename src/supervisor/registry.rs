use super::managed_process::{BotStatus, ManagedProcess};

/// Running bots keyed by script path, iterated in insertion order.
///
/// A handful of bots per daemon is the expected load, so a `Vec` with
/// linear lookup keeps ordering trivial.
#[derive(Default)]
pub struct ProcessRegistry {
    entries: Vec<ManagedProcess>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|p| p.key == key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    pub fn get(&self, key: &str) -> Option<&ManagedProcess> {
        self.entries.iter().find(|p| p.key == key)
    }

    /// Register a process at the end of the start order. The caller stops
    /// any bot already tracked under the same key first; a leftover entry
    /// is dropped from tracking with a warning.
    pub fn insert(&mut self, process: ManagedProcess) {
        if let Some(prev) = self.remove(&process.key) {
            tracing::warn!(
                "Replacing registry entry for '{}' (old pid {}) without a stop",
                prev.key,
                prev.pid
            );
        }
        tracing::info!("Now tracking bot '{}' with pid: {}", process.key, process.pid);
        self.entries.push(process);
    }

    /// Remove a key, keeping the order of the remaining entries.
    pub fn remove(&mut self, key: &str) -> Option<ManagedProcess> {
        let idx = self.position(key)?;
        let process = self.entries.remove(idx);
        tracing::debug!("Stopped tracking bot '{}'", key);
        Some(process)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|p| p.key.clone()).collect()
    }

    pub fn statuses(&self) -> Vec<BotStatus> {
        self.entries.iter().map(ManagedProcess::status).collect()
    }
}
