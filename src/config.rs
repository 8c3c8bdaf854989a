/// Runtime configuration for the orchestrator loop.
///
/// Defaults are compiled in; a [`SettingsStore`] can override them at boot
/// without reflashing. Out-of-range or missing settings keep the default.

/// Read-only key-value settings, backed by whatever persistence the
/// platform has.
pub trait SettingsStore {
    fn get_int(&self, key: &str) -> Option<i32>;
    fn get_bool(&self, key: &str) -> Option<bool>;
}

/// A store with nothing in it. Every lookup falls back to the default.
pub struct NoSettings;

impl SettingsStore for NoSettings {
    fn get_int(&self, _key: &str) -> Option<i32> {
        None
    }

    fn get_bool(&self, _key: &str) -> Option<bool> {
        None
    }
}

/// Setting keys understood by [`Config::from_settings`].
pub mod keys {
    pub const RECEIVE_WAIT_MS: &str = "receive_wait_ms";
    pub const PROGRESS_INTERVAL_MS: &str = "progress_interval_ms";
    pub const STALE_TTL_S: &str = "stale_ttl_s";
    pub const SWEEP_INTERVAL_S: &str = "sweep_interval_s";
    pub const MIN_HEAP_FREE: &str = "min_heap_free";
    pub const ALLOW_DESTRUCTIVE: &str = "allow_destructive";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Bounded wait for one inbound request per loop iteration
    pub receive_wait_ms: u32,
    /// Minimum gap between two `InProgress` events
    pub progress_interval_ms: u64,
    /// Gap between two heap/stack headroom checks
    pub headroom_interval_ms: u64,
    /// Targets unseen for longer than this are swept
    pub stale_ttl_ms: u64,
    /// Gap between two staleness sweeps
    pub sweep_interval_ms: u64,
    /// Warn when free heap drops below this many bytes
    pub min_heap_free: usize,
    /// Warn when the loop's stack headroom drops below this many bytes
    pub min_stack_free: usize,
    /// Consecutive failed radio releases tolerated before giving up
    pub radio_release_retries: u8,
    /// Whether destructive actions may be started at all
    pub allow_destructive: bool,
}

impl Config {
    pub const fn new() -> Self {
        Self {
            receive_wait_ms: 10,
            progress_interval_ms: 500,
            headroom_interval_ms: 30_000,
            stale_ttl_ms: 120_000,
            sweep_interval_ms: 5_000,
            min_heap_free: 8 * 1024,
            min_stack_free: 1024,
            radio_release_retries: 3,
            allow_destructive: true,
        }
    }

    pub fn from_settings(store: &dyn SettingsStore) -> Self {
        let mut config = Self::new();

        if let Some(ms) = positive(store, keys::RECEIVE_WAIT_MS) {
            // Cap the wait well under the watchdog timeout
            config.receive_wait_ms = (ms as u32).min(250);
        }
        if let Some(ms) = positive(store, keys::PROGRESS_INTERVAL_MS) {
            config.progress_interval_ms = ms as u64;
        }
        if let Some(secs) = positive(store, keys::STALE_TTL_S) {
            config.stale_ttl_ms = secs as u64 * 1000;
        }
        if let Some(secs) = positive(store, keys::SWEEP_INTERVAL_S) {
            config.sweep_interval_ms = secs as u64 * 1000;
        }
        if let Some(bytes) = positive(store, keys::MIN_HEAP_FREE) {
            config.min_heap_free = bytes as usize;
        }
        if let Some(allow) = store.get_bool(keys::ALLOW_DESTRUCTIVE) {
            config.allow_destructive = allow;
        }

        config
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn positive(store: &dyn SettingsStore, key: &str) -> Option<i32> {
    match store.get_int(key) {
        Some(v) if v > 0 => Some(v),
        Some(v) => {
            log::warn!("Ignoring setting {}={} (must be positive)", key, v);
            None
        }
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MapStore(&'static [(&'static str, i32)], Option<bool>);

    impl SettingsStore for MapStore {
        fn get_int(&self, key: &str) -> Option<i32> {
            self.0.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
        }

        fn get_bool(&self, key: &str) -> Option<bool> {
            if key == keys::ALLOW_DESTRUCTIVE {
                self.1
            } else {
                None
            }
        }
    }

    #[test]
    fn empty_store_gives_defaults() {
        assert_eq!(Config::from_settings(&NoSettings), Config::new());
    }

    #[test]
    fn settings_override_defaults() {
        let store = MapStore(
            &[(keys::STALE_TTL_S, 30), (keys::PROGRESS_INTERVAL_MS, 250)],
            Some(false),
        );
        let config = Config::from_settings(&store);
        assert_eq!(config.stale_ttl_ms, 30_000);
        assert_eq!(config.progress_interval_ms, 250);
        assert!(!config.allow_destructive);
        assert_eq!(config.sweep_interval_ms, Config::new().sweep_interval_ms);
    }

    #[test]
    fn non_positive_values_are_ignored() {
        let store = MapStore(&[(keys::STALE_TTL_S, 0), (keys::MIN_HEAP_FREE, -5)], None);
        let config = Config::from_settings(&store);
        assert_eq!(config.stale_ttl_ms, Config::new().stale_ttl_ms);
        assert_eq!(config.min_heap_free, Config::new().min_heap_free);
    }

    #[test]
    fn receive_wait_is_capped() {
        let store = MapStore(&[(keys::RECEIVE_WAIT_MS, 10_000)], None);
        assert_eq!(Config::from_settings(&store).receive_wait_ms, 250);
    }
}
