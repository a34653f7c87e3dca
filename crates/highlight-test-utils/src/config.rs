//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries.

use highlight_config::AppConfig;

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .scan_timeout_ms(50)
///     .resync_on_respawn(false)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn scan_timeout_ms(mut self, ms: u64) -> Self {
        self.config.workers.scan_timeout_ms = ms;
        self
    }

    pub fn validation_timeout_ms(mut self, ms: u64) -> Self {
        self.config.workers.validation_timeout_ms = ms;
        self
    }

    pub fn resync_on_respawn(mut self, enabled: bool) -> Self {
        self.config.workers.resync_on_respawn = enabled;
        self
    }

    pub fn size_limit(mut self, bytes: usize) -> Self {
        self.config.patterns.size_limit = bytes;
        self
    }

    pub fn store_path(mut self, path: &str) -> Self {
        self.config.store.path = path.to_string();
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
