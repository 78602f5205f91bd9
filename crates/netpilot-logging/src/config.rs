use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    /// An `EnvFilter` directive, e.g. `info` or `info,route=debug`.
    pub level: String,
    pub keep_days: u64,
    /// Cap on the total size of the log directory.
    pub max_total_mb: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            keep_days: 14,
            max_total_mb: 200,
        }
    }
}

impl LoggingConfig {
    pub fn max_total_bytes(&self) -> u64 {
        self.max_total_mb.saturating_mul(1024 * 1024)
    }
}
