use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TelemetryConfig {
    /// Store slot holding the offline queue.
    pub storage_key: String,
    pub max_queue_size: usize,
    pub flush_batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_retries: u32,
    /// Store slot holding events already delivered, kept for reports and velocity checks.
    pub history_key: String,
    pub max_history_size: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            storage_key: "telemetry.queue".to_string(),
            max_queue_size: 5000,
            flush_batch_size: 100,
            flush_interval_ms: 30_000,
            max_retries: 5,
            history_key: "telemetry.history".to_string(),
            max_history_size: 5000,
        }
    }
}

impl TelemetryConfig {
    /// Defaults overlaid with `PULSE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(key) = env::var("PULSE_STORAGE_KEY") {
            if !key.trim().is_empty() {
                config.storage_key = key;
            }
        }
        overlay("PULSE_MAX_QUEUE_SIZE", &mut config.max_queue_size);
        overlay("PULSE_FLUSH_BATCH_SIZE", &mut config.flush_batch_size);
        overlay("PULSE_FLUSH_INTERVAL_MS", &mut config.flush_interval_ms);
        overlay("PULSE_MAX_RETRIES", &mut config.max_retries);
        overlay("PULSE_MAX_HISTORY_SIZE", &mut config.max_history_size);
        config
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    pub telemetry: TelemetryConfig,
    /// Directory for the durable store. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Collector endpoint. `None` logs batches instead of sending them.
    pub endpoint: Option<String>,
    /// Denominator for adoption rates.
    pub eligible_users: u64,
    /// Per-service attribution weights.
    pub service_weights: BTreeMap<u32, f64>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let mut config = Self {
            telemetry: TelemetryConfig::from_env(),
            ..Self::default()
        };
        config.data_dir = env::var_os("PULSE_DATA_DIR").map(PathBuf::from);
        config.endpoint = env::var("PULSE_ENDPOINT").ok().filter(|e| !e.trim().is_empty());
        overlay("PULSE_ELIGIBLE_USERS", &mut config.eligible_users);
        config
    }
}

fn overlay<T: FromStr>(var: &str, target: &mut T) {
    let Ok(raw) = env::var(var) else { return };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => warn!(var, value = %raw, "ignoring unparseable configuration value"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults_for_missing_fields() {
        let config: TelemetryConfig = serde_json::from_str(r#"{"maxRetries": 2, "storageKey": "kiosk.queue"}"#).unwrap();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.storage_key, "kiosk.queue");
        assert_eq!(config.max_queue_size, 5000);
        assert_eq!(config.flush_batch_size, 100);
        assert_eq!(config.flush_interval_ms, 30_000);
        assert_eq!(config.history_key, "telemetry.history");
    }

    #[test]
    fn app_config_parses_service_weights() {
        let config: AppConfig = serde_json::from_str(r#"{"serviceWeights": {"12": 0.3}, "eligibleUsers": 400}"#).unwrap();
        assert_eq!(config.service_weights.get(&12), Some(&0.3));
        assert_eq!(config.eligible_users, 400);
        assert_eq!(config.telemetry, TelemetryConfig::default());
    }
}
