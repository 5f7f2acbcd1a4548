//! Configuration for script execution including engine security limits and
//! runtime bounds.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Configuration for sandboxed script execution.
#[derive(Debug, Deserialize, Clone)]
pub struct ScriptConfig {
    /// Maximum number of operations a script can perform. `0` disables the
    /// cap; the invocation timeout is the primary execution bound.
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,

    /// Maximum function call nesting depth.
    #[serde(default = "default_max_call_levels")]
    pub max_call_levels: usize,

    /// Maximum size of strings in characters.
    #[serde(default = "default_max_string_size")]
    pub max_string_size: usize,

    /// Maximum number of array elements.
    #[serde(default = "default_max_array_size")]
    pub max_array_size: usize,

    /// Maximum wall-clock time per invocation. When it elapses the execution
    /// unit is destroyed with no graceful shutdown signal to the script.
    #[serde(
        default = "default_execution_timeout",
        deserialize_with = "deserialize_duration_from_millis"
    )]
    pub execution_timeout: Duration,

    /// Serialized-size ceiling per storage value. Writes above the ceiling
    /// still apply inside the sandbox but are never mirrored to the host
    /// cache.
    #[serde(default = "default_storage_value_ceiling")]
    pub storage_value_ceiling: usize,

    /// Connect timeout for HTTP bridge calls issued by scripts.
    #[serde(
        default = "default_bridge_connect_timeout",
        deserialize_with = "deserialize_duration_from_millis"
    )]
    pub bridge_connect_timeout: Duration,

    /// Total per-request timeout for HTTP bridge calls issued by scripts.
    #[serde(
        default = "default_bridge_request_timeout",
        deserialize_with = "deserialize_duration_from_millis"
    )]
    pub bridge_request_timeout: Duration,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            max_operations: default_max_operations(),
            max_call_levels: default_max_call_levels(),
            max_string_size: default_max_string_size(),
            max_array_size: default_max_array_size(),
            execution_timeout: default_execution_timeout(),
            storage_value_ceiling: default_storage_value_ceiling(),
            bridge_connect_timeout: default_bridge_connect_timeout(),
            bridge_request_timeout: default_bridge_request_timeout(),
        }
    }
}

fn default_max_operations() -> u64 {
    0
}

fn default_max_call_levels() -> usize {
    32
}

fn default_max_string_size() -> usize {
    1_048_576
}

fn default_max_array_size() -> usize {
    10_000
}

fn default_execution_timeout() -> Duration {
    Duration::from_millis(10_000)
}

fn default_storage_value_ceiling() -> usize {
    100 * 1024
}

fn default_bridge_connect_timeout() -> Duration {
    Duration::from_millis(10_000)
}

fn default_bridge_request_timeout() -> Duration {
    Duration::from_millis(10_000)
}

/// Custom deserializer for Duration from milliseconds.
fn deserialize_duration_from_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::Config;

    #[test]
    fn test_script_config_default() {
        let config = ScriptConfig::default();
        assert_eq!(config.max_operations, 0);
        assert_eq!(config.max_call_levels, 32);
        assert_eq!(config.max_string_size, 1_048_576);
        assert_eq!(config.max_array_size, 10_000);
        assert_eq!(config.execution_timeout, Duration::from_millis(10_000));
        assert_eq!(config.storage_value_ceiling, 102_400);
        assert_eq!(config.bridge_connect_timeout, Duration::from_millis(10_000));
        assert_eq!(config.bridge_request_timeout, Duration::from_millis(10_000));
    }

    #[test]
    fn test_script_config_custom_values_yaml() {
        let yaml = "
            max_operations: 50000
            max_call_levels: 5
            max_string_size: 4096
            max_array_size: 500
            execution_timeout: 3000
            storage_value_ceiling: 1024
            bridge_connect_timeout: 2000
            bridge_request_timeout: 4000
        ";

        let builder =
            Config::builder().add_source(config::File::from_str(yaml, config::FileFormat::Yaml));
        let config: ScriptConfig = builder.build().unwrap().try_deserialize().unwrap();

        assert_eq!(config.max_operations, 50_000);
        assert_eq!(config.max_call_levels, 5);
        assert_eq!(config.max_string_size, 4_096);
        assert_eq!(config.max_array_size, 500);
        assert_eq!(config.execution_timeout, Duration::from_millis(3_000));
        assert_eq!(config.storage_value_ceiling, 1_024);
        assert_eq!(config.bridge_connect_timeout, Duration::from_millis(2_000));
        assert_eq!(config.bridge_request_timeout, Duration::from_millis(4_000));
    }

    #[test]
    fn test_script_config_partial_yaml_uses_defaults() {
        let yaml = "
            execution_timeout: 7500
        ";

        let builder =
            Config::builder().add_source(config::File::from_str(yaml, config::FileFormat::Yaml));
        let config: ScriptConfig = builder.build().unwrap().try_deserialize().unwrap();

        assert_eq!(config.execution_timeout, Duration::from_millis(7_500));
        assert_eq!(config.max_call_levels, 32);
        assert_eq!(config.storage_value_ceiling, 102_400);
    }
}
