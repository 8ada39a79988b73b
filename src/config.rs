use crate::error::Error;
use ::config::Config;
use std::time::Duration;

pub(crate) const DEFAULT_POLL_CAPACITY: usize = 256;
pub(crate) const DEFAULT_PREALLOCATION_SIZE: usize = 65536;
pub(crate) const DEFAULT_MIN_BUFFER_SIZE: usize = 1024;
pub(crate) const DEFAULT_SHARED_POOL_CAPACITY: usize = 64;
pub(crate) const DEFAULT_MAX_READ_SIZE: usize = 1024 * 1024;
pub(crate) const DEFAULT_TIMEOUT_CHECK_PERIOD: Duration = Duration::from_millis(1000);

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, ::config::ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, ::config::ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, ::config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_u64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u64, ::config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key))
}

pub(crate) fn get_namespaced_string(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<String, ::config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_string)
}

// Missing keys fall back to the default, present but malformed keys are
// reported.
pub(crate) fn optional<T>(result: Result<T, ::config::ConfigError>) -> Result<Option<T>, Error> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(::config::ConfigError::NotFound(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Resolved engine settings for one [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of the mio event buffer per poll.
    pub poll_capacity: usize,
    /// Size of freshly allocated pool buffers.
    pub preallocation_size: usize,
    /// Smallest buffer remainder worth recycling.
    pub min_buffer_size: usize,
    /// Maximum number of free buffers kept by the shared pool.
    pub shared_pool_capacity: usize,
    /// Upper bound for a single delimited or length-prefixed record.
    pub max_read_size: usize,
    /// Close connections that received nothing for this long.
    pub idle_timeout: Option<Duration>,
    /// Close connections that have been open for this long.
    pub connection_timeout: Option<Duration>,
    /// Period of the timeout sweep.
    pub timeout_check_period: Duration,
    /// Maximum number of registered connections.
    pub max_connections: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_capacity: DEFAULT_POLL_CAPACITY,
            preallocation_size: DEFAULT_PREALLOCATION_SIZE,
            min_buffer_size: DEFAULT_MIN_BUFFER_SIZE,
            shared_pool_capacity: DEFAULT_SHARED_POOL_CAPACITY,
            max_read_size: DEFAULT_MAX_READ_SIZE,
            idle_timeout: None,
            connection_timeout: None,
            timeout_check_period: DEFAULT_TIMEOUT_CHECK_PERIOD,
            max_connections: None,
        }
    }
}

impl EngineConfig {
    /// Reads the engine settings, looking up `name.key` before `key`.
    pub fn from_config(config: &Config, name: &str) -> Result<Self, Error> {
        let defaults = Self::default();

        let poll_capacity = optional(get_namespaced_usize(config, name, "poll_capacity"))?
            .unwrap_or(defaults.poll_capacity);
        let preallocation_size =
            optional(get_namespaced_usize(config, name, "preallocation_size"))?
                .unwrap_or(defaults.preallocation_size);
        let min_buffer_size = optional(get_namespaced_usize(config, name, "min_buffer_size"))?
            .unwrap_or(defaults.min_buffer_size);
        let shared_pool_capacity =
            optional(get_namespaced_usize(config, name, "shared_pool_capacity"))?
                .unwrap_or(defaults.shared_pool_capacity);
        let max_read_size = optional(get_namespaced_usize(config, name, "max_read_size"))?
            .unwrap_or(defaults.max_read_size);
        let idle_timeout = optional(get_namespaced_u64(config, name, "idle_timeout_ms"))?
            .map(Duration::from_millis);
        let connection_timeout =
            optional(get_namespaced_u64(config, name, "connection_timeout_ms"))?
                .map(Duration::from_millis);
        let timeout_check_period =
            optional(get_namespaced_u64(config, name, "timeout_check_period_ms"))?
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout_check_period);
        let max_connections = optional(get_namespaced_usize(config, name, "max_connections"))?;

        if preallocation_size == 0 {
            return Err(Error::InvalidConfig {
                key: "preallocation_size".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if min_buffer_size > preallocation_size {
            return Err(Error::InvalidConfig {
                key: "min_buffer_size".to_string(),
                reason: format!("must not exceed preallocation_size ({preallocation_size})"),
            });
        }
        if timeout_check_period.is_zero() {
            return Err(Error::InvalidConfig {
                key: "timeout_check_period_ms".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            poll_capacity,
            preallocation_size,
            min_buffer_size,
            shared_pool_capacity,
            max_read_size,
            idle_timeout,
            connection_timeout,
            timeout_check_period,
            max_connections,
        })
    }
}
