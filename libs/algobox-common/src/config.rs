use std::env;
use std::time::Duration;

const DEFAULT_IO_IMAGE: &str = "alpine:3.8";
const DEFAULT_MEMORY_LIMIT: i64 = 4 * 1024 * 1024 * 1024;

/// Memory, CPU and network limits applied to every container of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceEnvelope {
    pub memory_bytes: i64,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub network_disabled: bool,
}

impl Default for ResourceEnvelope {
    fn default() -> Self {
        Self {
            memory_bytes: DEFAULT_MEMORY_LIMIT,
            cpu_quota: 100_000,
            cpu_period: 100_000,
            network_disabled: true,
        }
    }
}

/// Retry schedule for prune calls
/// After failed attempt n (1-based) the delay is `base_delay * 2^(n-1)` plus up
/// to `max_jitter`, so the first retry waits `base_delay`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_jitter: Duration::from_secs(1),
        }
    }
}

/// Executor configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub io_image: String,
    /// `None` means the runtime's local defaults
    pub docker_host: Option<String>,
    pub resources: ResourceEnvelope,
    /// Wall-clock limit for the algorithm container, off unless configured
    pub run_timeout: Option<Duration>,
    pub prune_retry: RetryPolicy,
}

impl ExecutorConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build from any variable lookup; unparsable values fall back to defaults
    pub fn from_vars<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ResourceEnvelope::default();
        let retry = RetryPolicy::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            io_image: lookup("ALGOBOX_IO_IMAGE")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_IO_IMAGE.to_string()),
            docker_host: lookup("ALGOBOX_DOCKER_HOST")
                .or_else(|| lookup("DOCKER_HOST"))
                .filter(|v| !v.trim().is_empty()),
            resources: ResourceEnvelope {
                memory_bytes: lookup("ALGOBOX_MEMORY_LIMIT")
                    .and_then(|v| parse_memory_limit(&v))
                    .unwrap_or(defaults.memory_bytes),
                cpu_quota: lookup("ALGOBOX_CPU_QUOTA")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(defaults.cpu_quota),
                cpu_period: lookup("ALGOBOX_CPU_PERIOD")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(defaults.cpu_period),
                network_disabled: true,
            },
            run_timeout: parsed("ALGOBOX_RUN_TIMEOUT_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            prune_retry: RetryPolicy {
                max_attempts: parsed("ALGOBOX_PRUNE_ATTEMPTS")
                    .filter(|n| *n > 0)
                    .and_then(|n| u32::try_from(n).ok())
                    .unwrap_or(retry.max_attempts),
                base_delay: parsed("ALGOBOX_PRUNE_BASE_DELAY_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(retry.base_delay),
                max_jitter: parsed("ALGOBOX_PRUNE_JITTER_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(retry.max_jitter),
            },
        }
    }

    pub fn new() -> Self {
        Self::from_env()
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from_vars(|_| None)
    }
}

/// Parse a memory limit such as `4g`, `512m`, `64k` or a plain byte count
pub fn parse_memory_limit(value: &str) -> Option<i64> {
    let value = value.trim().to_ascii_lowercase();
    let value = value.strip_suffix('b').unwrap_or(&value);
    let (digits, multiplier) = match value.chars().last()? {
        'k' => (&value[..value.len() - 1], 1024),
        'm' => (&value[..value.len() - 1], 1024 * 1024),
        'g' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    let amount: i64 = digits.trim().parse().ok()?;
    if amount <= 0 {
        return None;
    }
    amount.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(vars: &[(&str, &str)]) -> ExecutorConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ExecutorConfig::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_config_defaults() {
        let config = ExecutorConfig::default();
        assert_eq!(config.io_image, "alpine:3.8");
        assert_eq!(config.docker_host, None);
        assert_eq!(config.resources.memory_bytes, 4 * 1024 * 1024 * 1024);
        assert_eq!(config.resources.cpu_quota, 100_000);
        assert_eq!(config.resources.cpu_period, 100_000);
        assert!(config.resources.network_disabled);
        assert_eq!(config.run_timeout, None);
        assert_eq!(config.prune_retry.max_attempts, 3);
        assert_eq!(config.prune_retry.base_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_config_overrides() {
        let config = config_with(&[
            ("ALGOBOX_IO_IMAGE", "busybox:1.36"),
            ("ALGOBOX_DOCKER_HOST", "tcp://10.0.0.5:2375"),
            ("ALGOBOX_MEMORY_LIMIT", "512m"),
            ("ALGOBOX_CPU_QUOTA", "50000"),
            ("ALGOBOX_RUN_TIMEOUT_SECS", "600"),
            ("ALGOBOX_PRUNE_ATTEMPTS", "5"),
            ("ALGOBOX_PRUNE_BASE_DELAY_MS", "10"),
        ]);
        assert_eq!(config.io_image, "busybox:1.36");
        assert_eq!(config.docker_host.as_deref(), Some("tcp://10.0.0.5:2375"));
        assert_eq!(config.resources.memory_bytes, 512 * 1024 * 1024);
        assert_eq!(config.resources.cpu_quota, 50_000);
        assert_eq!(config.resources.cpu_period, 100_000);
        assert_eq!(config.run_timeout, Some(Duration::from_secs(600)));
        assert_eq!(config.prune_retry.max_attempts, 5);
        assert_eq!(config.prune_retry.base_delay, Duration::from_millis(10));
    }

    #[test]
    fn test_docker_host_falls_back_to_standard_variable() {
        let config = config_with(&[("DOCKER_HOST", "unix:///run/user/1000/docker.sock")]);
        assert_eq!(
            config.docker_host.as_deref(),
            Some("unix:///run/user/1000/docker.sock")
        );
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = config_with(&[
            ("ALGOBOX_MEMORY_LIMIT", "lots"),
            ("ALGOBOX_CPU_QUOTA", "-"),
            ("ALGOBOX_RUN_TIMEOUT_SECS", "0"),
            ("ALGOBOX_PRUNE_ATTEMPTS", "0"),
        ]);
        assert_eq!(config.resources.memory_bytes, 4 * 1024 * 1024 * 1024);
        assert_eq!(config.resources.cpu_quota, 100_000);
        assert_eq!(config.run_timeout, None);
        assert_eq!(config.prune_retry.max_attempts, 3);
    }

    #[test]
    fn test_prune_attempts_out_of_range_fall_back() {
        let config = config_with(&[("ALGOBOX_PRUNE_ATTEMPTS", "4294967296")]);
        assert_eq!(config.prune_retry.max_attempts, 3);

        let config = config_with(&[("ALGOBOX_PRUNE_ATTEMPTS", "4294967295")]);
        assert_eq!(config.prune_retry.max_attempts, u32::MAX);
    }

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("4g"), Some(4 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory_limit("4G"), Some(4 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory_limit("256mb"), Some(256 * 1024 * 1024));
        assert_eq!(parse_memory_limit("64k"), Some(64 * 1024));
        assert_eq!(parse_memory_limit("1048576"), Some(1_048_576));
        assert_eq!(parse_memory_limit(""), None);
        assert_eq!(parse_memory_limit("0"), None);
        assert_eq!(parse_memory_limit("g"), None);
    }
}
