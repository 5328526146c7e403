//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Supervisor and worker pool configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Maximum number of concurrently active workers.
    pub max_workers: usize,
    /// Maximum number of tasks waiting in the queue.
    pub queue_capacity: usize,
    /// A worker silent for longer than this is timed out.
    pub worker_timeout: Duration,
    /// How often workers send heartbeats. Must be shorter than `worker_timeout`.
    pub heartbeat_interval: Duration,
    /// Scheduling tick (timeout checks, backoff promotion, spawning).
    pub tick_interval: Duration,
    /// Retries allowed per task after the first attempt.
    pub max_retries: u32,
    /// Base delay before a retried task becomes eligible again (doubles per retry).
    pub retry_backoff: Duration,
    /// Upper bound for the retry delay.
    pub retry_backoff_max: Duration,
    /// How long `cleanup()` and cancellations wait before force-killing workers.
    pub shutdown_grace: Duration,
    /// Memory arena size per worker, in bytes.
    pub worker_memory_bytes: usize,
    /// Wall-clock budget per worker run.
    pub worker_max_runtime: Duration,
    /// Default token budget of the context snapshot handed to a worker.
    pub worker_context_tokens: usize,
    /// Contexts kept in memory at once; the rest are read from the store.
    pub max_resident_contexts: usize,
    /// Context tier budgets.
    pub context: ContextBudgets,
    /// Limits for the bounded stream reader.
    pub stream: StreamLimits,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            queue_capacity: 1024,
            worker_timeout: Duration::from_millis(600_000), // 10 minutes
            heartbeat_interval: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            retry_backoff_max: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            worker_memory_bytes: 256 * 1024 * 1024,
            worker_max_runtime: Duration::from_secs(30 * 60),
            worker_context_tokens: 32_000,
            max_resident_contexts: 64,
            context: ContextBudgets::default(),
            stream: StreamLimits::default(),
        }
    }
}

impl SupervisorConfig {
    /// Build a config from `SHIFTWORK_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            max_workers: env_or("SHIFTWORK_MAX_WORKERS", d.max_workers)?,
            queue_capacity: env_or("SHIFTWORK_QUEUE_CAPACITY", d.queue_capacity)?,
            worker_timeout: env_ms_or("SHIFTWORK_WORKER_TIMEOUT_MS", d.worker_timeout)?,
            heartbeat_interval: env_ms_or("SHIFTWORK_HEARTBEAT_MS", d.heartbeat_interval)?,
            tick_interval: env_ms_or("SHIFTWORK_TICK_MS", d.tick_interval)?,
            max_retries: env_or("SHIFTWORK_MAX_RETRIES", d.max_retries)?,
            retry_backoff: env_ms_or("SHIFTWORK_RETRY_BACKOFF_MS", d.retry_backoff)?,
            retry_backoff_max: env_ms_or("SHIFTWORK_RETRY_BACKOFF_MAX_MS", d.retry_backoff_max)?,
            shutdown_grace: env_ms_or("SHIFTWORK_SHUTDOWN_GRACE_MS", d.shutdown_grace)?,
            worker_memory_bytes: env_or("SHIFTWORK_WORKER_MEMORY_BYTES", d.worker_memory_bytes)?,
            worker_max_runtime: env_ms_or("SHIFTWORK_WORKER_MAX_RUNTIME_MS", d.worker_max_runtime)?,
            worker_context_tokens: env_or("SHIFTWORK_WORKER_CONTEXT_TOKENS", d.worker_context_tokens)?,
            max_resident_contexts: env_or(
                "SHIFTWORK_MAX_RESIDENT_CONTEXTS",
                d.max_resident_contexts,
            )?,
            context: ContextBudgets {
                head: env_or("SHIFTWORK_CONTEXT_HEAD_TOKENS", d.context.head)?,
                recent: env_or("SHIFTWORK_CONTEXT_RECENT_TOKENS", d.context.recent)?,
                mid: env_or("SHIFTWORK_CONTEXT_MID_TOKENS", d.context.mid)?,
                long: env_or("SHIFTWORK_CONTEXT_LONG_TOKENS", d.context.long)?,
                ..d.context
            },
            stream: StreamLimits {
                max_lines: env_or("SHIFTWORK_STREAM_MAX_LINES", d.stream.max_lines)?,
                max_line_chars: env_or("SHIFTWORK_STREAM_MAX_LINE_CHARS", d.stream.max_line_chars)?,
                chunk_bytes: env_or("SHIFTWORK_STREAM_CHUNK_BYTES", d.stream.chunk_bytes)?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the supervisor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(invalid("max_workers", "must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "must be at least 1"));
        }
        if self.heartbeat_interval >= self.worker_timeout {
            return Err(invalid(
                "heartbeat_interval",
                format!(
                    "{:?} must be shorter than worker_timeout {:?}",
                    self.heartbeat_interval, self.worker_timeout
                ),
            ));
        }
        if self.max_resident_contexts == 0 {
            return Err(invalid("max_resident_contexts", "must be at least 1"));
        }
        if self.retry_backoff_max < self.retry_backoff {
            return Err(invalid(
                "retry_backoff_max",
                format!(
                    "{:?} must not be shorter than retry_backoff {:?}",
                    self.retry_backoff_max, self.retry_backoff
                ),
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(invalid("tick_interval", "must be non-zero"));
        }
        self.context.validate()?;
        self.stream.validate()?;
        Ok(())
    }
}

/// Token budgets for the four context tiers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextBudgets {
    /// Token budget for pinned head segments.
    pub head: usize,
    /// Token budget for the newest, uncompacted segments.
    pub recent: usize,
    /// Token budget for first-level summaries.
    pub mid: usize,
    /// Token budget for summaries of summaries.
    pub long: usize,
    /// Fraction of the combined budget at which compaction kicks in.
    pub compaction_threshold: f64,
    /// Compaction drains a tier down to this fraction of its budget.
    pub low_watermark: f64,
}

impl Default for ContextBudgets {
    fn default() -> Self {
        Self {
            head: 10_000,
            recent: 40_000,
            mid: 20_000,
            long: 10_000,
            compaction_threshold: 0.90,
            low_watermark: 0.75,
        }
    }
}

impl ContextBudgets {
    /// Combined budget across all tiers.
    pub fn total(&self) -> usize {
        self.head + self.recent + self.mid + self.long
    }

    /// Total usage above which compaction runs.
    pub fn compaction_trigger(&self) -> usize {
        (self.total() as f64 * self.compaction_threshold) as usize
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.recent == 0 || self.mid == 0 || self.long == 0 {
            return Err(invalid(
                "context budgets",
                "recent, mid and long budgets must be non-zero",
            ));
        }
        if !(0.0..=1.0).contains(&self.compaction_threshold) || self.compaction_threshold == 0.0 {
            return Err(invalid("compaction_threshold", "must be in (0, 1]"));
        }
        if !(0.0..1.0).contains(&self.low_watermark) {
            return Err(invalid("low_watermark", "must be in [0, 1)"));
        }
        Ok(())
    }
}

/// Caps enforced by the bounded stream reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLimits {
    /// Lines yielded before the reader stops and marks the result partial.
    pub max_lines: usize,
    /// Characters kept per line; the rest is dropped and flagged truncated.
    pub max_line_chars: usize,
    /// Size of each read from the underlying file.
    pub chunk_bytes: usize,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            max_lines: 2_000,
            max_line_chars: 2_000,
            chunk_bytes: 64 * 1024,
        }
    }
}

impl StreamLimits {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_bytes == 0 {
            return Err(invalid("chunk_bytes", "must be non-zero"));
        }
        if self.max_line_chars == 0 {
            return Err(invalid("max_line_chars", "must be non-zero"));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| invalid(key, e.to_string())),
        Err(_) => Ok(default),
    }
}

fn env_ms_or(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let ms = env_or(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SupervisorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_timeout, Duration::from_millis(600_000));
        assert_eq!(config.context.total(), 80_000);
        assert_eq!(config.context.compaction_trigger(), 72_000);
        assert_eq!(config.stream.chunk_bytes, 65_536);
    }

    #[test]
    fn zero_workers_rejected() {
        let config = SupervisorConfig {
            max_workers: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "max_workers"
        ));
    }

    #[test]
    fn heartbeat_must_be_shorter_than_timeout() {
        let config = SupervisorConfig {
            heartbeat_interval: Duration::from_secs(600),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_chunk_rejected() {
        let limits = StreamLimits {
            chunk_bytes: 0,
            ..Default::default()
        };
        assert!(limits.validate().is_err());
    }

    #[test]
    fn env_parse_error_names_key() {
        let err = env_or::<usize>("PATH", 1).unwrap_err();
        assert!(err.to_string().contains("PATH"));
    }

    #[test]
    fn backoff_max_read_from_env() {
        // SAFETY: no other test reads this variable.
        unsafe { std::env::set_var("SHIFTWORK_RETRY_BACKOFF_MAX_MS", "2500") };
        let config = SupervisorConfig::from_env();
        unsafe { std::env::remove_var("SHIFTWORK_RETRY_BACKOFF_MAX_MS") };
        assert_eq!(config.unwrap().retry_backoff_max, Duration::from_millis(2_500));
    }

    #[test]
    fn backoff_max_below_base_rejected() {
        let config = SupervisorConfig {
            retry_backoff: Duration::from_secs(2),
            retry_backoff_max: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "retry_backoff_max"
        ));
    }

    #[test]
    fn zero_resident_contexts_rejected() {
        let config = SupervisorConfig {
            max_resident_contexts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
