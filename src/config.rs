//! Engine configuration.
//!
//! Read once from environment variables at startup and passed by value to
//! the components that need it. Every knob has a documented default tuned
//! for a single camera feeding a handful of LAN clients.

use std::env;
use std::time::Duration;

use serde::Serialize;

/// Streaming engine configuration.
#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    /// Maximum frames held per client sub-queue.
    pub queue_max_size: usize,
    /// Maximum acceptable frame age at delivery time.
    pub max_frame_age_secs: f64,

    /// Requested stream quality ceiling (JPEG quality percent).
    pub stream_quality: u8,
    /// Quality floor adaptation may not go below.
    pub min_stream_quality: u8,
    /// Frame rate ceiling.
    pub max_frame_rate: u32,
    /// Frame rate floor.
    pub min_frame_rate: u32,

    /// Enable automatic frame-rate adaptation.
    pub adaptive_streaming: bool,
    /// Enable automatic quality adaptation.
    pub adaptive_quality: bool,
    /// Network monitor poll interval.
    pub network_check_interval_secs: f64,
    /// Minimum spacing between per-client adaptation evaluations.
    pub adaptation_interval_secs: f64,

    /// Health check intervals per family.
    pub camera_check_interval_secs: f64,
    pub stream_check_interval_secs: f64,
    pub session_check_interval_secs: f64,
    /// Consecutive unchanged frame counts before frames are considered frozen.
    pub max_stale_checks: u32,
    /// Consecutive failed hardware probes before the camera is considered gone.
    pub max_hardware_failures: u32,

    /// Minimum spacing between recovery attempts for one problem type.
    pub recovery_cooldown_secs: u64,
    /// Maximum recovery attempts per problem type in a trailing hour.
    pub max_recovery_attempts: usize,

    /// Sessions idle longer than this are reclaimed by periodic cleanup.
    pub client_inactivity_ttl_secs: u64,

    /// Caps the initial quality at 70 for constrained hosts.
    pub low_resource_mode: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_max_size: 10,
            max_frame_age_secs: 5.0,
            stream_quality: 85,
            min_stream_quality: 30,
            max_frame_rate: 30,
            min_frame_rate: 2,
            adaptive_streaming: true,
            adaptive_quality: true,
            network_check_interval_secs: 5.0,
            adaptation_interval_secs: 3.0,
            camera_check_interval_secs: 10.0,
            stream_check_interval_secs: 5.0,
            session_check_interval_secs: 30.0,
            max_stale_checks: 3,
            max_hardware_failures: 3,
            recovery_cooldown_secs: 60,
            max_recovery_attempts: 3,
            client_inactivity_ttl_secs: 300,
            low_resource_mode: false,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on"),
        Err(_) => default,
    }
}

impl EngineConfig {
    /// Builds configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            queue_max_size: env_parse("CAMRELAY_QUEUE_MAX_SIZE", defaults.queue_max_size),
            max_frame_age_secs: env_parse("CAMRELAY_MAX_FRAME_AGE", defaults.max_frame_age_secs),
            stream_quality: env_parse("CAMRELAY_STREAM_QUALITY", defaults.stream_quality),
            min_stream_quality: env_parse(
                "CAMRELAY_MIN_STREAM_QUALITY",
                defaults.min_stream_quality,
            ),
            max_frame_rate: env_parse("CAMRELAY_MAX_FRAME_RATE", defaults.max_frame_rate),
            min_frame_rate: env_parse("CAMRELAY_MIN_FRAME_RATE", defaults.min_frame_rate),
            adaptive_streaming: env_bool("CAMRELAY_ADAPTIVE_STREAMING", defaults.adaptive_streaming),
            adaptive_quality: env_bool("CAMRELAY_ADAPTIVE_QUALITY", defaults.adaptive_quality),
            network_check_interval_secs: env_parse(
                "CAMRELAY_NETWORK_CHECK_INTERVAL",
                defaults.network_check_interval_secs,
            ),
            adaptation_interval_secs: env_parse(
                "CAMRELAY_ADAPTATION_INTERVAL",
                defaults.adaptation_interval_secs,
            ),
            camera_check_interval_secs: env_parse(
                "CAMRELAY_CAMERA_CHECK_INTERVAL",
                defaults.camera_check_interval_secs,
            ),
            stream_check_interval_secs: env_parse(
                "CAMRELAY_STREAM_CHECK_INTERVAL",
                defaults.stream_check_interval_secs,
            ),
            session_check_interval_secs: env_parse(
                "CAMRELAY_SESSION_CHECK_INTERVAL",
                defaults.session_check_interval_secs,
            ),
            max_stale_checks: env_parse("CAMRELAY_MAX_STALE_CHECKS", defaults.max_stale_checks),
            max_hardware_failures: env_parse(
                "CAMRELAY_MAX_HARDWARE_FAILURES",
                defaults.max_hardware_failures,
            ),
            recovery_cooldown_secs: env_parse(
                "CAMRELAY_RECOVERY_COOLDOWN",
                defaults.recovery_cooldown_secs,
            ),
            max_recovery_attempts: env_parse(
                "CAMRELAY_MAX_RECOVERY_ATTEMPTS",
                defaults.max_recovery_attempts,
            ),
            client_inactivity_ttl_secs: env_parse(
                "CAMRELAY_CLIENT_INACTIVITY_TTL",
                defaults.client_inactivity_ttl_secs,
            ),
            low_resource_mode: env_bool("CAMRELAY_LOW_RESOURCE_MODE", defaults.low_resource_mode),
        }
    }

    /// Initial stream quality, honoring low-resource mode.
    pub fn initial_quality(&self) -> u8 {
        if self.low_resource_mode {
            self.stream_quality.min(70)
        } else {
            self.stream_quality
        }
    }

    pub fn max_frame_age(&self) -> Duration {
        Duration::from_secs_f64(self.max_frame_age_secs)
    }

    pub fn network_check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.network_check_interval_secs)
    }

    pub fn adaptation_interval(&self) -> Duration {
        Duration::from_secs_f64(self.adaptation_interval_secs)
    }

    pub fn recovery_cooldown(&self) -> Duration {
        Duration::from_secs(self.recovery_cooldown_secs)
    }

    pub fn client_inactivity_ttl(&self) -> Duration {
        Duration::from_secs(self.client_inactivity_ttl_secs)
    }

    /// Validates configured ranges, returning all violations.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.queue_max_size == 0 {
            errors.push("queue_max_size must be at least 1".to_string());
        }
        if self.max_frame_age_secs <= 0.0 {
            errors.push("max_frame_age must be positive".to_string());
        }
        if self.min_stream_quality > self.stream_quality {
            errors.push(format!(
                "min_stream_quality ({}) exceeds stream_quality ({})",
                self.min_stream_quality, self.stream_quality
            ));
        }
        if self.stream_quality > 100 {
            errors.push("stream_quality must be at most 100".to_string());
        }
        if self.min_frame_rate == 0 || self.min_frame_rate > self.max_frame_rate {
            errors.push(format!(
                "invalid frame rate range [{}, {}]",
                self.min_frame_rate, self.max_frame_rate
            ));
        }
        if self.network_check_interval_secs <= 0.0 {
            errors.push("network_check_interval must be positive".to_string());
        }
        if self.max_recovery_attempts == 0 {
            errors.push("max_recovery_attempts must be at least 1".to_string());
        }

        errors
    }
}
