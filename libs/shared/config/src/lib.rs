use std::env;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_host: String,
    pub bind_port: u16,
    /// Default reservation hold duration in minutes.
    pub default_hold_minutes: i64,
    /// How often the background sweeper reconciles expired holds.
    pub sweep_interval_seconds: u64,
    /// Unresolved conflicts older than this are dropped by the sweeper.
    pub conflict_ttl_minutes: i64,
    /// Clinic working hours, minute precision.
    pub working_hours_open: String,
    pub working_hours_close: String,
    /// Minimum bookable slot duration in minutes.
    pub min_slot_duration_minutes: i64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let mut config = Self {
            bind_host: env::var("BIND_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            bind_port: parse_or_default("BIND_PORT", 3000),
            default_hold_minutes: parse_or_default("RESERVATION_HOLD_MINUTES", 15),
            sweep_interval_seconds: parse_or_default("RESERVATION_SWEEP_INTERVAL_SECONDS", 30),
            conflict_ttl_minutes: parse_or_default("CONFLICT_TTL_MINUTES", 120),
            working_hours_open: env::var("WORKING_HOURS_OPEN")
                .unwrap_or_else(|_| "08:00".to_string()),
            working_hours_close: env::var("WORKING_HOURS_CLOSE")
                .unwrap_or_else(|_| "20:00".to_string()),
            min_slot_duration_minutes: parse_or_default("MIN_SLOT_DURATION_MINUTES", 15),
        };

        if config.default_hold_minutes <= 0 {
            warn!("RESERVATION_HOLD_MINUTES must be positive, using 15");
            config.default_hold_minutes = 15;
        }
        if config.sweep_interval_seconds == 0 {
            warn!("RESERVATION_SWEEP_INTERVAL_SECONDS must be positive, using 30");
            config.sweep_interval_seconds = 30;
        }
        if config.conflict_ttl_minutes <= 0 {
            warn!("CONFLICT_TTL_MINUTES must be positive, using 120");
            config.conflict_ttl_minutes = 120;
        }

        config
    }
}

fn parse_or_default<T: std::str::FromStr + std::fmt::Display + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{} is not a valid value, using default {}", key, default);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_env() {
        let config = AppConfig::from_env();
        assert_eq!(config.default_hold_minutes, 15);
        assert_eq!(config.conflict_ttl_minutes, 120);
        assert_eq!(config.working_hours_open, "08:00");
        assert_eq!(config.working_hours_close, "20:00");
    }
}
