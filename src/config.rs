use std::env;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub base_fare: f64,
    pub fare_per_km: f64,
    pub average_speed_kmh: f64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: String,
    pub frontend_url: Option<String>,
    pub rematch_queue_size: usize,
    pub connection_buffer_size: usize,
    pub ride_request_expires_in_secs: u64,
    pub active_booking_window_mins: i64,
    pub pricing: Pricing,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            log_format: "compact".to_string(),
            frontend_url: None,
            rematch_queue_size: 1024,
            connection_buffer_size: 256,
            ride_request_expires_in_secs: 300,
            active_booking_window_mins: 30,
            pricing: Pricing {
                base_fare: 50.0,
                fare_per_km: 12.0,
                average_speed_kmh: 30.0,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let defaults = Config::default();

        let config = Self {
            http_port: parse_or_default("HTTP_PORT", defaults.http_port)?,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: env::var("LOG_FORMAT").unwrap_or(defaults.log_format),
            frontend_url: env::var("FRONTEND_URL").ok().filter(|url| !url.trim().is_empty()),
            rematch_queue_size: parse_or_default("REMATCH_QUEUE_SIZE", defaults.rematch_queue_size)?,
            connection_buffer_size: parse_or_default(
                "CONNECTION_BUFFER_SIZE",
                defaults.connection_buffer_size,
            )?,
            ride_request_expires_in_secs: parse_or_default(
                "RIDE_REQUEST_EXPIRES_IN_SECS",
                defaults.ride_request_expires_in_secs,
            )?,
            active_booking_window_mins: parse_or_default(
                "ACTIVE_BOOKING_WINDOW_MINS",
                defaults.active_booking_window_mins,
            )?,
            pricing: Pricing {
                base_fare: parse_or_default("BASE_FARE", defaults.pricing.base_fare)?,
                fare_per_km: parse_or_default("FARE_PER_KM", defaults.pricing.fare_per_km)?,
                average_speed_kmh: parse_or_default(
                    "AVERAGE_SPEED_KMH",
                    defaults.pricing.average_speed_kmh,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.rematch_queue_size == 0 || self.connection_buffer_size == 0 {
            return Err(AppError::Internal(
                "queue and connection buffer sizes must be > 0".to_string(),
            ));
        }
        if self.pricing.average_speed_kmh <= 0.0 {
            return Err(AppError::Internal(
                "AVERAGE_SPEED_KMH must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
