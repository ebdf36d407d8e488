use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn validate(&self, field: &str) -> Result<(), AppError> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(AppError::Validation(format!(
                "{field}: latitude must be between -90 and 90"
            )));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(AppError::Validation(format!(
                "{field}: longitude must be between -180 and 180"
            )));
        }
        Ok(())
    }
}

/// A named place: what the rider typed plus where it resolved to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub address: String,
    pub coordinates: GeoPoint,
}

impl Location {
    pub fn validate(&self, field: &str) -> Result<(), AppError> {
        if self.address.trim().is_empty() {
            return Err(AppError::Validation(format!("{field}: address cannot be empty")));
        }
        self.coordinates.validate(field)
    }
}
