use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::location::Location;

/// The single status vocabulary shared by ride and tour bookings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    DriverAssigned,
    DriverArrived,
    InProgress,
    Completed,
    Cancelled,
    NoDriversAvailable,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 7] = [
        BookingStatus::Pending,
        BookingStatus::DriverAssigned,
        BookingStatus::DriverArrived,
        BookingStatus::InProgress,
        BookingStatus::Completed,
        BookingStatus::Cancelled,
        BookingStatus::NoDriversAvailable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::DriverAssigned => "driver_assigned",
            BookingStatus::DriverArrived => "driver_arrived",
            BookingStatus::InProgress => "in_progress",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::NoDriversAvailable => "no_drivers_available",
        }
    }

    /// A driver is held busy by bookings in these states.
    pub fn holds_driver(&self) -> bool {
        matches!(
            self,
            BookingStatus::DriverAssigned | BookingStatus::DriverArrived | BookingStatus::InProgress
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        BookingStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == raw)
            .ok_or_else(|| {
                let known: Vec<&str> = BookingStatus::ALL.iter().map(|s| s.as_str()).collect();
                format!("unknown status: {raw}, expected one of {}", known.join(", "))
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BookingKind {
    Ride,
    Tour {
        package_id: Uuid,
        title: String,
        travel_date: NaiveDate,
        people: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookingTimestamps {
    pub requested_at: DateTime<Utc>,
    /// First assignment; later assignment cycles live on their `Assignment` records.
    pub assigned_at: Option<DateTime<Utc>>,
    pub arrived_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TripEstimate {
    pub distance_km: f64,
    pub duration_minutes: u32,
    pub fare: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub reference: String,
    pub kind: BookingKind,
    pub rider_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub pickup: Location,
    pub drop: Option<Location>,
    pub passengers: u32,
    pub vehicle_type: Option<String>,
    pub payment_method: Option<String>,
    pub note: Option<String>,
    pub status: BookingStatus,
    pub rejected_by: Vec<Uuid>,
    pub estimate: TripEstimate,
    pub timestamps: BookingTimestamps,
    pub cancellation_reason: Option<String>,
    pub current_assignment: Option<Uuid>,
}

impl Booking {
    pub fn has_rejected(&self, driver_id: Uuid) -> bool {
        self.rejected_by.contains(&driver_id)
    }

    /// Returns false when the driver was already recorded.
    pub fn record_rejection(&mut self, driver_id: Uuid) -> bool {
        if self.has_rejected(driver_id) {
            return false;
        }
        self.rejected_by.push(driver_id);
        true
    }

    pub fn is_party(&self, user_id: Uuid) -> bool {
        self.rider_id == user_id || self.driver_id == Some(user_id)
    }
}

pub fn booking_reference(id: &Uuid) -> String {
    let simple = id.simple().to_string();
    format!("BK-{}", simple[..8].to_ascii_uppercase())
}
