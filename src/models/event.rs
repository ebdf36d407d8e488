use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::booking::BookingStatus;
use crate::models::location::{GeoPoint, Location};
use crate::models::user::{Capability, DriverSummary};

/// Server-to-client frames. Serialized as `{"event": <name>, "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum RealtimeEvent {
    NewRideRequest(NewRideRequest),
    RideStatusUpdate(RideStatusUpdate),
    DriverStatusChanged(DriverStatusChanged),
    BookingCancelled(BookingCancelled),
    RideTaken(RideTaken),
    RideUnavailable(RideUnavailable),
    DriverLocationUpdated(DriverLocationUpdated),
    Authenticated(Authenticated),
    AuthenticationError(ErrorMessage),
    Error(ErrorMessage),
}

impl RealtimeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RealtimeEvent::NewRideRequest(_) => "newRideRequest",
            RealtimeEvent::RideStatusUpdate(_) => "rideStatusUpdate",
            RealtimeEvent::DriverStatusChanged(_) => "driverStatusChanged",
            RealtimeEvent::BookingCancelled(_) => "bookingCancelled",
            RealtimeEvent::RideTaken(_) => "rideTaken",
            RealtimeEvent::RideUnavailable(_) => "rideUnavailable",
            RealtimeEvent::DriverLocationUpdated(_) => "driverLocationUpdated",
            RealtimeEvent::Authenticated(_) => "authenticated",
            RealtimeEvent::AuthenticationError(_) => "authenticationError",
            RealtimeEvent::Error(_) => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        RealtimeEvent::Error(ErrorMessage {
            message: message.into(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewRideRequest {
    pub booking_id: Uuid,
    pub pickup: Location,
    pub drop: Option<Location>,
    pub fare: f64,
    pub distance: f64,
    pub expires_in: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RideStatusUpdate {
    pub booking_id: Uuid,
    pub status: BookingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<DriverSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_minutes: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriverStatusChanged {
    pub driver_id: Uuid,
    pub is_online: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BookingCancelled {
    pub booking_id: Uuid,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RideTaken {
    pub booking_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RideUnavailable {
    pub booking_id: Uuid,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriverLocationUpdated {
    pub driver_id: Uuid,
    pub location: GeoPoint,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Authenticated {
    pub user_id: Uuid,
    pub role: Capability,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorMessage {
    pub message: String,
}

/// Client-to-server frames, tagged by `type`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Authenticate {
        user_id: Uuid,
        role: Capability,
    },
    DriverOnline {
        is_online: bool,
    },
    UpdateLocation {
        location: GeoPoint,
    },
    DriverRideResponse {
        booking_id: Uuid,
        accepted: bool,
    },
    UpdateRideStatus {
        booking_id: Uuid,
        status: BookingStatus,
    },
}
