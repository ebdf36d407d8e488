use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::location::GeoPoint;

/// What an account is allowed to do. Ordered by privilege so the highest one
/// sorts last.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    #[serde(alias = "user")]
    Rider,
    Driver,
    Admin,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Rider => "rider",
            Capability::Driver => "driver",
            Capability::Admin => "admin",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "rider" | "user" => Ok(Capability::Rider),
            "driver" => Ok(Capability::Driver),
            "admin" => Ok(Capability::Admin),
            other => Err(format!(
                "unknown role: {other}, expected rider/user/driver/admin"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub capabilities: BTreeSet<Capability>,
    pub is_online: bool,
    /// False while `current_booking` holds the driver.
    pub is_available: bool,
    pub current_booking: Option<Uuid>,
    pub last_online: Option<DateTime<Utc>>,
    pub location: Option<GeoPoint>,
    pub last_booking_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(name: String, email: String, phone: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            email,
            phone,
            capabilities: BTreeSet::from([Capability::Rider]),
            is_online: false,
            is_available: true,
            current_booking: None,
            last_online: None,
            location: None,
            last_booking_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn is_driver(&self) -> bool {
        self.has(Capability::Driver)
    }

    /// Display role, derived rather than stored.
    pub fn primary_role(&self) -> Capability {
        self.capabilities
            .iter()
            .next_back()
            .copied()
            .unwrap_or(Capability::Rider)
    }

    pub fn is_eligible_driver(&self) -> bool {
        self.is_driver() && self.is_online && self.is_available
    }
}

/// Contact details handed to the other party of a booking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriverSummary {
    pub id: Uuid,
    pub name: String,
    pub phone: Option<String>,
    pub location: Option<GeoPoint>,
}

impl From<&User> for DriverSummary {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            phone: user.phone.clone(),
            location: user.location,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Capability, User};

    #[test]
    fn primary_role_prefers_highest_privilege() {
        let mut user = User::new("Asha".to_string(), "asha@example.com".to_string(), None);
        assert_eq!(user.primary_role(), Capability::Rider);

        user.capabilities.insert(Capability::Driver);
        assert_eq!(user.primary_role(), Capability::Driver);

        user.capabilities.insert(Capability::Admin);
        assert_eq!(user.primary_role(), Capability::Admin);
    }

    #[test]
    fn legacy_user_role_parses_as_rider() {
        assert_eq!("user".parse::<Capability>().unwrap(), Capability::Rider);
        assert_eq!(" Driver ".parse::<Capability>().unwrap(), Capability::Driver);
        assert!("dispatcher".parse::<Capability>().is_err());

        let parsed: Capability = serde_json::from_str("\"user\"").unwrap();
        assert_eq!(parsed, Capability::Rider);
    }

    #[test]
    fn eligibility_needs_capability_online_and_available() {
        let mut user = User::new("Bikash".to_string(), "bikash@example.com".to_string(), None);
        user.is_online = true;
        assert!(!user.is_eligible_driver());

        user.capabilities.insert(Capability::Driver);
        assert!(user.is_eligible_driver());

        user.is_available = false;
        assert!(!user.is_eligible_driver());
    }
}
