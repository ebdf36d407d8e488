use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentOutcome {
    Rejected,
    Completed,
    Cancelled,
    Unassigned,
}

/// One driver's hold on one booking, from reservation to release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub driver_id: Uuid,
    pub assigned_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: Option<AssignmentOutcome>,
}

impl Assignment {
    pub fn open(booking_id: Uuid, driver_id: Uuid, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            booking_id,
            driver_id,
            assigned_at: at,
            accepted_at: None,
            ended_at: None,
            outcome: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn close(&mut self, outcome: AssignmentOutcome, at: DateTime<Utc>) {
        if self.is_open() {
            self.ended_at = Some(at);
            self.outcome = Some(outcome);
        }
    }
}
