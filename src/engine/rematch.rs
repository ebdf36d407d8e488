use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::matching::try_assign;
use crate::error::AppError;
use crate::state::AppState;

/// Drains the rematch queue, one matching attempt per booking id.
pub async fn run_rematch_engine(state: Arc<AppState>, mut rematch_rx: mpsc::Receiver<Uuid>) {
    info!("rematch engine started");

    while let Some(booking_id) = rematch_rx.recv().await {
        state.metrics.rematch_queue_depth.dec();

        match try_assign(&state, booking_id) {
            Ok(outcome) => {
                debug!(
                    booking_id = %booking_id,
                    status = %outcome.booking.status,
                    "rematch attempt finished"
                );
            }
            // Already matched, cancelled or deleted since it was queued.
            Err(AppError::Conflict(_)) | Err(AppError::NotFound(_)) => {
                debug!(booking_id = %booking_id, "rematch skipped; booking no longer pending");
            }
            Err(err) => {
                error!(booking_id = %booking_id, error = %err, "rematch attempt failed");
            }
        }
    }

    warn!("rematch engine stopped: queue channel closed");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::Config;
    use crate::engine::fixtures;
    use crate::engine::matching::create_booking;
    use crate::engine::registry::go_online;
    use crate::models::booking::BookingStatus;
    use crate::state::AppState;

    use super::run_rematch_engine;

    #[tokio::test]
    async fn driver_coming_online_picks_up_waiting_booking() {
        let (state, rematch_rx) = AppState::new(Config::default());
        let state = Arc::new(state);
        tokio::spawn(run_rematch_engine(state.clone(), rematch_rx));

        let rider = fixtures::rider(&state);
        let driver = fixtures::driver(&state);
        let id = create_booking(&state, rider.id, fixtures::ride_request())
            .unwrap()
            .booking
            .id;

        go_online(&state, driver.id).unwrap();

        let mut status = BookingStatus::Pending;
        for _ in 0..50 {
            status = state.store.booking(id).unwrap().status;
            if status != BookingStatus::Pending {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(status, BookingStatus::DriverAssigned);
        assert_eq!(state.store.booking(id).unwrap().driver_id, Some(driver.id));
        assert_eq!(state.metrics.rematch_queue_depth.get(), 0);
    }
}
