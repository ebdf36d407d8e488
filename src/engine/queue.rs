use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;
use uuid::Uuid;

use crate::models::booking::{Booking, BookingStatus};
use crate::state::AppState;

/// Best-effort: a full or closed queue is logged and the caller carries on.
pub fn enqueue_rematch(state: &AppState, booking_id: Uuid) -> bool {
    match state.rematch_tx.try_send(booking_id) {
        Ok(()) => {
            state.metrics.rematch_queue_depth.inc();
            true
        }
        Err(TrySendError::Full(_)) => {
            warn!(booking_id = %booking_id, "rematch queue full; booking left pending");
            false
        }
        Err(TrySendError::Closed(_)) => {
            warn!(booking_id = %booking_id, "rematch queue closed");
            false
        }
    }
}

/// Queues every pending booking, oldest first.
pub fn enqueue_pending(state: &AppState) -> usize {
    let mut pending = state
        .store
        .find(|booking: &Booking| booking.status == BookingStatus::Pending);
    pending.sort_by_key(|booking| booking.timestamps.requested_at);

    pending
        .into_iter()
        .filter(|booking| enqueue_rematch(state, booking.id))
        .count()
}
