use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::matching::{accept, handle_rejection};
use crate::engine::registry::{go_offline, go_online, update_location};
use crate::engine::state_machine::{Outcome, StatusChange, update_status};
use crate::error::AppError;
use crate::models::actor::Actor;
use crate::models::booking::BookingStatus;
use crate::models::event::{ClientMessage, RealtimeEvent, RideUnavailable};
use crate::models::location::GeoPoint;
use crate::models::user::Capability;
use crate::realtime::notifier::{ConnectionRole, Subscription};
use crate::state::AppState;

/// An authenticated realtime connection.
#[derive(Debug, Clone, Copy)]
pub struct Session {
    pub connection_id: Uuid,
    pub actor: Actor,
    pub role: ConnectionRole,
}

pub fn register_connection(
    state: &AppState,
    user_id: Uuid,
    capability: Capability,
) -> Result<(Session, Subscription), AppError> {
    let user = state
        .store
        .user(user_id)
        .ok_or_else(|| AppError::Unauthenticated(format!("unknown user {user_id}")))?;

    if !user.has(capability) {
        return Err(AppError::Unauthenticated(format!(
            "user {user_id} does not hold the {capability} role"
        )));
    }

    let role = match capability {
        Capability::Driver => ConnectionRole::Driver,
        Capability::Rider | Capability::Admin => ConnectionRole::Rider,
    };

    let subscription = state.notifier.attach(user_id, role);
    if user.location.is_some() {
        state.notifier.touch(user_id, user.location);
    }

    info!(user_id = %user_id, role = role.as_str(), "realtime connection registered");

    Ok((
        Session {
            connection_id: subscription.connection_id,
            actor: Actor::new(user_id, capability),
            role,
        },
        subscription,
    ))
}

/// A driver whose live connection goes away is marked offline. Failing to do
/// so is logged and otherwise ignored.
pub fn unregister_connection(state: &AppState, session: &Session) {
    let user_id = session.actor.user_id;

    let Some(role) = state.notifier.detach(user_id, session.connection_id) else {
        return;
    };

    info!(user_id = %user_id, role = role.as_str(), "realtime connection closed");

    if role == ConnectionRole::Driver {
        if let Err(err) = go_offline(state, user_id) {
            warn!(driver_id = %user_id, error = %err, "failed to mark disconnected driver offline");
        }
    }
}

/// Runs one client frame. The returned event, if any, is meant for the
/// sender alone.
pub fn handle_client_message(
    state: &AppState,
    session: &Session,
    message: ClientMessage,
) -> Option<RealtimeEvent> {
    state.notifier.touch(session.actor.user_id, None);

    let result = match message {
        ClientMessage::Authenticate { .. } => {
            return Some(RealtimeEvent::error("connection is already authenticated"));
        }
        ClientMessage::DriverOnline { is_online } => {
            require_driver(session).and_then(|driver_id| {
                if is_online {
                    go_online(state, driver_id).map(|_| ())
                } else {
                    go_offline(state, driver_id).map(|_| ())
                }
            })
        }
        ClientMessage::UpdateLocation { location } => on_location(state, session, location),
        ClientMessage::DriverRideResponse {
            booking_id,
            accepted,
        } => {
            let response = require_driver(session)
                .and_then(|driver_id| on_driver_response(state, driver_id, booking_id, accepted));

            return match response {
                Ok(_) => None,
                Err(err @ (AppError::Conflict(_) | AppError::NotFound(_))) if accepted => {
                    Some(RealtimeEvent::RideUnavailable(RideUnavailable {
                        booking_id,
                        message: err.to_string(),
                    }))
                }
                Err(err) => Some(RealtimeEvent::error(err.to_string())),
            };
        }
        ClientMessage::UpdateRideStatus { booking_id, status } => {
            on_status_update(state, session, booking_id, status)
        }
    };

    result.err().map(|err| RealtimeEvent::error(err.to_string()))
}

/// A driver's answer to a ride request, routed into the matching engine.
pub fn on_driver_response(
    state: &AppState,
    driver_id: Uuid,
    booking_id: Uuid,
    accepted: bool,
) -> Result<Outcome, AppError> {
    if accepted {
        accept(state, driver_id, booking_id)
    } else {
        handle_rejection(state, driver_id, booking_id)
    }
}

fn on_location(state: &AppState, session: &Session, location: GeoPoint) -> Result<(), AppError> {
    match session.role {
        ConnectionRole::Driver => update_location(state, session.actor.user_id, location).map(|_| ()),
        ConnectionRole::Rider => {
            location.validate("location")?;
            state.notifier.touch(session.actor.user_id, Some(location));
            Ok(())
        }
    }
}

fn on_status_update(
    state: &AppState,
    session: &Session,
    booking_id: Uuid,
    status: BookingStatus,
) -> Result<(), AppError> {
    update_status(
        state,
        &session.actor,
        booking_id,
        status,
        StatusChange::default(),
    )
    .map(|_| ())
}

fn require_driver(session: &Session) -> Result<Uuid, AppError> {
    if session.role == ConnectionRole::Driver {
        Ok(session.actor.user_id)
    } else {
        Err(AppError::Forbidden(
            "only driver connections can do that".to_string(),
        ))
    }
}
