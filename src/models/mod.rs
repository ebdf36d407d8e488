pub mod actor;
pub mod assignment;
pub mod booking;
pub mod event;
pub mod location;
pub mod taxi;
pub mod tour;
pub mod user;
