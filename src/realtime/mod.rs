pub mod announce;
pub mod notifier;
pub mod session;
