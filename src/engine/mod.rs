pub mod matching;
pub mod queue;
pub mod registry;
pub mod rematch;
pub mod state_machine;

#[cfg(test)]
pub(crate) mod fixtures;
