pub mod anthropic;
pub mod event_bus;
pub mod mock;
pub mod persistence;
pub mod quantconnect;
pub mod repositories;

pub use repositories::in_memory::{InMemoryIterationRepository, InMemoryStrategyRepository};
