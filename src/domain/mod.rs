pub mod errors;
pub mod events;
pub mod ports;
pub mod refinement;
pub mod repositories;
pub mod types;
