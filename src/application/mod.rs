pub mod context;
pub mod controller;
pub mod cooldown;
pub mod pipeline;
pub mod retry;
