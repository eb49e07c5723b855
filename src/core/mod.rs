pub mod delivery;
pub mod diagnose;
pub mod error;
pub mod event;
pub mod extract;
pub mod limiter;
pub mod patch;
pub mod pipeline;
pub mod store;
