pub mod runs;
pub mod webhook;
