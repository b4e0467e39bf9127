pub mod common;
pub mod config;
pub mod error;
pub mod persist;
pub mod scheduler;
pub mod state;
pub mod transfer;
