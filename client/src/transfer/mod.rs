pub mod events;
pub mod failover;
