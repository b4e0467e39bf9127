pub mod sched_reply;
pub mod state_file;
pub mod visibility;
