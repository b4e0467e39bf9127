pub mod app;
pub mod client_state;
pub mod file_info;
pub mod file_ref;
pub mod gc;
pub mod project;
pub mod result;
pub mod stats;
pub mod text;
pub mod workunit;
