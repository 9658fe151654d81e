pub mod capture;
pub mod config;
pub mod diagnostic_logging;
pub mod dispatcher;
pub mod listener;
pub mod scanner;
pub mod scratch;
#[cfg(target_os = "linux")]
mod sendfile_copy;
pub mod session;
pub mod stream_dispatcher;
pub mod task;
pub mod teardown;
