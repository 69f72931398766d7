//! Tracing subscriber setup shared by the vigil binaries.

mod subscriber;

pub use subscriber::{LogFormat, LogSettings, init, init_with, try_init_for_tests};
