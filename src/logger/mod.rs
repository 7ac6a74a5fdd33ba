//! The `logger` module is a simple utility that requires manual verification.
//! See `bin/access_demo.rs` for a binary demonstrating its usage.

mod logger;
pub use logger::*;

pub use tracing::{debug, error, info, trace, warn};
