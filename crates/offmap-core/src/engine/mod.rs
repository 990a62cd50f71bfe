//! Region storage engine
//!
//! The port the lifecycle layer drives, plus a simulated implementation
//! backed by a SQLite catalog and a tile rate limiter.

mod catalog;
mod port;
mod rate_limiter;
mod simulated;

pub use catalog::*;
pub use port::*;
pub use rate_limiter::*;
pub use simulated::*;
