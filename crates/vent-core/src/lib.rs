//! vent-core: stable foundation for the respiratory-control stack.
//!
//! Contains:
//! - units (uom SI types + constructors for the quantities the vent uses)
//! - timing (monotonic `TimePoint` + `Duration` arithmetic)
//! - numeric (Real + tolerances + float helpers)
//! - error (shared error types)

pub mod error;
pub mod numeric;
pub mod timing;
pub mod units;

// Re-exports: nice ergonomics for downstream crates
pub use error::{CoreError, CoreResult};
pub use numeric::*;
pub use timing::TimePoint;
pub use units::*;
