//! A read-through cache for conditions data.
//!
//! Conditions are values that are valid for a range of time points, like calibration constants
//! that are valid for a range of runs and luminosity blocks. A [`ConditionsCache`] keeps the
//! current value per key together with its [`ValidityInterval`], and computes a new one on demand
//! once the requested time point leaves that interval.
//!
//! Concurrent requests for the same key are coalesced, so that the producer of a key never runs
//! more than once at a time:
//!
//! ```
//! # use condcache::{CacheConfig, ConditionsCache, ValidityInterval};
//! let cache: ConditionsCache<&str, u64, f64, String> =
//!     ConditionsCache::new(CacheConfig::named("beamspot"));
//!
//! let view = cache
//!     .get_blocking(&"x", 42, |_, t| {
//!         let start = t - t % 100;
//!         Ok((0.25, ValidityInterval::new(start, start + 100).unwrap()))
//!     })
//!     .unwrap();
//!
//! assert_eq!(*view, 0.25);
//! assert_eq!(view.interval().to_string(), "[0, 100)");
//! ```

#[macro_use]
pub mod metrics;

pub mod cache;
pub mod config;
pub mod interval;
pub mod logging;
pub mod store;
pub mod time;

pub use cache::{CacheStats, ConditionsCache};
pub use config::CacheConfig;
pub use interval::{InvalidInterval, ValidityInterval};
pub use store::{
    Busy, Completion, ConditionsStore, Pending, Production, ProductionTicket, ValueView,
};
pub use time::{RunLumi, TimePoint};
