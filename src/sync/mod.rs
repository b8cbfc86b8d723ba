//! Sync module - scheduled reconciliation against the Web API
//!
//! - `clock`: Injectable time source and ticker
//! - `governor`: Retry and rate-limit handling for every request
//! - `paginator`: Lazy iteration over paged listings
//! - `engine`: Reconciliation of a source collection into a mirror playlist
//! - `cleanup`: Removal of empty default playlists
//! - `skipper`: Skipping liked tracks played from elsewhere
//! - `scheduler`: Periodic, failure-isolated execution of cycles

pub mod cleanup;
pub mod clock;
pub mod engine;
pub mod governor;
pub mod paginator;
pub mod scheduler;
pub mod skipper;

pub use cleanup::PlaylistCleanup;
pub use clock::{Clock, SystemClock, Ticker};
pub use engine::{ReconciliationEngine, SyncJob};
pub use governor::{RateLimitGovernor, RetryPolicy};
pub use paginator::{Listing, Paginator};
pub use scheduler::{CycleRunner, SchedulerContext, SchedulerLoop};
pub use skipper::LikedSongSkipper;
