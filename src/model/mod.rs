//! Model module - data types and the remote API boundary
//!
//! - `types`: Track references, page cursors and pending operations
//! - `content`: Fixed records decoded from listing responses
//! - `cache`: Response cache with freshness and validators
//! - `snapshot`: Snapshots and their atomic on-disk store
//! - `spotify_client`: Cache-aware Spotify API client

mod cache;
mod content;
mod snapshot;
mod spotify_client;
mod types;

pub use cache::{CacheEntry, ResponseCache};
pub use content::{
    CurrentUser, PageItem, PlayHistoryItem, PlaybackState, PlayedTrack, PlaylistItem, PlaylistSummary, RawPage, TrackItem,
};
pub use snapshot::{Snapshot, SnapshotStore};
pub use spotify_client::SpotifyClient;
pub use types::{OperationId, OperationKind, PageCursor, PendingOperation, TrackRef};

#[cfg(test)]
pub use spotify_client::testing;
