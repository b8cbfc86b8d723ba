//! Removal of the empty "My Playlist #n" playlists Spotify's clients leave
//! behind.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::paginator::{Listing, Paginator};
use super::scheduler::CycleRunner;
use crate::error::{Result, SyncError};
use crate::events::{CycleSummary, EventBus, SyncEvent};
use crate::model::{PlaylistItem, PlaylistSummary, SpotifyClient};

const DEFAULT_NAME_PREFIX: &str = "My Playlist #";

/// Only untouched default playlists of the user qualify: owned by them, with
/// the default name, no tracks and no description.
pub fn is_disposable(playlist: &PlaylistSummary, user_id: &str) -> bool {
    playlist.owner_id.as_deref() == Some(user_id)
        && playlist.name.starts_with(DEFAULT_NAME_PREFIX)
        && playlist.total_tracks == 0
        && playlist.description.is_empty()
}

pub struct PlaylistCleanup {
    client: SpotifyClient,
    events: EventBus,
    page_size: u32,
}

impl PlaylistCleanup {
    pub const NAME: &'static str = "cleanup";

    pub fn new(client: SpotifyClient, events: EventBus, page_size: u32) -> Self {
        Self {
            client,
            events,
            page_size,
        }
    }
}

#[async_trait]
impl CycleRunner for PlaylistCleanup {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run_cycle(&self, _cycle: u64, shutdown: &CancellationToken) -> Result<CycleSummary> {
        let user = self.client.current_user().await?;
        let playlists = Paginator::<PlaylistItem>::new(
            self.client.clone(),
            Listing::UserPlaylists,
            self.page_size,
            shutdown.clone(),
        )
        .collect_all()
        .await?;

        let mut summary = CycleSummary::default();
        for playlist in playlists.iter().filter(|playlist| is_disposable(playlist, &user.id)) {
            if shutdown.is_cancelled() {
                summary.deferred += 1;
                continue;
            }
            match self.client.unfollow_playlist(&playlist.id).await {
                Ok(()) => {
                    tracing::info!(id = %playlist.id, name = %playlist.name, "Removed empty playlist");
                    summary.removed += 1;
                    self.events.emit(SyncEvent::PlaylistRemoved {
                        id: playlist.id.clone(),
                        name: playlist.name.clone(),
                    });
                }
                Err(SyncError::Cancelled) => summary.deferred += 1,
                Err(e) => {
                    tracing::warn!(id = %playlist.id, error = %e, "Failed to remove playlist");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }
}
