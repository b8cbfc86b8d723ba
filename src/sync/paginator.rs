//! Lazy, restartable iteration over paged listings.
//!
//! The next cursor is always derived from the response (`next`, then
//! `offset + items`), so a server that changes the page size mid-iteration
//! neither skips nor repeats items.

use std::collections::HashSet;
use std::marker::PhantomData;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::SourceConfig;
use crate::error::{Result, SyncError};
use crate::http::HttpMethod;
use crate::model::{PageCursor, PageItem, RawPage, SpotifyClient, TrackItem, TrackRef};

/// A listing endpoint of the Web API
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listing {
    LikedSongs,
    PlaylistTracks(String),
    UserPlaylists,
}

impl Listing {
    pub fn endpoint(&self) -> String {
        match self {
            Listing::LikedSongs => "/v1/me/tracks".to_string(),
            Listing::PlaylistTracks(id) => format!("/v1/playlists/{id}/tracks"),
            Listing::UserPlaylists => "/v1/me/playlists".to_string(),
        }
    }

    fn extra_params(&self) -> Vec<(&'static str, String)> {
        match self {
            Listing::PlaylistTracks(_) => vec![("additional_types", "track".to_string())],
            _ => Vec::new(),
        }
    }
}

impl From<&SourceConfig> for Listing {
    fn from(source: &SourceConfig) -> Self {
        match source {
            SourceConfig::LikedSongs => Listing::LikedSongs,
            SourceConfig::Playlist(id) => Listing::PlaylistTracks(id.clone()),
        }
    }
}

fn offset_from_url(next: &str) -> Option<u32> {
    let url = Url::parse(next).ok()?;
    url.query_pairs()
        .find(|(key, _)| key == "offset")
        .and_then(|(_, value)| value.parse().ok())
}

pub struct Paginator<I: PageItem> {
    client: SpotifyClient,
    listing: Listing,
    page_size: u32,
    cursor: Option<PageCursor>,
    expected_total: Option<u32>,
    finished: bool,
    shutdown: CancellationToken,
    _item: PhantomData<fn() -> I>,
}

impl<I: PageItem> Paginator<I> {
    pub fn new(client: SpotifyClient, listing: Listing, page_size: u32, shutdown: CancellationToken) -> Self {
        Self {
            client,
            listing,
            page_size,
            cursor: None,
            expected_total: None,
            finished: false,
            shutdown,
            _item: PhantomData,
        }
    }

    /// Start over from the first page.
    pub fn restart(&mut self) {
        self.cursor = None;
        self.expected_total = None;
        self.finished = false;
    }

    /// Fetch the next page, or `None` once the listing is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<I::Record>>> {
        Ok(self.next_slots().await?.map(|slots| slots.into_iter().flatten().collect()))
    }

    /// Like [`Self::next_page`], but keeps one slot per raw item so positions
    /// match the listing. Items without a record are `None`.
    pub async fn next_slots(&mut self) -> Result<Option<Vec<Option<I::Record>>>> {
        if self.finished {
            return Ok(None);
        }
        if self.shutdown.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let cursor = self.cursor.unwrap_or_default();
        let endpoint = self.listing.endpoint();
        let mut params = vec![
            ("limit", self.page_size.to_string()),
            ("offset", cursor.offset.to_string()),
        ];
        params.extend(self.listing.extra_params());

        let page: RawPage<I> = self
            .client
            .request(HttpMethod::Get, &endpoint, &params)
            .await?
            .json(&endpoint)?;

        match self.expected_total {
            Some(expected) if expected != page.total => {
                return Err(SyncError::UpstreamChanged {
                    endpoint,
                    expected,
                    actual: page.total,
                });
            }
            Some(_) => {}
            None => self.expected_total = Some(page.total),
        }

        let raw_count = page.items.len() as u32;
        let next_offset = page
            .next
            .as_deref()
            .and_then(offset_from_url)
            .unwrap_or(page.offset + raw_count);

        if page.next.is_none() || raw_count == 0 {
            self.finished = true;
            tracing::debug!(%endpoint, fetched = cursor.fetched + raw_count, "Listing drained");
        } else if next_offset <= cursor.offset {
            tracing::warn!(%endpoint, offset = cursor.offset, next_offset, "Listing cursor did not advance");
            self.finished = true;
        } else {
            self.cursor = Some(PageCursor {
                offset: next_offset,
                fetched: cursor.fetched + raw_count,
            });
        }

        tracing::trace!(%endpoint, offset = page.offset, items = raw_count, total = page.total, "Fetched page");
        Ok(Some(page.items.into_iter().map(PageItem::into_record).collect()))
    }

    /// Drain every remaining page.
    pub async fn collect_all(mut self) -> Result<Vec<I::Record>> {
        let mut records = Vec::new();
        while let Some(page) = self.next_page().await? {
            records.extend(page);
        }
        Ok(records)
    }

    /// Drain every remaining page, one slot per raw item.
    pub async fn collect_slots(mut self) -> Result<Vec<Option<I::Record>>> {
        let mut slots = Vec::new();
        while let Some(page) = self.next_slots().await? {
            slots.extend(page);
        }
        Ok(slots)
    }
}

impl Paginator<TrackItem> {
    /// Drain into tracks in listing order, keeping the first occurrence of
    /// each remote ID.
    pub async fn collect_tracks(self) -> Result<Vec<TrackRef>> {
        let mut seen = HashSet::new();
        let mut tracks = self.collect_all().await?;
        tracks.retain(|track| seen.insert(track.id.clone()));
        Ok(tracks)
    }
}
