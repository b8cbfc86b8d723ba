//! Fixed records for the listing responses of the Web API.
//!
//! Responses are decoded into these shapes immediately after each call so the
//! rest of the engine never looks up JSON fields by hand.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::types::TrackRef;

/// One page of any `offset`/`limit` paged listing
#[derive(Debug, Deserialize)]
pub struct RawPage<I> {
    #[serde(default = "Vec::new")]
    pub items: Vec<I>,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub offset: u32,
    #[serde(default)]
    pub total: u32,
}

/// A raw listing item that maps to a fixed record, or to nothing if the item
/// is not relevant (local files, podcast episodes).
pub trait PageItem: DeserializeOwned + Send {
    type Record: Send;

    fn into_record(self) -> Option<Self::Record>;
}

#[derive(Debug, Deserialize)]
struct ArtistRecord {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct AlbumRecord {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct TrackRecord {
    id: Option<String>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    artists: Vec<ArtistRecord>,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    external_ids: HashMap<String, String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    is_local: bool,
    #[serde(default)]
    album: AlbumRecord,
}

impl TrackRecord {
    /// `None` for local files, podcast episodes and tracks without an ID.
    fn into_track_ref(self) -> Option<TrackRef> {
        if self.is_local || self.kind.as_deref().is_some_and(|kind| kind != "track") {
            return None;
        }
        let id = self.id.filter(|id| !id.is_empty())?;
        Some(TrackRef {
            id,
            isrc: self.external_ids.get("isrc").cloned(),
            title: self.name,
            artists: self.artists.into_iter().map(|artist| artist.name).collect(),
            duration_ms: self.duration_ms,
        })
    }
}

/// Item of `/me/tracks` and `/playlists/{id}/tracks`; both wrap a `track`.
#[derive(Debug, Deserialize)]
pub struct TrackItem {
    #[serde(default)]
    track: Option<TrackRecord>,
}

impl PageItem for TrackItem {
    type Record = TrackRef;

    fn into_record(self) -> Option<TrackRef> {
        self.track?.into_track_ref()
    }
}

#[derive(Debug, Deserialize)]
struct OwnerRecord {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct PlaylistTracksRecord {
    #[serde(default)]
    total: u32,
}

/// Item of `/me/playlists`
#[derive(Debug, Deserialize)]
pub struct PlaylistItem {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    owner: Option<OwnerRecord>,
    #[serde(default)]
    tracks: PlaylistTracksRecord,
}

/// A playlist of the current user, as needed by the cleanup task
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaylistSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub owner_id: Option<String>,
    pub total_tracks: u32,
}

impl PageItem for PlaylistItem {
    type Record = PlaylistSummary;

    fn into_record(self) -> Option<PlaylistSummary> {
        Some(PlaylistSummary {
            id: self.id,
            name: self.name,
            description: self.description.unwrap_or_default(),
            owner_id: self.owner.map(|owner| owner.id),
            total_tracks: self.tracks.total,
        })
    }
}

/// `/me`
#[derive(Debug, Deserialize)]
pub struct CurrentUser {
    pub id: String,
}

#[derive(Debug, Deserialize)]
struct ContextRecord {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct DeviceRecord {
    id: Option<String>,
}

/// `/me/player`
#[derive(Debug, Deserialize)]
pub struct PlaybackState {
    #[serde(default)]
    is_playing: bool,
    #[serde(default)]
    currently_playing_type: String,
    #[serde(default)]
    context: Option<ContextRecord>,
    #[serde(default)]
    device: Option<DeviceRecord>,
    #[serde(default)]
    item: Option<TrackRecord>,
}

impl PlaybackState {
    /// ID of the playing track when it may be skipped for being liked: a
    /// track playing from any context except Liked Songs itself.
    pub fn skippable_track_id(&self) -> Option<&str> {
        let from_elsewhere = self.context.as_ref().is_some_and(|context| context.kind != "collection");
        if !self.is_playing || !from_elsewhere || self.currently_playing_type != "track" {
            return None;
        }
        self.item.as_ref()?.id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn track_name(&self) -> &str {
        self.item.as_ref().map_or("", |item| item.name.as_str())
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device.as_ref()?.id.as_deref()
    }
}

/// A play history entry of `/me/player/recently-played`
#[derive(Clone, Debug, PartialEq)]
pub struct PlayedTrack {
    pub played_at: DateTime<Utc>,
    pub track: TrackRef,
    pub album: String,
}

#[derive(Debug, Deserialize)]
pub struct PlayHistoryItem {
    played_at: DateTime<Utc>,
    track: TrackRecord,
}

impl PageItem for PlayHistoryItem {
    type Record = PlayedTrack;

    fn into_record(self) -> Option<PlayedTrack> {
        let Self { played_at, mut track } = self;
        let album = std::mem::take(&mut track.album.name);
        Some(PlayedTrack {
            played_at,
            track: track.into_track_ref()?,
            album,
        })
    }
}
