//! Skips tracks that are already liked while the user listens to anything
//! other than Liked Songs.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::scheduler::CycleRunner;
use crate::error::Result;
use crate::events::{CycleSummary, EventBus, SyncEvent};
use crate::model::SpotifyClient;

pub struct LikedSongSkipper {
    client: SpotifyClient,
    events: EventBus,
}

impl LikedSongSkipper {
    pub const NAME: &'static str = "skip_liked";

    pub fn new(client: SpotifyClient, events: EventBus) -> Self {
        Self { client, events }
    }
}

#[async_trait]
impl CycleRunner for LikedSongSkipper {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run_cycle(&self, _cycle: u64, _shutdown: &CancellationToken) -> Result<CycleSummary> {
        let summary = CycleSummary::default();
        let Some(state) = self.client.playback_state().await? else {
            tracing::trace!("Nothing is playing");
            return Ok(summary);
        };
        let Some(track_id) = state.skippable_track_id() else {
            return Ok(summary);
        };

        let liked = self.client.saved_tracks_contain(&[track_id.to_string()]).await?;
        if liked.first() != Some(&true) {
            return Ok(summary);
        }

        self.client.skip_to_next(state.device_id()).await?;
        tracing::info!(track_id, title = state.track_name(), "Skipped liked track");
        self.events.emit(SyncEvent::TrackSkipped {
            track_id: track_id.to_string(),
            title: state.track_name().to_string(),
        });
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::events::testing::drain;
    use crate::http::testing::FakeTransport;
    use crate::http::{ApiRequest, ApiResponse, HttpMethod};
    use crate::model::testing::client_with;
    use crate::sync::clock::testing::ManualClock;

    fn player(context: &str, liked: bool) -> impl Fn(&ApiRequest) -> Result<ApiResponse> + Send + Sync + 'static {
        let context = context.to_string();
        move |request| {
            Ok(match (request.method, request.path.as_str()) {
                (HttpMethod::Get, "/v1/me/player") => ApiResponse::new(
                    200,
                    json!({
                        "is_playing": true,
                        "currently_playing_type": "track",
                        "context": { "type": context },
                        "device": { "id": "desk" },
                        "item": { "id": "abc", "name": "Song", "type": "track" }
                    })
                    .to_string(),
                ),
                (HttpMethod::Get, "/v1/me/tracks/contains") => ApiResponse::new(200, json!([liked]).to_string()),
                (HttpMethod::Post, "/v1/me/player/next") => ApiResponse::new(204, ""),
                _ => ApiResponse::new(404, "not found"),
            })
        }
    }

    fn skipper(transport: Arc<FakeTransport>, events: &EventBus) -> LikedSongSkipper {
        let client = client_with(transport, ManualClock::new(), None, CancellationToken::new());
        LikedSongSkipper::new(client, events.clone())
    }

    #[tokio::test]
    async fn skips_liked_tracks_played_from_a_playlist() {
        let transport = Arc::new(FakeTransport::with_handler(player("playlist", true)));
        let events = EventBus::new(8);
        let mut received = events.subscribe();

        skipper(transport.clone(), &events).run_cycle(1, &CancellationToken::new()).await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[1].query.get("ids").map(String::as_str), Some("abc"));
        assert_eq!(requests[2].path, "/v1/me/player/next");
        assert_eq!(requests[2].query.get("device_id").map(String::as_str), Some("desk"));
        assert_eq!(
            drain(&mut received),
            vec![SyncEvent::TrackSkipped {
                track_id: "abc".into(),
                title: "Song".into()
            }]
        );
    }

    #[tokio::test]
    async fn leaves_tracks_that_are_not_liked() {
        let transport = Arc::new(FakeTransport::with_handler(player("album", false)));
        skipper(transport.clone(), &EventBus::default())
            .run_cycle(1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn never_skips_inside_liked_songs() {
        let transport = Arc::new(FakeTransport::with_handler(player("collection", true)));
        skipper(transport.clone(), &EventBus::default())
            .run_cycle(1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn idle_player_is_a_no_op() {
        let transport = Arc::new(FakeTransport::scripted(vec![Ok(ApiResponse::new(204, ""))]));
        let summary = skipper(transport.clone(), &EventBus::default())
            .run_cycle(1, &CancellationToken::new())
            .await
            .unwrap();
        assert!(summary.is_empty());
        assert_eq!(transport.request_count(), 1);
    }
}
