//! Spotify Web API client with response caching and rate-limit handling

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;

use super::cache::ResponseCache;
use super::content::{CurrentUser, PageItem, PlayHistoryItem, PlaybackState, PlayedTrack, RawPage};
use crate::error::Result;
use crate::http::{ApiRequest, ApiResponse, HttpMethod};
use crate::sync::governor::RateLimitGovernor;

/// IDs accepted by one `/me/tracks/contains` call
const CONTAINS_BATCH: usize = 50;

/// Cache-aware client; every network call goes through the governor.
#[derive(Clone)]
pub struct SpotifyClient {
    governor: Arc<RateLimitGovernor>,
    cache: Option<ResponseCache>,
}

impl SpotifyClient {
    pub fn new(governor: RateLimitGovernor, cache: Option<ResponseCache>) -> Self {
        Self {
            governor: Arc::new(governor),
            cache,
        }
    }

    pub fn cache(&self) -> Option<&ResponseCache> {
        self.cache.as_ref()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.governor.clock().now()
    }

    /// Issue `method endpoint?params`.
    pub async fn request(
        &self,
        method: HttpMethod,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<ApiResponse> {
        let mut request = ApiRequest::new(method, endpoint);
        for (key, value) in params {
            request = request.query(*key, value);
        }
        self.send(request).await
    }

    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let cache = match &self.cache {
            Some(cache) if !request.bypasses_cache() => cache,
            _ => return self.governor.execute(&request).await,
        };
        if request.method == HttpMethod::Get {
            return self.cached_get(cache, request).await;
        }

        let result = self.governor.execute(&request).await;
        if request.method.is_mutation() {
            // A failed mutation may still have been applied.
            cache.invalidate(&request.path);
            tracing::trace!(path = %request.path, succeeded = result.is_ok(), "Invalidated cached responses");
        }
        result
    }

    async fn cached_get(&self, cache: &ResponseCache, request: ApiRequest) -> Result<ApiResponse> {
        let signature = request.signature();
        let cached = cache.get(&signature).await;

        let conditional = match &cached {
            Some(entry) if entry.is_fresh(self.now()) => {
                tracing::trace!(%signature, "Cache hit");
                return Ok(cached_response(entry.body.clone()));
            }
            Some(entry) => {
                let mut conditional = request.clone();
                if let Some(etag) = &entry.etag {
                    conditional = conditional.header("if-none-match", etag.clone());
                }
                if let Some(last_modified) = &entry.last_modified {
                    conditional = conditional.header("if-modified-since", last_modified.clone());
                }
                conditional
            }
            None => request.clone(),
        };

        let mut response = self.governor.execute(&conditional).await?;
        if response.is_not_modified() {
            if let Some(entry) = cache.revalidate(&signature, &response, self.now()).await {
                tracing::trace!(%signature, "Cache entry revalidated");
                return Ok(cached_response(entry.body));
            }
            tracing::debug!(%signature, "Revalidated entry was invalidated meanwhile, fetching it again");
            response = self.governor.execute(&request).await?;
        }
        cache.store(&signature, &request.path, &response, self.now()).await;
        Ok(response)
    }

    pub async fn current_user(&self) -> Result<CurrentUser> {
        let endpoint = "/v1/me";
        self.request(HttpMethod::Get, endpoint, &[]).await?.json(endpoint)
    }

    /// Insert tracks at `position`, or append them when `None`.
    pub async fn playlist_add_items(&self, playlist_id: &str, uris: &[String], position: Option<usize>) -> Result<()> {
        let mut body = json!({ "uris": uris });
        if let Some(position) = position {
            body["position"] = json!(position);
        }
        let request = ApiRequest::new(HttpMethod::Post, format!("/v1/playlists/{playlist_id}/tracks")).json(body);
        self.send(request).await?;
        Ok(())
    }

    /// Remove every occurrence of the tracks from a playlist.
    pub async fn playlist_remove_items(&self, playlist_id: &str, uris: &[String]) -> Result<()> {
        let tracks: Vec<_> = uris.iter().map(|uri| json!({ "uri": uri })).collect();
        let request = ApiRequest::new(HttpMethod::Delete, format!("/v1/playlists/{playlist_id}/tracks"))
            .json(json!({ "tracks": tracks }));
        self.send(request).await?;
        Ok(())
    }

    /// Move the item at `range_start` so it lands before `insert_before`.
    pub async fn playlist_reorder_item(&self, playlist_id: &str, range_start: usize, insert_before: usize) -> Result<()> {
        let request = ApiRequest::new(HttpMethod::Put, format!("/v1/playlists/{playlist_id}/tracks")).json(json!({
            "range_start": range_start,
            "insert_before": insert_before,
            "range_length": 1,
        }));
        self.send(request).await?;
        Ok(())
    }

    pub async fn unfollow_playlist(&self, playlist_id: &str) -> Result<()> {
        let request = ApiRequest::new(HttpMethod::Delete, format!("/v1/playlists/{playlist_id}/followers"));
        self.send(request).await?;
        Ok(())
    }

    /// What the user is playing right now; `None` when nothing is active.
    pub async fn playback_state(&self) -> Result<Option<PlaybackState>> {
        let endpoint = "/v1/me/player";
        let request = ApiRequest::new(HttpMethod::Get, endpoint).header("cache-control", "no-cache");
        let response = self.send(request).await?;
        if response.status == 204 || response.body.trim().is_empty() {
            return Ok(None);
        }
        response.json(endpoint).map(Some)
    }

    /// Whether each track is in the user's Liked Songs, in input order.
    pub async fn saved_tracks_contain(&self, ids: &[String]) -> Result<Vec<bool>> {
        let endpoint = "/v1/me/tracks/contains";
        let mut saved = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(CONTAINS_BATCH) {
            let request = ApiRequest::new(HttpMethod::Get, endpoint)
                .query("ids", chunk.join(","))
                .header("cache-control", "no-cache");
            let flags: Vec<bool> = self.send(request).await?.json(endpoint)?;
            saved.extend(flags);
        }
        Ok(saved)
    }

    /// Skip to the next track on `device_id`, or on the active device.
    pub async fn skip_to_next(&self, device_id: Option<&str>) -> Result<()> {
        let mut request = ApiRequest::new(HttpMethod::Post, "/v1/me/player/next");
        if let Some(device_id) = device_id {
            request = request.query("device_id", device_id);
        }
        self.send(request).await?;
        Ok(())
    }

    /// Up to `limit` (at most 50) recently played tracks, newest first.
    pub async fn recently_played(&self, limit: u32) -> Result<Vec<PlayedTrack>> {
        let endpoint = "/v1/me/player/recently-played";
        let request = ApiRequest::new(HttpMethod::Get, endpoint)
            .query("limit", limit)
            .header("cache-control", "no-cache");
        let page: RawPage<PlayHistoryItem> = self.send(request).await?.json(endpoint)?;
        Ok(page.items.into_iter().filter_map(PageItem::into_record).collect())
    }
}

fn cached_response(body: String) -> ApiResponse {
    ApiResponse {
        from_cache: true,
        ..ApiResponse::new(200, body)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::auth::testing::StaticToken;
    use crate::http::Transport;
    use crate::sync::clock::Clock;
    use crate::sync::governor::RetryPolicy;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    pub fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        }
    }

    pub fn client_with(
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        cache: Option<ResponseCache>,
        shutdown: CancellationToken,
    ) -> SpotifyClient {
        let governor = RateLimitGovernor::new(transport, Arc::new(StaticToken), clock, fast_policy(), shutdown);
        SpotifyClient::new(governor, cache)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::client_with;
    use super::*;
    use crate::error::SyncError;
    use crate::http::Transport;
    use crate::http::testing::FakeTransport;
    use crate::sync::clock::testing::ManualClock;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn cache() -> ResponseCache {
        ResponseCache::new(chrono::Duration::zero(), 1_000)
    }

    #[tokio::test]
    async fn fresh_entries_skip_the_network() {
        let transport = Arc::new(FakeTransport::with_handler(|_| {
            Ok(ApiResponse::new(200, r#"{"id":"me"}"#).with_header("cache-control", "private, max-age=60"))
        }));
        let clock = ManualClock::new();
        let client = client_with(transport.clone(), clock.clone(), Some(cache()), CancellationToken::new());

        assert_eq!(client.current_user().await.unwrap().id, "me");
        let second = client.request(HttpMethod::Get, "/v1/me", &[]).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(transport.request_count(), 1);

        clock.advance(Duration::from_secs(61));
        client.current_user().await.unwrap();
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn stale_entries_are_revalidated_with_their_etag() {
        let transport = Arc::new(FakeTransport::scripted(vec![
            Ok(ApiResponse::new(200, r#"{"id":"me"}"#)
                .with_header("cache-control", "max-age=0")
                .with_header("etag", "\"v1\"")),
            Ok(ApiResponse::new(304, "").with_header("cache-control", "max-age=0")),
            Ok(ApiResponse::new(200, r#"{"id":"other"}"#)
                .with_header("cache-control", "max-age=0")
                .with_header("etag", "\"v2\"")),
        ]));
        let client = client_with(transport.clone(), ManualClock::new(), Some(cache()), CancellationToken::new());

        assert_eq!(client.current_user().await.unwrap().id, "me");

        let revalidated = client.request(HttpMethod::Get, "/v1/me", &[]).await.unwrap();
        assert!(revalidated.from_cache);
        assert_eq!(revalidated.json::<CurrentUser>("/v1/me").unwrap().id, "me");
        let requests = transport.requests();
        assert_eq!(requests[1].headers.get("if-none-match").map(String::as_str), Some("\"v1\""));

        assert_eq!(client.current_user().await.unwrap().id, "other");
        assert_eq!(transport.requests()[2].headers.get("if-none-match").map(String::as_str), Some("\"v1\""));
    }

    /// Drops the cached resource whenever a conditional request goes out, as
    /// a concurrent mutation would.
    struct InvalidatingTransport {
        inner: FakeTransport,
        cache: ResponseCache,
    }

    #[async_trait]
    impl Transport for InvalidatingTransport {
        async fn send(&self, request: &ApiRequest, token: &str) -> Result<ApiResponse> {
            if request.headers.contains_key("if-none-match") {
                self.cache.invalidate(&request.path);
            }
            self.inner.send(request, token).await
        }
    }

    #[tokio::test]
    async fn not_modified_for_a_vanished_entry_fetches_again() {
        let cache = cache();
        let transport = Arc::new(InvalidatingTransport {
            inner: FakeTransport::scripted(vec![
                Ok(ApiResponse::new(200, r#"{"id":"me"}"#)
                    .with_header("cache-control", "max-age=0")
                    .with_header("etag", "\"v1\"")),
                Ok(ApiResponse::new(304, "")),
                Ok(ApiResponse::new(200, r#"{"id":"fresh"}"#)
                    .with_header("cache-control", "max-age=0")
                    .with_header("etag", "\"v2\"")),
            ]),
            cache: cache.clone(),
        });
        let client = client_with(transport.clone(), ManualClock::new(), Some(cache.clone()), CancellationToken::new());

        assert_eq!(client.current_user().await.unwrap().id, "me");
        assert_eq!(client.current_user().await.unwrap().id, "fresh");

        let requests = transport.inner.requests();
        assert_eq!(requests.len(), 3);
        assert!(!requests[2].headers.contains_key("if-none-match"));
        let stored = cache.get("GET /v1/me").await.unwrap();
        assert_eq!(stored.etag.as_deref(), Some("\"v2\""));
    }

    #[tokio::test]
    async fn mutations_invalidate_the_resource() {
        let transport = Arc::new(FakeTransport::with_handler(|request| match request.method {
            HttpMethod::Get => Ok(ApiResponse::new(200, r#"{"items":[]}"#).with_header("cache-control", "max-age=300")),
            _ => Ok(ApiResponse::new(201, r#"{"snapshot_id":"s"}"#)),
        }));
        let cache = cache();
        let client = client_with(transport.clone(), ManualClock::new(), Some(cache.clone()), CancellationToken::new());

        let params = [("offset", "0".to_string())];
        client.request(HttpMethod::Get, "/v1/playlists/p1/tracks", &params).await.unwrap();
        client.request(HttpMethod::Get, "/v1/me/tracks", &params).await.unwrap();

        client.playlist_add_items("p1", &["spotify:track:a".to_string()], Some(3)).await.unwrap();
        assert!(cache.get("GET /v1/playlists/p1/tracks?offset=0").await.is_none());
        assert!(cache.get("GET /v1/me/tracks?offset=0").await.is_some());
        let add = &transport.requests()[2];
        assert_eq!(add.body.as_ref().unwrap()["position"], 3);

        client.request(HttpMethod::Get, "/v1/playlists/p1/tracks", &params).await.unwrap();
        assert_eq!(transport.request_count(), 4);
    }

    #[tokio::test]
    async fn failed_mutations_still_invalidate() {
        let transport = Arc::new(FakeTransport::with_handler(|request| match request.method {
            HttpMethod::Get => Ok(ApiResponse::new(200, r#"{"items":[]}"#).with_header("cache-control", "max-age=300")),
            _ => Ok(ApiResponse::new(502, "bad gateway")),
        }));
        let cache = cache();
        let client = client_with(transport.clone(), ManualClock::new(), Some(cache.clone()), CancellationToken::new());

        client.request(HttpMethod::Get, "/v1/playlists/p1/tracks", &[]).await.unwrap();
        assert!(cache.get("GET /v1/playlists/p1/tracks").await.is_some());

        let err = client.playlist_add_items("p1", &["spotify:track:a".to_string()], None).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(cache.get("GET /v1/playlists/p1/tracks").await.is_none());
        assert!(transport.requests()[1].body.as_ref().unwrap().get("position").is_none());
    }

    #[tokio::test]
    async fn surfaces_permanent_errors() {
        let transport = Arc::new(FakeTransport::scripted(vec![Ok(ApiResponse::new(403, "forbidden"))]));
        let client = client_with(transport, ManualClock::new(), None, CancellationToken::new());

        let err = client.unfollow_playlist("p1").await.unwrap_err();
        assert_eq!(err, SyncError::permanent(403, "forbidden"));
    }

    #[tokio::test]
    async fn uncached_client_always_hits_the_network() {
        let transport = Arc::new(FakeTransport::with_handler(|_| {
            Ok(ApiResponse::new(200, r#"{"id":"me"}"#).with_header("cache-control", "max-age=60"))
        }));
        let client = client_with(transport.clone(), ManualClock::new(), None, CancellationToken::new());

        client.current_user().await.unwrap();
        client.current_user().await.unwrap();
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn playback_state_is_never_served_from_cache() {
        let transport = Arc::new(FakeTransport::scripted(vec![
            Ok(ApiResponse::new(200, r#"{"is_playing":true,"currently_playing_type":"track","context":{"type":"album"},"device":{"id":"d1"},"item":{"id":"abc","type":"track"}}"#)
                .with_header("cache-control", "max-age=60")),
            Ok(ApiResponse::new(204, "")),
        ]));
        let cache = cache();
        let client = client_with(transport.clone(), ManualClock::new(), Some(cache.clone()), CancellationToken::new());

        let state = client.playback_state().await.unwrap().unwrap();
        assert_eq!(state.skippable_track_id(), Some("abc"));
        assert!(client.playback_state().await.unwrap().is_none());
        assert_eq!(transport.request_count(), 2);
        assert!(cache.get("GET /v1/me/player").await.is_none());
    }

    #[tokio::test]
    async fn liked_lookups_and_skips() {
        let transport = Arc::new(FakeTransport::with_handler(|request| match request.path.as_str() {
            "/v1/me/tracks/contains" => {
                let ids = request.query.get("ids").cloned().unwrap_or_default();
                let flags: Vec<bool> = ids.split(',').map(|id| id.starts_with('l')).collect();
                Ok(ApiResponse::new(200, serde_json::to_string(&flags).unwrap()))
            }
            _ => Ok(ApiResponse::new(204, "")),
        }));
        let client = client_with(transport.clone(), ManualClock::new(), Some(cache()), CancellationToken::new());

        let ids: Vec<String> = (0..60).map(|i| if i % 2 == 0 { format!("l{i}") } else { format!("x{i}") }).collect();
        let saved = client.saved_tracks_contain(&ids).await.unwrap();
        assert_eq!(saved.len(), 60);
        assert!(saved[0] && !saved[1] && saved[58]);

        client.skip_to_next(Some("d1")).await.unwrap();
        let requests = transport.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[2].method, HttpMethod::Post);
        assert_eq!(requests[2].path, "/v1/me/player/next");
        assert_eq!(requests[2].query.get("device_id").map(String::as_str), Some("d1"));
    }

    #[tokio::test]
    async fn recently_played_decodes_history() {
        let transport = Arc::new(FakeTransport::scripted(vec![Ok(ApiResponse::new(
            200,
            r#"{"items":[{"played_at":"2024-05-01T12:00:00Z","track":{"id":"abc","name":"Song","type":"track","album":{"name":"Record"}}}],"next":null}"#,
        ))]));
        let client = client_with(transport.clone(), ManualClock::new(), None, CancellationToken::new());

        let played = client.recently_played(5).await.unwrap();
        assert_eq!(played.len(), 1);
        assert_eq!(played[0].album, "Record");
        assert_eq!(transport.requests()[0].query.get("limit").map(String::as_str), Some("5"));
    }
}
