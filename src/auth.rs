use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rspotify::Token;
use tokio::sync::RwLock;

use crate::config::SpotifyConfig;
use crate::error::SyncError;

pub const SCOPES: &str = "user-library-read user-library-modify playlist-read-private playlist-read-collaborative playlist-modify-private playlist-modify-public user-read-playback-state user-modify-playback-state user-read-recently-played";

/// Refresh when less than this many seconds of validity remain.
const REFRESH_MARGIN_SECS: i64 = 300;

const RESPONSE: &str = r#"
<!doctype html>
<html>
<head><title>spotils</title></head>
<body><h1>spotils is authorized, you can close this tab.</h1><script>window.close();</script></body>
</html>
"#;

/// Supplies a bearer token that is valid for at least the next request.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_valid_token(&self) -> Result<Token, SyncError>;
}

struct TokenState {
    token: Token,
    refresh_token: String,
}

/// Token capability backed by librespot's OAuth client.
///
/// The refresh token is kept on disk so only the first run opens a browser.
pub struct OAuthTokenProvider {
    client_id: String,
    redirect_uri: String,
    refresh_token_file: PathBuf,
    state: RwLock<TokenState>,
}

fn oauth_client(
    config: &SpotifyConfig,
    open_in_browser: bool,
) -> Result<librespot_oauth::OAuthClient> {
    let mut builder = librespot_oauth::OAuthClientBuilder::new(
        &config.client_id,
        &config.redirect_uri,
        SCOPES.split_whitespace().collect(),
    );
    if open_in_browser {
        builder = builder.open_in_browser().with_custom_message(RESPONSE);
    }
    Ok(builder.build()?)
}

fn to_rspotify_token(access_token: String, expires_at: Instant) -> Token {
    let remaining = expires_at.saturating_duration_since(Instant::now());
    let expires_in = chrono::Duration::from_std(remaining).unwrap_or(chrono::Duration::seconds(3600));
    Token {
        access_token,
        expires_in,
        expires_at: Some(Utc::now() + expires_in),
        scopes: SCOPES
            .split_whitespace()
            .map(|s| s.to_string())
            .collect::<HashSet<String>>(),
        refresh_token: None,
    }
}

fn needs_refresh(token: &Token, now: DateTime<Utc>) -> bool {
    match token.expires_at {
        Some(exp) => (exp - now).num_seconds() < REFRESH_MARGIN_SECS,
        None => false,
    }
}

async fn persist_refresh_token(path: &PathBuf, refresh_token: &str) {
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    match tokio::fs::write(path, refresh_token).await {
        Ok(()) => tracing::debug!("Saved refresh token to disk"),
        Err(e) => tracing::warn!(error = %e, "Could not save refresh token"),
    }
}

impl OAuthTokenProvider {
    /// Reuse the stored refresh token if it still works, otherwise run the
    /// browser flow.
    pub async fn authorize(config: &SpotifyConfig, refresh_token_file: PathBuf) -> Result<Self> {
        let stored = tokio::fs::read_to_string(&refresh_token_file)
            .await
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let token = match stored {
            Some(refresh_token) => {
                tracing::info!("Found cached refresh token");
                match oauth_client(config, false)?
                    .refresh_token_async(&refresh_token)
                    .await
                {
                    Ok(token) => token,
                    Err(e) => {
                        tracing::warn!(error = %e, "Cached refresh token failed, re-authenticating");
                        Self::browser_flow(config).await?
                    }
                }
            }
            None => {
                tracing::info!("No cached credentials found, starting browser authentication");
                Self::browser_flow(config).await?
            }
        };

        persist_refresh_token(&refresh_token_file, &token.refresh_token).await;

        Ok(Self {
            client_id: config.client_id.clone(),
            redirect_uri: config.redirect_uri.clone(),
            refresh_token_file,
            state: RwLock::new(TokenState {
                token: to_rspotify_token(token.access_token, token.expires_at),
                refresh_token: token.refresh_token,
            }),
        })
    }

    async fn browser_flow(config: &SpotifyConfig) -> Result<librespot_oauth::OAuthToken> {
        tracing::info!("Starting browser-based OAuth flow");
        let token = oauth_client(config, true)?.get_access_token_async().await?;
        tracing::info!("Browser authentication completed successfully");
        Ok(token)
    }

    async fn refresh(&self, state: &mut TokenState) -> Result<(), SyncError> {
        tracing::info!("Token expiring soon, refreshing...");
        let config = SpotifyConfig {
            client_id: self.client_id.clone(),
            redirect_uri: self.redirect_uri.clone(),
        };
        let client = oauth_client(&config, false).map_err(|e| SyncError::Auth(e.to_string()))?;
        let token = client
            .refresh_token_async(&state.refresh_token)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to refresh token");
                SyncError::Auth(e.to_string())
            })?;

        persist_refresh_token(&self.refresh_token_file, &token.refresh_token).await;
        state.token = to_rspotify_token(token.access_token, token.expires_at);
        state.refresh_token = token.refresh_token;
        tracing::info!("Token refreshed successfully");
        Ok(())
    }
}

#[async_trait]
impl TokenProvider for OAuthTokenProvider {
    async fn get_valid_token(&self) -> Result<Token, SyncError> {
        {
            let state = self.state.read().await;
            if !needs_refresh(&state.token, Utc::now()) {
                return Ok(state.token.clone());
            }
        }

        let mut state = self.state.write().await;
        // Another task may have refreshed while we waited for the lock.
        if needs_refresh(&state.token, Utc::now()) {
            self.refresh(&mut state).await?;
        }
        Ok(state.token.clone())
    }
}
