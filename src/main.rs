mod auth;
mod cli;
mod config;
mod error;
mod events;
mod http;
mod logging;
mod model;
mod sync;
mod view;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use rspotify::{AuthCodeSpotify, Config as RspotifyConfig, Token, clients::OAuthClient};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use auth::{OAuthTokenProvider, TokenProvider};
use cli::{Cli, Command};
use config::{AppPaths, Config};
use events::EventBus;
use http::ReqwestTransport;
use model::{ResponseCache, SnapshotStore, SpotifyClient};
use sync::{
    Clock, CycleRunner, LikedSongSkipper, PlaylistCleanup, RateLimitGovernor, ReconciliationEngine, RetryPolicy,
    SchedulerContext, SchedulerLoop, SyncJob, SystemClock, Ticker,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = ?e, "spotils failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    let command = Cli::parse().into_command();

    let paths = AppPaths::platform()?;
    let config = config::load(&paths)?;
    let _log_guard = match logging::init_logging(&paths.log_dir(), &config.log.level) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: Failed to initialize logging: {e}");
            None
        }
    };
    tracing::info!("=== spotils {} starting ===", env!("CARGO_PKG_VERSION"));

    if let Command::Reset { job } = &command {
        return reset(&config, &paths, job).await;
    }

    let tokens = Arc::new(OAuthTokenProvider::authorize(&config.spotify, paths.refresh_token_file()).await?);
    verify_account(tokens.get_valid_token().await?).await?;

    let shutdown = CancellationToken::new();
    let events = EventBus::default();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let client = build_client(&config, &paths, tokens, clock.clone(), &shutdown).await?;

    if let Command::Recent { limit } = command {
        recent(&client, limit).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let tasks = build_tasks(&config, &paths, &client, &events);
    if tasks.is_empty() {
        println!("Nothing to do: no enabled jobs in {}", paths.config_file.display());
        return Ok(ExitCode::SUCCESS);
    }

    let presenter = tokio::spawn(view::present(events.subscribe()));
    let code = match command {
        Command::Sync => sync_once(tasks, &config, clock, events, &shutdown).await,
        _ => run_forever(tasks, &config, clock, events, &shutdown).await,
    };
    let _ = presenter.await;

    tracing::info!("spotils shutting down");
    Ok(code)
}

/// Check the token against the account endpoint before starting any task.
async fn verify_account(token: Token) -> Result<()> {
    let spotify = AuthCodeSpotify::with_config(
        Default::default(),
        Default::default(),
        RspotifyConfig {
            token_cached: false,
            token_refreshing: false,
            ..Default::default()
        },
    );
    *spotify
        .token
        .lock()
        .await
        .map_err(|_| anyhow!("rspotify token lock poisoned"))? = Some(token);

    let user = spotify.me().await.context("rspotify authorization failed")?;
    tracing::info!(user_id = %user.id, "Authorized");
    Ok(())
}

async fn build_client(
    config: &Config,
    paths: &AppPaths,
    tokens: Arc<dyn TokenProvider>,
    clock: Arc<dyn Clock>,
    shutdown: &CancellationToken,
) -> Result<SpotifyClient> {
    let transport = Arc::new(ReqwestTransport::new(http::SPOTIFY_API_BASE, HTTP_TIMEOUT)?);
    let governor = RateLimitGovernor::new(
        transport,
        tokens,
        clock,
        RetryPolicy::from(&config.retry),
        shutdown.clone(),
    );

    let cache = if config.cache.enabled {
        let ttl = chrono::Duration::seconds(config.cache.default_ttl_secs.min(i64::MAX as u64) as i64);
        let cache = ResponseCache::new(ttl, config.cache.max_entries);
        if let Err(e) = cache.load_from_disk(&paths.http_cache_file()).await {
            tracing::warn!(error = %e, "Ignoring unreadable response cache");
        }
        Some(cache)
    } else {
        None
    };
    Ok(SpotifyClient::new(governor, cache))
}

/// Every enabled task with its interval.
fn build_tasks(
    config: &Config,
    paths: &AppPaths,
    client: &SpotifyClient,
    events: &EventBus,
) -> Vec<(Arc<dyn CycleRunner>, Duration)> {
    let mut tasks: Vec<(Arc<dyn CycleRunner>, Duration)> = config
        .jobs
        .iter()
        .filter(|job| job.enabled)
        .map(|job| {
            let engine = ReconciliationEngine::new(
                SyncJob::from(job),
                client.clone(),
                SnapshotStore::new(paths.snapshot_file(&job.name)),
                events.clone(),
                config.sync.clone(),
            )
            .with_cache_file(paths.http_cache_file());
            (Arc::new(engine) as Arc<dyn CycleRunner>, job.interval)
        })
        .collect();

    if config.cleanup.enabled {
        let cleanup = PlaylistCleanup::new(client.clone(), events.clone(), config.sync.page_size);
        tasks.push((Arc::new(cleanup), config.cleanup.interval));
    }
    if config.skip_liked.enabled {
        let skipper = LikedSongSkipper::new(client.clone(), events.clone());
        tasks.push((Arc::new(skipper), config.skip_liked.interval));
    }
    tasks
}

fn scheduler(runner: Arc<dyn CycleRunner>, config: &Config, clock: &Arc<dyn Clock>, events: &EventBus) -> SchedulerLoop {
    SchedulerLoop::new(runner, Ticker::new(clock.clone()), events.clone(), config.sync.cycle_deadline)
}

/// `spotils sync`: one cycle per task, in order.
async fn sync_once(
    tasks: Vec<(Arc<dyn CycleRunner>, Duration)>,
    config: &Config,
    clock: Arc<dyn Clock>,
    events: EventBus,
    shutdown: &CancellationToken,
) -> ExitCode {
    let mut code = ExitCode::SUCCESS;
    for (runner, _) in tasks {
        if let Err(e) = scheduler(runner, config, &clock, &events).run_once(1, shutdown).await {
            if e.is_fatal() {
                tracing::error!(error = %e, "Stopping after a storage failure");
                code = ExitCode::FAILURE;
                break;
            }
        }
    }
    code
}

/// `spotils run`: every task on its own schedule until Ctrl-C or a storage
/// failure.
async fn run_forever(
    tasks: Vec<(Arc<dyn CycleRunner>, Duration)>,
    config: &Config,
    clock: Arc<dyn Clock>,
    events: EventBus,
    shutdown: &CancellationToken,
) -> ExitCode {
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested, finishing in-flight requests");
            ctrl_c.cancel();
        }
    });

    let mut set = JoinSet::new();
    for (runner, interval) in tasks {
        let scheduler = scheduler(runner, config, &clock, &events);
        let context = SchedulerContext::new(interval, config.sync.max_interval, clock.now());
        let shutdown = shutdown.clone();
        set.spawn(async move { scheduler.run(context, &shutdown).await });
    }
    drop(events);

    let mut code = ExitCode::SUCCESS;
    while let Some(joined) = set.join_next().await {
        let failure = match joined {
            Ok(Ok(_)) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("task panicked: {e}"),
        };
        tracing::error!(error = %failure, "Stopping every task");
        eprintln!("Error: {failure}");
        code = ExitCode::FAILURE;
        shutdown.cancel();
    }
    code
}

/// `spotils recent`
async fn recent(client: &SpotifyClient, limit: u32) -> Result<()> {
    let played = client.recently_played(limit).await?;
    if played.is_empty() {
        println!("Nothing played recently");
        return Ok(());
    }
    let ids: Vec<String> = played.iter().map(|play| play.track.id.clone()).collect();
    let liked = client.saved_tracks_contain(&ids).await?;
    println!("Recently played tracks, newest first:");
    for line in view::render_played(&played, &liked, chrono::Utc::now()) {
        println!("{line}");
    }
    Ok(())
}

/// `spotils reset <job>`
async fn reset(config: &Config, paths: &AppPaths, job: &str) -> Result<ExitCode> {
    if config.job(job).is_none() {
        return Err(anyhow!("no job named {job:?} in {}", paths.config_file.display()));
    }
    let store = SnapshotStore::new(paths.snapshot_file(job));
    if store.delete().await? {
        tracing::info!(job, "Snapshot deleted");
        println!("Deleted the snapshot of {job:?}; its next cycle starts from scratch");
    } else {
        println!("{job:?} has no snapshot");
    }
    Ok(ExitCode::SUCCESS)
}
