//! Terminal output: one line per noteworthy sync event

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::events::{CycleSummary, SyncEvent};
use crate::model::PlayedTrack;

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let (hours, minutes, seconds) = (total_seconds / 3600, total_seconds / 60 % 60, total_seconds % 60);
    match (hours, minutes, seconds) {
        (0, 0, s) => format!("{s}s"),
        (0, m, 0) => format!("{m}m"),
        (0, m, s) => format!("{m}m {s}s"),
        (h, 0, _) => format!("{h}h"),
        (h, m, _) => format!("{h}h {m}m"),
    }
}

/// `M:SS`, or `H:MM:SS` for tracks of an hour or more
pub fn format_track_length(duration_ms: u64) -> String {
    let total_seconds = (duration_ms + 500) / 1000;
    let (hours, minutes, seconds) = (total_seconds / 3600, total_seconds / 60 % 60, total_seconds % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

/// Largest whole unit elapsed since `then`, e.g. `3 hours ago`.
pub fn format_time_since(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    const UNITS: [(u64, &str); 5] = [
        (365 * 86400, "year"),
        (30 * 86400, "month"),
        (86400, "day"),
        (3600, "hour"),
        (60, "minute"),
    ];
    let elapsed = (now - then).num_seconds().max(0) as u64;
    let (value, unit) = UNITS
        .iter()
        .find(|(scale, _)| elapsed >= *scale)
        .map_or((elapsed, "second"), |(scale, unit)| (elapsed / scale, *unit));
    let plural = if value == 1 { "" } else { "s" };
    format!("{value} {unit}{plural} ago")
}

/// One line per play, newest first, marking tracks in Liked Songs.
pub fn render_played(played: &[PlayedTrack], liked: &[bool], now: DateTime<Utc>) -> Vec<String> {
    played
        .iter()
        .enumerate()
        .map(|(i, play)| {
            let heart = if liked.get(i).copied().unwrap_or(false) { "♥" } else { "♡" };
            format!(
                "{:>16}  {heart} {} - {} [{}] {}",
                format_time_since(play.played_at, now),
                play.track.title,
                play.track.artists.join(", "),
                play.album,
                format_track_length(play.track.duration_ms),
            )
        })
        .collect()
}

fn format_summary(summary: &CycleSummary) -> String {
    let mut line = format!("+{} -{}", summary.added, summary.removed);
    if summary.moved > 0 {
        line.push_str(&format!(" ~{}", summary.moved));
    }
    if summary.failed > 0 {
        line.push_str(&format!(", {} failed", summary.failed));
    }
    if summary.deferred > 0 {
        line.push_str(&format!(", {} deferred", summary.deferred));
    }
    line
}

/// The line shown for `event`, if any.
pub fn render(event: &SyncEvent) -> Option<String> {
    match event {
        SyncEvent::CycleFinished { summary, .. } if summary.is_empty() => None,
        SyncEvent::CycleFinished { task, cycle, summary } => {
            Some(format!("[{task}] cycle {cycle}: {}", format_summary(summary)))
        }
        SyncEvent::CycleAbandoned { task, cycle, reason } => {
            Some(format!("[{task}] cycle {cycle} abandoned: {reason}"))
        }
        SyncEvent::SchedulerBackoff { task, failures, delay } => Some(format!(
            "[{task}] {failures} failed cycle(s) in a row, next attempt in {}",
            format_duration(*delay)
        )),
        SyncEvent::PlaylistRemoved { name, .. } => Some(format!("Removed empty playlist \"{name}\"")),
        SyncEvent::TrackSkipped { title, .. } => Some(format!("Skipped \"{title}\", it is already liked")),
        SyncEvent::CycleStarted { .. } | SyncEvent::OperationApplied { .. } => None,
    }
}

/// Print events until every sender is gone.
pub async fn present(mut events: broadcast::Receiver<SyncEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(line) = render(&event) {
                    println!("{line}");
                }
            }
            Err(RecvError::Lagged(missed)) => tracing::warn!(missed, "Terminal output fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}
