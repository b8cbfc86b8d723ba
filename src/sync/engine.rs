//! # Reconciliation Engine
//!
//! Mirrors a source collection into a target playlist, one cycle at a time.
//!
//! ```text
//! FetchingRemote → FetchingLocal → Diffing → Applying → Committing → Done
//!        └──────────────┴─────────────┴──────────┴───────────┴──────→ Aborted
//! ```
//!
//! The snapshot written in `Committing` records the remote set as observed,
//! even when some operations failed. Those operations are stored with it and
//! retried by the next cycle if they still make sense.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::paginator::{Listing, Paginator};
use super::scheduler::CycleRunner;
use crate::config::{JobConfig, SyncSettings};
use crate::error::{Result, SyncError};
use crate::events::{CycleSummary, EventBus, OperationOutcome, SyncEvent};
use crate::model::{OperationKind, PendingOperation, Snapshot, SnapshotStore, SpotifyClient, TrackItem, TrackRef};

// ============================================================================
// Cycle state machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    FetchingRemote,
    FetchingLocal,
    Diffing,
    Applying,
    Committing,
    Done,
    Aborted,
}

impl CycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleState::FetchingRemote => "fetching_remote",
            CycleState::FetchingLocal => "fetching_local",
            CycleState::Diffing => "diffing",
            CycleState::Applying => "applying",
            CycleState::Committing => "committing",
            CycleState::Done => "done",
            CycleState::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CycleState::Done | CycleState::Aborted)
    }

    pub fn can_transition_to(&self, next: CycleState) -> bool {
        use CycleState::*;
        match (self, next) {
            (Done | Aborted, _) => false,
            (_, Aborted) => true,
            (FetchingRemote, FetchingLocal)
            | (FetchingLocal, Diffing)
            | (Diffing, Applying)
            | (Applying, Committing)
            | (Committing, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct CycleTracker<'a> {
    job: &'a str,
    cycle: u64,
    state: CycleState,
}

impl<'a> CycleTracker<'a> {
    fn new(job: &'a str, cycle: u64) -> Self {
        Self {
            job,
            cycle,
            state: CycleState::FetchingRemote,
        }
    }

    fn advance(&mut self, next: CycleState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(SyncError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!(job = self.job, cycle = self.cycle, from = %self.state, to = %next, "Cycle transition");
        self.state = next;
        Ok(())
    }

    fn abort(&mut self, error: &SyncError) {
        if !self.state.is_terminal() {
            tracing::warn!(job = self.job, cycle = self.cycle, state = %self.state, error = %error, "Cycle aborted");
            self.state = CycleState::Aborted;
        }
    }
}

// ============================================================================
// Diffing
// ============================================================================

/// Set difference by remote ID, in listing order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    pub to_add: Vec<TrackRef>,
    pub to_remove: Vec<TrackRef>,
}

pub fn diff(remote: &[TrackRef], local: &[TrackRef]) -> Delta {
    let remote_ids: HashSet<&str> = remote.iter().map(|track| track.id.as_str()).collect();
    let local_ids: HashSet<&str> = local.iter().map(|track| track.id.as_str()).collect();
    Delta {
        to_add: remote
            .iter()
            .filter(|track| !local_ids.contains(track.id.as_str()))
            .cloned()
            .collect(),
        to_remove: local
            .iter()
            .filter(|track| !remote_ids.contains(track.id.as_str()))
            .cloned()
            .collect(),
    }
}

/// Operations for this cycle: the fresh delta plus carried-over operations
/// that still agree with `remote`, deduplicated by identity, removals first.
pub fn plan(target: &str, remote: &[TrackRef], local: &[TrackRef], carried: &[PendingOperation]) -> Vec<PendingOperation> {
    let delta = diff(remote, local);
    let remote_ids: HashSet<&str> = remote.iter().map(|track| track.id.as_str()).collect();

    let still_wanted = carried
        .iter()
        .filter(|op| op.target == target)
        .filter(|op| match op.kind {
            OperationKind::Add => remote_ids.contains(op.track.id.as_str()),
            OperationKind::Remove => !remote_ids.contains(op.track.id.as_str()),
            OperationKind::Move { .. } => false,
        })
        .cloned();

    let mut seen = HashSet::new();
    let mut operations: Vec<PendingOperation> = delta
        .to_remove
        .into_iter()
        .map(|track| PendingOperation::remove(target, track))
        .chain(delta.to_add.into_iter().map(|track| PendingOperation::add(target, track)))
        .chain(still_wanted)
        .filter(|op| seen.insert(op.id.clone()))
        .collect();
    operations.sort_by_key(|op| op.kind == OperationKind::Add);
    operations
}

/// Position of every ID in `remote`; the first occurrence wins.
fn ranks(remote: &[TrackRef]) -> HashMap<&str, usize> {
    let mut ranks = HashMap::with_capacity(remote.len());
    for (index, track) in remote.iter().enumerate() {
        ranks.entry(track.id.as_str()).or_insert(index);
    }
    ranks
}

/// Tracks of a playlist layout, first occurrence of each ID.
fn present_tracks(layout: &[Option<TrackRef>]) -> Vec<TrackRef> {
    let mut seen = HashSet::new();
    layout
        .iter()
        .flatten()
        .filter(|track| seen.insert(track.id.as_str()))
        .cloned()
        .collect()
}

/// Additions inserted together, starting at `position`
#[derive(Debug, Clone, PartialEq)]
pub struct InsertBatch {
    pub position: usize,
    pub operations: Vec<PendingOperation>,
}

/// Group `adds` into inserts that place each new track right after the
/// target items that precede it in `remote`.
///
/// `layout` is the target when the inserts start, one slot per raw item,
/// `None` for items that are not tracks. Each position assumes every earlier
/// batch was inserted.
pub fn plan_inserts(
    remote: &[TrackRef],
    layout: &[Option<TrackRef>],
    mut adds: Vec<PendingOperation>,
    max_batch: usize,
) -> Vec<InsertBatch> {
    let ranks = ranks(remote);
    let rank_of = |track: &TrackRef| ranks.get(track.id.as_str()).copied().unwrap_or(usize::MAX);

    // (rank, raw index) of placed tracks, and the slot after the furthest of
    // them seen so far in rank order.
    let mut placed: Vec<(usize, usize)> = layout
        .iter()
        .enumerate()
        .filter_map(|(index, slot)| Some((*ranks.get(slot.as_ref()?.id.as_str())?, index)))
        .collect();
    placed.sort_unstable();
    let reach: Vec<usize> = placed
        .iter()
        .scan(0, |furthest, &(_, index)| {
            *furthest = (*furthest).max(index + 1);
            Some(*furthest)
        })
        .collect();
    let anchor = |rank: usize| match placed.partition_point(|&(placed_rank, _)| placed_rank < rank) {
        0 => 0,
        n => reach[n - 1],
    };

    adds.sort_by_key(|op| rank_of(&op.track));
    let mut batches: Vec<(usize, InsertBatch)> = Vec::new();
    for (inserted, op) in adds.into_iter().enumerate() {
        let at = anchor(rank_of(&op.track));
        match batches.last_mut() {
            Some((batch_anchor, batch)) if *batch_anchor == at && batch.operations.len() < max_batch => {
                batch.operations.push(op);
            }
            _ => batches.push((
                at,
                InsertBatch {
                    position: at + inserted,
                    operations: vec![op],
                },
            )),
        }
    }
    batches.into_iter().map(|(_, batch)| batch).collect()
}

/// Moves that turn `current` into `remote` order, as a sequence of single
/// item reorders at raw positions. Slots absent from `remote`, non-track
/// items included, keep their relative order at the end.
pub fn plan_moves(target: &str, remote: &[TrackRef], current: &[Option<TrackRef>]) -> Vec<PendingOperation> {
    let ranks = ranks(remote);
    let rank_of = |slot: usize| {
        current[slot]
            .as_ref()
            .and_then(|track| ranks.get(track.id.as_str()).copied())
            .unwrap_or(usize::MAX)
    };
    let mut desired: Vec<usize> = (0..current.len()).collect();
    desired.sort_by_key(|&slot| rank_of(slot));

    let mut working: Vec<usize> = (0..current.len()).collect();
    let mut moves = Vec::new();
    for (to, &wanted) in desired.iter().enumerate() {
        if working[to] == wanted {
            continue;
        }
        let (Some(offset), Some(track)) = (working[to..].iter().position(|&slot| slot == wanted), &current[wanted])
        else {
            continue;
        };
        let from = to + offset;
        working.remove(from);
        working.insert(to, wanted);
        moves.push(PendingOperation::new(OperationKind::Move { from, to }, target, track.clone()));
    }
    moves
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Applied,
    Failed(SyncError),
    /// Not attempted: shutdown or an exhausted rate-limit budget
    Deferred,
}

/// What a mirror job synchronizes
#[derive(Debug, Clone, PartialEq)]
pub struct SyncJob {
    pub name: String,
    pub source: Listing,
    pub target: String,
    pub reorder: bool,
    pub seed_from_target: bool,
}

impl From<&JobConfig> for SyncJob {
    fn from(config: &JobConfig) -> Self {
        Self {
            name: config.name.clone(),
            source: Listing::from(&config.source),
            target: config.target_playlist_id.clone(),
            reorder: config.reorder,
            seed_from_target: config.seed_from_target,
        }
    }
}

pub struct ReconciliationEngine {
    job: SyncJob,
    client: SpotifyClient,
    store: SnapshotStore,
    events: EventBus,
    settings: SyncSettings,
    cache_file: Option<PathBuf>,
}

impl ReconciliationEngine {
    pub fn new(job: SyncJob, client: SpotifyClient, store: SnapshotStore, events: EventBus, settings: SyncSettings) -> Self {
        Self {
            job,
            client,
            store,
            events,
            settings,
            cache_file: None,
        }
    }

    /// Save the response cache to `path` after every commit.
    pub fn with_cache_file(mut self, path: PathBuf) -> Self {
        self.cache_file = Some(path);
        self
    }

    fn paginator(&self, listing: Listing, shutdown: &CancellationToken) -> Paginator<TrackItem> {
        Paginator::new(self.client.clone(), listing, self.settings.page_size, shutdown.clone())
    }

    fn target_listing(&self) -> Listing {
        Listing::PlaylistTracks(self.job.target.clone())
    }

    /// Run one full cycle.
    ///
    /// Errors before `Committing` leave the snapshot as it was. An exhausted
    /// rate-limit budget while applying still commits the progress made, then
    /// fails the cycle so the scheduler backs off.
    pub async fn reconcile(&self, cycle: u64, shutdown: &CancellationToken) -> Result<CycleSummary> {
        let mut tracker = CycleTracker::new(&self.job.name, cycle);
        match self.run_phases(&mut tracker, shutdown).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                tracker.abort(&e);
                Err(e)
            }
        }
    }

    async fn run_phases(&self, tracker: &mut CycleTracker<'_>, shutdown: &CancellationToken) -> Result<CycleSummary> {
        let job = self.job.name.as_str();
        let source = self.job.source.endpoint();

        let remote = self.paginator(self.job.source.clone(), shutdown).collect_tracks().await?;
        tracing::debug!(job, tracks = remote.len(), "Fetched remote state");

        tracker.advance(CycleState::FetchingLocal)?;
        let stored = match self.store.load().await? {
            Some(snapshot) if snapshot.describes(&source, &self.job.target) => Some(snapshot),
            Some(snapshot) => {
                tracing::info!(
                    job,
                    snapshot_source = %snapshot.source,
                    snapshot_target = %snapshot.target,
                    "Snapshot was taken for another source or target, starting over"
                );
                None
            }
            None => None,
        };

        let mut layout = None;
        let (previous, local) = match stored {
            Some(snapshot) => {
                let local = snapshot.tracks.clone();
                (snapshot, local)
            }
            None if self.job.seed_from_target => {
                let slots = self.paginator(self.target_listing(), shutdown).collect_slots().await?;
                let local = present_tracks(&slots);
                tracing::info!(job, tracks = local.len(), "No snapshot yet, seeding from the target playlist");
                layout = Some(slots);
                (Snapshot::initial(source, self.job.target.clone()), local)
            }
            None => (Snapshot::initial(source, self.job.target.clone()), Vec::new()),
        };

        tracker.advance(CycleState::Diffing)?;
        let mut operations = plan(&self.job.target, &remote, &local, &previous.unapplied);
        if operations.iter().any(|op| op.kind == OperationKind::Add) {
            // An add that failed after reaching the server must not duplicate
            // the track, so adds are checked against the target itself.
            let slots = match layout.take() {
                Some(slots) => slots,
                None => self.paginator(self.target_listing(), shutdown).collect_slots().await?,
            };
            let present: HashSet<&str> = slots.iter().flatten().map(|track| track.id.as_str()).collect();
            operations.retain(|op| {
                let redundant = op.kind == OperationKind::Add && present.contains(op.track.id.as_str());
                if redundant {
                    tracing::debug!(job, op = %op.id, "Track already in the target, dropping its add");
                }
                !redundant
            });
            layout = Some(slots);
        }
        tracing::info!(job, cycle = tracker.cycle, operations = operations.len(), "Planned operations");

        tracker.advance(CycleState::Applying)?;
        let mut outcomes = self
            .apply(operations, &remote, layout.unwrap_or_default(), shutdown)
            .await;
        let clean = outcomes.iter().all(|(_, outcome)| *outcome == Outcome::Applied);
        if self.job.reorder && clean {
            outcomes.extend(self.reorder(&remote, shutdown).await);
        }
        let exhausted = outcomes.iter().find_map(|(_, outcome)| match outcome {
            Outcome::Failed(e @ SyncError::RateLimitExhausted { .. }) => Some(e.clone()),
            _ => None,
        });

        let mut summary = CycleSummary::default();
        for (op, outcome) in &outcomes {
            match outcome {
                Outcome::Applied => match op.kind {
                    OperationKind::Add => summary.added += 1,
                    OperationKind::Remove => summary.removed += 1,
                    OperationKind::Move { .. } => summary.moved += 1,
                },
                Outcome::Failed(e) => {
                    summary.failed += 1;
                    tracing::warn!(job, op = %op.id, error = %e, "Operation failed");
                }
                Outcome::Deferred => summary.deferred += 1,
            }
            let event_outcome = match outcome {
                Outcome::Applied => OperationOutcome::Applied,
                Outcome::Failed(e) => OperationOutcome::Failed(e.to_string()),
                Outcome::Deferred => continue,
            };
            self.events.emit(SyncEvent::OperationApplied {
                task: job.to_string(),
                op: op.id.clone(),
                outcome: event_outcome,
            });
        }

        tracker.advance(CycleState::Committing)?;
        let unapplied: Vec<PendingOperation> = outcomes
            .into_iter()
            .filter(|(op, outcome)| *outcome != Outcome::Applied && !matches!(op.kind, OperationKind::Move { .. }))
            .map(|(op, _)| op)
            .collect();
        let snapshot = previous.supersede(remote, unapplied, self.client.now());
        self.store.save(&snapshot).await?;
        self.persist_cache().await;

        if let Some(e) = exhausted {
            tracing::warn!(
                job,
                version = snapshot.version,
                unapplied = snapshot.unapplied.len(),
                "Committed partial progress before giving up on the rate limit"
            );
            return Err(e);
        }
        tracker.advance(CycleState::Done)?;
        Ok(summary)
    }

    /// Removals run as concurrent batches. Additions follow one batch at a
    /// time, since every insert shifts the positions after it.
    async fn apply(
        &self,
        operations: Vec<PendingOperation>,
        remote: &[TrackRef],
        mut layout: Vec<Option<TrackRef>>,
        shutdown: &CancellationToken,
    ) -> Vec<(PendingOperation, Outcome)> {
        let mut outcomes = Vec::with_capacity(operations.len());
        let halted = AtomicBool::new(false);
        let (mut removals, mut additions) = (Vec::new(), Vec::new());
        for op in operations {
            if let Err(e) = op.track.uri() {
                outcomes.push((op, Outcome::Failed(e)));
            } else if op.kind == OperationKind::Remove {
                removals.push(op);
            } else {
                additions.push(op);
            }
        }

        let mut batches = Vec::new();
        let mut removals = removals.into_iter().peekable();
        while removals.peek().is_some() {
            batches.push(removals.by_ref().take(self.settings.max_batch).collect::<Vec<_>>());
        }
        let removed: Vec<_> = futures::stream::iter(batches)
            .map(|batch| self.apply_batch(OperationKind::Remove, batch, None, shutdown, &halted))
            .buffer_unordered(self.settings.max_concurrent_requests)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect();

        let gone: HashSet<&str> = removed
            .iter()
            .filter(|(_, outcome)| *outcome == Outcome::Applied)
            .map(|(op, _)| op.track.id.as_str())
            .collect();
        layout.retain(|slot| slot.as_ref().is_none_or(|track| !gone.contains(track.id.as_str())));
        outcomes.extend(removed);

        let mut missing = 0;
        for batch in plan_inserts(remote, &layout, additions, self.settings.max_batch) {
            let size = batch.operations.len();
            let position = batch.position.saturating_sub(missing);
            let results = self
                .apply_batch(OperationKind::Add, batch.operations, Some(position), shutdown, &halted)
                .await;
            if results.iter().any(|(_, outcome)| *outcome != Outcome::Applied) {
                missing += size;
            }
            outcomes.extend(results);
        }
        outcomes
    }

    async fn apply_batch(
        &self,
        kind: OperationKind,
        batch: Vec<PendingOperation>,
        position: Option<usize>,
        shutdown: &CancellationToken,
        halted: &AtomicBool,
    ) -> Vec<(PendingOperation, Outcome)> {
        if shutdown.is_cancelled() || halted.load(Ordering::Relaxed) {
            return batch.into_iter().map(|op| (op, Outcome::Deferred)).collect();
        }

        let send = async {
            let uris = batch.iter().map(|op| op.track.uri()).collect::<Result<Vec<_>>>()?;
            match kind {
                OperationKind::Remove => self.client.playlist_remove_items(&self.job.target, &uris).await,
                _ => self.client.playlist_add_items(&self.job.target, &uris, position).await,
            }
        };

        let outcome = match send.await {
            Ok(()) => {
                tracing::debug!(job = %self.job.name, op = kind.as_str(), items = batch.len(), ?position, "Batch applied");
                Outcome::Applied
            }
            Err(SyncError::Cancelled) => Outcome::Deferred,
            Err(e) => {
                if matches!(e, SyncError::RateLimitExhausted { .. }) {
                    tracing::warn!(job = %self.job.name, "Rate limit budget exhausted, deferring the remaining operations");
                    halted.store(true, Ordering::Relaxed);
                }
                Outcome::Failed(e)
            }
        };
        batch.into_iter().map(|op| (op, outcome.clone())).collect()
    }

    /// Re-read the target and move items until it follows the source order.
    /// Moves depend on each other, so they run one at a time and stop at the
    /// first failure.
    async fn reorder(&self, remote: &[TrackRef], shutdown: &CancellationToken) -> Vec<(PendingOperation, Outcome)> {
        let current = match self.paginator(self.target_listing(), shutdown).collect_slots().await {
            Ok(current) => current,
            Err(e) => {
                tracing::warn!(job = %self.job.name, error = %e, "Skipping reorder, target could not be read");
                return Vec::new();
            }
        };

        let mut outcomes = Vec::new();
        for op in plan_moves(&self.job.target, remote, &current) {
            let OperationKind::Move { from, to } = op.kind else {
                continue;
            };
            if shutdown.is_cancelled() {
                break;
            }
            match self.client.playlist_reorder_item(&self.job.target, from, to).await {
                Ok(()) => outcomes.push((op, Outcome::Applied)),
                Err(e) => {
                    outcomes.push((op, Outcome::Failed(e)));
                    break;
                }
            }
        }
        outcomes
    }

    async fn persist_cache(&self) {
        let (Some(cache), Some(path)) = (self.client.cache(), &self.cache_file) else {
            return;
        };
        cache.prune(self.client.now());
        if let Err(e) = cache.save_to_disk(path).await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to save response cache");
        }
    }
}

#[async_trait]
impl CycleRunner for ReconciliationEngine {
    fn name(&self) -> &str {
        &self.job.name
    }

    async fn run_cycle(&self, cycle: u64, shutdown: &CancellationToken) -> Result<CycleSummary> {
        self.reconcile(cycle, shutdown).await
    }
}
