//! Core type definitions shared by the sync engine

use std::fmt;

use rspotify::model::TrackId;
use rspotify::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// A track known to the remote service, keyed by its remote ID
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isrc: Option<String>,
    pub title: String,
    #[serde(default)]
    pub artists: Vec<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl TrackRef {
    #[cfg(test)]
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            isrc: None,
            title: title.into(),
            artists: Vec::new(),
            duration_ms: 0,
        }
    }

    /// `spotify:track:<id>`, validated through rspotify's ID parser.
    pub fn uri(&self) -> Result<String> {
        TrackId::from_id(self.id.as_str())
            .map(|id| id.uri())
            .map_err(|e| SyncError::permanent(400, format!("invalid track id {}: {}", self.id, e)))
    }
}

/// Position of the next page of a listing
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageCursor {
    pub offset: u32,
    /// Number of raw items fetched so far
    pub fetched: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Add,
    Remove,
    Move { from: usize, to: usize },
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Add => "add",
            OperationKind::Remove => "remove",
            OperationKind::Move { .. } => "move",
        }
    }
}

/// Deterministic identity of a pending operation
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(String);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A queued mutating request against a target playlist
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: OperationId,
    pub target: String,
    pub kind: OperationKind,
    pub track: TrackRef,
}

impl PendingOperation {
    pub fn new(kind: OperationKind, target: impl Into<String>, track: TrackRef) -> Self {
        let target = target.into();
        let id = match kind {
            OperationKind::Move { from, to } => {
                format!("move:{}:{}:{}>{}", target, track.id, from, to)
            }
            _ => format!("{}:{}:{}", kind.as_str(), target, track.id),
        };
        Self {
            id: OperationId(id),
            target,
            kind,
            track,
        }
    }

    pub fn add(target: impl Into<String>, track: TrackRef) -> Self {
        Self::new(OperationKind::Add, target, track)
    }

    pub fn remove(target: impl Into<String>, track: TrackRef) -> Self {
        Self::new(OperationKind::Remove, target, track)
    }
}
