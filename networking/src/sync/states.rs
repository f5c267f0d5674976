use std::fmt;

use serde::{Deserialize, Serialize};

/// Top-level phase of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncState {
    /// No sync has been started, or the node is already at the network head.
    #[default]
    NotSyncing,

    /// Missing ranges are being downloaded.
    Syncing,

    /// Every requested range was downloaded and delivered in order.
    SyncDone,

    /// A range could not be downloaded after exhausting retries or peers.
    SyncError,
}

impl SyncState {
    /// Check if a transition to the target state is expected.
    ///
    /// Terminal sync states may restart syncing when the network moves ahead;
    /// nothing moves back to `NotSyncing` except through an explicit reset.
    pub fn can_transition_to(&self, target: SyncState) -> bool {
        match self {
            SyncState::NotSyncing => matches!(target, SyncState::Syncing),
            SyncState::Syncing => matches!(target, SyncState::SyncDone | SyncState::SyncError),
            SyncState::SyncDone | SyncState::SyncError => {
                matches!(target, SyncState::Syncing | SyncState::NotSyncing)
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncState::SyncDone | SyncState::SyncError)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncState::NotSyncing => "Sync Not Start",
            SyncState::Syncing => "Synchronising",
            SyncState::SyncDone => "Sync done",
            SyncState::SyncError => "Sync error",
        })
    }
}
