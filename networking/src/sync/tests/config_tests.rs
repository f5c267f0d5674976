use std::time::Duration;

use pretty_assertions::assert_eq;
use rstest::rstest;

use crate::sync::{MAX_BLOCKS, MIN_BLOCKS, SyncConfig, SyncState};

#[test]
fn test_default_config() {
    let config = SyncConfig::default();
    assert_eq!(config.min_blocks, MIN_BLOCKS);
    assert_eq!(config.max_blocks, MAX_BLOCKS);
    assert_eq!(config.max_retry, 3);
    assert_eq!(config.file_timeout, Duration::from_secs(120));
    assert!(config.validate().is_ok());
}

#[test]
fn test_partial_config_keeps_defaults() {
    let config: SyncConfig =
        serde_json::from_str(r#"{"network_id": 7, "chunk_timeout": 5, "sweep_interval": 250}"#)
            .expect("parse");

    assert_eq!(config.network_id, 7);
    assert_eq!(config.chunk_timeout, Duration::from_secs(5));
    assert_eq!(config.sweep_interval, Duration::from_millis(250));
    assert_eq!(config.min_blocks, MIN_BLOCKS);
}

#[test]
fn test_unknown_config_field_rejected() {
    assert!(serde_json::from_str::<SyncConfig>(r#"{"min_block": 1}"#).is_err());
}

#[rstest]
#[case(SyncConfig { min_blocks: 0, ..SyncConfig::default() })]
#[case(SyncConfig { max_blocks: 10, min_blocks: 20, ..SyncConfig::default() })]
#[case(SyncConfig { sweep_interval: Duration::ZERO, ..SyncConfig::default() })]
#[case(SyncConfig { false_positive_rate: 1.0, ..SyncConfig::default() })]
fn test_invalid_config(#[case] config: SyncConfig) {
    assert!(config.validate().is_err());
}

#[rstest]
#[case(SyncState::NotSyncing, SyncState::Syncing, true)]
#[case(SyncState::NotSyncing, SyncState::SyncDone, false)]
#[case(SyncState::Syncing, SyncState::SyncDone, true)]
#[case(SyncState::Syncing, SyncState::SyncError, true)]
#[case(SyncState::Syncing, SyncState::NotSyncing, false)]
#[case(SyncState::SyncError, SyncState::Syncing, true)]
#[case(SyncState::SyncDone, SyncState::Syncing, true)]
fn test_state_transitions(#[case] from: SyncState, #[case] to: SyncState, #[case] allowed: bool) {
    assert_eq!(from.can_transition_to(to), allowed);
}

#[test]
fn test_state_display_and_serde() {
    assert_eq!(SyncState::Syncing.to_string(), "Synchronising");
    assert_eq!(SyncState::default(), SyncState::NotSyncing);
    assert_eq!(
        serde_json::to_string(&SyncState::SyncError).expect("serialize"),
        "\"sync-error\""
    );
    assert!(SyncState::SyncDone.is_terminal());
    assert!(!SyncState::Syncing.is_terminal());
}
