use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phase reported on the status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    #[default]
    Initializing,
    Syncing,
    Completed,
    Failed,
}

/// Messages pushed to UI subscribers.
///
/// ```json
/// {"type":"sync-progress","percentage":40,"message":"...","phase":"syncing"}
/// {"type":"db-ready"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StatusMessage {
    SyncProgress {
        percentage: u8,
        message: String,
        phase: SyncPhase,
    },
    /// Sent once, the first time the mirror becomes queryable.
    DbReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Uninitialized,
    Bootstrapping,
    Steady,
    Degraded,
}

/// Point-in-time view of the coordinator, kept in a watch channel so
/// readers never wait on the writer task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStatus {
    pub state: SyncState,
    pub phase: SyncPhase,
    pub percentage: u8,
    pub message: String,
    pub db_ready: bool,
    pub cursor_sequence: u64,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    pub full_syncs: u64,
    pub batches_applied: u64,
    pub mutations_applied: u64,
    pub anomalies: u64,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_messages_use_ui_wire_names() {
        let progress = StatusMessage::SyncProgress {
            percentage: 40,
            message: "200/500 changes applied".into(),
            phase: SyncPhase::Syncing,
        };
        assert_eq!(
            serde_json::to_value(&progress).unwrap(),
            serde_json::json!({
                "type": "sync-progress",
                "percentage": 40,
                "message": "200/500 changes applied",
                "phase": "syncing"
            })
        );
        assert_eq!(
            serde_json::to_string(&StatusMessage::DbReady).unwrap(),
            r#"{"type":"db-ready"}"#
        );
    }
}
