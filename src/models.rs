use serde::Serialize;
use std::collections::HashMap;

/// Sync queue statistics
#[derive(Debug, Serialize)]
pub struct QueueStats {
    pub pending_count: i64,
    pub failed_count: i64,
    pub sent_count: i64,
    pub pending_by_operation: HashMap<String, i64>,
}

/// A task that exhausted its retries
#[derive(Debug, Serialize)]
pub struct FailedTaskInfo {
    pub id: i64,
    pub operation: String,
    pub attempt_count: u32,
    pub created_at: i64,
    pub error_message: Option<String>,
}

/// Token refresh result
#[derive(Debug, Clone)]
pub struct TokenRefreshResult {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// What the UI shows about synchronization lag.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub pending_count: i64,
    pub failed_count: i64,
    pub is_online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<i64>,
    /// Last pass hit a 401 it could not recover from.
    pub auth_degraded: bool,
    /// Refresh credential rejected; user must log in again.
    pub reauth_required: bool,
    /// Tasks rejected by admission control since install.
    pub dropped_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_drop_reason: Option<String>,
    /// A committed timer transition whose outbox write failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_enqueue_error: Option<String>,
}
