use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Notify;
use uuid::Uuid;

use relay_core::dispatch::{
    Attachment, PayloadError, SubmitReceipt, TaskLease, TaskOutcome, TaskStatus, TerminalStatus,
    validate_attachments, validate_output,
};

use crate::config::{
    DispatchConfig, LEASE_SECONDS_MAX, LEASE_SECONDS_MIN, NEXT_LIMIT_MAX, NEXT_LIMIT_MIN,
    WAIT_SECONDS_MAX,
};
use crate::store::TaskStore;

/// Maximum length of a progress message.
pub const PROGRESS_MESSAGE_MAX_CHARS: usize = 500;

/// A task as stored: lifecycle state plus lease bookkeeping. The `version`
/// field drives the store's compare-and-swap; every mutation goes through
/// CAS so two workers can never hold the same lease.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub execution_id: Uuid,
    pub workspace_id: Uuid,
    pub canonical: String,
    pub payload: Value,
    pub status: TaskStatus,
    pub lease_id: Option<Uuid>,
    pub owner_client_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Total lease seconds ever granted to this task, across reclaims.
    pub cumulative_lease_seconds: u64,
    pub enqueued_at: DateTime<Utc>,
    pub progress_pct: Option<u8>,
    pub progress_message: Option<String>,
    pub outcome: Option<TaskOutcome>,
    pub version: u64,
}

impl TaskRecord {
    pub fn new_pending(workspace_id: Uuid, canonical: String, payload: Value) -> Self {
        Self {
            execution_id: Uuid::now_v7(),
            workspace_id,
            canonical,
            payload,
            status: TaskStatus::Pending,
            lease_id: None,
            owner_client_id: None,
            lease_expires_at: None,
            cumulative_lease_seconds: 0,
            enqueued_at: Utc::now(),
            progress_pct: None,
            progress_message: None,
            outcome: None,
            version: 0,
        }
    }

    fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        match self.lease_expires_at {
            Some(expires_at) => expires_at <= now,
            None => true,
        }
    }

    /// The lease token alone proves ownership (progress has no client_id
    /// on the wire); an expired lease proves nothing.
    fn holds_lease_token(&self, lease_id: Uuid, now: DateTime<Utc>) -> bool {
        self.lease_id == Some(lease_id) && !self.lease_expired(now)
    }

    fn holds_lease(&self, lease_id: Uuid, client_id: &str, now: DateTime<Utc>) -> bool {
        self.holds_lease_token(lease_id, now)
            && self.owner_client_id.as_deref() == Some(client_id)
    }

    fn leased_view(&self) -> Option<TaskLease> {
        Some(TaskLease {
            execution_id: self.execution_id,
            lease_id: self.lease_id?,
            workspace_id: self.workspace_id,
            capability: self.canonical.clone(),
            payload: self.payload.clone(),
            status: self.status,
            lease_expires_at: self.lease_expires_at?,
            cumulative_lease_seconds: self.cumulative_lease_seconds,
            progress_pct: self.progress_pct,
            progress_message: self.progress_message.clone(),
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("unknown execution id")]
    UnknownExecution,
    #[error("lease is not held by the caller")]
    LeaseNotHeld,
    #[error("cumulative lease ceiling of {ceiling_secs}s exceeded")]
    LeaseCeilingExceeded { ceiling_secs: u64 },
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] PayloadError),
}

/// The leased work queue: reserve → acknowledge → heartbeat → complete,
/// safe against client crashes and at-least-once retries.
///
/// Expiry is handled lazily — every operation revalidates
/// `lease_expires_at` before trusting `status`, and `maintain` reclaims
/// orphaned leases on each read path. No sweeper thread exists and none
/// is needed for correctness.
pub struct TaskDispatcher {
    store: Arc<dyn TaskStore>,
    notify: Notify,
    config: DispatchConfig,
}

impl TaskDispatcher {
    pub fn new(store: Arc<dyn TaskStore>, config: DispatchConfig) -> Self {
        Self {
            store,
            notify: Notify::new(),
            config,
        }
    }

    /// Backend-facing: adds a pending task and wakes long-pollers.
    pub fn enqueue(&self, workspace_id: Uuid, canonical: String, payload: Value) -> Uuid {
        let record = TaskRecord::new_pending(workspace_id, canonical, payload);
        let execution_id = record.execution_id;
        self.store.insert(record);
        self.notify.notify_waiters();
        tracing::info!(
            event = "task_enqueued",
            execution_id = %execution_id,
            workspace_id = %workspace_id,
            "task enqueued"
        );
        execution_id
    }

    /// Reserves up to `limit` pending tasks for `client_id`, blocking up
    /// to `wait_seconds` for work to arrive. Out-of-range parameters are
    /// clamped.
    ///
    /// Cancellation-safe: a caller that disconnects mid-wait has reserved
    /// nothing — reservation happens only through the store CAS after
    /// wake-up, never across an await point.
    pub async fn next(
        &self,
        workspace_id: Uuid,
        client_id: &str,
        limit: usize,
        lease_seconds: u64,
        wait_seconds: u64,
    ) -> Vec<TaskLease> {
        let limit = limit.clamp(NEXT_LIMIT_MIN, NEXT_LIMIT_MAX);
        let lease_seconds = lease_seconds.clamp(LEASE_SECONDS_MIN, LEASE_SECONDS_MAX);
        let wait_seconds = wait_seconds.min(WAIT_SECONDS_MAX);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(wait_seconds);

        loop {
            // Register for wake-ups before scanning, so an enqueue between
            // the scan and the await is never missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);

            let reserved = self.try_reserve(workspace_id, client_id, limit, lease_seconds);
            if !reserved.is_empty() {
                return reserved;
            }
            if tokio::time::Instant::now() >= deadline {
                return Vec::new();
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Vec::new(),
            }
        }
    }

    fn try_reserve(
        &self,
        workspace_id: Uuid,
        client_id: &str,
        limit: usize,
        lease_seconds: u64,
    ) -> Vec<TaskLease> {
        let now = Utc::now();
        self.maintain(now);

        let mut candidates: Vec<TaskRecord> = self
            .store
            .list()
            .into_iter()
            .filter(|record| {
                record.workspace_id == workspace_id && record.status == TaskStatus::Pending
            })
            .collect();
        candidates.sort_by_key(|record| record.enqueued_at);

        let mut reserved = Vec::new();
        for mut record in candidates {
            if reserved.len() >= limit {
                break;
            }
            let expected = record.version;
            record.status = TaskStatus::Reserved;
            record.lease_id = Some(Uuid::now_v7());
            record.owner_client_id = Some(client_id.to_string());
            record.lease_expires_at = Some(now + chrono::Duration::seconds(lease_seconds as i64));
            record.cumulative_lease_seconds += lease_seconds;
            // A concurrent `next` may win this record; CAS failure means
            // it is simply not ours.
            if self.store.compare_and_swap(expected, record.clone()) {
                if let Some(view) = record.leased_view() {
                    reserved.push(view);
                }
            }
        }
        if !reserved.is_empty() {
            tracing::debug!(
                event = "tasks_reserved",
                client_id,
                count = reserved.len()
            );
        }
        reserved
    }

    /// Acknowledges a reservation, extending the lease to the long ack
    /// window. Idempotent: a repeat with the same still-valid lease is a
    /// no-op that reports current lease state.
    pub fn ack(
        &self,
        execution_id: Uuid,
        lease_id: Uuid,
        client_id: &str,
    ) -> Result<TaskLease, DispatchError> {
        loop {
            let now = Utc::now();
            let record = self
                .store
                .get(&execution_id)
                .ok_or(DispatchError::UnknownExecution)?;
            if record.status.is_terminal() || !record.holds_lease(lease_id, client_id, now) {
                return Err(DispatchError::LeaseNotHeld);
            }
            if matches!(
                record.status,
                TaskStatus::Acknowledged | TaskStatus::InProgress
            ) {
                return record.leased_view().ok_or(DispatchError::LeaseNotHeld);
            }
            // The ceiling bounds every extension, not just heartbeats;
            // a task stuck in a reclaim/re-ack loop terminates too. The
            // short reservation lease stays usable for submit_result.
            let grant = self.config.ack_lease_secs;
            if record.cumulative_lease_seconds + grant > self.config.lease_ceiling_secs {
                return Err(DispatchError::LeaseCeilingExceeded {
                    ceiling_secs: self.config.lease_ceiling_secs,
                });
            }

            let expected = record.version;
            let mut updated = record;
            updated.status = TaskStatus::Acknowledged;
            updated.lease_expires_at = Some(now + chrono::Duration::seconds(grant as i64));
            updated.cumulative_lease_seconds += grant;
            if self.store.compare_and_swap(expected, updated.clone()) {
                return updated.leased_view().ok_or(DispatchError::LeaseNotHeld);
            }
        }
    }

    /// Heartbeat: resets the lease timer and records progress. Rejected
    /// once the cumulative lease grant would cross the hard ceiling, so
    /// even a runaway task terminates eventually.
    pub fn progress(
        &self,
        execution_id: Uuid,
        lease_id: Uuid,
        pct: Option<u8>,
        message: Option<String>,
    ) -> Result<TaskLease, DispatchError> {
        loop {
            let now = Utc::now();
            let record = self
                .store
                .get(&execution_id)
                .ok_or(DispatchError::UnknownExecution)?;
            if record.status.is_terminal() || !record.holds_lease_token(lease_id, now) {
                return Err(DispatchError::LeaseNotHeld);
            }
            let grant = self.config.ack_lease_secs;
            if record.cumulative_lease_seconds + grant > self.config.lease_ceiling_secs {
                tracing::warn!(
                    event = "lease_ceiling_exceeded",
                    execution_id = %execution_id,
                    cumulative = record.cumulative_lease_seconds,
                    ceiling = self.config.lease_ceiling_secs,
                    "progress rejected"
                );
                return Err(DispatchError::LeaseCeilingExceeded {
                    ceiling_secs: self.config.lease_ceiling_secs,
                });
            }

            let expected = record.version;
            let mut updated = record;
            updated.status = TaskStatus::InProgress;
            updated.lease_expires_at = Some(now + chrono::Duration::seconds(grant as i64));
            updated.cumulative_lease_seconds += grant;
            if let Some(pct) = pct {
                updated.progress_pct = Some(pct.min(100));
            }
            if let Some(ref message) = message {
                updated.progress_message = Some(truncate_chars(message, PROGRESS_MESSAGE_MAX_CHARS));
            }
            if self.store.compare_and_swap(expected, updated.clone()) {
                return updated.leased_view().ok_or(DispatchError::LeaseNotHeld);
            }
        }
    }

    /// Records the terminal outcome of a task. Idempotent: replays for an
    /// already-terminal execution return the recorded outcome without
    /// re-applying anything, even if the lease has since expired.
    #[allow(clippy::too_many_arguments)]
    pub fn submit_result(
        &self,
        execution_id: Uuid,
        lease_id: Uuid,
        status: TerminalStatus,
        output: String,
        result_json: Option<Value>,
        attachments: Vec<Attachment>,
        client_id: &str,
    ) -> Result<SubmitReceipt, DispatchError> {
        validate_output(&output)?;
        validate_attachments(&attachments)?;

        loop {
            let record = self
                .store
                .get(&execution_id)
                .ok_or(DispatchError::UnknownExecution)?;
            if let Some(outcome) = record.outcome.clone() {
                // Terminal already. The recorded lease still gates the
                // replay: only the finishing client gets the outcome back.
                if record.lease_id == Some(lease_id) {
                    return Ok(SubmitReceipt {
                        execution_id,
                        replayed: true,
                        outcome,
                    });
                }
                return Err(DispatchError::LeaseNotHeld);
            }

            let now = Utc::now();
            if !record.holds_lease(lease_id, client_id, now) {
                return Err(DispatchError::LeaseNotHeld);
            }

            let outcome = TaskOutcome {
                status,
                output: output.clone(),
                result_json: result_json.clone(),
                attachments: attachments.clone(),
                recorded_at: now,
            };
            let expected = record.version;
            let mut updated = record;
            updated.status = status.into();
            updated.outcome = Some(outcome.clone());
            if self.store.compare_and_swap(expected, updated) {
                tracing::info!(
                    event = "task_completed",
                    execution_id = %execution_id,
                    status = TaskStatus::from(status).as_str(),
                    "task reached terminal state"
                );
                return Ok(SubmitReceipt {
                    execution_id,
                    replayed: false,
                    outcome,
                });
            }
        }
    }

    /// All non-terminal tasks currently leased to `client_id`, letting a
    /// restarted worker resume instead of orphaning work.
    pub fn list_inflight(&self, client_id: &str) -> Vec<TaskLease> {
        let now = Utc::now();
        self.maintain(now);
        let mut inflight: Vec<TaskLease> = self
            .store
            .list()
            .into_iter()
            .filter(|record| {
                !record.status.is_terminal()
                    && record.status != TaskStatus::Pending
                    && record.owner_client_id.as_deref() == Some(client_id)
                    && !record.lease_expired(now)
            })
            .filter_map(|record| record.leased_view())
            .collect();
        inflight.sort_by_key(|lease| lease.execution_id);
        inflight
    }

    /// Lazy maintenance on read paths: reclaims orphaned leases back to
    /// pending and drops terminal records past the retention window.
    fn maintain(&self, now: DateTime<Utc>) {
        let mut reclaimed_any = false;
        for record in self.store.list() {
            if record.status.is_terminal() {
                let expired = record.outcome.as_ref().is_some_and(|outcome| {
                    now.signed_duration_since(outcome.recorded_at).num_seconds()
                        > self.config.retention_secs as i64
                });
                if expired {
                    self.store.remove(&record.execution_id);
                }
                continue;
            }
            if record.status != TaskStatus::Pending && record.lease_expired(now) {
                let expected = record.version;
                let mut reclaimed = record.clone();
                reclaimed.status = TaskStatus::Pending;
                reclaimed.lease_id = None;
                reclaimed.owner_client_id = None;
                reclaimed.lease_expires_at = None;
                // cumulative_lease_seconds survives the reclaim so a task
                // that keeps orphaning leases still hits the ceiling.
                if self.store.compare_and_swap(expected, reclaimed) {
                    reclaimed_any = true;
                    tracing::warn!(
                        event = "lease_reclaimed",
                        execution_id = %record.execution_id,
                        previous_client = record.owner_client_id.as_deref().unwrap_or("unknown"),
                        "orphaned lease reclaimed"
                    );
                }
            }
        }
        if reclaimed_any {
            self.notify.notify_waiters();
        }
    }
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}
