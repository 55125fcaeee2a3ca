use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use uuid::Uuid;

use crate::store::ConfirmTokenStore;

/// Maximum length of the optional action preview attached at issue time.
pub const ACTION_PREVIEW_MAX_CHARS: usize = 2_000;

/// A short-lived, single-use credential authorizing one specific governed
/// invocation. Valid only for the exact `(workspace_id, tool_name)` pair
/// it was minted for, only before `expires_at`, and only once.
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmToken {
    pub token: String,
    pub workspace_id: Uuid,
    pub tool_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_preview: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of a redemption attempt. `reason` is user-actionable and never
/// leaks more than the check that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redemption {
    pub valid: bool,
    pub reason: Option<&'static str>,
    /// Present on success so the caller can enforce preview requirements.
    pub action_preview: Option<String>,
}

impl Redemption {
    fn rejected(reason: &'static str) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
            action_preview: None,
        }
    }
}

pub const REASON_NOT_FOUND: &str = "not found";
pub const REASON_EXPIRED: &str = "expired";
pub const REASON_WORKSPACE_MISMATCH: &str = "workspace mismatch";
pub const REASON_TOOL_MISMATCH: &str = "issued for a different tool";

/// Issues and redeems confirmation tokens. Redemption is destructive:
/// delete-on-read through the store, so a token can never authorize two
/// invocations.
pub struct ConfirmationService {
    store: Arc<dyn ConfirmTokenStore>,
    ttl: Duration,
}

impl ConfirmationService {
    pub fn new(store: Arc<dyn ConfirmTokenStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Mints a fresh single-use token for `(workspace_id, tool_name)`.
    /// Sweeps expired tokens opportunistically — no dedicated sweeper
    /// thread exists, and correctness never depends on sweep timing.
    pub fn issue(
        &self,
        workspace_id: Uuid,
        tool_name: &str,
        action_preview: Option<String>,
    ) -> ConfirmToken {
        let now = Utc::now();
        let swept = self.store.sweep_expired(now);
        if swept > 0 {
            tracing::debug!(event = "confirm_token_sweep", removed = swept);
        }

        let action_preview = action_preview
            .map(|preview| truncate_chars(&preview, ACTION_PREVIEW_MAX_CHARS))
            .filter(|preview| !preview.trim().is_empty());
        let token = ConfirmToken {
            token: random_token(),
            workspace_id,
            tool_name: tool_name.to_string(),
            action_preview,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(self.ttl.as_secs() as i64),
        };
        self.store.put(token.clone());
        tracing::info!(
            event = "confirm_token_issued",
            workspace_id = %workspace_id,
            tool = tool_name,
            expires_at = %token.expires_at,
            "confirmation token issued"
        );
        token
    }

    /// Redeems a token for one invocation. Checks, in order: existence,
    /// expiry (expired tokens are removed), workspace match, tool match.
    /// Only a fully matching redemption consumes the token — a workspace
    /// or tool mismatch leaves it redeemable within its TTL.
    pub fn redeem(&self, token: &str, workspace_id: Uuid, tool_name: &str) -> Redemption {
        let now = Utc::now();
        let Some(stored) = self.store.get(token) else {
            return Redemption::rejected(REASON_NOT_FOUND);
        };
        if stored.expires_at <= now {
            let _ = self.store.remove(token);
            return Redemption::rejected(REASON_EXPIRED);
        }
        if stored.workspace_id != workspace_id {
            return Redemption::rejected(REASON_WORKSPACE_MISMATCH);
        }
        if stored.tool_name != tool_name {
            return Redemption::rejected(REASON_TOOL_MISMATCH);
        }
        // Delete-on-read: whichever of two concurrent redeems wins the
        // remove gets the token; the loser sees "not found".
        let Some(consumed) = self.store.remove(token) else {
            return Redemption::rejected(REASON_NOT_FOUND);
        };
        tracing::info!(
            event = "confirm_token_redeemed",
            workspace_id = %workspace_id,
            tool = tool_name,
            "confirmation token redeemed"
        );
        Redemption {
            valid: true,
            reason: None,
            action_preview: consumed.action_preview,
        }
    }
}

fn random_token() -> String {
    let mut bytes = [0_u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryConfirmTokenStore;

    fn service(ttl_secs: u64) -> ConfirmationService {
        ConfirmationService::new(
            Arc::new(MemoryConfirmTokenStore::default()),
            Duration::from_secs(ttl_secs),
        )
    }

    const TOOL: &str = "relay_run_notes_delete_archive";

    #[test]
    fn redeem_is_one_shot() {
        let service = service(300);
        let workspace = Uuid::now_v7();
        let token = service.issue(workspace, TOOL, None);

        let first = service.redeem(&token.token, workspace, TOOL);
        assert!(first.valid);

        let second = service.redeem(&token.token, workspace, TOOL);
        assert!(!second.valid);
        // One-shot without leakage: "not found", never "already used".
        assert_eq!(second.reason, Some(REASON_NOT_FOUND));
    }

    #[test]
    fn workspace_mismatch_is_reported_and_does_not_consume() {
        let service = service(300);
        let workspace = Uuid::now_v7();
        let token = service.issue(workspace, TOOL, None);

        let wrong = service.redeem(&token.token, Uuid::now_v7(), TOOL);
        assert!(!wrong.valid);
        assert_eq!(wrong.reason, Some(REASON_WORKSPACE_MISMATCH));

        // The token survives a mismatched attempt.
        let retry = service.redeem(&token.token, workspace, TOOL);
        assert!(retry.valid);
    }

    #[test]
    fn tool_mismatch_is_reported() {
        let service = service(300);
        let workspace = Uuid::now_v7();
        let token = service.issue(workspace, TOOL, None);

        let wrong = service.redeem(&token.token, workspace, "relay_run_crm_update_contact");
        assert!(!wrong.valid);
        assert_eq!(wrong.reason, Some(REASON_TOOL_MISMATCH));
    }

    #[test]
    fn expired_tokens_are_rejected_and_removed() {
        let store = Arc::new(MemoryConfirmTokenStore::default());
        let service = ConfirmationService::new(store.clone(), Duration::from_secs(300));
        let workspace = Uuid::now_v7();
        let token = service.issue(workspace, TOOL, None);

        // Backdate the expiry through the store.
        use crate::store::ConfirmTokenStore;
        let mut stored = store.get(&token.token).unwrap();
        stored.expires_at = Utc::now() - chrono::Duration::seconds(1);
        store.put(stored);

        let expired = service.redeem(&token.token, workspace, TOOL);
        assert!(!expired.valid);
        assert_eq!(expired.reason, Some(REASON_EXPIRED));

        // Expiry transitioned the token to absent.
        let gone = service.redeem(&token.token, workspace, TOOL);
        assert_eq!(gone.reason, Some(REASON_NOT_FOUND));
    }

    #[test]
    fn unknown_token_is_not_found() {
        let service = service(300);
        let result = service.redeem("deadbeef", Uuid::now_v7(), TOOL);
        assert!(!result.valid);
        assert_eq!(result.reason, Some(REASON_NOT_FOUND));
    }

    #[test]
    fn preview_is_carried_through_redemption() {
        let service = service(300);
        let workspace = Uuid::now_v7();
        let token = service.issue(workspace, TOOL, Some("will delete 42 archived notes".to_string()));
        assert_eq!(
            token.action_preview.as_deref(),
            Some("will delete 42 archived notes")
        );

        let redeemed = service.redeem(&token.token, workspace, TOOL);
        assert!(redeemed.valid);
        assert_eq!(
            redeemed.action_preview.as_deref(),
            Some("will delete 42 archived notes")
        );
    }

    #[test]
    fn issue_sweeps_previously_expired_tokens() {
        let store = Arc::new(MemoryConfirmTokenStore::default());
        let service = ConfirmationService::new(store.clone(), Duration::from_secs(300));
        let workspace = Uuid::now_v7();
        let old = service.issue(workspace, TOOL, None);

        use crate::store::ConfirmTokenStore;
        let mut stored = store.get(&old.token).unwrap();
        stored.expires_at = Utc::now() - chrono::Duration::seconds(1);
        store.put(stored);

        let _fresh = service.issue(workspace, TOOL, None);
        assert!(store.get(&old.token).is_none());
    }
}
