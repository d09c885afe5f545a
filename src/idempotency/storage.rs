use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::idempotency::key_generator::IdempotencyKey;

/// Status of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum IdempotencyStatus {
    Pending,
    Completed,
}

/// Response captured on completion and replayed for duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl StoredResponse {
    pub fn new(status_code: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status_code,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn json(status_code: u16, value: &serde_json::Value) -> Self {
        Self::new(status_code, value.to_string()).with_header("content-type", "application/json")
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }
}

/// Stored idempotency record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct IdempotencyRecord {
    pub key: String,
    pub tenant_id: String,
    pub operation: String,
    pub request_hash: String,
    pub status: IdempotencyStatus,
    pub epoch: Uuid,
    pub status_code: Option<i32>,
    pub response_headers: Option<serde_json::Value>,
    pub response_body: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl IdempotencyRecord {
    /// A fresh pending marker leased until `now + lease`.
    pub fn pending(
        key: &IdempotencyKey,
        request_hash: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Self {
        Self {
            key: key.to_string(),
            tenant_id: key.tenant().to_string(),
            operation: key.operation().to_string(),
            request_hash: request_hash.to_string(),
            status: IdempotencyStatus::Pending,
            epoch: Uuid::new_v4(),
            status_code: None,
            response_headers: None,
            response_body: None,
            created_at: now,
            expires_at: expiry_after(now, lease),
            completed_at: None,
        }
    }

    /// Transitions this record to completed in place.
    pub fn complete(&mut self, response: &StoredResponse, now: DateTime<Utc>, ttl: Duration) {
        self.status = IdempotencyStatus::Completed;
        self.status_code = Some(i32::from(response.status_code));
        self.response_headers = serde_json::to_value(&response.headers).ok();
        self.response_body = Some(response.body.clone());
        self.completed_at = Some(now);
        self.expires_at = expiry_after(now, ttl);
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_completed(&self) -> bool {
        self.status == IdempotencyStatus::Completed
    }

    pub fn is_pending(&self) -> bool {
        self.status == IdempotencyStatus::Pending
    }

    pub fn is_owned_by(&self, claim: &Claim) -> bool {
        self.is_pending() && self.epoch == claim.epoch && self.key == claim.key.to_string()
    }

    /// The stored response, if this record is completed.
    pub fn stored_response(&self) -> Option<StoredResponse> {
        if !self.is_completed() {
            return None;
        }
        let status_code = u16::try_from(self.status_code?).ok()?;
        let headers = self
            .response_headers
            .clone()
            .and_then(|h| serde_json::from_value(h).ok())
            .unwrap_or_default();

        Some(StoredResponse {
            status_code,
            headers,
            body: self.response_body.clone().unwrap_or_default(),
        })
    }

    /// Lifecycle state as observed at `now`; expired records read as absent.
    pub fn state_at(&self, now: DateTime<Utc>) -> RecordState {
        if self.is_expired_at(now) {
            return RecordState::Absent;
        }
        match self.status {
            IdempotencyStatus::Pending => RecordState::Pending {
                epoch: self.epoch,
                lease_expires_at: self.expires_at,
            },
            IdempotencyStatus::Completed => match self.stored_response() {
                Some(response) => RecordState::Completed {
                    response,
                    expires_at: self.expires_at,
                },
                None => RecordState::Absent,
            },
        }
    }
}

/// Explicit lifecycle state of a key.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordState {
    Absent,
    Pending {
        epoch: Uuid,
        lease_expires_at: DateTime<Utc>,
    },
    Completed {
        response: StoredResponse,
        expires_at: DateTime<Utc>,
    },
}

/// Proof that the holder won the claim on a key for one epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub key: IdempotencyKey,
    pub epoch: Uuid,
}

/// Outcome of `begin`.
#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// No live record existed; the caller owns the key and must complete or abort.
    Proceed(Claim),
    /// A completed record exists; return its response unchanged.
    Replay(StoredResponse),
}

impl BeginOutcome {
    pub fn is_proceed(&self) -> bool {
        matches!(self, BeginOutcome::Proceed(_))
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, BeginOutcome::Replay(_))
    }
}

/// Durable idempotency storage.
///
/// Implementations must make `begin` an atomic claim at the storage layer:
/// two concurrent callers for the same key never both receive `Proceed`.
/// `begin` fails with `Conflict` while another claim is pending and with
/// `KeyReuse` when the live record was stored for a different request hash.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn begin(
        &self,
        key: &IdempotencyKey,
        request_hash: &str,
        lease: Duration,
    ) -> Result<BeginOutcome>;

    /// Stores the response and sets expiry to now + ttl; fails with `ClaimLost`
    /// if the claim no longer owns a pending record.
    async fn complete(
        &self,
        claim: &Claim,
        response: &StoredResponse,
        ttl: Duration,
    ) -> Result<IdempotencyRecord>;

    /// Removes the caller's pending marker. Returns false if it was already gone.
    async fn abort(&self, claim: &Claim) -> Result<bool>;

    /// Reads the live record for a key; expired records read as `None`.
    async fn find(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>>;

    /// Explicit eviction regardless of state.
    async fn evict(&self, key: &IdempotencyKey) -> Result<bool>;

    /// Deletes expired records. Housekeeping only.
    async fn cleanup_expired(&self) -> Result<u64>;

    fn backend(&self) -> &'static str;
}

/// Source of the current time for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = expiry_after(*now, by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub(crate) fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
