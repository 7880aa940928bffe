// 🔐 Secret Broker - bridge blocking portal logins to an async human operator
//
// The automation thread calls `resolve(kind)` and blocks until the UI answers
// the pending request (or the configured timeout passes). Non-PIN secrets are
// cached for the process lifetime once supplied.

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

use crate::error::SyncError;
use crate::runlog::RunLog;

// ============================================================================
// SECRET KINDS
// ============================================================================

/// Which secret is being requested. Callers always name the kind explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretKind {
    /// Ibercaja-style identification code
    IdentificationCode,
    /// Ibercaja-style access key
    AccessKey,
    /// ING-style national document number
    DocumentNumber,
    BirthDay,
    BirthMonth,
    BirthYear,
    /// Partial PIN disclosure - never cached
    PinDigits,
    /// Ledger server password
    LedgerPassword,
}

impl SecretKind {
    /// Human-readable name shown in prompts and logs
    pub fn label(&self) -> &'static str {
        match self {
            SecretKind::IdentificationCode => "identification code",
            SecretKind::AccessKey => "access key",
            SecretKind::DocumentNumber => "document number",
            SecretKind::BirthDay => "birth day (DD)",
            SecretKind::BirthMonth => "birth month (MM)",
            SecretKind::BirthYear => "birth year (YYYY)",
            SecretKind::PinDigits => "PIN digits",
            SecretKind::LedgerPassword => "ledger server password",
        }
    }

    pub fn is_cacheable(&self) -> bool {
        !matches!(self, SecretKind::PinDigits)
    }
}

// ============================================================================
// SECRET VALUE
// ============================================================================

/// A secret string. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        SecretValue(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// One `*` per character, for "using stored ..." confirmations
    pub fn masked(&self) -> String {
        "*".repeat(self.0.chars().count())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(<REDACTED>)")
    }
}

impl fmt::Display for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<REDACTED>")
    }
}

// ============================================================================
// PROVIDER TRAIT - what portal drivers see
// ============================================================================

/// Source of secrets for a portal driver. Calls may block for a long time.
pub trait SecretProvider: Send + Sync {
    fn request_secret(&self, kind: SecretKind) -> Result<SecretValue, SyncError>;

    /// Ask for the digits at `positions` (1-based). `mask` shows the operator
    /// which physical digits of their PIN are wanted.
    fn request_pin_digits(&self, positions: &[u8], mask: &str) -> Result<SecretValue, SyncError>;
}

// ============================================================================
// PENDING PROMPT - what the UI sees
// ============================================================================

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PendingPrompt {
    pub id: Uuid,
    pub kind: SecretKind,
    pub label: String,
    /// Requested PIN positions (empty for ordinary secrets)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub positions: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask: Option<String>,
    pub requested_at: DateTime<Utc>,
}

impl PendingPrompt {
    /// One-line prompt shown by terminal and log
    pub fn prompt_text(&self) -> String {
        match &self.mask {
            Some(mask) => {
                let list: Vec<String> = self.positions.iter().map(|p| p.to_string()).collect();
                format!("> {} at positions {} ({})", self.label, list.join(", "), mask)
            }
            None => format!("> {}", self.label),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum AnswerError {
    #[error("no pending request with id {0}")]
    NoSuchRequest(Uuid),
    #[error("empty answer")]
    Empty,
}

// ============================================================================
// SECRET BROKER
// ============================================================================

#[derive(Default)]
struct BrokerState {
    queue: Vec<SecretKind>,
    position: usize,
    cache: HashMap<SecretKind, SecretValue>,
    pending: Option<PendingPrompt>,
    answer: Option<SecretValue>,
}

/// Ordered, resettable request queue plus a process-lifetime secret cache.
///
/// One automation thread per broker: concurrent `resolve` calls are not
/// supported (the pipeline's run guard enforces this).
pub struct SecretBroker {
    state: Mutex<BrokerState>,
    answered: Condvar,
    timeout: Option<Duration>,
    log: RunLog,
}

impl SecretBroker {
    /// `timeout: None` waits for the operator indefinitely
    pub fn new(timeout: Option<Duration>, log: RunLog) -> Self {
        SecretBroker {
            state: Mutex::new(BrokerState::default()),
            answered: Condvar::new(),
            timeout,
            log,
        }
    }

    /// Reset the queue for a new run
    pub fn setup_queue(&self, kinds: Vec<SecretKind>) {
        let mut state = self.state.lock();
        state.queue = kinds;
        state.position = 0;
        state.answer = None;
    }

    /// Declared type at the current position; `None` once exhausted
    pub fn next_type(&self) -> Option<SecretKind> {
        let state = self.state.lock();
        state.queue.get(state.position).copied()
    }

    /// Supply `kind`, from cache when allowed, otherwise from the operator
    pub fn resolve(&self, kind: SecretKind) -> Result<SecretValue, SyncError> {
        self.request(kind, Vec::new(), None)
    }

    /// The request the operator must answer right now, if any
    pub fn pending(&self) -> Option<PendingPrompt> {
        self.state.lock().pending.clone()
    }

    /// Deposit the operator's answer for request `id` and wake the waiter.
    /// The value is kept exactly as typed; only an empty answer is refused.
    pub fn answer(&self, id: Uuid, value: &str) -> Result<(), AnswerError> {
        {
            let mut state = self.state.lock();
            match &state.pending {
                Some(p) if p.id == id => {}
                _ => return Err(AnswerError::NoSuchRequest(id)),
            }
            if value.is_empty() {
                return Err(AnswerError::Empty);
            }
            state.pending = None;
            state.answer = Some(SecretValue::new(value));
        }
        self.answered.notify_all();
        Ok(())
    }

    /// Seed the cache without prompting (CLI bootstrap, tests)
    pub fn remember(&self, kind: SecretKind, value: SecretValue) {
        if kind.is_cacheable() {
            self.state.lock().cache.insert(kind, value);
        }
    }

    /// Forget every cached secret and reset the queue
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.cache.clear();
        state.queue.clear();
        state.position = 0;
        self.log
            .push("[SYSTEM] Credentials cleared. Next execution will prompt for new credentials.");
    }

    pub fn has_cached(&self, kind: SecretKind) -> bool {
        self.state.lock().cache.contains_key(&kind)
    }

    /// Cached value without touching the queue (ledger listings outside a run)
    pub fn cached(&self, kind: SecretKind) -> Option<SecretValue> {
        self.state.lock().cache.get(&kind).cloned()
    }

    pub fn cached_kinds(&self) -> Vec<SecretKind> {
        let mut kinds: Vec<SecretKind> = self.state.lock().cache.keys().copied().collect();
        kinds.sort();
        kinds
    }

    fn request(
        &self,
        kind: SecretKind,
        positions: Vec<u8>,
        mask: Option<String>,
    ) -> Result<SecretValue, SyncError> {
        let mut state = self.state.lock();

        let expected = state.queue.get(state.position).copied();
        if expected != Some(kind) {
            return Err(SyncError::SecretSequence {
                expected,
                requested: kind,
            });
        }

        if kind.is_cacheable() {
            if let Some(value) = state.cache.get(&kind).cloned() {
                self.log
                    .push(format!("Using stored {}: {}", kind.label(), value.masked()));
                state.position += 1;
                return Ok(value);
            }
        }

        let prompt = PendingPrompt {
            id: Uuid::new_v4(),
            kind,
            label: kind.label().to_string(),
            positions,
            mask,
            requested_at: Utc::now(),
        };
        self.log.push(prompt.prompt_text());
        state.pending = Some(prompt);
        state.answer = None;

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let value = loop {
            if let Some(value) = state.answer.take() {
                break value;
            }
            match deadline {
                Some(deadline) => {
                    if self.answered.wait_until(&mut state, deadline).timed_out() {
                        if let Some(value) = state.answer.take() {
                            break value;
                        }
                        state.pending = None;
                        let secs = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
                        self.log
                            .push(format!("No answer for {} after {}s", kind.label(), secs));
                        return Err(SyncError::SecretTimeout { kind, secs });
                    }
                }
                None => self.answered.wait(&mut state),
            }
        };

        if kind.is_cacheable() {
            state.cache.insert(kind, value.clone());
        }
        state.position += 1;
        Ok(value)
    }
}

impl SecretProvider for SecretBroker {
    fn request_secret(&self, kind: SecretKind) -> Result<SecretValue, SyncError> {
        self.resolve(kind)
    }

    fn request_pin_digits(&self, positions: &[u8], mask: &str) -> Result<SecretValue, SyncError> {
        self.request(
            SecretKind::PinDigits,
            positions.to_vec(),
            Some(mask.to_string()),
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================
