// 🗺️ Ledger Mappings - which ledger file/account each bank source syncs into
// Process lifetime only; scheduled runs require a saved mapping per source

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::secrets::SecretValue;

/// Where one source's transactions go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTarget {
    pub file: String,
    pub account: String,
    pub encryption_secret: Option<SecretValue>,
}

impl LedgerTarget {
    pub fn new(file: impl Into<String>, account: impl Into<String>) -> Self {
        LedgerTarget {
            file: file.into(),
            account: account.into(),
            encryption_secret: None,
        }
    }

    pub fn with_encryption_secret(mut self, secret: SecretValue) -> Self {
        self.encryption_secret = Some(secret);
        self
    }
}

/// A mapping as shown to the UI (never carries the secret)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingView {
    pub source_id: String,
    pub file: String,
    pub account: String,
    pub encrypted: bool,
}

#[derive(Debug, Default)]
pub struct MappingStore {
    targets: Mutex<HashMap<String, LedgerTarget>>,
}

impl MappingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites any earlier mapping for `source_id`
    pub fn save(&self, source_id: &str, target: LedgerTarget) {
        tracing::info!(
            source = source_id,
            "mapping saved: {} / {}",
            target.file,
            target.account
        );
        self.targets.lock().insert(source_id.to_string(), target);
    }

    pub fn get(&self, source_id: &str) -> Option<LedgerTarget> {
        self.targets.lock().get(source_id).cloned()
    }

    pub fn contains(&self, source_id: &str) -> bool {
        self.targets.lock().contains_key(source_id)
    }

    pub fn remove(&self, source_id: &str) -> Option<LedgerTarget> {
        self.targets.lock().remove(source_id)
    }

    /// Sorted by source id
    pub fn list(&self) -> Vec<MappingView> {
        let mut views: Vec<MappingView> = self
            .targets
            .lock()
            .iter()
            .map(|(source_id, target)| MappingView {
                source_id: source_id.clone(),
                file: target.file.clone(),
                account: target.account.clone(),
                encrypted: target.encryption_secret.is_some(),
            })
            .collect();
        views.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        views
    }
}
