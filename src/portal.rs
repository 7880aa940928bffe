// 🏦 Portal Drivers - stepwise bank login + export
//
// The browser automation behind each bank lives outside this crate. Drivers
// call back into a `SecretProvider` whenever a secret is needed and expose a
// PIN-challenge read/submit surface.

use anyhow::Result as AnyResult;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::SyncError;
use crate::export::{load_csv, ExportTable};
use crate::secrets::{SecretKind, SecretProvider};

// ============================================================================
// DRIVER TRAIT
// ============================================================================

/// What the portal wants after the credentials were accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    Authenticated,
    /// A partial-disclosure PIN step follows
    ChallengeRequired,
}

/// One bank session. A fresh driver is opened for every run.
pub trait PortalDriver: Send {
    fn name(&self) -> &str;

    /// Secrets `login` will request, in order (including `PinDigits` when
    /// the portal uses a PIN challenge)
    fn credential_sequence(&self) -> Vec<SecretKind>;

    fn login(&mut self, secrets: &dyn SecretProvider) -> Result<LoginOutcome, SyncError>;

    /// Read the announced PIN positions (1-based) from the live page
    fn await_challenge(&mut self) -> Result<Vec<u8>, SyncError>;

    /// Press one PIN digit on the portal's own keypad
    fn submit_digit(&mut self, digit: char) -> Result<(), SyncError>;

    /// Export every account this login covers, one table per source
    fn download_export(&mut self) -> Result<Vec<ExportTable>, SyncError>;

    /// Release browser resources; called on success and failure
    fn close(&mut self) {}
}

/// Opens drivers for one bank
pub trait PortalFactory: Send + Sync {
    fn open(&self) -> AnyResult<Box<dyn PortalDriver>>;

    /// Source ids a run of this bank produces
    fn source_ids(&self) -> Vec<String>;

    /// Cacheable secrets an unattended run needs up front
    fn login_secrets(&self) -> Vec<SecretKind>;
}

// ============================================================================
// DOWNLOADS DRIVER - picks up exports dropped by external automation
// ============================================================================

/// Reads the normalized CSV exports that a bank's browser automation leaves
/// in the downloads folder. Needs no secrets of its own.
#[derive(Debug, Clone)]
pub struct DownloadsDriver {
    bank: String,
    exports: Vec<(String, PathBuf)>,
}

impl DownloadsDriver {
    pub fn new(bank: impl Into<String>, exports: Vec<(String, PathBuf)>) -> Self {
        DownloadsDriver {
            bank: bank.into(),
            exports,
        }
    }
}

impl PortalDriver for DownloadsDriver {
    fn name(&self) -> &str {
        &self.bank
    }

    fn credential_sequence(&self) -> Vec<SecretKind> {
        Vec::new()
    }

    fn login(&mut self, _secrets: &dyn SecretProvider) -> Result<LoginOutcome, SyncError> {
        Ok(LoginOutcome::Authenticated)
    }

    fn await_challenge(&mut self) -> Result<Vec<u8>, SyncError> {
        Err(SyncError::PortalNavigation(format!(
            "{} exports carry no PIN challenge",
            self.bank
        )))
    }

    fn submit_digit(&mut self, _digit: char) -> Result<(), SyncError> {
        Err(SyncError::PortalNavigation(format!(
            "{} exports carry no PIN challenge",
            self.bank
        )))
    }

    fn download_export(&mut self) -> Result<Vec<ExportTable>, SyncError> {
        let mut tables = Vec::with_capacity(self.exports.len());
        for (source_id, path) in &self.exports {
            if !path.exists() {
                return Err(SyncError::PortalNavigation(format!(
                    "export for '{}' not found at {:?}",
                    source_id, path
                )));
            }
            let table = load_csv(path, source_id)
                .map_err(|e| SyncError::PortalNavigation(format!("{:#}", e)))?;
            tables.push(table);
        }
        Ok(tables)
    }
}

/// Factory for `DownloadsDriver`
#[derive(Debug, Clone)]
pub struct DownloadsFactory {
    bank: String,
    exports: Vec<(String, PathBuf)>,
}

impl DownloadsFactory {
    pub fn new(bank: impl Into<String>, exports: Vec<(String, PathBuf)>) -> Self {
        DownloadsFactory {
            bank: bank.into(),
            exports,
        }
    }
}

impl PortalFactory for DownloadsFactory {
    fn open(&self) -> AnyResult<Box<dyn PortalDriver>> {
        Ok(Box::new(DownloadsDriver::new(
            self.bank.clone(),
            self.exports.clone(),
        )))
    }

    fn source_ids(&self) -> Vec<String> {
        self.exports.iter().map(|(source, _)| source.clone()).collect()
    }

    fn login_secrets(&self) -> Vec<SecretKind> {
        Vec::new()
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Bank name -> driver factory
pub type PortalRegistry = BTreeMap<String, Arc<dyn PortalFactory>>;

/// Export locations of the supported banks under `downloads`
pub fn default_registry(downloads: &Path) -> PortalRegistry {
    let mut registry: PortalRegistry = BTreeMap::new();
    registry.insert(
        "ibercaja".to_string(),
        Arc::new(DownloadsFactory::new(
            "ibercaja",
            vec![(
                "ibercaja".to_string(),
                downloads.join("ibercaja").join("ibercaja_movements.csv"),
            )],
        )),
    );
    registry.insert(
        "ing".to_string(),
        Arc::new(DownloadsFactory::new(
            "ing",
            vec![
                (
                    "ing_nomina".to_string(),
                    downloads.join("ing").join("ing_nomina.csv"),
                ),
                (
                    "ing_naranja".to_string(),
                    downloads.join("ing").join("ing_naranja.csv"),
                ),
            ],
        )),
    );
    registry
}

// ============================================================================
// TESTS
// ============================================================================
