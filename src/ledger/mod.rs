// 📒 Ledger Service - the budgeting backend transactions are imported into
//
// Two-phase access, like the budgeting server itself: connect with the server
// password, then open one budget file (optionally encrypted). Work done on an
// open budget is only persisted by `commit`; dropping it discards everything.

pub mod sqlite;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::secrets::SecretValue;

pub use sqlite::SqliteConnector;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// Server unreachable, password or encryption secret rejected
    #[error("ledger unreachable or credentials rejected: {0}")]
    Connection(String),

    #[error("budget file '{0}' not found")]
    FileNotFound(String),

    #[error("account '{0}' not found")]
    AccountNotFound(String),

    /// One transaction refused by the ledger (row-level)
    #[error("transaction rejected: {0}")]
    Rejected(String),

    #[error("commit failed: {0}")]
    Commit(String),
}

impl LedgerError {
    /// Whether the error ends the whole sync (everything except `Rejected`)
    pub fn is_fatal(&self) -> bool {
        !matches!(self, LedgerError::Rejected(_))
    }
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetFile {
    pub name: String,
    pub file_id: String,
    pub encrypted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub id: String,
    pub name: String,
    pub off_budget: bool,
}

/// A transaction to create. `imported_id` is the engine's tag: the row
/// fingerprint used for deduplication across runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub date: NaiveDate,
    pub payee: Option<String>,
    pub notes: Option<String>,
    pub amount_cents: i64,
    pub imported_id: String,
    /// Bank-sourced data is already settled
    pub cleared: bool,
}

// ============================================================================
// TRAITS
// ============================================================================

/// Entry point: authenticates against the ledger server
pub trait LedgerConnector: Send + Sync {
    fn connect(&self, password: &SecretValue) -> Result<Box<dyn LedgerClient>, LedgerError>;

    /// Human-readable server address for logs
    fn address(&self) -> String;
}

/// An authenticated ledger server session
pub trait LedgerClient: Send {
    fn list_files(&self) -> Result<Vec<BudgetFile>, LedgerError>;

    fn open_budget(
        &mut self,
        file: &str,
        encryption_secret: Option<&SecretValue>,
    ) -> Result<Box<dyn LedgerBudget + '_>, LedgerError>;
}

/// One open budget file with a pending, uncommitted unit of work
pub trait LedgerBudget {
    /// Open accounts only
    fn accounts(&self) -> Result<Vec<LedgerAccount>, LedgerError>;

    /// Every `imported_id` already present in this budget
    fn existing_fingerprints(&self) -> Result<HashSet<String>, LedgerError>;

    /// Returns the new transaction's id
    fn create_transaction(
        &mut self,
        account_id: &str,
        tx: &NewTransaction,
    ) -> Result<String, LedgerError>;

    /// Run the budget's categorization rules over the given transactions
    /// only; returns the number of rule matches
    fn apply_rules(&mut self, transaction_ids: &[String]) -> Result<usize, LedgerError>;

    /// Persist every creation and rule mutation as one atomic unit
    fn commit(&mut self) -> Result<(), LedgerError>;
}

/// `list_accounts(file, secret)`: open the budget just to read its accounts
pub fn list_accounts(
    client: &mut dyn LedgerClient,
    file: &str,
    encryption_secret: Option<&SecretValue>,
) -> Result<Vec<LedgerAccount>, LedgerError> {
    let budget = client.open_budget(file, encryption_secret)?;
    budget.accounts()
}
