// 🔁 Sync Engine - idempotent import of export rows into one ledger account
//
// fingerprint -> skip known -> create new -> rules on new only -> commit.
// Never fails past its boundary: every failure becomes a negative SyncResult.

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::export::{ExportRow, ExportTable};
use crate::ledger::{LedgerClient, LedgerError, NewTransaction};
use crate::mapping::LedgerTarget;
use crate::runlog::RunLog;

/// Payees longer than this are cut
pub const PAYEE_MAX_CHARS: usize = 50;

/// Row error messages longer than this are cut
pub const ROW_ERROR_MAX_CHARS: usize = 50;

// ============================================================================
// RESULT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub imported: usize,
    pub skipped: usize,
    pub row_errors: Vec<String>,
    /// Rule matches on the newly created transactions
    pub rules_applied: usize,
    pub message: String,
}

impl SyncResult {
    /// A failed sync; counts are zeroed since nothing was committed
    pub fn failure(message: impl Into<String>) -> Self {
        SyncResult {
            success: false,
            message: message.into(),
            ..Default::default()
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn failure_from(err: &LedgerError) -> SyncResult {
    match err {
        LedgerError::Commit(msg) => SyncResult::failure(format!("Commit failed: {}", msg)),
        other => SyncResult::failure(format!("Ledger connection error: {}", other)),
    }
}

/// Map one export row onto a ledger transaction tagged with `fingerprint`
fn to_transaction(row: &ExportRow, fingerprint: String) -> Result<NewTransaction, String> {
    let date = row.parse_date()?;
    let amount_cents = row.parse_amount_cents()?;

    let concept = row.concept.trim();
    let description = row.description.trim();

    Ok(NewTransaction {
        date,
        payee: (!concept.is_empty()).then(|| truncate_chars(concept, PAYEE_MAX_CHARS)),
        notes: (!description.is_empty()).then(|| description.to_string()),
        amount_cents,
        imported_id: fingerprint,
        cleared: true,
    })
}

// ============================================================================
// ENGINE
// ============================================================================

/// Import `table` into `target` over an authenticated ledger session
pub fn sync_table(
    client: &mut dyn LedgerClient,
    table: &ExportTable,
    target: &LedgerTarget,
    log: &RunLog,
) -> SyncResult {
    let source = table.source_id.as_str();
    log.push(format!(
        "[{}] Syncing {} rows to '{}' / '{}'",
        source,
        table.len(),
        target.file,
        target.account
    ));

    let mut budget = match client.open_budget(&target.file, target.encryption_secret.as_ref()) {
        Ok(budget) => budget,
        Err(e) => return failure_from(&e),
    };

    let accounts = match budget.accounts() {
        Ok(accounts) => accounts,
        Err(e) => return failure_from(&e),
    };
    let Some(account) = accounts.into_iter().find(|a| a.name == target.account) else {
        return SyncResult::failure(format!(
            "Account '{}' not found in '{}'",
            target.account, target.file
        ));
    };

    let mut existing = match budget.existing_fingerprints() {
        Ok(existing) => existing,
        Err(e) => return failure_from(&e),
    };

    let mut imported = 0;
    let mut skipped = 0;
    let mut row_errors = Vec::new();
    let mut created = Vec::new();

    for (index, row) in table.rows.iter().enumerate() {
        let fingerprint = row.fingerprint(source);
        if existing.contains(&fingerprint) {
            tracing::debug!(source, fingerprint = %fingerprint, "row {} already imported", index + 1);
            skipped += 1;
            continue;
        }

        let outcome = to_transaction(row, fingerprint.clone())
            .map_err(LedgerError::Rejected)
            .and_then(|tx| budget.create_transaction(&account.id, &tx));

        match outcome {
            Ok(id) => {
                existing.insert(fingerprint);
                created.push(id);
                imported += 1;
            }
            Err(e) if !e.is_fatal() => {
                let message = match e {
                    LedgerError::Rejected(msg) => msg,
                    other => other.to_string(),
                };
                let err = SyncError::RowImport {
                    row: row.reference(index),
                    message: truncate_chars(&message, ROW_ERROR_MAX_CHARS),
                };
                tracing::warn!(source, "{}", err);
                row_errors.push(err.to_string());
            }
            Err(e) => {
                tracing::warn!(source, "sync aborted at row {}: {}", index + 1, e);
                return failure_from(&e);
            }
        }
    }

    let mut rules_applied = 0;
    if !created.is_empty() {
        log.push(format!(
            "[{}] Applying rules to {} new transactions...",
            source,
            created.len()
        ));
        rules_applied = match budget.apply_rules(&created) {
            Ok(matches) => matches,
            Err(e) => return failure_from(&e),
        };
        if rules_applied > 0 {
            log.push(format!("[{}] Applied {} rule matches", source, rules_applied));
        }
    }

    if let Err(e) = budget.commit() {
        tracing::warn!(source, "commit failed: {}", e);
        return failure_from(&e);
    }
    if imported > 0 {
        log.push(format!("[{}] Committed {} new transactions", source, imported));
    } else {
        log.push(format!("[{}] No new transactions to import", source));
    }

    SyncResult {
        success: true,
        imported,
        skipped,
        row_errors,
        rules_applied,
        message: format!(
            "Synced to '{}': {} imported, {} skipped",
            target.account, imported, skipped
        ),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::sqlite::{self, SqliteConnector};
    use crate::ledger::{BudgetFile, LedgerAccount, LedgerBudget, LedgerConnector};
    use crate::secrets::SecretValue;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::Arc;

    // ------------------------------------------------------------------------
    // In-memory ledger with failure injection
    // ------------------------------------------------------------------------

    #[derive(Default)]
    struct Memory {
        existing: HashSet<String>,
        committed: Vec<NewTransaction>,
        ruled: Vec<String>,
        creates: usize,
        /// Connection drops on the n-th create (0-based)
        drop_on_create: Option<usize>,
        fail_commit: bool,
    }

    #[derive(Clone, Default)]
    struct MemoryLedger(Arc<Mutex<Memory>>);

    struct MemoryBudget {
        mem: Arc<Mutex<Memory>>,
        pending: Vec<NewTransaction>,
    }

    impl LedgerClient for MemoryLedger {
        fn list_files(&self) -> Result<Vec<BudgetFile>, LedgerError> {
            Ok(vec![BudgetFile {
                name: "Budget".to_string(),
                file_id: "f1".to_string(),
                encrypted: false,
            }])
        }

        fn open_budget(
            &mut self,
            file: &str,
            _secret: Option<&SecretValue>,
        ) -> Result<Box<dyn LedgerBudget + '_>, LedgerError> {
            if file != "Budget" {
                return Err(LedgerError::FileNotFound(file.to_string()));
            }
            Ok(Box::new(MemoryBudget {
                mem: Arc::clone(&self.0),
                pending: Vec::new(),
            }))
        }
    }

    impl LedgerBudget for MemoryBudget {
        fn accounts(&self) -> Result<Vec<LedgerAccount>, LedgerError> {
            Ok(vec![LedgerAccount {
                id: "acc-1".to_string(),
                name: "Checking".to_string(),
                off_budget: false,
            }])
        }

        fn existing_fingerprints(&self) -> Result<HashSet<String>, LedgerError> {
            Ok(self.mem.lock().existing.clone())
        }

        fn create_transaction(
            &mut self,
            _account_id: &str,
            tx: &NewTransaction,
        ) -> Result<String, LedgerError> {
            let mut mem = self.mem.lock();
            if mem.drop_on_create == Some(mem.creates) {
                return Err(LedgerError::Connection("connection reset by peer".to_string()));
            }
            mem.creates += 1;
            self.pending.push(tx.clone());
            Ok(format!("tx-{}", mem.creates))
        }

        fn apply_rules(&mut self, transaction_ids: &[String]) -> Result<usize, LedgerError> {
            self.mem.lock().ruled.extend(transaction_ids.iter().cloned());
            Ok(transaction_ids.len())
        }

        fn commit(&mut self) -> Result<(), LedgerError> {
            let mut mem = self.mem.lock();
            if mem.fail_commit {
                return Err(LedgerError::Commit("disk I/O error".to_string()));
            }
            for tx in self.pending.drain(..) {
                mem.existing.insert(tx.imported_id.clone());
                mem.committed.push(tx);
            }
            Ok(())
        }
    }

    fn table(n: usize) -> ExportTable {
        let rows = (0..n)
            .map(|i| {
                ExportRow::new(
                    &format!("{:02}-03-2025", i + 1),
                    "TARJETA VISA",
                    "LM GETAFE MADRID",
                    &format!("-{}.50", i + 1),
                    &format!("{}.00", 1000 + i),
                )
            })
            .collect();
        ExportTable::new("ibercaja", rows)
    }

    fn target() -> LedgerTarget {
        LedgerTarget::new("Budget", "Checking")
    }

    /// Ledger that already holds the first `known` rows of `table`
    fn ledger_with_known(table: &ExportTable, known: usize) -> MemoryLedger {
        let ledger = MemoryLedger::default();
        {
            let mut mem = ledger.0.lock();
            for row in table.rows.iter().take(known) {
                mem.existing.insert(row.fingerprint(&table.source_id));
            }
        }
        ledger
    }

    // ------------------------------------------------------------------------

    #[test]
    fn test_mixed_batch_imports_only_new_rows() {
        let export = table(10);
        let mut ledger = ledger_with_known(&export, 7);

        let result = sync_table(&mut ledger, &export, &target(), &RunLog::new());

        assert!(result.success, "{}", result.message);
        assert_eq!(result.imported, 3);
        assert_eq!(result.skipped, 7);
        assert!(result.row_errors.is_empty());
        assert_eq!(result.message, "Synced to 'Checking': 3 imported, 7 skipped");
    }

    #[test]
    fn test_rules_run_only_on_created_transactions() {
        let export = table(10);
        let mut ledger = ledger_with_known(&export, 7);

        let result = sync_table(&mut ledger, &export, &target(), &RunLog::new());

        assert_eq!(result.rules_applied, 3);
        assert_eq!(ledger.0.lock().ruled, vec!["tx-1", "tx-2", "tx-3"]);
    }

    #[test]
    fn test_malformed_row_is_isolated() {
        let mut export = table(10);
        export.rows[8].amount = "abc".to_string();
        export.rows[8].order = Some("9".to_string());
        let mut ledger = ledger_with_known(&export, 7);

        let result = sync_table(&mut ledger, &export, &target(), &RunLog::new());

        assert!(result.success);
        assert_eq!(result.imported, 2);
        assert_eq!(result.skipped, 7);
        assert_eq!(result.row_errors.len(), 1);
        assert!(result.row_errors[0].starts_with("row 9: invalid amount"));
        assert_eq!(ledger.0.lock().committed.len(), 2);
    }

    #[test]
    fn test_connection_drop_fails_whole_batch() {
        let export = table(10);
        let mut ledger = ledger_with_known(&export, 7);
        ledger.0.lock().drop_on_create = Some(1);

        let result = sync_table(&mut ledger, &export, &target(), &RunLog::new());

        assert!(!result.success);
        assert!(result.message.starts_with("Ledger connection error"));
        assert_eq!(result.imported, 0);
        assert_eq!(result.skipped, 0);
        assert!(ledger.0.lock().committed.is_empty());
    }

    #[test]
    fn test_commit_failure_fails_run() {
        let export = table(3);
        let mut ledger = MemoryLedger::default();
        ledger.0.lock().fail_commit = true;

        let result = sync_table(&mut ledger, &export, &target(), &RunLog::new());

        assert!(!result.success);
        assert!(result.message.starts_with("Commit failed"));
        assert_eq!(result.imported, 0);
    }

    #[test]
    fn test_unknown_account_or_file() {
        let export = table(1);
        let mut ledger = MemoryLedger::default();

        let result = sync_table(
            &mut ledger,
            &export,
            &LedgerTarget::new("Budget", "Savings"),
            &RunLog::new(),
        );
        assert!(!result.success);
        assert_eq!(result.message, "Account 'Savings' not found in 'Budget'");

        let result = sync_table(
            &mut ledger,
            &export,
            &LedgerTarget::new("Other", "Checking"),
            &RunLog::new(),
        );
        assert!(!result.success);
        assert!(result.message.contains("'Other' not found"));
    }

    #[test]
    fn test_identical_rows_in_one_export_import_once() {
        let mut export = table(1);
        export.rows.push(export.rows[0].clone());
        let mut ledger = MemoryLedger::default();

        let result = sync_table(&mut ledger, &export, &target(), &RunLog::new());

        assert_eq!((result.imported, result.skipped), (1, 1));
    }

    #[test]
    fn test_transaction_mapping() {
        let mut row = ExportRow::new("05-03-2025", "", "Intereses a tu favor", "0,12", "10");
        let tx = to_transaction(&row, "fp".to_string()).unwrap();
        assert_eq!(tx.payee, None);
        assert_eq!(tx.notes.as_deref(), Some("Intereses a tu favor"));
        assert_eq!(tx.amount_cents, 12);
        assert!(tx.cleared);

        row.concept = "X".repeat(80);
        let tx = to_transaction(&row, "fp".to_string()).unwrap();
        assert_eq!(tx.payee.unwrap().chars().count(), PAYEE_MAX_CHARS);
    }

    #[test]
    fn test_second_import_skips_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let conn = sqlite::initialize(&path, "pw").unwrap();
        sqlite::create_budget_file(&conn, "Budget", None).unwrap();
        sqlite::create_account(&conn, "Budget", "Checking").unwrap();

        let connector = SqliteConnector::new(path);
        let export = table(5);

        let mut client = connector.connect(&SecretValue::new("pw")).unwrap();
        let first = sync_table(client.as_mut(), &export, &target(), &RunLog::new());
        let mut client = connector.connect(&SecretValue::new("pw")).unwrap();
        let second = sync_table(client.as_mut(), &export, &target(), &RunLog::new());

        assert_eq!((first.imported, first.skipped), (5, 0));
        assert_eq!((second.imported, second.skipped), (0, 5));
        assert!(second.success);
        assert_eq!(sqlite::transactions(&conn, "Budget").unwrap().len(), 5);
    }
}
