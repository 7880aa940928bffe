// 🗄️ SQLite Ledger - bundled budgeting backend
//
// One database file plays the ledger server: a password-protected set of
// budget files, each with accounts, transactions and categorization rules.
// An open budget holds a SQLite write transaction until `commit`.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::{
    BudgetFile, LedgerAccount, LedgerBudget, LedgerClient, LedgerConnector, LedgerError,
    NewTransaction,
};
use crate::rules::{CategorizationRule, RuleSet};
use crate::secrets::SecretValue;

const STORED_DATE_FORMAT: &str = "%Y-%m-%d";

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS server_auth (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            password_hash TEXT NOT NULL,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS budget_files (
            id TEXT PRIMARY KEY,
            name TEXT UNIQUE NOT NULL,
            encryption_key_hash TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            file_id TEXT NOT NULL REFERENCES budget_files(id),
            name TEXT NOT NULL,
            closed INTEGER NOT NULL DEFAULT 0,
            off_budget INTEGER NOT NULL DEFAULT 0,
            UNIQUE (file_id, name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY,
            file_id TEXT NOT NULL REFERENCES budget_files(id),
            account_id TEXT NOT NULL REFERENCES accounts(id),
            date TEXT NOT NULL,
            payee TEXT,
            notes TEXT,
            category TEXT,
            amount INTEGER NOT NULL,
            imported_id TEXT,
            cleared INTEGER NOT NULL DEFAULT 0,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS rules (
            id TEXT NOT NULL,
            file_id TEXT NOT NULL REFERENCES budget_files(id),
            priority INTEGER NOT NULL DEFAULT 0,
            body TEXT NOT NULL,
            PRIMARY KEY (file_id, id)
        )",
        [],
    )?;

    // A fingerprint can exist only once per budget file
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_imported_id
         ON transactions(file_id, imported_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tx_account ON transactions(account_id, date)",
        [],
    )?;

    Ok(())
}

fn hash_secret(salt: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", salt, secret));
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// ADMIN HELPERS (CLI)
// ============================================================================

/// Open (creating if needed) a ledger database with its schema
pub fn open_ledger(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open ledger database: {:?}", path))?;
    setup_database(&conn).context("Failed to set up ledger schema")?;
    Ok(conn)
}

/// Create the ledger (if needed) and set its server password
pub fn initialize(path: &Path, password: &str) -> Result<Connection> {
    if password.is_empty() {
        return Err(anyhow!("ledger password must not be empty"));
    }
    let conn = open_ledger(path)?;
    conn.execute(
        "INSERT INTO server_auth (id, password_hash) VALUES (1, ?1)
         ON CONFLICT(id) DO UPDATE SET password_hash = excluded.password_hash,
                                       updated_at = CURRENT_TIMESTAMP",
        params![hash_secret("server", password)],
    )?;
    Ok(conn)
}

/// Returns the new file id
pub fn create_budget_file(
    conn: &Connection,
    name: &str,
    encryption_secret: Option<&str>,
) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    let key_hash = encryption_secret.map(|secret| hash_secret(&id, secret));
    conn.execute(
        "INSERT INTO budget_files (id, name, encryption_key_hash) VALUES (?1, ?2, ?3)",
        params![id, name, key_hash],
    )
    .with_context(|| format!("Failed to create budget file '{}'", name))?;
    Ok(id)
}

fn file_id(conn: &Connection, file: &str) -> Result<String> {
    conn.query_row(
        "SELECT id FROM budget_files WHERE name = ?1",
        params![file],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| anyhow!("budget file '{}' not found", file))
}

/// Returns the new account id
pub fn create_account(conn: &Connection, file: &str, account: &str) -> Result<String> {
    let file_id = file_id(conn, file)?;
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO accounts (id, file_id, name) VALUES (?1, ?2, ?3)",
        params![id, file_id, account],
    )
    .with_context(|| format!("Failed to create account '{}' in '{}'", account, file))?;
    Ok(id)
}

pub fn close_account(conn: &Connection, file: &str, account: &str) -> Result<()> {
    let file_id = file_id(conn, file)?;
    let changed = conn.execute(
        "UPDATE accounts SET closed = 1 WHERE file_id = ?1 AND name = ?2",
        params![file_id, account],
    )?;
    if changed == 0 {
        return Err(anyhow!("account '{}' not found in '{}'", account, file));
    }
    Ok(())
}

/// Insert or replace rules (by id) in a budget file
pub fn add_rules(conn: &Connection, file: &str, rules: &[CategorizationRule]) -> Result<usize> {
    let file_id = file_id(conn, file)?;
    for rule in rules {
        conn.execute(
            "INSERT OR REPLACE INTO rules (id, file_id, priority, body) VALUES (?1, ?2, ?3, ?4)",
            params![rule.id, file_id, rule.priority, serde_json::to_string(rule)?],
        )?;
    }
    Ok(rules.len())
}

/// A transaction as stored, for inspection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredTransaction {
    pub id: String,
    pub account: String,
    pub date: String,
    pub payee: Option<String>,
    pub notes: Option<String>,
    pub category: Option<String>,
    pub amount_cents: i64,
    pub imported_id: Option<String>,
    pub cleared: bool,
}

/// Every transaction in a budget file, oldest first
pub fn transactions(conn: &Connection, file: &str) -> Result<Vec<StoredTransaction>> {
    let file_id = file_id(conn, file)?;
    let mut stmt = conn.prepare(
        "SELECT t.id, a.name, t.date, t.payee, t.notes, t.category, t.amount,
                t.imported_id, t.cleared
         FROM transactions t JOIN accounts a ON a.id = t.account_id
         WHERE t.file_id = ?1
         ORDER BY t.date, t.created_at, t.rowid",
    )?;

    let rows = stmt
        .query_map(params![file_id], |row| {
            Ok(StoredTransaction {
                id: row.get(0)?,
                account: row.get(1)?,
                date: row.get(2)?,
                payee: row.get(3)?,
                notes: row.get(4)?,
                category: row.get(5)?,
                amount_cents: row.get(6)?,
                imported_id: row.get(7)?,
                cleared: row.get(8)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

// ============================================================================
// CONNECTOR
// ============================================================================

#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: PathBuf,
    certificate: Option<PathBuf>,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SqliteConnector {
            path: path.into(),
            certificate: None,
        }
    }

    /// Certificate override; it must exist but a local file needs no TLS
    pub fn with_certificate(mut self, certificate: Option<PathBuf>) -> Self {
        self.certificate = certificate;
        self
    }
}

impl LedgerConnector for SqliteConnector {
    fn connect(&self, password: &SecretValue) -> Result<Box<dyn LedgerClient>, LedgerError> {
        if let Some(cert) = &self.certificate {
            if !cert.exists() {
                return Err(LedgerError::Connection(format!(
                    "certificate {:?} not found",
                    cert
                )));
            }
            tracing::debug!("certificate override {:?} not used by the SQLite ledger", cert);
        }
        if !self.path.exists() {
            return Err(LedgerError::Connection(format!(
                "no ledger at {:?} (run ledger-init first)",
                self.path
            )));
        }

        let conn = Connection::open(&self.path).map_err(connection_error)?;
        setup_database(&conn).map_err(|e| LedgerError::Connection(format!("{:#}", e)))?;

        let stored: Option<String> = conn
            .query_row(
                "SELECT password_hash FROM server_auth WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(connection_error)?;

        match stored {
            None => Err(LedgerError::Connection(
                "ledger has no server password (run ledger-init first)".to_string(),
            )),
            Some(hash) if hash == hash_secret("server", password.expose()) => {
                tracing::debug!("connected to ledger {:?}", self.path);
                Ok(Box::new(SqliteLedger { conn }))
            }
            Some(_) => Err(LedgerError::Connection("server password rejected".to_string())),
        }
    }

    fn address(&self) -> String {
        self.path.display().to_string()
    }
}

fn connection_error(e: rusqlite::Error) -> LedgerError {
    LedgerError::Connection(e.to_string())
}

/// Constraint violations are the ledger refusing one row; anything else
/// means the store itself is failing
fn write_error(e: rusqlite::Error) -> LedgerError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
            LedgerError::Rejected(e.to_string())
        }
        _ => LedgerError::Connection(e.to_string()),
    }
}

// ============================================================================
// CLIENT
// ============================================================================

pub struct SqliteLedger {
    conn: Connection,
}

impl LedgerClient for SqliteLedger {
    fn list_files(&self) -> Result<Vec<BudgetFile>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, encryption_key_hash IS NOT NULL
                 FROM budget_files ORDER BY name",
            )
            .map_err(connection_error)?;

        let files = stmt
            .query_map([], |row| {
                Ok(BudgetFile {
                    file_id: row.get(0)?,
                    name: row.get(1)?,
                    encrypted: row.get(2)?,
                })
            })
            .map_err(connection_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(connection_error)?;

        Ok(files)
    }

    fn open_budget(
        &mut self,
        file: &str,
        encryption_secret: Option<&SecretValue>,
    ) -> Result<Box<dyn LedgerBudget + '_>, LedgerError> {
        let found: Option<(String, Option<String>)> = self
            .conn
            .query_row(
                "SELECT id, encryption_key_hash FROM budget_files WHERE name = ?1",
                params![file],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(connection_error)?;

        let (file_id, key_hash) = found.ok_or_else(|| LedgerError::FileNotFound(file.to_string()))?;

        if let Some(key_hash) = key_hash {
            let secret = encryption_secret.ok_or_else(|| {
                LedgerError::Connection(format!("budget file '{}' is encrypted", file))
            })?;
            if hash_secret(&file_id, secret.expose()) != key_hash {
                return Err(LedgerError::Connection(format!(
                    "encryption secret rejected for '{}'",
                    file
                )));
            }
        }

        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(connection_error)?;

        Ok(Box::new(SqliteBudget {
            conn: &self.conn,
            file_id,
            committed: false,
        }))
    }
}

// ============================================================================
// OPEN BUDGET
// ============================================================================

pub struct SqliteBudget<'a> {
    conn: &'a Connection,
    file_id: String,
    committed: bool,
}

impl SqliteBudget<'_> {
    fn rules(&self) -> Result<RuleSet, LedgerError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, body FROM rules WHERE file_id = ?1")
            .map_err(connection_error)?;

        let bodies = stmt
            .query_map(params![self.file_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(connection_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(connection_error)?;

        let mut rules = Vec::with_capacity(bodies.len());
        for (id, body) in bodies {
            match serde_json::from_str::<CategorizationRule>(&body) {
                Ok(rule) => rules.push(rule),
                Err(e) => tracing::warn!("skipping unreadable rule '{}': {}", id, e),
            }
        }
        let rules = RuleSet::from_rules(rules);
        tracing::debug!(file_id = %self.file_id, count = rules.len(), "rules loaded");
        Ok(rules)
    }
}

impl LedgerBudget for SqliteBudget<'_> {
    fn accounts(&self) -> Result<Vec<LedgerAccount>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, off_budget FROM accounts
                 WHERE file_id = ?1 AND closed = 0
                 ORDER BY name",
            )
            .map_err(connection_error)?;

        let accounts = stmt
            .query_map(params![self.file_id], |row| {
                Ok(LedgerAccount {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    off_budget: row.get(2)?,
                })
            })
            .map_err(connection_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(connection_error)?;

        Ok(accounts)
    }

    fn existing_fingerprints(&self) -> Result<HashSet<String>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT imported_id FROM transactions
                 WHERE file_id = ?1 AND imported_id IS NOT NULL",
            )
            .map_err(connection_error)?;

        let fingerprints = stmt
            .query_map(params![self.file_id], |row| row.get(0))
            .map_err(connection_error)?
            .collect::<Result<HashSet<String>, _>>()
            .map_err(connection_error)?;

        Ok(fingerprints)
    }

    fn create_transaction(
        &mut self,
        account_id: &str,
        tx: &NewTransaction,
    ) -> Result<String, LedgerError> {
        let known: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM accounts WHERE id = ?1 AND file_id = ?2",
                params![account_id, self.file_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(connection_error)?;
        if known.is_none() {
            return Err(LedgerError::AccountNotFound(account_id.to_string()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO transactions (
                    id, file_id, account_id, date, payee, notes, amount, imported_id, cleared
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id,
                    self.file_id,
                    account_id,
                    tx.date.format(STORED_DATE_FORMAT).to_string(),
                    tx.payee,
                    tx.notes,
                    tx.amount_cents,
                    tx.imported_id,
                    tx.cleared,
                ],
            )
            .map_err(write_error)?;

        Ok(id)
    }

    fn apply_rules(&mut self, transaction_ids: &[String]) -> Result<usize, LedgerError> {
        let rules = self.rules()?;
        if rules.is_empty() || transaction_ids.is_empty() {
            return Ok(0);
        }

        let mut matched = 0;
        for id in transaction_ids {
            let current: Option<(Option<String>, Option<String>)> = self
                .conn
                .query_row(
                    "SELECT payee, notes FROM transactions WHERE id = ?1 AND file_id = ?2",
                    params![id, self.file_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(connection_error)?;

            let Some((payee, notes)) = current else {
                tracing::warn!("rule target {} not in this budget", id);
                continue;
            };

            let outcome = rules.apply(payee.as_deref(), notes.as_deref());
            if outcome.matched == 0 {
                continue;
            }
            matched += outcome.matched;

            self.conn
                .execute(
                    "UPDATE transactions
                     SET payee = COALESCE(?1, payee),
                         category = COALESCE(?2, category)
                     WHERE id = ?3",
                    params![outcome.payee, outcome.category, id],
                )
                .map_err(connection_error)?;
        }

        Ok(matched)
    }

    fn commit(&mut self) -> Result<(), LedgerError> {
        if self.committed {
            return Err(LedgerError::Commit("budget already committed".to_string()));
        }
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| LedgerError::Commit(e.to_string()))?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for SqliteBudget<'_> {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!("rollback of uncommitted budget failed: {}", e);
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::list_accounts;
    use crate::rules::RuleField;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    /// Ledger with password "pw", file "Budget" and an open account "Checking"
    fn ledger() -> (TempDir, SqliteConnector, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let conn = initialize(&path, "pw").unwrap();
        create_budget_file(&conn, "Budget", None).unwrap();
        let account = create_account(&conn, "Budget", "Checking").unwrap();
        (dir, SqliteConnector::new(path), account)
    }

    fn new_tx(imported_id: &str, payee: &str) -> NewTransaction {
        NewTransaction {
            date: NaiveDate::from_ymd_opt(2025, 3, 5).unwrap(),
            payee: Some(payee.to_string()),
            notes: Some("LM GETAFE".to_string()),
            amount_cents: -2340,
            imported_id: imported_id.to_string(),
            cleared: true,
        }
    }

    fn pw() -> SecretValue {
        SecretValue::new("pw")
    }

    #[test]
    fn test_connect_checks_password() {
        let (_dir, connector, _) = ledger();

        assert!(connector.connect(&pw()).is_ok());
        let err = connector.connect(&SecretValue::new("nope")).err().unwrap();
        assert!(matches!(err, LedgerError::Connection(_)));
    }

    #[test]
    fn test_connect_to_missing_ledger_fails() {
        let dir = tempfile::tempdir().unwrap();
        let connector = SqliteConnector::new(dir.path().join("absent.db"));

        let err = connector.connect(&pw()).err().unwrap();
        assert!(matches!(err, LedgerError::Connection(_)));
        assert!(!dir.path().join("absent.db").exists());
    }

    #[test]
    fn test_missing_certificate_override_fails() {
        let (dir, connector, _) = ledger();
        let connector = connector.with_certificate(Some(dir.path().join("ca.pem")));

        assert!(matches!(
            connector.connect(&pw()).err().unwrap(),
            LedgerError::Connection(_)
        ));
    }

    #[test]
    fn test_list_files_and_encryption() {
        let (dir, connector, _) = ledger();
        let conn = open_ledger(&dir.path().join("ledger.db")).unwrap();
        create_budget_file(&conn, "Locked", Some("s3cret")).unwrap();
        create_account(&conn, "Locked", "Savings").unwrap();

        let mut client = connector.connect(&pw()).unwrap();
        let files = client.list_files().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "Budget");
        assert!(!files[0].encrypted);
        assert!(files[1].encrypted);

        assert!(matches!(
            client.open_budget("Locked", None).err().unwrap(),
            LedgerError::Connection(_)
        ));
        assert!(matches!(
            client
                .open_budget("Locked", Some(&SecretValue::new("wrong")))
                .err()
                .unwrap(),
            LedgerError::Connection(_)
        ));
        let accounts =
            list_accounts(client.as_mut(), "Locked", Some(&SecretValue::new("s3cret"))).unwrap();
        assert_eq!(accounts[0].name, "Savings");

        assert_eq!(
            client.open_budget("Nope", None).err().unwrap(),
            LedgerError::FileNotFound("Nope".to_string())
        );
    }

    #[test]
    fn test_closed_accounts_are_hidden() {
        let (dir, connector, _) = ledger();
        let conn = open_ledger(&dir.path().join("ledger.db")).unwrap();
        create_account(&conn, "Budget", "Old card").unwrap();
        close_account(&conn, "Budget", "Old card").unwrap();

        let mut client = connector.connect(&pw()).unwrap();
        let names: Vec<String> = list_accounts(client.as_mut(), "Budget", None)
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["Checking"]);
    }

    #[test]
    fn test_commit_persists_and_drop_discards() {
        let (dir, connector, account) = ledger();
        let mut client = connector.connect(&pw()).unwrap();

        {
            let mut budget = client.open_budget("Budget", None).unwrap();
            budget.create_transaction(&account, &new_tx("fp-1", "A")).unwrap();
            budget.commit().unwrap();
        }
        {
            let mut budget = client.open_budget("Budget", None).unwrap();
            budget.create_transaction(&account, &new_tx("fp-2", "B")).unwrap();
            // dropped without commit
        }

        let conn = open_ledger(&dir.path().join("ledger.db")).unwrap();
        let stored = transactions(&conn, "Budget").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].imported_id.as_deref(), Some("fp-1"));
        assert_eq!(stored[0].date, "2025-03-05");
        assert_eq!(stored[0].amount_cents, -2340);
        assert!(stored[0].cleared);

        let budget = client.open_budget("Budget", None).unwrap();
        let fps = budget.existing_fingerprints().unwrap();
        assert!(fps.contains("fp-1"));
        assert!(!fps.contains("fp-2"));
    }

    #[test]
    fn test_duplicate_imported_id_is_row_level_rejection() {
        let (_dir, connector, account) = ledger();
        let mut client = connector.connect(&pw()).unwrap();
        let mut budget = client.open_budget("Budget", None).unwrap();

        budget.create_transaction(&account, &new_tx("fp-1", "A")).unwrap();
        let err = budget
            .create_transaction(&account, &new_tx("fp-1", "A"))
            .unwrap_err();

        assert!(matches!(err, LedgerError::Rejected(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_unknown_account_is_fatal() {
        let (_dir, connector, _) = ledger();
        let mut client = connector.connect(&pw()).unwrap();
        let mut budget = client.open_budget("Budget", None).unwrap();

        let err = budget
            .create_transaction("no-such-account", &new_tx("fp-1", "A"))
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_apply_rules_touches_only_given_ids() {
        let (dir, connector, account) = ledger();
        let conn = open_ledger(&dir.path().join("ledger.db")).unwrap();
        add_rules(
            &conn,
            "Budget",
            &[CategorizationRule {
                id: "groceries".to_string(),
                pattern: "MERCADONA".to_string(),
                field: RuleField::Payee,
                set_payee: Some("Mercadona".to_string()),
                set_category: Some("Groceries".to_string()),
                priority: 1,
            }],
        )
        .unwrap();

        let mut client = connector.connect(&pw()).unwrap();
        {
            let mut budget = client.open_budget("Budget", None).unwrap();
            budget
                .create_transaction(&account, &new_tx("old", "MERCADONA"))
                .unwrap();
            budget.commit().unwrap();
        }
        {
            let mut budget = client.open_budget("Budget", None).unwrap();
            let new_id = budget
                .create_transaction(&account, &new_tx("new", "MERCADONA"))
                .unwrap();
            assert_eq!(budget.apply_rules(&[new_id]).unwrap(), 1);
            budget.commit().unwrap();
        }

        let stored = transactions(&conn, "Budget").unwrap();
        let old = stored.iter().find(|t| t.imported_id.as_deref() == Some("old")).unwrap();
        let new = stored.iter().find(|t| t.imported_id.as_deref() == Some("new")).unwrap();
        assert_eq!(old.category, None);
        assert_eq!(new.category.as_deref(), Some("Groceries"));
        assert_eq!(new.payee.as_deref(), Some("Mercadona"));
    }

    #[test]
    fn test_double_commit_is_rejected() {
        let (_dir, connector, _) = ledger();
        let mut client = connector.connect(&pw()).unwrap();
        let mut budget = client.open_budget("Budget", None).unwrap();

        budget.commit().unwrap();
        assert!(matches!(budget.commit().unwrap_err(), LedgerError::Commit(_)));
    }
}
