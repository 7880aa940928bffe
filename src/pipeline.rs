// 🚀 Pipeline - one bank run end to end
//
// login (+ PIN challenge) -> download exports -> ledger password -> connect
// -> sync every exported source against its mapping.
// `Session` is the explicitly constructed context every operation goes
// through; nothing here is process-global.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::error::SyncError;
use crate::export::ExportTable;
use crate::ledger::{self, BudgetFile, LedgerAccount, LedgerClient, LedgerConnector};
use crate::mapping::{LedgerTarget, MappingStore};
use crate::pin::PinHandler;
use crate::portal::{default_registry, LoginOutcome, PortalDriver, PortalFactory, PortalRegistry};
use crate::runlog::RunLog;
use crate::scheduler::{ScheduleError, ScheduledJob};
use crate::secrets::{SecretBroker, SecretKind, SecretValue};
use crate::sync::{sync_table, SyncResult};

// ============================================================================
// REPORTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceReport {
    pub source_id: String,
    pub result: SyncResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub bank: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceReport>,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.sources.iter().all(|s| s.result.success)
    }

    pub fn imported(&self) -> usize {
        self.sources.iter().map(|s| s.result.imported).sum()
    }

    /// One line, e.g. `ing: ing_nomina 3 imported, 7 skipped; ing_naranja failed: ...`
    pub fn summary(&self) -> String {
        if self.sources.is_empty() {
            return format!("{}: nothing exported", self.bank);
        }
        let parts: Vec<String> = self
            .sources
            .iter()
            .map(|s| {
                if s.result.success {
                    format!(
                        "{} {} imported, {} skipped",
                        s.source_id, s.result.imported, s.result.skipped
                    )
                } else {
                    format!("{} failed: {}", s.source_id, s.result.message)
                }
            })
            .collect();
        format!("{}: {}", self.bank, parts.join("; "))
    }
}

// ============================================================================
// SESSION
// ============================================================================

pub struct Session {
    config: Config,
    broker: Arc<SecretBroker>,
    mappings: MappingStore,
    log: RunLog,
    ledger: Arc<dyn LedgerConnector>,
    portals: PortalRegistry,
    pin: PinHandler,
    run_guard: Mutex<()>,
}

impl Session {
    pub fn new(config: Config, ledger: Arc<dyn LedgerConnector>, portals: PortalRegistry) -> Self {
        let log = RunLog::new();
        let broker = Arc::new(SecretBroker::new(config.secret_timeout, log.clone()));
        Session {
            pin: config.pin_handler(),
            config,
            broker,
            mappings: MappingStore::new(),
            log,
            ledger,
            portals,
            run_guard: Mutex::new(()),
        }
    }

    /// Bundled SQLite ledger plus the downloads-folder portals
    pub fn from_config(config: Config) -> Self {
        let ledger = Arc::new(config.ledger_connector());
        let portals = default_registry(&config.downloads);
        Self::new(config, ledger, portals)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn broker(&self) -> &Arc<SecretBroker> {
        &self.broker
    }

    pub fn mappings(&self) -> &MappingStore {
        &self.mappings
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    pub fn banks(&self) -> Vec<String> {
        self.portals.keys().cloned().collect()
    }

    pub fn portal(&self, bank: &str) -> Option<&Arc<dyn PortalFactory>> {
        self.portals.get(bank)
    }

    pub fn is_running(&self) -> bool {
        self.run_guard.is_locked()
    }

    pub fn save_mapping(&self, source_id: &str, target: LedgerTarget) {
        self.mappings.save(source_id, target);
    }

    /// Run `bank` once. `explicit` targets win over saved mappings; a
    /// successful sync through an explicit target is saved for later runs.
    pub fn run(
        &self,
        bank: &str,
        explicit: &HashMap<String, LedgerTarget>,
    ) -> Result<RunReport, SyncError> {
        let _guard = self.run_guard.try_lock().ok_or(SyncError::RunInProgress)?;
        let factory = self
            .portals
            .get(bank)
            .cloned()
            .ok_or_else(|| SyncError::UnknownBank(bank.to_string()))?;

        let started_at = Utc::now();
        self.log.push(format!("=== {} sync started ===", bank));

        let outcome = self.run_steps(bank, factory.as_ref(), explicit);
        match &outcome {
            Ok(sources) => self.log.push(format!(
                "=== {} sync finished ({} sources) ===",
                bank,
                sources.len()
            )),
            Err(e) => self.log.push(format!("=== {} sync failed: {} ===", bank, e)),
        };

        Ok(RunReport {
            bank: bank.to_string(),
            started_at,
            finished_at: Utc::now(),
            sources: outcome?,
        })
    }

    fn run_steps(
        &self,
        bank: &str,
        factory: &dyn PortalFactory,
        explicit: &HashMap<String, LedgerTarget>,
    ) -> Result<Vec<SourceReport>, SyncError> {
        let mut driver = factory
            .open()
            .map_err(|e| SyncError::PortalNavigation(format!("{:#}", e)))?;

        let mut queue = driver.credential_sequence();
        queue.push(SecretKind::LedgerPassword);
        self.broker.setup_queue(queue);

        let exported = self.fetch_exports(driver.as_mut());
        driver.close();
        let tables = exported?;
        tracing::info!(bank, tables = tables.len(), "exports downloaded");

        let mut client = self.connect()?;

        let mut sources = Vec::with_capacity(tables.len());
        for table in &tables {
            let result = self.sync_source(client.as_mut(), table, explicit);
            self.log
                .push(format!("[{}] {}", table.source_id, result.message));
            sources.push(SourceReport {
                source_id: table.source_id.clone(),
                result,
            });
        }
        Ok(sources)
    }

    fn fetch_exports(&self, driver: &mut dyn PortalDriver) -> Result<Vec<ExportTable>, SyncError> {
        self.log.push(format!("Logging in to {}...", driver.name()));
        match driver.login(self.broker.as_ref())? {
            LoginOutcome::Authenticated => {}
            LoginOutcome::ChallengeRequired => {
                self.pin.run(driver, self.broker.as_ref(), &self.log)?;
            }
        }
        self.log.push("Login successful, downloading exports...");
        driver.download_export()
    }

    fn connect(&self) -> Result<Box<dyn LedgerClient>, SyncError> {
        let password = self.broker.resolve(SecretKind::LedgerPassword)?;
        self.log
            .push(format!("Connecting to ledger at {}...", self.ledger.address()));
        self.ledger
            .connect(&password)
            .map_err(|e| SyncError::LedgerConnection(e.to_string()))
    }

    fn sync_source(
        &self,
        client: &mut dyn LedgerClient,
        table: &ExportTable,
        explicit: &HashMap<String, LedgerTarget>,
    ) -> SyncResult {
        let source = &table.source_id;
        if let Some(target) = explicit.get(source) {
            let result = sync_table(client, table, target, &self.log);
            if result.success {
                self.mappings.save(source, target.clone());
            }
            return result;
        }
        match self.mappings.get(source) {
            Some(target) => sync_table(client, table, &target, &self.log),
            None => SyncResult::failure(SyncError::MissingMapping(source.clone()).to_string()),
        }
    }

    // ------------------------------------------------------------------------
    // Ledger listings for the mapping form (cached ledger password)
    // ------------------------------------------------------------------------

    fn connect_cached(&self) -> Result<Box<dyn LedgerClient>, SyncError> {
        let password = self
            .broker
            .cached(SecretKind::LedgerPassword)
            .ok_or_else(|| {
                SyncError::LedgerConnection("ledger password not supplied yet".to_string())
            })?;
        self.ledger
            .connect(&password)
            .map_err(|e| SyncError::LedgerConnection(e.to_string()))
    }

    pub fn list_budget_files(&self) -> Result<Vec<BudgetFile>, SyncError> {
        let client = self.connect_cached()?;
        client
            .list_files()
            .map_err(|e| SyncError::LedgerConnection(e.to_string()))
    }

    pub fn list_accounts(
        &self,
        file: &str,
        encryption_secret: Option<&SecretValue>,
    ) -> Result<Vec<LedgerAccount>, SyncError> {
        let mut client = self.connect_cached()?;
        ledger::list_accounts(client.as_mut(), file, encryption_secret)
            .map_err(|e| SyncError::LedgerConnection(e.to_string()))
    }
}

// ============================================================================
// SCHEDULED JOB
// ============================================================================

/// Unattended run of one bank with cached secrets and saved mappings
pub struct BankJob {
    session: Arc<Session>,
    bank: String,
}

impl BankJob {
    pub fn new(session: Arc<Session>, bank: impl Into<String>) -> Self {
        BankJob {
            session,
            bank: bank.into(),
        }
    }
}

impl ScheduledJob for BankJob {
    fn name(&self) -> String {
        self.bank.clone()
    }

    fn check_ready(&self) -> Result<(), ScheduleError> {
        let factory = self
            .session
            .portal(&self.bank)
            .ok_or_else(|| ScheduleError::UnknownBank(self.bank.clone()))?;
        let broker = self.session.broker();

        if factory
            .login_secrets()
            .iter()
            .any(|kind| !broker.has_cached(*kind))
        {
            return Err(ScheduleError::MissingBankSecrets(self.bank.clone()));
        }
        if !broker.has_cached(SecretKind::LedgerPassword) {
            return Err(ScheduleError::MissingLedgerSecret);
        }
        if let Some(source) = factory
            .source_ids()
            .into_iter()
            .find(|source| !self.session.mappings().contains(source))
        {
            return Err(ScheduleError::MissingMapping(source));
        }
        Ok(())
    }

    fn run(&self) -> anyhow::Result<String> {
        let report = self.session.run(&self.bank, &HashMap::new())?;
        if report.success() {
            Ok(report.summary())
        } else {
            Err(anyhow::anyhow!(report.summary()))
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
