// Bank Sync - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod error;
pub mod config;
pub mod runlog;
pub mod secrets;      // Secret Broker
pub mod pin;          // Partial-disclosure PIN challenges
pub mod export;
pub mod portal;
pub mod rules;
pub mod ledger;
pub mod mapping;
pub mod sync;         // Idempotent Sync Engine
pub mod pipeline;
pub mod scheduler;

#[cfg(feature = "server")]
pub mod api;

// Re-export commonly used types
pub use error::SyncError;
pub use config::Config;
pub use runlog::{LogLine, RunLog};
pub use secrets::{
    AnswerError, PendingPrompt, SecretBroker, SecretKind, SecretProvider, SecretValue,
};
pub use pin::{ChallengeError, PinChallenge, PinHandler};
pub use export::{load_csv, ExportRow, ExportTable};
pub use portal::{
    default_registry, DownloadsDriver, DownloadsFactory, LoginOutcome, PortalDriver,
    PortalFactory, PortalRegistry,
};
pub use rules::{CategorizationRule, RuleField, RuleSet};
pub use ledger::{
    BudgetFile, LedgerAccount, LedgerBudget, LedgerClient, LedgerConnector, LedgerError,
    NewTransaction, SqliteConnector,
};
pub use mapping::{LedgerTarget, MappingStore, MappingView};
pub use sync::{sync_table, SyncResult};
pub use pipeline::{BankJob, RunReport, Session, SourceReport};
pub use scheduler::{
    ScheduleError, ScheduleInterval, ScheduledJob, Scheduler, SchedulerStatus,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
