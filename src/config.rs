// ⚙️ Configuration - process settings from the environment
// Binaries load `.env` with dotenvy first; `from_lookup` keeps tests hermetic

use anyhow::{anyhow, Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::ledger::SqliteConnector;
use crate::pin::{PinHandler, DEFAULT_PIN_LENGTH};

pub const ENV_LEDGER_URL: &str = "BANKSYNC_LEDGER_URL";
pub const ENV_LEDGER_FILE: &str = "BANKSYNC_LEDGER_FILE";
pub const ENV_LEDGER_CERT: &str = "BANKSYNC_LEDGER_CERT";
pub const ENV_DOWNLOADS: &str = "BANKSYNC_DOWNLOADS";
pub const ENV_ADDR: &str = "BANKSYNC_ADDR";
pub const ENV_SECRET_TIMEOUT: &str = "BANKSYNC_SECRET_TIMEOUT_SECS";
pub const ENV_PIN_LENGTH: &str = "BANKSYNC_PIN_LENGTH";
pub const ENV_PIN_PACING: &str = "BANKSYNC_PIN_PACING_MS";

const DEFAULT_SECRET_TIMEOUT_SECS: u64 = 600;
const DEFAULT_PIN_PACING_MS: u64 = 200;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Ledger server address; a database path for the bundled backend
    pub ledger_url: String,
    /// Default budget file offered by the UI
    pub ledger_file: Option<String>,
    pub ledger_cert: Option<PathBuf>,
    pub downloads: PathBuf,
    pub bind_addr: SocketAddr,
    /// `None` waits for the operator forever
    pub secret_timeout: Option<Duration>,
    pub pin_length: u8,
    pub pin_pacing: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ledger_url: "./ledger.db".to_string(),
            ledger_file: None,
            ledger_cert: None,
            downloads: PathBuf::from("./downloads"),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 2077)),
            secret_timeout: Some(Duration::from_secs(DEFAULT_SECRET_TIMEOUT_SECS)),
            pin_length: DEFAULT_PIN_LENGTH,
            pin_pacing: Duration::from_millis(DEFAULT_PIN_PACING_MS),
        }
    }
}

fn parse_var<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("{} has an invalid value '{}'", name, raw))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key -> value source; unset and empty keys use defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Config::default();

        if let Some(url) = get(ENV_LEDGER_URL) {
            config.ledger_url = url;
        }
        config.ledger_file = get(ENV_LEDGER_FILE);
        config.ledger_cert = get(ENV_LEDGER_CERT).map(PathBuf::from);
        if let Some(dir) = get(ENV_DOWNLOADS) {
            config.downloads = PathBuf::from(dir);
        }
        if let Some(addr) = get(ENV_ADDR) {
            config.bind_addr = parse_var(ENV_ADDR, &addr)?;
        }
        if let Some(secs) = get(ENV_SECRET_TIMEOUT) {
            let secs: u64 = parse_var(ENV_SECRET_TIMEOUT, &secs)?;
            config.secret_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(length) = get(ENV_PIN_LENGTH) {
            config.pin_length = parse_var(ENV_PIN_LENGTH, &length)?;
            if config.pin_length == 0 {
                return Err(anyhow!("{} must be at least 1", ENV_PIN_LENGTH));
            }
        }
        if let Some(ms) = get(ENV_PIN_PACING) {
            config.pin_pacing = Duration::from_millis(parse_var(ENV_PIN_PACING, &ms)?);
        }

        Ok(config)
    }

    pub fn pin_handler(&self) -> PinHandler {
        PinHandler::new(self.pin_length, self.pin_pacing)
    }

    pub fn ledger_connector(&self) -> SqliteConnector {
        SqliteConnector::new(&self.ledger_url).with_certificate(self.ledger_cert.clone())
    }
}
