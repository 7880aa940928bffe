// 🏦 Bank Sync - CLI
// Interactive runs from a terminal plus ledger administration

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::env;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use bank_sync::ledger::sqlite;
use bank_sync::{Config, LedgerTarget, RuleSet, SecretBroker, SecretValue, Session};

const USAGE: &str = "\
Usage:
  bank-sync run <bank> [source=[File:]Account[:encryption-secret] ...]
  bank-sync banks
  bank-sync ledger-init <password>
  bank-sync ledger-add-file <name> [encryption-secret]
  bank-sync ledger-add-account <file> <account>
  bank-sync ledger-close-account <file> <account>
  bank-sync ledger-add-rules <file> <rules.json>
  bank-sync ledger-show <file>

Prompts during `run` read plain stdin and the terminal echoes what you type,
secrets and PIN digits included. Use a private terminal or the web server.";

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn,bank_sync=info".into()),
        )
        .init();
}

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::dotenv();
    init_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    let config = Config::from_env()?;

    match args.first().map(String::as_str) {
        Some("run") => {
            let bank = args.get(1).ok_or_else(|| anyhow!("missing <bank>\n{}", USAGE))?;
            run_bank(config, bank, &args[2..])
        }
        Some("banks") => {
            let session = Session::from_config(config);
            for bank in session.banks() {
                println!("{}", bank);
            }
            Ok(())
        }
        Some("ledger-init") => {
            let password = arg(&args, 1, "<password>")?;
            sqlite::initialize(ledger_path(&config), password)?;
            println!("✓ Ledger initialized at {}", config.ledger_url);
            Ok(())
        }
        Some("ledger-add-file") => {
            let name = arg(&args, 1, "<name>")?;
            let conn = sqlite::open_ledger(ledger_path(&config))?;
            sqlite::create_budget_file(&conn, name, args.get(2).map(String::as_str))?;
            println!("✓ Budget file '{}' created", name);
            Ok(())
        }
        Some("ledger-add-account") => {
            let file = arg(&args, 1, "<file>")?;
            let account = arg(&args, 2, "<account>")?;
            let conn = sqlite::open_ledger(ledger_path(&config))?;
            sqlite::create_account(&conn, file, account)?;
            println!("✓ Account '{}' created in '{}'", account, file);
            Ok(())
        }
        Some("ledger-close-account") => {
            let file = arg(&args, 1, "<file>")?;
            let account = arg(&args, 2, "<account>")?;
            let conn = sqlite::open_ledger(ledger_path(&config))?;
            sqlite::close_account(&conn, file, account)?;
            println!("✓ Account '{}' closed in '{}'", account, file);
            Ok(())
        }
        Some("ledger-add-rules") => {
            let file = arg(&args, 1, "<file>")?;
            let rules = RuleSet::from_file(arg(&args, 2, "<rules.json>")?)?;
            let conn = sqlite::open_ledger(ledger_path(&config))?;
            let count = sqlite::add_rules(&conn, file, rules.rules())?;
            println!("✓ {} rules stored in '{}'", count, file);
            Ok(())
        }
        Some("ledger-show") => {
            let file = arg(&args, 1, "<file>")?;
            let conn = sqlite::open_ledger(ledger_path(&config))?;
            for tx in sqlite::transactions(&conn, file)? {
                println!(
                    "{}  {:<12} {:>10.2}  {:<30} {}",
                    tx.date,
                    tx.account,
                    tx.amount_cents as f64 / 100.0,
                    tx.payee.as_deref().unwrap_or(""),
                    tx.category.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
}

fn arg<'a>(args: &'a [String], index: usize, name: &str) -> Result<&'a str> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("missing {}\n{}", name, USAGE))
}

fn ledger_path(config: &Config) -> &Path {
    Path::new(&config.ledger_url)
}

/// `source=File:Account[:secret]`, or `source=Account` with a default file
fn parse_target(raw: &str, default_file: Option<&str>) -> Result<(String, LedgerTarget)> {
    let invalid = || anyhow!("invalid target '{}' (expected source=File:Account)", raw);
    let (source, target) = raw.split_once('=').ok_or_else(invalid)?;
    let parts: Vec<&str> = target.splitn(3, ':').collect();

    let (file, account, secret) = match parts.as_slice() {
        [account] => (default_file.ok_or_else(invalid)?, *account, None),
        [file, account] => (*file, *account, None),
        [file, account, secret] => (*file, *account, Some(*secret)),
        _ => return Err(invalid()),
    };
    if source.is_empty() || file.is_empty() || account.is_empty() {
        return Err(invalid());
    }

    let mut ledger_target = LedgerTarget::new(file, account);
    if let Some(secret) = secret.filter(|s| !s.is_empty()) {
        ledger_target = ledger_target.with_encryption_secret(SecretValue::new(secret));
    }
    Ok((source.to_string(), ledger_target))
}

fn run_bank(config: Config, bank: &str, target_args: &[String]) -> Result<()> {
    let default_file = config.ledger_file.clone();
    let targets = target_args
        .iter()
        .map(|raw| parse_target(raw, default_file.as_deref()))
        .collect::<Result<HashMap<_, _>>>()?;

    println!("🏦 Bank Sync - {}", bank);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("⚠️  Answers typed here are echoed to the terminal");

    let session = Session::from_config(config);
    let done = Arc::new(AtomicBool::new(false));
    spawn_terminal_responder(Arc::clone(session.broker()), Arc::clone(&done));

    let outcome = session.run(bank, &targets);
    done.store(true, Ordering::SeqCst);
    let report = outcome?;

    println!();
    for source in &report.sources {
        let mark = if source.result.success { "✓" } else { "❌" };
        println!("{} {}: {}", mark, source.source_id, source.result.message);
        for error in &source.result.row_errors {
            println!("   ⚠️  {}", error);
        }
    }
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("{}", report.summary());

    if report.success() {
        Ok(())
    } else {
        Err(anyhow!("{} had failed sources", bank))
    }
}

/// Answers broker prompts from stdin until the run finishes
fn spawn_terminal_responder(broker: Arc<SecretBroker>, done: Arc<AtomicBool>) {
    thread::spawn(move || {
        let stdin = io::stdin();
        let mut answered = None;
        while !done.load(Ordering::SeqCst) {
            let prompt = match broker.pending() {
                Some(prompt) if answered != Some(prompt.id) => prompt,
                _ => {
                    thread::sleep(Duration::from_millis(100));
                    continue;
                }
            };

            print!("{}: ", prompt.prompt_text());
            let _ = io::stdout().flush();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
                return;
            }
            answered = Some(prompt.id);
            if let Err(e) = broker.answer(prompt.id, line.trim_end_matches(['\r', '\n'])) {
                eprintln!("❌ {}", e);
                answered = None;
            }
        }
    });
}
