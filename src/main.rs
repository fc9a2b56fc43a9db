//! # Tabkeeper REPL
//!
//! Drives one session through the core from the terminal. Every command is
//! handled as one request: rate limit, admission, request scope, flush.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin tabkeeper -- --session demo
//! ```
//!
//! Commands:
//! - `turn [placed]` - Advance the conversation one turn
//! - `add <name> <price> [qty]` - Add an item to the current order
//! - `place` - Place the current order and advance the turn
//! - `clear` - Drop the in-progress order
//! - `tip <percent>%` / `tip <amount>` - Set the tip
//! - `pay` - Settle the tab
//! - `show [section]` - Print the session record or one section
//! - `stats` - Print core counters as JSON
//! - `reset` - Restore the session to its defaults
//! - `quit` - Exit

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::env;
use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::sync::OnceLock;
use tabkeeper::config::LoggingConfig;
use tabkeeper::session::{LineItem, RequestScope, SessionState};
use tabkeeper::{Config, SessionCore};

static TRACE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Tabkeeper - session state, payments and admission control for ordering agents
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (defaults to tabkeeper.toml + tabkeeper.local.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Session id to drive (a random one if omitted)
    #[arg(short, long)]
    session: Option<String>,

    /// Start the background sweeps
    #[arg(long)]
    sweep: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;
    init_tracing(&config.logging);

    let core = SessionCore::from_config(config)?;
    if args.sweep {
        core.start_background()?;
    }

    let session_id = args
        .session
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    println!("Tabkeeper REPL");
    println!("==============\n");
    println!("Session: {session_id}");
    println!("Type `help` for commands.\n");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "quit" | "exit" => break,
            "help" => print_help(),
            "stats" => println!("{}", serde_json::to_string_pretty(&core.stats())?),
            _ => {
                if let Err(e) = handle_request(&core, &session_id, input) {
                    println!("Error: {e:#}");
                }
            }
        }
    }

    core.shutdown();
    println!("Goodbye!");
    Ok(())
}

fn print_help() {
    println!("\nCommands:");
    println!("  turn [placed]            - Advance the conversation one turn");
    println!("  add <name> <price> [qty] - Add an item to the current order");
    println!("  place                    - Place the order and advance the turn");
    println!("  clear                    - Drop the in-progress order");
    println!("  tip <percent>% | <amount> - Set the tip");
    println!("  pay                      - Settle the tab");
    println!("  show [section]           - Print the session or one section");
    println!("  stats                    - Print core counters");
    println!("  reset                    - Restore session defaults");
    println!("  quit                     - Exit\n");
}

/// Run one command as one request
fn handle_request(core: &SessionCore, session_id: &str, input: &str) -> Result<()> {
    let mut scope = core.begin_request(session_id, None)?;
    let result = execute(&mut scope, input);
    let summary = scope.finish().context("failed to persist session")?;
    tracing::debug!(
        session_id = %session_id,
        updates = summary.updates,
        writes = summary.writes,
        "request_finished"
    );
    result
}

fn execute(scope: &mut RequestScope, input: &str) -> Result<()> {
    let parts: Vec<&str> = input.split_whitespace().collect();
    match parts.as_slice() {
        ["turn"] | ["turn", "placed"] => {
            let change = scope.advance_turn(parts.len() == 2)?;
            println!("phase: {} -> {} (turn {})", change.from, change.to, change.turn);
        }
        ["add", name, price, rest @ ..] => {
            let price: f64 = price.parse().context("price must be a number")?;
            let mut item = LineItem::new(*name, price);
            if let Some(qty) = rest.first() {
                item = item.with_quantity(qty.parse().context("quantity must be a whole number")?);
            }
            let order = scope.add_item(item)?;
            println!(
                "tab: {:.2} ({} item(s) pending)",
                order.order_history.total_cost,
                order.current_order.len()
            );
        }
        ["place"] => {
            let placed = scope.place_order()?;
            let change = scope.advance_turn(placed)?;
            println!("placed: {placed}, phase: {}", change.to);
        }
        ["clear"] => {
            scope.clear_order()?;
            println!("current order cleared");
        }
        ["tip", value] => {
            let payment = match value.strip_suffix('%') {
                Some(pct) => scope.set_tip_percentage(pct.parse().context("invalid percentage")?)?,
                None => scope.set_tip_amount(value.parse().context("invalid amount")?)?,
            };
            println!("tip: {:.2}, total due: {:.2}", payment.tip_amount, payment.total_due());
        }
        ["pay"] => {
            let outcome = scope.atomic_payment_complete();
            println!("{}", serde_json::to_string(&outcome)?);
        }
        ["show"] => {
            println!("{}", serde_json::to_string_pretty(&scope.get_session_data()?)?);
        }
        ["show", section] => {
            println!("{}", serde_json::to_string_pretty(&scope.get_section(section)?)?);
        }
        ["reset"] => {
            scope.reset()?;
            println!("session reset");
        }
        _ => bail!("unknown command: {input} (type `help`)"),
    }
    Ok(())
}

fn init_tracing(logging_config: &LoggingConfig) {
    // Environment variables take precedence over config file values
    let enabled = env::var("TABKEEPER_TRACE").ok().is_some_and(|v| v != "0");
    if !enabled {
        return;
    }

    let log_path =
        env::var("TABKEEPER_TRACE_FILE").unwrap_or_else(|_| "tabkeeper_trace.log".to_string());
    let json = env::var("TABKEEPER_TRACE_JSON")
        .ok()
        .map_or_else(|| logging_config.format == "json", |v| v != "0");
    let level = env::var("TABKEEPER_TRACE_LEVEL")
        .ok()
        .unwrap_or_else(|| logging_config.level.clone());

    let file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(f) => f,
        Err(e) => {
            eprintln!("ERROR: Unable to open TABKEEPER_TRACE_FILE '{log_path}': {e}");
            return;
        }
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(file);
    let _ = TRACE_GUARD.set(guard);

    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let base = || {
        tracing_subscriber::fmt()
            .with_env_filter(filter.clone())
            .with_ansi(false)
            .with_thread_names(true)
            .with_writer(non_blocking.clone())
    };

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = if json {
        Box::new(base().json().finish())
    } else {
        Box::new(base().compact().finish())
    };

    let _ = tracing::subscriber::set_global_default(subscriber);
}
