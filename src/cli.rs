use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::domain::{Intent, Side};
use crate::error::{OrdexError, Result};

#[derive(Parser, Debug)]
#[command(name = "ordex")]
#[command(version = "0.1.0")]
#[command(about = "Crash-safe order execution engine", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config directory (default.toml, then the ORDEX_ENV file)
    #[arg(short, long, default_value = "config", env = "ORDEX_CONFIG_DIR")]
    pub config: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run intents through the router against the paper exchange
    Run {
        /// JSON-lines file, one intent per line
        #[arg(short, long)]
        intents: PathBuf,
        /// Reference price, e.g. BTC/USDT=65000 (repeatable)
        #[arg(short, long = "price", value_parser = parse_price)]
        prices: Vec<(String, Decimal)>,
        /// Paper exchange fee rate (e.g. 0.001 = 10 bps)
        #[arg(long, default_value = "0")]
        fee_rate: Decimal,
    },
    /// Restore snapshots and print the recovery report
    Recover,
    /// Print the audit trail for one intent
    Audit {
        intent_id: String,
    },
    /// Print the ledger after restoring reservations from snapshots
    Ledger,
}

/// Parse `SYMBOL=PRICE`
pub fn parse_price(raw: &str) -> std::result::Result<(String, Decimal), String> {
    let (symbol, price) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected SYMBOL=PRICE, got {}", raw))?;
    let symbol = symbol.trim();
    if symbol.is_empty() {
        return Err("symbol cannot be empty".to_string());
    }
    let price = Decimal::from_str(price.trim()).map_err(|e| format!("bad price {}: {}", price, e))?;
    if price <= Decimal::ZERO {
        return Err(format!("price must be positive, got {}", price));
    }
    Ok((symbol.to_string(), price))
}

/// One line of an intents file. `inputs` stands in for the decision inputs
/// hashed into the intent id.
#[derive(Debug, Clone, Deserialize)]
pub struct IntentLine {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub limit_price: Decimal,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub inputs: String,
}

impl IntentLine {
    pub fn into_intent(self, now: DateTime<Utc>) -> Intent {
        Intent::new(
            self.symbol,
            self.side,
            self.quantity,
            self.limit_price,
            self.created_at.unwrap_or(now),
            self.inputs.as_bytes(),
        )
    }
}

/// Parse intents, skipping blank lines and `#` comments
pub fn parse_intents(raw: &str, now: DateTime<Utc>) -> Result<Vec<Intent>> {
    raw.lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(n, line)| {
            serde_json::from_str::<IntentLine>(line)
                .map(|l| l.into_intent(now))
                .map_err(|e| OrdexError::Validation(format!("intents line {}: {}", n + 1, e)))
        })
        .collect()
}

pub async fn read_intents(path: &Path) -> Result<Vec<Intent>> {
    let raw = tokio::fs::read_to_string(path).await?;
    parse_intents(&raw, Utc::now())
}
