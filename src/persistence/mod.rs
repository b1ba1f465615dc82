//! SQLite history of detected opportunities and executed trades.
//!
//! Append-only: the pipeline writes terminal records, the `history` CLI
//! command reads them back. Decimals are stored as TEXT to avoid float
//! rounding in the database.

use crate::strategy::detector::Opportunity;
use crate::strategy::executor::Trade;
use crate::strategy::validator::Assessment;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::info;

/// Summary row returned by history queries.
#[derive(Debug, Clone)]
pub struct TradeSummary {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub base: String,
    pub route: String,
    pub state: String,
    pub initial_amount: Decimal,
    pub final_amount: Option<Decimal>,
    pub realized_profit_pct: Option<Decimal>,
}

/// Append-only trade and opportunity log.
pub struct HistoryStore {
    // rusqlite connections are not Sync; writes are rare and short
    conn: Mutex<Connection>,
}

impl HistoryStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        info!("History store initialized at {:?}", db_path.as_ref());
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("history store lock poisoned");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS opportunities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                detected_at TEXT NOT NULL,
                base TEXT NOT NULL,
                route TEXT NOT NULL,
                profit_pct TEXT NOT NULL,
                net_rate TEXT NOT NULL,
                min_leg_volume TEXT NOT NULL,
                max_leg_spread TEXT NOT NULL,
                score TEXT NOT NULL,
                accepted INTEGER NOT NULL,
                reason TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_opportunities_detected_at
                ON opportunities(detected_at);

            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                base TEXT NOT NULL,
                route TEXT NOT NULL,
                state TEXT NOT NULL,
                initial_amount TEXT NOT NULL,
                final_amount TEXT,
                realized_profit_pct TEXT,
                failure_reason TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_trades_started_at ON trades(started_at);

            CREATE TABLE IF NOT EXISTS trade_steps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trade_id INTEGER NOT NULL REFERENCES trades(id),
                leg INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL,
                order_id INTEGER NOT NULL,
                executed_qty TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trade_steps_trade_id ON trade_steps(trade_id);
            "#,
        )?;
        Ok(())
    }

    /// Record a scored opportunity, accepted or not.
    pub fn append_opportunity(
        &self,
        opportunity: &Opportunity,
        assessment: &Assessment,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("history store lock poisoned");
        conn.execute(
            r#"
            INSERT INTO opportunities (detected_at, base, route, profit_pct, net_rate,
                                       min_leg_volume, max_leg_spread, score, accepted, reason)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                millis_to_rfc3339(opportunity.detected_at),
                opportunity.base,
                opportunity.route_signature(),
                opportunity.profit_pct.to_string(),
                opportunity.net_rate.to_string(),
                opportunity.min_leg_volume.to_string(),
                opportunity.max_leg_spread.to_string(),
                assessment.score.to_string(),
                assessment.accepted as i32,
                assessment.reason,
            ],
        )?;
        Ok(())
    }

    /// Record a terminal trade with its filled legs.
    pub fn append_trade(&self, trade: &Trade) -> Result<i64> {
        let conn = self.conn.lock().expect("history store lock poisoned");
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            r#"
            INSERT INTO trades (started_at, finished_at, base, route, state,
                                initial_amount, final_amount, realized_profit_pct, failure_reason)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                millis_to_rfc3339(trade.started_at),
                trade.finished_at.map(millis_to_rfc3339),
                trade.base,
                trade.route,
                trade.state.to_string(),
                trade.initial_amount.to_string(),
                trade.final_amount.map(|v| v.to_string()),
                trade.realized_profit_pct.map(|v| v.to_string()),
                trade.failure_reason,
            ],
        )?;
        let trade_id = tx.last_insert_rowid();

        for step in &trade.steps {
            tx.execute(
                r#"
                INSERT INTO trade_steps (trade_id, leg, symbol, side, quantity, price,
                                         order_id, executed_qty)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    trade_id,
                    step.leg,
                    step.symbol,
                    format!("{:?}", step.side).to_uppercase(),
                    step.quantity.to_string(),
                    step.price.to_string(),
                    step.order_id,
                    step.executed_qty.to_string(),
                ],
            )?;
        }

        tx.commit()?;
        Ok(trade_id)
    }

    /// Most recent trades, newest first.
    pub fn recent_trades(&self, limit: usize) -> Result<Vec<TradeSummary>> {
        let conn = self.conn.lock().expect("history store lock poisoned");
        let mut stmt = conn.prepare(
            r#"
            SELECT id, started_at, base, route, state, initial_amount,
                   final_amount, realized_profit_pct
            FROM trades
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let trades: Vec<TradeSummary> = stmt
            .query_map([limit], |row| {
                Ok(TradeSummary {
                    id: row.get(0)?,
                    started_at: DateTime::parse_from_rfc3339(&row.get::<_, String>(1)?)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    base: row.get(2)?,
                    route: row.get(3)?,
                    state: row.get(4)?,
                    initial_amount: Decimal::from_str(&row.get::<_, String>(5)?)
                        .unwrap_or_default(),
                    final_amount: row
                        .get::<_, Option<String>>(6)?
                        .and_then(|v| Decimal::from_str(&v).ok()),
                    realized_profit_pct: row
                        .get::<_, Option<String>>(7)?
                        .and_then(|v| Decimal::from_str(&v).ok()),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(trades)
    }

    /// Completed / failed / stopped counts over the whole log.
    pub fn trade_counts(&self) -> Result<(u64, u64, u64)> {
        let conn = self.conn.lock().expect("history store lock poisoned");
        let count = |state: &str| -> Result<u64> {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM trades WHERE state = ?1",
                [state],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        };
        Ok((count("COMPLETED")?, count("FAILED")?, count("STOPPED")?))
    }
}

fn millis_to_rfc3339(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .unwrap_or_else(Utc::now)
        .to_rfc3339()
}
