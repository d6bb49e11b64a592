// =============================================================================
// Persistent Store (§4.B) — SQLite-backed durable tables (§6)
// =============================================================================
//
// The teacher persists only a single JSON config snapshot. This engine's
// durable-table requirement needs genuine embedded SQL storage, so `rusqlite`
// (bundled SQLite, as used by the sibling `cooprefr-bettersys` trading
// backend in this pack) is adopted. A single connection behind a
// `parking_lot::Mutex` matches the teacher's lock-first concurrency style —
// SQLite serializes writers internally anyway, so there is no contention
// cost beyond what the engine would pay regardless.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::TimeZone;
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::domain::{Notification, NotificationLevel, StrategyConfig, TradeRecord};

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if absent) the SQLite database at `path` and ensure
    /// every durable table from §6 exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).context("failed to open sqlite store")?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite store")?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS historical_bars (
                symbol TEXT NOT NULL,
                timeframe_value INTEGER NOT NULL,
                timeframe_unit TEXT NOT NULL,
                open_time INTEGER NOT NULL,
                o REAL NOT NULL,
                h REAL NOT NULL,
                l REAL NOT NULL,
                c REAL NOT NULL,
                v REAL NOT NULL,
                PRIMARY KEY (symbol, timeframe_value, timeframe_unit, open_time)
            );
            CREATE INDEX IF NOT EXISTS idx_bars_coverage
                ON historical_bars (symbol, timeframe_value, timeframe_unit, open_time DESC);

            CREATE TABLE IF NOT EXISTS account_state (
                account_id TEXT PRIMARY KEY,
                balance REAL NOT NULL,
                equity REAL NOT NULL,
                dll_used REAL NOT NULL,
                mll_used REAL NOT NULL,
                start_of_day_balance REAL NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS strategy_config (
                account_id TEXT NOT NULL,
                name TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                symbols_json TEXT NOT NULL,
                position_size REAL NOT NULL,
                max_positions INTEGER NOT NULL,
                params_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (account_id, name)
            );

            CREATE TABLE IF NOT EXISTS strategy_stats (
                account_id TEXT NOT NULL,
                name TEXT NOT NULL,
                total_trades INTEGER NOT NULL,
                winning INTEGER NOT NULL,
                total_pnl REAL NOT NULL,
                max_drawdown REAL NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (account_id, name)
            );

            CREATE TABLE IF NOT EXISTS trade_history (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                strategy_name TEXT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price REAL NOT NULL,
                exit_price REAL NOT NULL,
                entry_time INTEGER NOT NULL,
                exit_time INTEGER NOT NULL,
                qty REAL NOT NULL,
                gross_pnl REAL NOT NULL,
                fees REAL NOT NULL,
                net_pnl REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_account ON trade_history (account_id, exit_time DESC);

            CREATE TABLE IF NOT EXISTS notifications (
                account_id TEXT NOT NULL,
                id TEXT NOT NULL,
                ts INTEGER NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                meta_json TEXT NOT NULL,
                PRIMARY KEY (account_id, id)
            );

            CREATE TABLE IF NOT EXISTS settings (
                scope TEXT NOT NULL,
                key TEXT NOT NULL,
                value_json TEXT NOT NULL,
                PRIMARY KEY (scope, key)
            );
            "#,
        )
        .context("failed to migrate sqlite schema")?;
        Ok(())
    }

    // -- historical_bars ------------------------------------------------

    pub fn upsert_bars(&self, symbol: &str, tf_value: u32, tf_unit: &str, bars: &[(i64, f64, f64, f64, f64, f64)]) -> Result<()> {
        let conn = self.conn.lock();
        for (open_time, o, h, l, c, v) in bars {
            conn.execute(
                "INSERT INTO historical_bars (symbol, timeframe_value, timeframe_unit, open_time, o, h, l, c, v)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(symbol, timeframe_value, timeframe_unit, open_time)
                 DO UPDATE SET o=excluded.o, h=excluded.h, l=excluded.l, c=excluded.c, v=excluded.v",
                params![symbol, tf_value, tf_unit, open_time, o, h, l, c, v],
            )?;
        }
        Ok(())
    }

    pub fn load_bars(
        &self,
        symbol: &str,
        tf_value: u32,
        tf_unit: &str,
        start: i64,
        end: i64,
        limit: usize,
    ) -> Result<Vec<(i64, f64, f64, f64, f64, f64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT open_time, o, h, l, c, v FROM historical_bars
             WHERE symbol=?1 AND timeframe_value=?2 AND timeframe_unit=?3
               AND open_time >= ?4 AND open_time <= ?5
             ORDER BY open_time ASC LIMIT ?6",
        )?;
        let rows = stmt
            .query_map(params![symbol, tf_value, tf_unit, start, end, limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, f64>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // -- strategy_config --------------------------------------------------

    pub fn save_strategy_config(&self, cfg: &StrategyConfig) -> Result<()> {
        let conn = self.conn.lock();
        let symbols_json = serde_json::to_string(&cfg.symbols)?;
        let params_json = serde_json::to_string(&cfg.params)?;
        conn.execute(
            "INSERT INTO strategy_config (account_id, name, enabled, symbols_json, position_size, max_positions, params_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, strftime('%s','now'))
             ON CONFLICT(account_id, name) DO UPDATE SET
                enabled=excluded.enabled, symbols_json=excluded.symbols_json,
                position_size=excluded.position_size, max_positions=excluded.max_positions,
                params_json=excluded.params_json, updated_at=excluded.updated_at",
            params![
                cfg.account_id,
                cfg.name.to_string(),
                cfg.enabled as i64,
                symbols_json,
                cfg.position_size,
                cfg.max_positions,
                params_json,
            ],
        )?;
        Ok(())
    }

    pub fn load_strategy_configs(&self, account_id: &str) -> Result<Vec<StrategyConfig>> {
        use crate::domain::{StrategyKind, StrategyParams};

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name, enabled, symbols_json, position_size, max_positions, params_json
             FROM strategy_config WHERE account_id=?1",
        )?;
        let rows = stmt.query_map(params![account_id], |row| {
            let name: String = row.get(0)?;
            let enabled: i64 = row.get(1)?;
            let symbols_json: String = row.get(2)?;
            let position_size: f64 = row.get(3)?;
            let max_positions: i64 = row.get(4)?;
            let params_json: String = row.get(5)?;
            Ok((name, enabled, symbols_json, position_size, max_positions, params_json))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (name, enabled, symbols_json, position_size, max_positions, params_json) = row?;
            let kind = match name.as_str() {
                "OvernightRange" => StrategyKind::OvernightRange,
                "MeanReversion" => StrategyKind::MeanReversion,
                "TrendFollowing" => StrategyKind::TrendFollowing,
                _ => continue,
            };
            out.push(StrategyConfig {
                name: kind,
                account_id: account_id.to_string(),
                enabled: enabled != 0,
                symbols: serde_json::from_str(&symbols_json).unwrap_or_default(),
                position_size,
                max_positions: max_positions as u32,
                params: serde_json::from_str::<StrategyParams>(&params_json).unwrap_or_default(),
            });
        }
        Ok(out)
    }

    /// Every persisted `StrategyConfig` across all accounts, for the
    /// startup auto-enable pass (§4.J, §8 invariant 7): the runtime doesn't
    /// know which accounts exist yet at load time, so it scans the whole
    /// table rather than one account at a time.
    pub fn load_all_strategy_configs(&self) -> Result<Vec<StrategyConfig>> {
        use crate::domain::{StrategyKind, StrategyParams};

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT account_id, name, enabled, symbols_json, position_size, max_positions, params_json
             FROM strategy_config",
        )?;
        let rows = stmt.query_map([], |row| {
            let account_id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let enabled: i64 = row.get(2)?;
            let symbols_json: String = row.get(3)?;
            let position_size: f64 = row.get(4)?;
            let max_positions: i64 = row.get(5)?;
            let params_json: String = row.get(6)?;
            Ok((account_id, name, enabled, symbols_json, position_size, max_positions, params_json))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (account_id, name, enabled, symbols_json, position_size, max_positions, params_json) = row?;
            let kind = match name.as_str() {
                "OvernightRange" => StrategyKind::OvernightRange,
                "MeanReversion" => StrategyKind::MeanReversion,
                "TrendFollowing" => StrategyKind::TrendFollowing,
                _ => continue,
            };
            out.push(StrategyConfig {
                name: kind,
                account_id,
                enabled: enabled != 0,
                symbols: serde_json::from_str(&symbols_json).unwrap_or_default(),
                position_size,
                max_positions: max_positions as u32,
                params: serde_json::from_str::<StrategyParams>(&params_json).unwrap_or_default(),
            });
        }
        Ok(out)
    }

    // -- trade_history -----------------------------------------------------

    pub fn insert_trade(&self, trade: &TradeRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO trade_history
             (id, account_id, strategy_name, symbol, side, entry_price, exit_price, entry_time, exit_time, qty, gross_pnl, fees, net_pnl)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
            params![
                trade.id,
                trade.account_id,
                trade.strategy_name,
                trade.symbol,
                trade.side.to_string(),
                trade.entry_price,
                trade.exit_price,
                trade.entry_time.timestamp(),
                trade.exit_time.timestamp(),
                trade.quantity,
                trade.gross_pnl,
                trade.fees,
                trade.net_pnl,
            ],
        )?;
        Ok(())
    }

    pub fn count_trades(&self, account_id: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trade_history WHERE account_id=?1",
            params![account_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Most recent `limit` trades for `account_id`, newest first, optionally
    /// filtered to one symbol (`/api/trades?account_id&limit&type`, §6).
    pub fn load_trades(&self, account_id: &str, limit: i64, symbol: Option<&str>) -> Result<Vec<TradeRecord>> {
        use crate::domain::OrderSide;

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, strategy_name, symbol, side, entry_price, exit_price, entry_time, exit_time,
                    qty, gross_pnl, fees, net_pnl
             FROM trade_history
             WHERE account_id=?1 AND (?2 IS NULL OR symbol=?2)
             ORDER BY exit_time DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![account_id, symbol, limit], |row| {
            let side: String = row.get(4)?;
            let entry_time: i64 = row.get(7)?;
            let exit_time: i64 = row.get(8)?;
            Ok(TradeRecord {
                id: row.get(0)?,
                account_id: row.get(1)?,
                strategy_name: row.get(2)?,
                symbol: row.get(3)?,
                side: if side == "BUY" { OrderSide::Buy } else { OrderSide::Sell },
                entry_price: row.get(5)?,
                exit_price: row.get(6)?,
                entry_time: chrono::Utc.timestamp_opt(entry_time, 0).single().unwrap_or_default(),
                exit_time: chrono::Utc.timestamp_opt(exit_time, 0).single().unwrap_or_default(),
                quantity: row.get(9)?,
                gross_pnl: row.get(10)?,
                fees: row.get(11)?,
                net_pnl: row.get(12)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to load trade history")
    }

    // -- notifications -----------------------------------------------------

    pub fn insert_notification(&self, n: &Notification) -> Result<()> {
        let conn = self.conn.lock();
        let level = match n.level {
            NotificationLevel::Info => "info",
            NotificationLevel::Warning => "warning",
            NotificationLevel::Error => "error",
            NotificationLevel::Success => "success",
        };
        conn.execute(
            "INSERT OR REPLACE INTO notifications (account_id, id, ts, level, message, meta_json)
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![n.account_id, n.id, n.timestamp.timestamp(), level, n.message, n.meta.to_string()],
        )?;
        Ok(())
    }

    /// Drop notifications older than 7 days, per §6 retention policy.
    pub fn prune_notifications(&self, now_unix: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let cutoff = now_unix - 7 * 24 * 3600;
        let n = conn.execute("DELETE FROM notifications WHERE ts < ?1", params![cutoff])?;
        Ok(n)
    }

    // -- settings -----------------------------------------------------------

    pub fn set_setting(&self, scope: &str, key: &str, value: &serde_json::Value) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO settings (scope, key, value_json) VALUES (?1,?2,?3)
             ON CONFLICT(scope, key) DO UPDATE SET value_json=excluded.value_json",
            params![scope, key, value.to_string()],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, scope: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.lock();
        let value: Option<String> = conn
            .query_row(
                "SELECT value_json FROM settings WHERE scope=?1 AND key=?2",
                params![scope, key],
                |row| row.get(0),
            )
            .ok();
        Ok(value.and_then(|v| serde_json::from_str(&v).ok()))
    }

    /// Every `(key, value)` pair in `scope`, for `GET /api/settings/{scope}`.
    pub fn list_settings(&self, scope: &str) -> Result<Vec<(String, serde_json::Value)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key, value_json FROM settings WHERE scope=?1")?;
        let rows = stmt.query_map(params![scope], |row| {
            let key: String = row.get(0)?;
            let value_json: String = row.get(1)?;
            Ok((key, value_json))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (key, value_json) = row?;
            out.push((key, serde_json::from_str(&value_json).unwrap_or(serde_json::Value::Null)));
        }
        Ok(out)
    }

    /// Most recent `limit` notifications for `account_id`, newest first
    /// (`GET /api/notifications`, §6).
    pub fn load_notifications(&self, account_id: &str, limit: i64) -> Result<Vec<Notification>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, ts, level, message, meta_json FROM notifications
             WHERE account_id=?1 ORDER BY ts DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![account_id, limit], |row| {
            let id: String = row.get(0)?;
            let ts: i64 = row.get(1)?;
            let level: String = row.get(2)?;
            let message: String = row.get(3)?;
            let meta_json: String = row.get(4)?;
            Ok((id, ts, level, message, meta_json))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, ts, level, message, meta_json) = row?;
            let level = match level.as_str() {
                "warning" => NotificationLevel::Warning,
                "error" => NotificationLevel::Error,
                "success" => NotificationLevel::Success,
                _ => NotificationLevel::Info,
            };
            out.push(Notification {
                id,
                account_id: account_id.to_string(),
                timestamp: chrono::Utc.timestamp_opt(ts, 0).single().unwrap_or_default(),
                level,
                message,
                meta: serde_json::from_str(&meta_json).unwrap_or(serde_json::Value::Null),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{StrategyKind, StrategyParams};

    #[test]
    fn bars_upsert_then_load_is_sorted_and_deduplicated() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_bars(
                "MNQ",
                5,
                "minute",
                &[
                    (200, 1.0, 2.0, 0.5, 1.5, 10.0),
                    (100, 1.0, 2.0, 0.5, 1.5, 10.0),
                    (200, 9.0, 9.0, 9.0, 9.0, 99.0), // overwrite
                ],
            )
            .unwrap();

        let bars = store.load_bars("MNQ", 5, "minute", 0, 1_000, 100).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].0, 100);
        assert_eq!(bars[1].0, 200);
        assert!((bars[1].1 - 9.0).abs() < f64::EPSILON);
    }

    #[test]
    fn strategy_config_roundtrips_through_store() {
        let store = Store::open_in_memory().unwrap();
        let cfg = crate::domain::StrategyConfig {
            name: StrategyKind::OvernightRange,
            account_id: "A1".to_string(),
            enabled: true,
            symbols: vec!["MNQ".to_string()],
            position_size: 2.0,
            max_positions: 1,
            params: StrategyParams::default(),
        };
        store.save_strategy_config(&cfg).unwrap();

        let loaded = store.load_strategy_configs("A1").unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].enabled);
        assert_eq!(loaded[0].symbols, vec!["MNQ".to_string()]);
    }

    #[test]
    fn settings_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        store.set_setting("global", "theme", &serde_json::json!("dark")).unwrap();
        let v = store.get_setting("global", "theme").unwrap();
        assert_eq!(v, Some(serde_json::json!("dark")));
        assert!(store.get_setting("global", "missing").unwrap().is_none());
    }
}
