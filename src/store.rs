//! SQLite-backed position store
//!
//! One row per managed position, written through on every supervisor-observed
//! transition. After `upsert` returns, a subsequent process start observes the
//! written value; the supervisor's per-position lock serializes writers.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::types::{ManagedPosition, PartialExit, StatusFilter};

pub struct PositionStore {
    conn: Mutex<Connection>,
    next_id: AtomicI64,
    json_backup_path: Option<PathBuf>,
}

impl PositionStore {
    /// Open (or create) the store at `db_path`. With `json_backup` a
    /// readable JSON snapshot is written next to the database after every
    /// mutation.
    pub fn open<P: AsRef<Path>>(db_path: P, json_backup: bool) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        // WAL for concurrent readers while the supervisor writes
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let backup = json_backup.then(|| db_path.with_extension("json"));
        let store = Self::init(conn, backup)?;
        info!("position store ready at {}", db_path.display());
        Ok(store)
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, json_backup_path: Option<PathBuf>) -> Result<Self, StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                strategy_tag TEXT NOT NULL DEFAULT '',
                quantity REAL NOT NULL,
                remaining_quantity REAL NOT NULL,
                allocation REAL NOT NULL,
                entry_order_id TEXT,
                entry_order_type TEXT NOT NULL,
                entry_price REAL NOT NULL,
                stop_price REAL NOT NULL,
                stop_percent REAL,
                stop_order_id TEXT,
                trailing_enabled INTEGER NOT NULL DEFAULT 0,
                trailing_percent REAL,
                take_profit_price REAL NOT NULL,
                take_profit_percent REAL,
                take_profit_order_id TEXT,
                partial_exit TEXT,
                status TEXT NOT NULL,
                current_price REAL NOT NULL DEFAULT 0,
                unrealized_pl REAL NOT NULL DEFAULT 0,
                unrealized_pl_pct REAL NOT NULL DEFAULT 0,
                notes TEXT NOT NULL DEFAULT '',
                tags TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                closed_at TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;

        let max_id: i64 =
            conn.query_row("SELECT COALESCE(MAX(id), 0) FROM positions", [], |row| {
                row.get(0)
            })?;

        debug!("position schema verified, max id {}", max_id);

        Ok(Self {
            conn: Mutex::new(conn),
            next_id: AtomicI64::new(max_id),
            json_backup_path,
        })
    }

    /// Allocate the next position id; monotonic across restarts because the
    /// counter is seeded from the table at open.
    pub fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Write a position through, replacing any previous row with the same id
    pub fn upsert(&self, pos: &ManagedPosition) -> Result<(), StoreError> {
        let partial_json = pos
            .partial_exit
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let tags_json = serde_json::to_string(&pos.tags)?;

        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT OR REPLACE INTO positions
                 (id, symbol, side, strategy_tag, quantity, remaining_quantity,
                  allocation, entry_order_id, entry_order_type, entry_price,
                  stop_price, stop_percent, stop_order_id, trailing_enabled,
                  trailing_percent, take_profit_price, take_profit_percent,
                  take_profit_order_id, partial_exit, status, current_price,
                  unrealized_pl, unrealized_pl_pct, notes, tags, created_at,
                  updated_at, closed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                         ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22,
                         ?23, ?24, ?25, ?26, ?27, ?28)",
                params![
                    pos.id,
                    pos.symbol,
                    pos.side.as_str(),
                    pos.strategy_tag,
                    pos.quantity,
                    pos.remaining_quantity,
                    pos.allocation,
                    pos.entry_order_id,
                    pos.entry_order_type.as_str(),
                    pos.entry_price,
                    pos.stop_price,
                    pos.stop_percent,
                    pos.stop_order_id,
                    pos.trailing_enabled as i64,
                    pos.trailing_percent,
                    pos.take_profit_price,
                    pos.take_profit_percent,
                    pos.take_profit_order_id,
                    partial_json,
                    pos.status.as_str(),
                    pos.current_price,
                    pos.unrealized_pl,
                    pos.unrealized_pl_pct,
                    pos.notes,
                    tags_json,
                    pos.created_at.to_rfc3339(),
                    pos.updated_at.to_rfc3339(),
                    pos.closed_at.map(|t| t.to_rfc3339()),
                ],
            )?;
        }

        debug!(
            "position saved: #{} {} [{}] remaining={:.0}",
            pos.id, pos.symbol, pos.status, pos.remaining_quantity
        );

        if self.json_backup_path.is_some() {
            self.export_json()?;
        }

        Ok(())
    }

    /// Fetch one position by id
    pub fn get(&self, id: i64) -> Result<Option<ManagedPosition>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM positions WHERE id = ?1")?;

        match stmt.query_row(params![id], row_to_position) {
            Ok(pos) => Ok(Some(pos)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List positions matching the filter, oldest first. `Default` is
    /// resolved to every row here; hiding stale pending records is a view
    /// concern and happens in the engine.
    pub fn list(&self, filter: StatusFilter) -> Result<Vec<ManagedPosition>, StoreError> {
        let conn = self.conn.lock().unwrap();

        let positions = match filter {
            StatusFilter::Default | StatusFilter::All => {
                let mut stmt = conn.prepare("SELECT * FROM positions ORDER BY id")?;
                let rows = stmt.query_map([], row_to_position)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            StatusFilter::NonTerminal => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM positions
                     WHERE status IN ('pending', 'active', 'partial')
                     ORDER BY id",
                )?;
                let rows = stmt.query_map([], row_to_position)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            StatusFilter::Status(status) => {
                let mut stmt =
                    conn.prepare("SELECT * FROM positions WHERE status = ?1 ORDER BY id")?;
                let rows = stmt.query_map(params![status.as_str()], row_to_position)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };

        debug!("loaded {} positions (filter: {:?})", positions.len(), filter);
        Ok(positions)
    }

    /// Read a metadata value (config fingerprint, etc.)
    pub fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT value FROM meta WHERE key = ?1")?;
        match stmt.query_row(params![key], |row| row.get(0)) {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Write a human-readable snapshot next to the database
    pub fn export_json(&self) -> Result<(), StoreError> {
        let Some(path) = &self.json_backup_path else {
            return Ok(());
        };
        let positions = self.list(StatusFilter::All)?;
        let state = serde_json::json!({
            "exported_at": Utc::now().to_rfc3339(),
            "positions": positions,
        });
        std::fs::write(path, serde_json::to_string_pretty(&state)?)?;
        debug!("state exported to {}", path.display());
        Ok(())
    }
}

fn row_to_position(row: &rusqlite::Row<'_>) -> rusqlite::Result<ManagedPosition> {
    let side: String = row.get(2)?;
    let entry_type: String = row.get(8)?;
    let status: String = row.get(19)?;
    let partial_json: Option<String> = row.get(18)?;
    let tags_json: String = row.get(24)?;
    let created_at: String = row.get(25)?;
    let updated_at: String = row.get(26)?;
    let closed_at: Option<String> = row.get(27)?;

    let partial_exit: Option<PartialExit> = partial_json
        .as_deref()
        .and_then(|j| serde_json::from_str(j).ok());

    Ok(ManagedPosition {
        id: row.get(0)?,
        symbol: row.get(1)?,
        side: side
            .parse()
            .map_err(|_| rusqlite::Error::InvalidColumnType(2, side, rusqlite::types::Type::Text))?,
        strategy_tag: row.get(3)?,
        quantity: row.get(4)?,
        remaining_quantity: row.get(5)?,
        allocation: row.get(6)?,
        entry_order_id: row.get(7)?,
        entry_order_type: entry_type.parse().map_err(|_| {
            rusqlite::Error::InvalidColumnType(8, entry_type, rusqlite::types::Type::Text)
        })?,
        entry_price: row.get(9)?,
        stop_price: row.get(10)?,
        stop_percent: row.get(11)?,
        stop_order_id: row.get(12)?,
        trailing_enabled: row.get::<_, i64>(13)? != 0,
        trailing_percent: row.get(14)?,
        take_profit_price: row.get(15)?,
        take_profit_percent: row.get(16)?,
        take_profit_order_id: row.get(17)?,
        partial_exit,
        status: status.parse().map_err(|_| {
            rusqlite::Error::InvalidColumnType(19, status, rusqlite::types::Type::Text)
        })?,
        current_price: row.get(20)?,
        unrealized_pl: row.get(21)?,
        unrealized_pl_pct: row.get(22)?,
        notes: row.get(23)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: updated_at.parse().unwrap_or_else(|_| Utc::now()),
        closed_at: closed_at.and_then(|t| t.parse::<DateTime<Utc>>().ok()),
    })
}
