use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use rusqlite::{Connection, OptionalExtension as _, Row, params};

use super::{OrderType, SwapDeal, SwapFailureReason, SwapPhase, SwapRole, SwapState};

/// Durable copy of every deal, keyed by payment hash. Written on every
/// phase transition; entries are never deleted here.
pub trait DealRepository: Send {
    fn load_all(&self) -> Result<Vec<SwapDeal>>;

    /// Insert or replace the row for `deal.r_hash`.
    fn save(&mut self, deal: &SwapDeal) -> Result<()>;

    fn get(&self, r_hash: &str) -> Result<Option<SwapDeal>>;

    fn contains(&self, r_hash: &str) -> Result<bool>;
}

#[derive(Debug)]
pub struct SqliteDealStore {
    conn: Connection,
    path: Option<PathBuf>,
}

const DEAL_COLUMNS: &str = r#"
  r_hash,
  role,
  phase,
  state,
  error_message,
  failure_reason,
  peer_pub_key,
  order_id,
  local_id,
  pair_id,
  order_type,
  is_buy,
  proposed_quantity,
  quantity,
  price,
  taker_amount,
  taker_units,
  taker_currency,
  taker_pub_key,
  taker_cltv_delta,
  maker_amount,
  maker_units,
  maker_currency,
  maker_pub_key,
  maker_cltv_delta,
  r_preimage,
  payment_request,
  taker_max_time_lock,
  destination,
  create_time,
  execute_time,
  complete_time
"#;

impl SqliteDealStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create deal store dir {}", dir.display()))?;
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("configure sqlite pragmas")?;

        migrate(&conn).context("migrate sqlite schema")?;

        Ok(Self {
            conn,
            path: Some(path),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite")?;
        migrate(&conn).context("migrate sqlite schema")?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn list_active(&self) -> Result<Vec<SwapDeal>> {
        self.query_deals(
            "WHERE state = ?1 ORDER BY create_time, r_hash",
            params![SwapState::Active.as_str()],
        )
        .context("list active deals")
    }

    fn query_deals(&self, tail: &str, args: impl rusqlite::Params) -> Result<Vec<SwapDeal>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {DEAL_COLUMNS} FROM deals {tail}"))
            .context("prepare deal query")?;
        let rows = stmt.query_map(args, deal_from_row).context("query deals")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read deal row")?);
        }
        Ok(out)
    }
}

impl DealRepository for SqliteDealStore {
    fn load_all(&self) -> Result<Vec<SwapDeal>> {
        self.query_deals("ORDER BY create_time, r_hash", [])
            .context("load deals")
    }

    fn save(&mut self, deal: &SwapDeal) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO deals ({DEAL_COLUMNS}) VALUES (
  ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
  ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32
)"
                ),
                params![
                    &deal.r_hash,
                    deal.role.as_str(),
                    deal.phase.as_str(),
                    deal.state.as_str(),
                    &deal.error_message,
                    deal.failure_reason.map(SwapFailureReason::as_str),
                    &deal.peer_pub_key,
                    &deal.order_id,
                    &deal.local_id,
                    &deal.pair_id,
                    deal.order_type.as_str(),
                    deal.is_buy,
                    deal.proposed_quantity,
                    deal.quantity,
                    deal.price,
                    deal.taker_amount,
                    deal.taker_units.to_string(),
                    &deal.taker_currency,
                    &deal.taker_pub_key,
                    deal.taker_cltv_delta,
                    deal.maker_amount,
                    deal.maker_units.to_string(),
                    &deal.maker_currency,
                    &deal.maker_pub_key,
                    deal.maker_cltv_delta,
                    &deal.r_preimage,
                    &deal.payment_request,
                    deal.taker_max_time_lock,
                    &deal.destination,
                    deal.create_time,
                    deal.execute_time,
                    deal.complete_time,
                ],
            )
            .with_context(|| format!("save deal {}", deal.r_hash))?;
        Ok(())
    }

    fn get(&self, r_hash: &str) -> Result<Option<SwapDeal>> {
        self.conn
            .query_row(
                &format!("SELECT {DEAL_COLUMNS} FROM deals WHERE r_hash = ?1"),
                params![r_hash],
                deal_from_row,
            )
            .optional()
            .with_context(|| format!("get deal {r_hash}"))
    }

    fn contains(&self, r_hash: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM deals WHERE r_hash = ?1",
                params![r_hash],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("lookup deal {r_hash}"))?;
        Ok(found.is_some())
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS deals (
  r_hash TEXT PRIMARY KEY,
  role TEXT NOT NULL,
  phase TEXT NOT NULL,
  state TEXT NOT NULL,
  error_message TEXT,
  failure_reason TEXT,
  peer_pub_key TEXT NOT NULL,
  order_id TEXT NOT NULL,
  local_id TEXT NOT NULL,
  pair_id TEXT NOT NULL,
  order_type TEXT NOT NULL,
  is_buy INTEGER NOT NULL,
  proposed_quantity INTEGER NOT NULL,
  quantity INTEGER,
  price INTEGER NOT NULL,
  taker_amount INTEGER NOT NULL,
  taker_units TEXT NOT NULL,
  taker_currency TEXT NOT NULL,
  taker_pub_key TEXT,
  taker_cltv_delta INTEGER NOT NULL,
  maker_amount INTEGER NOT NULL,
  maker_units TEXT NOT NULL,
  maker_currency TEXT NOT NULL,
  maker_pub_key TEXT,
  maker_cltv_delta INTEGER,
  r_preimage TEXT,
  payment_request TEXT,
  taker_max_time_lock INTEGER,
  destination TEXT,
  create_time INTEGER NOT NULL,
  execute_time INTEGER,
  complete_time INTEGER
);
CREATE INDEX IF NOT EXISTS deals_state_idx ON deals(state);
"#,
    )
    .context("create tables")?;
    Ok(())
}

fn conversion_error(col: usize, ty: rusqlite::types::Type, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, ty, msg.into())
}

fn text_enum<T>(row: &Row<'_>, col: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let s: String = row.get(col)?;
    parse(&s).ok_or_else(|| {
        conversion_error(
            col,
            rusqlite::types::Type::Text,
            format!("unknown value: {s}"),
        )
    })
}

fn units(row: &Row<'_>, col: usize) -> rusqlite::Result<u128> {
    let s: String = row.get(col)?;
    s.parse().map_err(|_| {
        conversion_error(
            col,
            rusqlite::types::Type::Text,
            format!("invalid units {s}"),
        )
    })
}

fn opt_u32(row: &Row<'_>, col: usize) -> rusqlite::Result<Option<u32>> {
    let v: Option<i64> = row.get(col)?;
    v.map(|v| {
        u32::try_from(v).map_err(|_| {
            conversion_error(
                col,
                rusqlite::types::Type::Integer,
                format!("invalid u32 {v}"),
            )
        })
    })
    .transpose()
}

fn deal_from_row(row: &Row<'_>) -> rusqlite::Result<SwapDeal> {
    let failure_reason: Option<String> = row.get(5)?;
    let failure_reason = failure_reason
        .map(|s| {
            SwapFailureReason::parse(&s).ok_or_else(|| {
                conversion_error(
                    5,
                    rusqlite::types::Type::Text,
                    format!("unknown failure reason: {s}"),
                )
            })
        })
        .transpose()?;
    let taker_cltv_delta = opt_u32(row, 19)?.ok_or_else(|| {
        conversion_error(
            19,
            rusqlite::types::Type::Null,
            "missing taker_cltv_delta".to_string(),
        )
    })?;

    Ok(SwapDeal {
        r_hash: row.get(0)?,
        role: text_enum(row, 1, SwapRole::parse)?,
        phase: text_enum(row, 2, SwapPhase::parse)?,
        state: text_enum(row, 3, SwapState::parse)?,
        error_message: row.get(4)?,
        failure_reason,
        peer_pub_key: row.get(6)?,
        order_id: row.get(7)?,
        local_id: row.get(8)?,
        pair_id: row.get(9)?,
        order_type: text_enum(row, 10, OrderType::parse)?,
        is_buy: row.get(11)?,
        proposed_quantity: row.get(12)?,
        quantity: row.get(13)?,
        price: row.get(14)?,
        taker_amount: row.get(15)?,
        taker_units: units(row, 16)?,
        taker_currency: row.get(17)?,
        taker_pub_key: row.get(18)?,
        taker_cltv_delta,
        maker_amount: row.get(20)?,
        maker_units: units(row, 21)?,
        maker_currency: row.get(22)?,
        maker_pub_key: row.get(23)?,
        maker_cltv_delta: opt_u32(row, 24)?,
        r_preimage: row.get(25)?,
        payment_request: row.get(26)?,
        taker_max_time_lock: opt_u32(row, 27)?,
        destination: row.get(28)?,
        create_time: row.get(29)?,
        execute_time: row.get(30)?,
        complete_time: row.get(31)?,
    })
}
