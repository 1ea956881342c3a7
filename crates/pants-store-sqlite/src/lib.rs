use std::path::Path;

use anyhow::{anyhow, Context, Result};
use pants_core::{
    random_offset, Inquest, InquestId, NewInquest, NewRuling, Ruling, RulingId, SeenSet, Vote,
    VoteTally,
};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
);
";

// Timestamps are unix microseconds so `ORDER BY created_at` is numeric.
const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS inquests (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  image_url TEXT NOT NULL CHECK (length(image_url) BETWEEN 1 AND 255),
  created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_inquests_created_at ON inquests(created_at, id);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS rulings (
  ruling_id TEXT PRIMARY KEY,
  inquest_id INTEGER NOT NULL,
  vote TEXT NOT NULL CHECK (vote IN ('yes','no','not_sure')),
  created_at INTEGER NOT NULL,
  FOREIGN KEY (inquest_id) REFERENCES inquests(id)
);

CREATE INDEX IF NOT EXISTS idx_rulings_inquest ON rulings(inquest_id);
CREATE INDEX IF NOT EXISTS idx_rulings_inquest_vote ON rulings(inquest_id, vote);
";

const SELECT_INQUEST_COLUMNS: &str = "SELECT id, image_url, created_at FROM inquests";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

struct InquestRow {
    id: i64,
    image_url: String,
    created_at: i64,
}

impl InquestRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self { id: row.get(0)?, image_url: row.get(1)?, created_at: row.get(2)? })
    }

    fn into_inquest(self) -> Result<Inquest> {
        Ok(Inquest {
            id: InquestId(self.id),
            image_url: self.image_url,
            created_at: from_unix_micros(self.created_at)?,
        })
    }
}

impl SqliteStore {
    /// Open a SQLite-backed store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.apply_migration(1, MIGRATION_001_SQL)?;
            version = 1;
        }

        if version < 2 {
            self.apply_migration(2, MIGRATION_002_SQL)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("failed to start migration v{version} transaction"))?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, to_unix_micros(OffsetDateTime::now_utc())?],
        )
        .with_context(|| format!("failed to record migration version {version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        debug!(version, "applied schema migration");
        Ok(())
    }

    /// Validate and persist one new Inquest.
    ///
    /// The stored `created_at` is truncated to microseconds; the returned
    /// record carries the stored value.
    ///
    /// # Errors
    /// Returns [`pants_core::PantsError::Validation`] (inside `anyhow`) when the
    /// `image_url` is invalid, or an error when the insert fails.
    pub fn create_inquest(
        &mut self,
        input: &NewInquest,
        created_at: OffsetDateTime,
    ) -> Result<Inquest> {
        let image_url = input.validate()?.to_string();
        let created_at_us = to_unix_micros(created_at)?;

        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO inquests(image_url, created_at) VALUES (?1, ?2)",
            params![image_url, created_at_us],
        )
        .context("failed to insert inquest")?;
        let id = tx.last_insert_rowid();
        tx.commit().context("failed to commit inquest transaction")?;

        Ok(Inquest { id: InquestId(id), image_url, created_at: from_unix_micros(created_at_us)? })
    }

    /// Look up one Inquest by id.
    ///
    /// # Errors
    /// Returns an error when the query or row decoding fails.
    pub fn find_inquest(&self, id: InquestId) -> Result<Option<Inquest>> {
        let row = self
            .conn
            .query_row(
                &format!("{SELECT_INQUEST_COLUMNS} WHERE id = ?1"),
                params![id.0],
                InquestRow::from_row,
            )
            .optional()
            .with_context(|| format!("failed to load inquest {id}"))?;
        row.map(InquestRow::into_inquest).transpose()
    }

    /// # Errors
    /// Returns an error when the existence check fails.
    pub fn inquest_exists(&self, id: InquestId) -> Result<bool> {
        let exists = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM inquests WHERE id = ?1)",
                params![id.0],
                |row| row.get::<_, i64>(0),
            )
            .with_context(|| format!("failed to check if inquest exists: {id}"))?;
        Ok(exists == 1)
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_inquests(&self) -> Result<u64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM inquests", [], |row| row.get::<_, i64>(0))
            .context("failed to count inquests")?;
        u64::try_from(count).context("inquest count out of range")
    }

    /// Newest Inquest by `(created_at, id)`, if any exist.
    ///
    /// # Errors
    /// Returns an error when the query or row decoding fails.
    pub fn latest_inquest(&self) -> Result<Option<Inquest>> {
        let row = self
            .conn
            .query_row(
                &format!("{SELECT_INQUEST_COLUMNS} ORDER BY created_at DESC, id DESC LIMIT 1"),
                [],
                InquestRow::from_row,
            )
            .optional()
            .context("failed to load latest inquest")?;
        row.map(InquestRow::into_inquest).transpose()
    }

    /// List Inquests newest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_inquests(&self, limit: u32) -> Result<Vec<Inquest>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SELECT_INQUEST_COLUMNS} ORDER BY created_at DESC, id DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![i64::from(limit)], InquestRow::from_row)?;

        let mut inquests = Vec::new();
        for row in rows {
            inquests.push(row?.into_inquest()?);
        }
        Ok(inquests)
    }

    /// Count Inquests whose id is not in `excluded`.
    ///
    /// Ids in `excluded` that do not exist in the store have no effect.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_remaining(&self, excluded: &SeenSet) -> Result<u64> {
        count_remaining_in(&self.conn, &excluded_json(excluded)?)
    }

    /// Pick one Inquest uniformly at random among those not in `excluded`.
    ///
    /// Counts the filtered view, draws an offset in `[0, remaining)`, and reads
    /// the single row at that offset of the same view ordered by id. Both
    /// queries share one read transaction.
    ///
    /// # Errors
    /// Returns an error when either query fails.
    pub fn select_unseen<R: Rng + ?Sized>(
        &mut self,
        excluded: &SeenSet,
        rng: &mut R,
    ) -> Result<Option<Inquest>> {
        let excluded_ids = excluded_json(excluded)?;
        let tx = self.conn.transaction().context("failed to start selection transaction")?;

        let remaining = count_remaining_in(&tx, &excluded_ids)?;
        let Some(offset) = random_offset(remaining, rng) else {
            debug!(excluded = excluded.len(), "no unseen inquest remains");
            return Ok(None);
        };
        debug!(remaining, offset, excluded = excluded.len(), "selecting unseen inquest");

        let row = tx
            .query_row(
                &format!(
                    "{SELECT_INQUEST_COLUMNS}
                     WHERE id NOT IN (SELECT value FROM json_each(?1))
                     ORDER BY id ASC
                     LIMIT 1 OFFSET ?2"
                ),
                params![excluded_ids, i64::try_from(offset).context("offset out of range")?],
                InquestRow::from_row,
            )
            .optional()
            .context("failed to load inquest at offset")?;
        tx.commit().context("failed to close selection transaction")?;

        row.map(InquestRow::into_inquest).transpose()
    }

    /// The Inquest immediately older than `inquest` in `(created_at, id)` order.
    ///
    /// # Errors
    /// Returns an error when the query or row decoding fails.
    pub fn predecessor_of(&self, inquest: &Inquest) -> Result<Option<Inquest>> {
        self.neighbor(
            inquest,
            "WHERE created_at < ?1 OR (created_at = ?1 AND id < ?2)
             ORDER BY created_at DESC, id DESC",
        )
    }

    /// The Inquest immediately newer than `inquest` in `(created_at, id)` order.
    ///
    /// # Errors
    /// Returns an error when the query or row decoding fails.
    pub fn successor_of(&self, inquest: &Inquest) -> Result<Option<Inquest>> {
        self.neighbor(
            inquest,
            "WHERE created_at > ?1 OR (created_at = ?1 AND id > ?2)
             ORDER BY created_at ASC, id ASC",
        )
    }

    fn neighbor(&self, inquest: &Inquest, clause: &str) -> Result<Option<Inquest>> {
        let row = self
            .conn
            .query_row(
                &format!("{SELECT_INQUEST_COLUMNS} {clause} LIMIT 1"),
                params![to_unix_micros(inquest.created_at)?, inquest.id.0],
                InquestRow::from_row,
            )
            .optional()
            .with_context(|| format!("failed to load neighbor of inquest {}", inquest.id))?;
        row.map(InquestRow::into_inquest).transpose()
    }

    /// Validate and persist one Ruling.
    ///
    /// # Errors
    /// Returns [`pants_core::PantsError::Validation`] (inside `anyhow`) when the
    /// vote or Inquest reference is invalid, or an error when the insert fails.
    pub fn record_vote(&mut self, input: &NewRuling, created_at: OffsetDateTime) -> Result<Ruling> {
        let exists = match input.inquest_id {
            Some(id) => self.inquest_exists(id)?,
            None => false,
        };
        let (inquest_id, vote) = input.validate(exists)?;
        let created_at_us = to_unix_micros(created_at)?;
        let ruling = Ruling {
            id: RulingId::new(),
            inquest_id,
            vote,
            created_at: from_unix_micros(created_at_us)?,
        };

        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO rulings(ruling_id, inquest_id, vote, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![ruling.id.to_string(), inquest_id.0, vote.as_str(), created_at_us],
        )
        .context("failed to insert ruling")?;
        tx.commit().context("failed to commit ruling transaction")?;

        debug!(ruling_id = %ruling.id, inquest_id = %inquest_id, vote = vote.as_str(), "recorded ruling");
        Ok(ruling)
    }

    /// Per-vote counts for one Inquest; zero for kinds nobody chose.
    ///
    /// # Errors
    /// Returns an error when the aggregate query fails or returns an unknown vote.
    pub fn tally(&self, inquest_id: InquestId) -> Result<VoteTally> {
        let mut stmt = self
            .conn
            .prepare("SELECT vote, COUNT(*) FROM rulings WHERE inquest_id = ?1 GROUP BY vote")?;
        let mut rows = stmt.query(params![inquest_id.0])?;

        let mut tally = VoteTally::default();
        while let Some(row) = rows.next()? {
            let vote_raw: String = row.get(0)?;
            let vote =
                Vote::parse(&vote_raw).ok_or_else(|| anyhow!("unknown vote value: {vote_raw}"))?;
            let count = u64::try_from(row.get::<_, i64>(1)?).context("vote count out of range")?;
            tally.add(vote, count);
        }
        Ok(tally)
    }

    /// All Rulings cast on one Inquest, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn rulings_for(&self, inquest_id: InquestId) -> Result<Vec<Ruling>> {
        let mut stmt = self.conn.prepare(
            "SELECT ruling_id, vote, created_at FROM rulings
             WHERE inquest_id = ?1
             ORDER BY created_at ASC, ruling_id ASC",
        )?;
        let mut rows = stmt.query(params![inquest_id.0])?;

        let mut rulings = Vec::new();
        while let Some(row) = rows.next()? {
            let ruling_id_raw: String = row.get(0)?;
            let vote_raw: String = row.get(1)?;
            rulings.push(Ruling {
                id: parse_ruling_id(&ruling_id_raw)?,
                inquest_id,
                vote: Vote::parse(&vote_raw)
                    .ok_or_else(|| anyhow!("unknown vote value: {vote_raw}"))?,
                created_at: from_unix_micros(row.get(2)?)?,
            });
        }
        Ok(rulings)
    }
}

fn count_remaining_in(conn: &Connection, excluded_ids: &str) -> Result<u64> {
    let count = conn
        .query_row(
            "SELECT COUNT(*) FROM inquests WHERE id NOT IN (SELECT value FROM json_each(?1))",
            params![excluded_ids],
            |row| row.get::<_, i64>(0),
        )
        .context("failed to count remaining inquests")?;
    u64::try_from(count).context("remaining count out of range")
}

fn excluded_json(excluded: &SeenSet) -> Result<String> {
    serde_json::to_string(&excluded.to_raw_ids()).context("failed to serialize excluded ids")
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn to_unix_micros(value: OffsetDateTime) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos() / 1_000)
        .with_context(|| format!("timestamp out of range: {value}"))
}

fn from_unix_micros(value: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(value) * 1_000)
        .with_context(|| format!("invalid stored timestamp: {value}"))
}

fn parse_ruling_id(raw: &str) -> Result<RulingId> {
    let parsed = ulid::Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(RulingId(parsed))
}
