// ==============================================================================
// store.rs - Persistent Contig Index (SQLite)
// ==============================================================================
// Description: SQLite storage for per-contig annotation aggregates, the
//              multi-valued attribute index and index metadata
// Author: Matt Barham
// Created: 2026-10-02
// Modified: 2026-10-17
// Version: 1.2.1
// ==============================================================================
// Schema:
//   contigs             one row per seqid, creation order = id, has_* flags
//   contig_annotations  (category, value) -> contig, UNIQUE per contig
//   metadata            key/value, JSON IndexMetadata under "index_metadata"
// ==============================================================================

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};

use crate::models::{AnnotationCategory, Annotations, Contig, IndexMetadata, Presence};

/// Well-known metadata key for the indexed source record
pub const INDEX_METADATA_KEY: &str = "index_metadata";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS contigs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        contig_name TEXT NOT NULL UNIQUE,
        length INTEGER NOT NULL DEFAULT 0,
        has_interpros INTEGER NOT NULL DEFAULT 0,
        has_pfams INTEGER NOT NULL DEFAULT 0,
        has_gos INTEGER NOT NULL DEFAULT 0,
        has_keggs INTEGER NOT NULL DEFAULT 0,
        has_cogs INTEGER NOT NULL DEFAULT 0,
        has_ec_numbers INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_contigs_has_interpros ON contigs(has_interpros);
    CREATE INDEX IF NOT EXISTS idx_contigs_has_pfams ON contigs(has_pfams);
    CREATE INDEX IF NOT EXISTS idx_contigs_has_gos ON contigs(has_gos);
    CREATE INDEX IF NOT EXISTS idx_contigs_has_keggs ON contigs(has_keggs);
    CREATE INDEX IF NOT EXISTS idx_contigs_has_cogs ON contigs(has_cogs);
    CREATE INDEX IF NOT EXISTS idx_contigs_has_ec_numbers ON contigs(has_ec_numbers);

    CREATE TABLE IF NOT EXISTS contig_annotations (
        id INTEGER PRIMARY KEY,
        contig_id INTEGER NOT NULL REFERENCES contigs(id) ON DELETE CASCADE,
        category TEXT NOT NULL,
        value TEXT NOT NULL,
        UNIQUE(category, value, contig_id)
    );

    CREATE INDEX IF NOT EXISTS idx_contig_annotations_contig
        ON contig_annotations(contig_id, category);

    CREATE TABLE IF NOT EXISTS metadata (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

/// Presence flags recomputed from the annotation rows of one contig
const REFRESH_PRESENCE: &str = "
    UPDATE contigs SET
        has_interpros = EXISTS(SELECT 1 FROM contig_annotations WHERE contig_id = ?1 AND category = 'interpros'),
        has_pfams = EXISTS(SELECT 1 FROM contig_annotations WHERE contig_id = ?1 AND category = 'pfams'),
        has_gos = EXISTS(SELECT 1 FROM contig_annotations WHERE contig_id = ?1 AND category = 'gos'),
        has_keggs = EXISTS(SELECT 1 FROM contig_annotations WHERE contig_id = ?1 AND category = 'keggs'),
        has_cogs = EXISTS(SELECT 1 FROM contig_annotations WHERE contig_id = ?1 AND category = 'cogs'),
        has_ec_numbers = EXISTS(SELECT 1 FROM contig_annotations WHERE contig_id = ?1 AND category = 'ec_numbers')
    WHERE id = ?1";

/// Column list shared by every contig row read
pub(crate) const CONTIG_COLUMNS: &str = "c.id, c.contig_name, c.length, c.has_interpros, c.has_pfams, \
     c.has_gos, c.has_keggs, c.has_cogs, c.has_ec_numbers";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to (de)serialize index metadata: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Store lock poisoned by a panicked writer")]
    Poisoned,
}

/// Contig row before its annotation values are attached
pub(crate) struct ContigRow {
    pub id: i64,
    pub contig_name: String,
    pub length: u64,
    pub presence: Presence,
}

impl ContigRow {
    /// Map a row selected with `CONTIG_COLUMNS`
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            contig_name: row.get(1)?,
            length: row.get::<_, i64>(2)? as u64,
            presence: Presence {
                has_interpros: row.get::<_, i64>(3)? != 0,
                has_pfams: row.get::<_, i64>(4)? != 0,
                has_gos: row.get::<_, i64>(5)? != 0,
                has_keggs: row.get::<_, i64>(6)? != 0,
                has_cogs: row.get::<_, i64>(7)? != 0,
                has_ec_numbers: row.get::<_, i64>(8)? != 0,
            },
        })
    }
}

/// SQLite-backed contig index
pub struct ContigStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for ContigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContigStore").field("path", &self.path).finish()
    }
}

impl ContigStore {
    /// Open (or create) the index database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        let store = Self {
            conn,
            path: Some(path.as_ref().to_path_buf()),
        };
        store.init_schema()?;
        info!("Opened contig index: {:?}", path.as_ref());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self { conn, path: None };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Remove every contig, annotation and metadata row
    ///
    /// Contig ids restart at 1 so creation order is reproducible.
    pub fn reset(&mut self) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM contig_annotations;
             DELETE FROM contigs;
             DELETE FROM metadata;
             DELETE FROM sqlite_sequence WHERE name = 'contigs';",
        )?;
        tx.commit()?;
        info!("Contig index reset");
        Ok(())
    }

    /// Merge contig aggregates into the index in one transaction
    ///
    /// New values are appended, existing ones ignored, the length keeps its
    /// maximum and presence flags are recomputed. Returns the number of new
    /// annotation rows.
    pub fn merge_contigs(&mut self, contigs: &[Contig]) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut upsert = tx.prepare(
                "INSERT INTO contigs (contig_name, length) VALUES (?1, ?2)
                 ON CONFLICT(contig_name) DO UPDATE SET length = MAX(length, excluded.length)",
            )?;
            let mut lookup = tx.prepare("SELECT id FROM contigs WHERE contig_name = ?1")?;
            let mut add_value = tx.prepare(
                "INSERT OR IGNORE INTO contig_annotations (contig_id, category, value) VALUES (?1, ?2, ?3)",
            )?;
            let mut refresh = tx.prepare(REFRESH_PRESENCE)?;

            for contig in contigs {
                upsert.execute(params![contig.contig_name, contig.length as i64])?;
                let contig_id: i64 = lookup.query_row(params![contig.contig_name], |row| row.get(0))?;

                for (category, value) in contig.annotations.iter() {
                    inserted += add_value.execute(params![contig_id, category.as_str(), value])?;
                }
                refresh.execute(params![contig_id])?;
            }
        }
        tx.commit()?;

        debug!("Merged {} contigs ({} new annotation values)", contigs.len(), inserted);
        Ok(inserted)
    }

    pub fn contig_count(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM contigs", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn get_contig(&self, contig_name: &str) -> Result<Option<Contig>, StoreError> {
        let sql = format!("SELECT {} FROM contigs c WHERE c.contig_name = ?1", CONTIG_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![contig_name], ContigRow::from_row)
            .optional()?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row)?)),
            None => Ok(None),
        }
    }

    /// Every contig in creation order
    pub fn all_contigs(&self) -> Result<Vec<Contig>, StoreError> {
        let sql = format!("SELECT {} FROM contigs c ORDER BY c.id", CONTIG_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], ContigRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        self.hydrate_all(rows)
    }

    /// Attach annotation values to contig rows
    pub(crate) fn hydrate_all(&self, rows: Vec<ContigRow>) -> Result<Vec<Contig>, StoreError> {
        rows.into_iter().map(|row| self.hydrate(row)).collect()
    }

    fn hydrate(&self, row: ContigRow) -> Result<Contig, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT category, value FROM contig_annotations WHERE contig_id = ?1 ORDER BY id",
        )?;
        let values = stmt.query_map(params![row.id], |r| {
            let category: String = r.get(0)?;
            let category = AnnotationCategory::from_str(&category).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
            })?;
            Ok((category, r.get::<_, String>(1)?))
        })?;

        let mut annotations = Annotations::default();
        for value in values {
            let (category, value) = value?;
            annotations.get_mut(category).push(value);
        }

        Ok(Contig {
            contig_name: row.contig_name,
            length: row.length,
            annotations,
            presence: row.presence,
        })
    }

    pub fn load_index_metadata(&self) -> Result<Option<IndexMetadata>, StoreError> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                params![INDEX_METADATA_KEY],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn save_index_metadata(&self, metadata: &IndexMetadata) -> Result<(), StoreError> {
        let json = serde_json::to_string(metadata)?;
        self.conn.execute(
            "INSERT INTO metadata (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![INDEX_METADATA_KEY, json],
        )?;
        info!("Recorded index metadata for {}", metadata.source_url);
        Ok(())
    }

    /// Forget which source the index reflects, keeping the contigs
    pub fn clear_index_metadata(&self) -> Result<(), StoreError> {
        let removed = self
            .conn
            .execute("DELETE FROM metadata WHERE key = ?1", params![INDEX_METADATA_KEY])?;
        if removed > 0 {
            debug!("Cleared index metadata");
        }
        Ok(())
    }
}
