//! Unit store contract and SQLite implementation.
//!
//! # Responsibility
//! - Provide unit CRUD keyed by fingerprint, recency listings and search.
//! - Own the metadata slot, watch registrations and document memberships.
//!
//! # Invariants
//! - Listings are ordered by `updated_at DESC, id DESC`.
//! - No two rows share a fingerprint (enforced by a UNIQUE constraint).
//! - Read paths reject rows whose fingerprint does not match their content.
//! - Removing a unit or a watch registration cascades to memberships.

use crate::db::DbError;
use crate::model::unit::{fingerprint, CanonicalUnit, ContentUnit, Timestamp, UnitId};
use crate::search::terms::{substring_matcher, SearchError, SearchTerms, TermMatcher};
use rusqlite::{params, Connection, ErrorCode, Row, Transaction, TransactionBehavior};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};

const UNIT_SELECT_SQL: &str = "SELECT
    units.id AS id,
    units.content AS content,
    units.fingerprint AS fingerprint,
    units.created_at AS created_at,
    units.updated_at AS updated_at
FROM units";

const RECENCY_ORDER_SQL: &str = "ORDER BY units.updated_at DESC, units.id DESC";

pub type RepoResult<T> = Result<T, RepoError>;

/// Store error for unit, metadata and membership operations.
#[derive(Debug)]
pub enum RepoError {
    Db(DbError),
    /// A create was attempted for a fingerprint that already exists.
    DuplicateFingerprint(String),
    /// Search terms were missing or unusable.
    InvalidQuery(SearchError),
    InvalidData(String),
}

impl RepoError {
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Db(err) if err.is_busy())
    }
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::DuplicateFingerprint(value) => {
                write!(f, "unit with fingerprint {value} already exists")
            }
            Self::InvalidQuery(err) => write!(f, "{err}"),
            Self::InvalidData(message) => write!(f, "invalid persisted unit data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::InvalidQuery(err) => Some(err),
            Self::DuplicateFingerprint(_) | Self::InvalidData(_) => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<SearchError> for RepoError {
    fn from(value: SearchError) -> Self {
        Self::InvalidQuery(value)
    }
}

/// A document path the engine monitors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRegistration {
    pub path: String,
    pub started_at: Timestamp,
}

/// Persistence contract for units, metadata, watches and memberships.
pub trait UnitStore {
    /// Persists a unit whose fingerprint is not yet stored.
    ///
    /// Both timestamps are set to `at`. Fails with `DuplicateFingerprint`
    /// when the fingerprint exists; callers check first.
    fn insert_new(&self, unit: &CanonicalUnit, at: Timestamp) -> RepoResult<ContentUnit>;
    fn find_by_fingerprint(&self, fingerprint: &str) -> RepoResult<Option<ContentUnit>>;
    /// Sets `updated_at`. Returns `false` when the fingerprint is absent.
    fn touch(&self, fingerprint: &str, at: Timestamp) -> RepoResult<bool>;
    fn delete_by_fingerprint(&self, fingerprint: &str) -> RepoResult<bool>;
    fn delete_by_id(&self, id: UnitId) -> RepoResult<bool>;
    /// All units, newest first.
    fn list_all(&self) -> RepoResult<Vec<ContentUnit>>;
    /// Units created strictly after `at`, newest first.
    fn list_created_after(&self, at: Timestamp) -> RepoResult<Vec<ContentUnit>>;
    /// Units matching the include/exclude terms, newest first.
    fn search(&self, include: &[String], exclude: &[String]) -> RepoResult<Vec<ContentUnit>>;
    /// Deletes every unit containing `term`. Returns the number removed.
    fn delete_matching(&self, term: &str) -> RepoResult<usize>;
    fn count(&self) -> RepoResult<usize>;

    fn get_metadata(&self, key: &str) -> RepoResult<Option<String>>;
    /// Last write wins.
    fn set_metadata(&self, key: &str, value: &str) -> RepoResult<()>;

    /// Records that `path` contains `fingerprint`. Idempotent.
    fn add_membership(&self, path: &str, fingerprint: &str) -> RepoResult<()>;
    fn remove_membership(&self, path: &str, fingerprint: &str) -> RepoResult<bool>;
    fn memberships_of(&self, path: &str) -> RepoResult<BTreeSet<String>>;
    /// Units that are members of `path`, newest first.
    fn list_document_units(&self, path: &str) -> RepoResult<Vec<ContentUnit>>;

    /// Returns `true` when `path` was not registered before.
    fn register_watch(&self, path: &str, at: Timestamp) -> RepoResult<bool>;
    /// Removes the registration and its memberships. Returns `false` when
    /// `path` was not registered.
    fn unregister_watch(&self, path: &str) -> RepoResult<bool>;
    fn is_watched(&self, path: &str) -> RepoResult<bool>;
    fn list_watches(&self) -> RepoResult<Vec<WatchRegistration>>;

    /// Runs `work` so that all of its store writes apply together or not at
    /// all. Reads inside `work` see no other writer until it returns.
    fn atomically<T, E, F>(&self, work: F) -> Result<T, E>
    where
        Self: Sized,
        E: From<RepoError>,
        F: FnOnce(&Self) -> Result<T, E>;
}

/// SQLite-backed unit store owning one connection.
pub struct SqliteUnitStore {
    conn: Connection,
}

impl SqliteUnitStore {
    /// Wraps a connection returned by `db::open_db` or `db::open_db_in_memory`.
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn query_units(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> RepoResult<Vec<ContentUnit>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut units = Vec::new();
        while let Some(row) = rows.next()? {
            units.push(parse_unit_row(row)?);
        }
        Ok(units)
    }

    fn filter_units(&self, matcher: &TermMatcher) -> RepoResult<Vec<ContentUnit>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|unit| matcher.matches(&unit.content))
            .collect())
    }
}

impl UnitStore for SqliteUnitStore {
    fn insert_new(&self, unit: &CanonicalUnit, at: Timestamp) -> RepoResult<ContentUnit> {
        let inserted = self.conn.execute(
            "INSERT INTO units (content, fingerprint, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3);",
            params![unit.content(), unit.fingerprint(), at],
        );

        match inserted {
            Ok(_) => Ok(ContentUnit {
                id: self.conn.last_insert_rowid(),
                content: unit.content().to_string(),
                fingerprint: unit.fingerprint().to_string(),
                created_at: at,
                updated_at: at,
            }),
            Err(err) if is_unique_violation(&err) => Err(RepoError::DuplicateFingerprint(
                unit.fingerprint().to_string(),
            )),
            Err(err) => Err(err.into()),
        }
    }

    fn find_by_fingerprint(&self, fingerprint: &str) -> RepoResult<Option<ContentUnit>> {
        let mut units = self.query_units(
            &format!("{UNIT_SELECT_SQL} WHERE units.fingerprint = ?1;"),
            [fingerprint],
        )?;
        Ok(units.pop())
    }

    fn touch(&self, fingerprint: &str, at: Timestamp) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "UPDATE units SET updated_at = ?2 WHERE fingerprint = ?1;",
            params![fingerprint, at],
        )?;
        Ok(changed > 0)
    }

    fn delete_by_fingerprint(&self, fingerprint: &str) -> RepoResult<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM units WHERE fingerprint = ?1;", [fingerprint])?;
        Ok(changed > 0)
    }

    fn delete_by_id(&self, id: UnitId) -> RepoResult<bool> {
        let changed = self.conn.execute("DELETE FROM units WHERE id = ?1;", [id])?;
        Ok(changed > 0)
    }

    fn list_all(&self) -> RepoResult<Vec<ContentUnit>> {
        self.query_units(&format!("{UNIT_SELECT_SQL} {RECENCY_ORDER_SQL};"), [])
    }

    fn list_created_after(&self, at: Timestamp) -> RepoResult<Vec<ContentUnit>> {
        self.query_units(
            &format!("{UNIT_SELECT_SQL} WHERE units.created_at > ?1 {RECENCY_ORDER_SQL};"),
            [at],
        )
    }

    fn search(&self, include: &[String], exclude: &[String]) -> RepoResult<Vec<ContentUnit>> {
        let matcher = SearchTerms::new(include.to_vec(), exclude.to_vec()).matcher()?;
        self.filter_units(&matcher)
    }

    fn delete_matching(&self, term: &str) -> RepoResult<usize> {
        let matcher = substring_matcher(term)?;
        let doomed = self.filter_units(&matcher)?;
        let mut stmt = self.conn.prepare("DELETE FROM units WHERE id = ?1;")?;
        let mut removed = 0;
        for unit in doomed {
            removed += stmt.execute([unit.id])?;
        }
        Ok(removed)
    }

    fn count(&self) -> RepoResult<usize> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM units;", [], |row| row.get::<_, i64>(0))?;
        usize::try_from(count)
            .map_err(|_| RepoError::InvalidData(format!("negative unit count `{count}`")))
    }

    fn get_metadata(&self, key: &str) -> RepoResult<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM metadata WHERE key = ?1;")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn set_metadata(&self, key: &str, value: &str) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO metadata (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value;",
            params![key, value],
        )?;
        Ok(())
    }

    fn add_membership(&self, path: &str, fingerprint: &str) -> RepoResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO document_units (path, fingerprint) VALUES (?1, ?2);",
            params![path, fingerprint],
        )?;
        Ok(())
    }

    fn remove_membership(&self, path: &str, fingerprint: &str) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "DELETE FROM document_units WHERE path = ?1 AND fingerprint = ?2;",
            params![path, fingerprint],
        )?;
        Ok(changed > 0)
    }

    fn memberships_of(&self, path: &str) -> RepoResult<BTreeSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT fingerprint FROM document_units WHERE path = ?1;")?;
        let mut rows = stmt.query([path])?;
        let mut fingerprints = BTreeSet::new();
        while let Some(row) = rows.next()? {
            fingerprints.insert(row.get(0)?);
        }
        Ok(fingerprints)
    }

    fn list_document_units(&self, path: &str) -> RepoResult<Vec<ContentUnit>> {
        self.query_units(
            &format!(
                "{UNIT_SELECT_SQL}
                 JOIN document_units ON document_units.fingerprint = units.fingerprint
                 WHERE document_units.path = ?1
                 {RECENCY_ORDER_SQL};"
            ),
            [path],
        )
    }

    fn register_watch(&self, path: &str, at: Timestamp) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO watched_documents (path, started_at) VALUES (?1, ?2);",
            params![path, at],
        )?;
        Ok(changed > 0)
    }

    fn unregister_watch(&self, path: &str) -> RepoResult<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM watched_documents WHERE path = ?1;", [path])?;
        Ok(changed > 0)
    }

    fn is_watched(&self, path: &str) -> RepoResult<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM watched_documents WHERE path = ?1);",
            [path],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(exists == 1)
    }

    fn list_watches(&self) -> RepoResult<Vec<WatchRegistration>> {
        let mut stmt = self.conn.prepare(
            "SELECT path, started_at FROM watched_documents ORDER BY started_at ASC, path ASC;",
        )?;
        let mut rows = stmt.query([])?;
        let mut watches = Vec::new();
        while let Some(row) = rows.next()? {
            watches.push(WatchRegistration {
                path: row.get("path")?,
                started_at: row.get("started_at")?,
            });
        }
        Ok(watches)
    }

    fn atomically<T, E, F>(&self, work: F) -> Result<T, E>
    where
        E: From<RepoError>,
        F: FnOnce(&Self) -> Result<T, E>,
    {
        // IMMEDIATE takes the write lock up front, so a second connection
        // waits on the busy timeout instead of failing a read-then-write.
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .map_err(|err| E::from(RepoError::from(err)))?;
        // Dropping `tx` on the error path rolls back.
        let value = work(self)?;
        tx.commit().map_err(|err| E::from(RepoError::from(err)))?;
        Ok(value)
    }
}

fn parse_unit_row(row: &Row<'_>) -> RepoResult<ContentUnit> {
    let unit = ContentUnit {
        id: row.get("id")?,
        content: row.get("content")?,
        fingerprint: row.get("fingerprint")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    };

    if unit.content.is_empty() {
        return Err(RepoError::InvalidData(format!(
            "empty content in units.id={}",
            unit.id
        )));
    }
    if fingerprint(&unit.content) != unit.fingerprint {
        return Err(RepoError::InvalidData(format!(
            "fingerprint does not match content in units.id={}",
            unit.id
        )));
    }

    Ok(unit)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation
                && failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}
