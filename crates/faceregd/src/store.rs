//! SQLite-backed person store with an in-memory gallery snapshot.
//!
//! All SQL runs on the single `tokio-rusqlite` connection thread. Each
//! mutation swaps the snapshot on that thread right after its commit, so
//! readers see the gallery before or after a write and never a database
//! that disagrees with it, even when the caller stops waiting.

use chrono::{SecondsFormat, Utc};
use facereg_core::{Embedding, Person};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio_rusqlite::Connection;

pub const MAX_NAME_LEN: usize = 128;

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS persons (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS embeddings (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    person_id      INTEGER NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
    model_version  TEXT,
    dim            INTEGER NOT NULL,
    data           BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_embeddings_person ON embeddings(person_id);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("name must not be empty")]
    EmptyName,
    #[error("name is longer than {MAX_NAME_LEN} characters")]
    NameTooLong,
    #[error("a person named {0:?} already exists")]
    DuplicateName(String),
    #[error("person {0} not found")]
    NotFound(i64),
    #[error("embedding has no values")]
    EmptyEmbedding,
    #[error("corrupt embedding for person {0}")]
    CorruptEmbedding(i64),
    #[error("database: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
}

/// What `create` does when the name is already registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Fail with `DuplicateName`.
    Reject,
    /// Add the embedding to the existing person.
    Merge,
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuplicatePolicy::Reject => f.write_str("reject"),
            DuplicatePolicy::Merge => f.write_str("merge"),
        }
    }
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(DuplicatePolicy::Reject),
            "merge" => Ok(DuplicatePolicy::Merge),
            other => Err(format!("unknown duplicate policy: {other}")),
        }
    }
}

/// Result of `PersonStore::create`.
#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    pub id: i64,
    pub name: String,
    /// True when the embedding was appended to an existing person.
    pub merged: bool,
}

pub struct PersonStore {
    conn: Connection,
    policy: DuplicatePolicy,
    gallery: Arc<RwLock<Arc<Vec<Person>>>>,
}

impl PersonStore {
    /// Open (or create) the database at `path` and load the gallery.
    pub async fn open(path: &Path, policy: DuplicatePolicy) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).await?;
        let store = Self::init(conn, policy).await?;
        tracing::info!(
            path = %path.display(),
            persons = store.len(),
            policy = %policy,
            "person store opened"
        );
        Ok(store)
    }

    pub async fn open_in_memory(policy: DuplicatePolicy) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn, policy).await
    }

    async fn init(conn: Connection, policy: DuplicatePolicy) -> Result<Self, StoreError> {
        let persons = conn
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(load_persons(conn))
            })
            .await??;

        Ok(Self {
            conn,
            policy,
            gallery: Arc::new(RwLock::new(Arc::new(persons))),
        })
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Consistent snapshot of the gallery in insertion order.
    pub fn list(&self) -> Arc<Vec<Person>> {
        match self.gallery.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn get(&self, id: i64) -> Option<Person> {
        self.list().iter().find(|p| p.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.list().len()
    }

    /// Register `embedding` under `name`.
    ///
    /// With `DuplicatePolicy::Merge` an existing name gains another
    /// embedding and keeps its id.
    pub async fn create(&self, name: &str, embedding: Embedding) -> Result<Created, StoreError> {
        let name = normalize_name(name)?;
        if embedding.values.is_empty() {
            return Err(StoreError::EmptyEmbedding);
        }

        let policy = self.policy;
        let gallery = Arc::clone(&self.gallery);
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let blob = encode_values(&embedding.values);
        let dim = embedding.dim() as i64;
        let model_version = embedding.model_version.clone();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let existing: Option<i64> = tx
                    .query_row("SELECT id FROM persons WHERE name = ?1", [&name], |row| row.get(0))
                    .optional()?;

                let (id, merged) = match existing {
                    Some(_) if policy == DuplicatePolicy::Reject => {
                        return Ok(Err(StoreError::DuplicateName(name)));
                    }
                    Some(id) => (id, true),
                    None => {
                        tx.execute(
                            "INSERT INTO persons (name, created_at) VALUES (?1, ?2)",
                            params![name, now],
                        )?;
                        (tx.last_insert_rowid(), false)
                    }
                };

                tx.execute(
                    "INSERT INTO embeddings (person_id, model_version, dim, data) VALUES (?1, ?2, ?3, ?4)",
                    params![id, model_version, dim, blob],
                )?;
                tx.commit()?;

                swap_gallery(&gallery, |persons| {
                    if merged {
                        if let Some(person) = persons.iter_mut().find(|p| p.id == id) {
                            person.embeddings.push(embedding);
                        }
                    } else {
                        persons.push(Person {
                            id,
                            name: name.clone(),
                            embeddings: vec![embedding],
                            created_at: now,
                        });
                    }
                });
                tracing::info!(id, name = %name, merged, "person registered");
                Ok(Ok(Created { id, name, merged }))
            })
            .await?
    }

    /// Rename person `id`, returning the stored name.
    ///
    /// Renaming to the current name succeeds without a write.
    pub async fn rename(&self, id: i64, new_name: &str) -> Result<String, StoreError> {
        let name = normalize_name(new_name)?;
        let gallery = Arc::clone(&self.gallery);

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let current: Option<String> = tx
                    .query_row("SELECT name FROM persons WHERE id = ?1", [id], |row| row.get(0))
                    .optional()?;
                match current {
                    None => return Ok(Err(StoreError::NotFound(id))),
                    Some(current) if current == name => return Ok(Ok(name)),
                    Some(_) => {}
                }

                let taken: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM persons WHERE name = ?1 AND id != ?2",
                        params![name, id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if taken.is_some() {
                    return Ok(Err(StoreError::DuplicateName(name)));
                }

                tx.execute("UPDATE persons SET name = ?1 WHERE id = ?2", params![name, id])?;
                tx.commit()?;

                swap_gallery(&gallery, |persons| {
                    if let Some(person) = persons.iter_mut().find(|p| p.id == id) {
                        person.name = name.clone();
                    }
                });
                tracing::info!(id, name = %name, "person renamed");
                Ok(Ok(name))
            })
            .await?
    }

    /// Delete person `id` and all of its embeddings.
    pub async fn delete(&self, id: i64) -> Result<(), StoreError> {
        let gallery = Arc::clone(&self.gallery);

        self.conn
            .call(move |conn| {
                if conn.execute("DELETE FROM persons WHERE id = ?1", [id])? == 0 {
                    return Ok(Err(StoreError::NotFound(id)));
                }
                swap_gallery(&gallery, |persons| persons.retain(|p| p.id != id));
                tracing::info!(id, "person deleted");
                Ok(Ok(()))
            })
            .await?
    }
}

/// Copy-on-write update of the snapshot. Only called on the connection
/// thread, right after the matching commit.
fn swap_gallery(gallery: &RwLock<Arc<Vec<Person>>>, f: impl FnOnce(&mut Vec<Person>)) {
    let mut guard = match gallery.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let mut next = guard.as_ref().clone();
    f(&mut next);
    *guard = Arc::new(next);
}

fn normalize_name(name: &str) -> Result<String, StoreError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StoreError::EmptyName);
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(StoreError::NameTooLong);
    }
    Ok(name.to_string())
}

fn load_persons(conn: &rusqlite::Connection) -> Result<Vec<Person>, StoreError> {
    let read = || -> rusqlite::Result<(Vec<Person>, Vec<(i64, Option<String>, i64, Vec<u8>)>)> {
        let mut stmt = conn.prepare("SELECT id, name, created_at FROM persons ORDER BY id")?;
        let persons = stmt
            .query_map([], |row| {
                Ok(Person {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    embeddings: Vec::new(),
                    created_at: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = conn.prepare(
            "SELECT person_id, model_version, dim, data FROM embeddings ORDER BY person_id, id",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((persons, rows))
    };

    let (mut persons, rows) = read().map_err(|e| StoreError::Database(e.into()))?;

    for (person_id, model_version, dim, data) in rows {
        let values = decode_values(&data)
            .filter(|v| v.len() as i64 == dim)
            .ok_or(StoreError::CorruptEmbedding(person_id))?;
        if let Some(person) = persons.iter_mut().find(|p| p.id == person_id) {
            person.embeddings.push(Embedding {
                values,
                model_version,
            });
        }
    }

    Ok(persons)
}

/// Little-endian `f32` blob.
fn encode_values(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_values(data: &[u8]) -> Option<Vec<f32>> {
    if data.len() % 4 != 0 {
        return None;
    }
    Some(
        data.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}
