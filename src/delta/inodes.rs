//! Durable inode identity table.
//!
//! Identity is path-independent: each row has a numeric id, a name and
//! parent ids, so renames keep the id stable. The table is the sync
//! worker's source of truth for what an inode is, independent of any
//! process's in-memory registry.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::OptionalExtension;
use tracing::*;

use crate::error::StateError;
use crate::upath::{ubasename, udirname};
use crate::utils::unix_timestamp;

/// The id of the filesystem root row.
pub const ROOT_ID: i64 = 1;

#[derive(Clone, Debug)]
pub struct InodeRow {
    pub id: i64,
    pub name: String,
    /// Node kind tag (`filenode` or `dirnode`), used to reconstruct the
    /// right inode type.
    pub kind: String,
    pub parents: Vec<i64>,
    pub children: Vec<i64>,
    pub meta: serde_json::Value,
    /// Files only: path of the cached data on disk.
    pub data: Option<String>,
    pub last_accessed: i64,
}

pub struct InodeDb {
    conn: Mutex<rusqlite::Connection>,
}

impl InodeDb {
    pub fn open(path: &Path) -> Result<Self, StateError> {
        Self::init(rusqlite::Connection::open(path)?)
    }

    /// Private in-memory database, for tests and single-process use.
    pub fn open_in_memory() -> Result<Self, StateError> {
        Self::init(rusqlite::Connection::open_in_memory()?)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self, StateError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS fs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 name TEXT NOT NULL,
                 kind TEXT NOT NULL,
                 parents TEXT,
                 children TEXT,
                 meta TEXT,
                 data TEXT,
                 last_accessed INTEGER DEFAULT 0
             );",
        )?;
        // The root row is fixed so path resolution has an anchor
        conn.execute(
            "INSERT OR IGNORE INTO fs (id, name, kind, parents, children)
             VALUES (?1, '', 'dirnode', NULL, '[]')",
            [ROOT_ID],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolve a upath to an inode id by walking segments under the root.
    pub fn resolve(&self, upath: &str) -> Result<Option<i64>, StateError> {
        if upath.is_empty() {
            return Ok(Some(ROOT_ID));
        }
        let conn = self.lock();
        let mut parent = ROOT_ID;
        for segment in upath.split('/') {
            let mut stmt = conn.prepare_cached("SELECT id, parents FROM fs WHERE name = ?1")?;
            let rows: Vec<(i64, Option<String>)> = stmt
                .query_map([segment], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<Result<_, _>>()?;
            let hit = rows.into_iter().find(|(_, parents)| {
                parse_ids(parents.as_deref()).contains(&parent)
            });
            match hit {
                Some((id, _)) => parent = id,
                None => return Ok(None),
            }
        }
        Ok(Some(parent))
    }

    pub fn get(&self, id: i64) -> Result<InodeRow, StateError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, name, kind, parents, children, meta, data, last_accessed
                 FROM fs WHERE id = ?1",
                [id],
                |r| {
                    Ok(InodeRow {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        kind: r.get(2)?,
                        parents: parse_ids(r.get::<_, Option<String>>(3)?.as_deref()),
                        children: parse_ids(r.get::<_, Option<String>>(4)?.as_deref()),
                        meta: r
                            .get::<_, Option<String>>(5)?
                            .and_then(|m| serde_json::from_str(&m).ok())
                            .unwrap_or(serde_json::Value::Null),
                        data: r.get(6)?,
                        last_accessed: r.get(7)?,
                    })
                },
            )
            .optional()?;
        row.ok_or(StateError::InodeNotFound(id))
    }

    /// Create any missing rows along `upath`, committing each one;
    /// intermediate segments are directories, the leaf gets `kind`.
    /// Returns the leaf id.
    pub fn create_path(&self, upath: &str, kind: &str) -> Result<i64, StateError> {
        if upath.is_empty() {
            return Ok(ROOT_ID);
        }
        let parent_upath = udirname(upath);
        let parent = match self.resolve(parent_upath)? {
            Some(id) => id,
            None => self.create_path(parent_upath, "dirnode")?,
        };
        if let Some(existing) = self.resolve(upath)? {
            return Ok(existing);
        }

        let conn = self.lock();
        conn.execute(
            "INSERT INTO fs (name, kind, parents, children, last_accessed)
             VALUES (?1, ?2, ?3, '[]', ?4)",
            rusqlite::params![
                ubasename(upath),
                kind,
                serde_json::to_string(&[parent]).unwrap_or_default(),
                unix_timestamp() as i64,
            ],
        )?;
        let id = conn.last_insert_rowid();

        // Register with the parent
        let children: Option<String> = conn
            .query_row("SELECT children FROM fs WHERE id = ?1", [parent], |r| {
                r.get(0)
            })
            .optional()?
            .flatten();
        let mut children = parse_ids(children.as_deref());
        children.push(id);
        conn.execute(
            "UPDATE fs SET children = ?1 WHERE id = ?2",
            rusqlite::params![serde_json::to_string(&children).unwrap_or_default(), parent],
        )?;

        debug!(upath, id, kind, "Created inode row");
        Ok(id)
    }

    /// Reconstruct a upath by walking the first-parent chain to the root.
    pub fn upath_of(&self, id: i64) -> Result<Option<String>, StateError> {
        let mut segments = Vec::new();
        let mut current = id;
        loop {
            if current == ROOT_ID {
                segments.reverse();
                return Ok(Some(segments.join("/")));
            }
            let row = match self.get(current) {
                Ok(row) => row,
                Err(StateError::InodeNotFound(_)) => return Ok(None),
                Err(e) => return Err(e),
            };
            segments.push(row.name);
            match row.parents.first() {
                Some(&p) => current = p,
                None => return Ok(None),
            }
            if segments.len() > 4096 {
                // Parent cycle in a corrupted table
                return Ok(None);
            }
        }
    }

    pub fn touch(&self, id: i64) -> Result<(), StateError> {
        self.lock().execute(
            "UPDATE fs SET last_accessed = ?1 WHERE id = ?2",
            rusqlite::params![unix_timestamp() as i64, id],
        )?;
        Ok(())
    }

    pub fn save(&self, row: &InodeRow) -> Result<(), StateError> {
        let changed = self.lock().execute(
            "UPDATE fs SET name = ?1, kind = ?2, parents = ?3, children = ?4,
                 meta = ?5, data = ?6, last_accessed = ?7 WHERE id = ?8",
            rusqlite::params![
                row.name,
                row.kind,
                serde_json::to_string(&row.parents).unwrap_or_default(),
                serde_json::to_string(&row.children).unwrap_or_default(),
                row.meta.to_string(),
                row.data,
                row.last_accessed,
                row.id,
            ],
        )?;
        if changed == 0 {
            return Err(StateError::InodeNotFound(row.id));
        }
        Ok(())
    }
}

fn parse_ids(json: Option<&str>) -> Vec<i64> {
    json.and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resolve_and_create() {
        let db = InodeDb::open_in_memory().unwrap();
        assert_eq!(db.resolve("").unwrap(), Some(ROOT_ID));
        assert_eq!(db.resolve("a/b").unwrap(), None);

        let id = db.create_path("a/b/c.txt", "filenode").unwrap();
        assert_eq!(db.resolve("a/b/c.txt").unwrap(), Some(id));
        assert_eq!(db.upath_of(id).unwrap().as_deref(), Some("a/b/c.txt"));

        let b = db.resolve("a/b").unwrap().unwrap();
        assert_eq!(db.get(b).unwrap().kind, "dirnode");
        assert!(db.get(b).unwrap().children.contains(&id));

        // Idempotent
        assert_eq!(db.create_path("a/b/c.txt", "filenode").unwrap(), id);

        // Same leaf name under a different parent is a distinct identity
        let other = db.create_path("z/c.txt", "filenode").unwrap();
        assert_ne!(other, id);
        assert_eq!(db.upath_of(other).unwrap().as_deref(), Some("z/c.txt"));
    }
}
