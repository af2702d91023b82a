use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};

use crate::error::{AgentError, Result};
use crate::scheduler::task::{Task, TaskStatus};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS local_tasks (
    id                TEXT PRIMARY KEY,
    name              TEXT NOT NULL DEFAULT '',
    type              TEXT NOT NULL DEFAULT 'shell',
    command           TEXT NOT NULL,
    args              TEXT NOT NULL DEFAULT '[]',
    workdir           TEXT NOT NULL DEFAULT '',
    env               TEXT NOT NULL DEFAULT '{}',
    timeout           INTEGER NOT NULL DEFAULT 0,
    priority          INTEGER NOT NULL DEFAULT 5,
    retry_count       INTEGER NOT NULL DEFAULT 0,
    retry_delay       INTEGER NOT NULL DEFAULT 60,
    max_retries       INTEGER NOT NULL DEFAULT 0,
    status            TEXT NOT NULL DEFAULT 'pending',
    exit_code         INTEGER NOT NULL DEFAULT 0,
    stdout            TEXT NOT NULL DEFAULT '',
    stderr            TEXT NOT NULL DEFAULT '',
    error             TEXT NOT NULL DEFAULT '',
    machine_id        TEXT NOT NULL DEFAULT '',
    group_id          TEXT NOT NULL DEFAULT '',
    parent_id         TEXT NOT NULL DEFAULT '',
    depends_on        TEXT NOT NULL DEFAULT '[]',
    assigned_agent_id TEXT NOT NULL DEFAULT '',
    attempt_id        TEXT NOT NULL DEFAULT '',
    lease_expires_at  TEXT NOT NULL DEFAULT '',
    created_at        TEXT NOT NULL DEFAULT '',
    assigned_at       TEXT NOT NULL DEFAULT '',
    started_at        TEXT NOT NULL DEFAULT '',
    ended_at          TEXT NOT NULL DEFAULT '',
    synced            INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_local_tasks_status ON local_tasks(status);
CREATE INDEX IF NOT EXISTS idx_local_tasks_priority ON local_tasks(priority);
CREATE INDEX IF NOT EXISTS idx_local_tasks_synced ON local_tasks(synced);
";

const COLUMNS: &str = "id, name, type, command, args, workdir, env, timeout, \
    priority, retry_count, retry_delay, max_retries, \
    status, exit_code, stdout, stderr, error, \
    machine_id, group_id, parent_id, depends_on, \
    assigned_agent_id, attempt_id, lease_expires_at, \
    created_at, assigned_at, started_at, ended_at, synced";

#[cfg(unix)]
type OwnerLock = nix::fcntl::Flock<File>;
#[cfg(not(unix))]
type OwnerLock = File;

/// SQLite-backed task store. One connection, serialized behind a mutex.
///
/// A writable store holds an exclusive lock on `<db>.lock` until it is closed
/// or dropped, so only one agent process at a time can recover and dispatch
/// from a database.
///
/// Timestamps are written as fixed-precision RFC 3339 UTC text so they sort
/// lexically; an empty string means unset.
pub struct TaskStore {
    conn: Mutex<Option<Connection>>,
    owner: Mutex<Option<OwnerLock>>,
}

impl TaskStore {
    /// Open or create the database file, applying the schema if missing.
    ///
    /// Fails with [`AgentError::StoreLocked`] when another store already owns
    /// the file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let owner = acquire_owner_lock(path)?;
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "Opened task store");
        Self::init(conn, Some(owner))
    }

    /// Read-only view of an existing database. Takes no lock, so it works
    /// while an agent owns the file; every write fails.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            owner: Mutex::new(None),
        })
    }

    /// In-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, owner: Option<OwnerLock>) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            owner: Mutex::new(owner),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(AgentError::StoreClosed)?;
        Ok(f(conn)?)
    }

    /// Insert or fully replace the record with this task's ID.
    pub fn save(&self, task: &Task) -> Result<()> {
        let args = serde_json::to_string(&task.args)?;
        let env = serde_json::to_string(&task.env)?;
        let depends_on = serde_json::to_string(&task.depends_on)?;

        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO local_tasks ({COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                      ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29)"
                ),
                params![
                    task.id,
                    task.name,
                    task.task_type.as_str(),
                    task.command,
                    args,
                    task.workdir,
                    env,
                    to_i64(task.timeout),
                    task.priority,
                    task.retry_count,
                    to_i64(task.retry_delay),
                    task.max_retries,
                    task.status.as_str(),
                    task.exit_code,
                    task.stdout,
                    task.stderr,
                    task.error,
                    task.machine_id,
                    task.group_id,
                    task.parent_id,
                    depends_on,
                    task.assigned_agent_id,
                    task.attempt_id,
                    format_time(task.lease_expires_at),
                    format_time(task.created_at),
                    format_time(task.assigned_at),
                    format_time(task.started_at),
                    format_time(task.ended_at),
                    task.synced,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get(&self, id: &str) -> Result<Task> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM local_tasks WHERE id = ?1"),
                params![id],
                task_from_row,
            )
            .optional()
        })?
        .ok_or_else(|| AgentError::TaskNotFound(id.to_string()))
    }

    /// Records with the given status, highest priority (lowest value) first.
    pub fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM local_tasks WHERE status = ?1 \
                 ORDER BY priority ASC, created_at ASC"
            ))?;
            let rows = stmt.query_map(params![status.as_str()], task_from_row)?;
            rows.collect()
        })
    }

    /// Every record, newest first.
    pub fn list_all(&self) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM local_tasks ORDER BY created_at DESC"
            ))?;
            let rows = stmt.query_map([], task_from_row)?;
            rows.collect()
        })
    }

    /// Returns false when no record had this ID.
    pub fn delete(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM local_tasks WHERE id = ?1", params![id])?;
            Ok(n > 0)
        })
    }

    /// Terminal records whose result has not been reconciled upstream yet.
    pub fn list_unsynced(&self) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM local_tasks \
                 WHERE synced = 0 AND status IN (?1, ?2, ?3) \
                 ORDER BY ended_at ASC"
            ))?;
            let [a, b, c] = TaskStatus::TERMINAL;
            let rows = stmt.query_map(params![a.as_str(), b.as_str(), c.as_str()], task_from_row)?;
            rows.collect()
        })
    }

    pub fn mark_synced(&self, id: &str) -> Result<()> {
        let updated = self.with_conn(|conn| {
            conn.execute(
                "UPDATE local_tasks SET synced = 1 WHERE id = ?1",
                params![id],
            )
        })?;
        if updated == 0 {
            return Err(AgentError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Number of records per status. Statuses with no records are omitted.
    pub fn count_by_status(&self) -> Result<HashMap<TaskStatus, usize>> {
        let raw = self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM local_tasks GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        let mut counts = HashMap::new();
        for (status, count) in raw {
            let status = status.parse::<TaskStatus>().map_err(|e| AgentError::InvalidRecord {
                task_id: String::new(),
                message: e.to_string(),
            })?;
            counts.insert(status, usize::try_from(count).unwrap_or(0));
        }
        Ok(counts)
    }

    /// Close the connection. Later calls fail with [`AgentError::StoreClosed`].
    /// Close the connection and release the ownership lock.
    pub fn close(&self) -> Result<()> {
        let conn = self.lock().take();
        let _owner = self.owner.lock().unwrap_or_else(|e| e.into_inner()).take();
        match conn {
            Some(conn) => conn.close().map_err(|(_, e)| AgentError::Store(e)),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }
}

fn lock_path(db: &Path) -> PathBuf {
    let mut name = db.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

#[cfg(unix)]
fn acquire_owner_lock(db: &Path) -> Result<OwnerLock> {
    use nix::errno::Errno;
    use nix::fcntl::{Flock, FlockArg};

    let path = lock_path(db);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)?;
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => Ok(lock),
        Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
            Err(AgentError::StoreLocked(db.display().to_string()))
        }
        Err((_, errno)) => Err(AgentError::Io(errno.into())),
    }
}

#[cfg(not(unix))]
fn acquire_owner_lock(db: &Path) -> Result<OwnerLock> {
    Ok(OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path(db))?)
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

fn format_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339_opts(SecondsFormat::Nanos, true))
        .unwrap_or_default()
}

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: String = row.get(idx)?;
    if raw.is_empty() {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| Some(t.with_timezone(&Utc)))
        .map_err(|e| conversion_error(idx, e))
}

fn json_at<T: serde::de::DeserializeOwned + Default>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    if raw.is_empty() || raw == "null" {
        return Ok(T::default());
    }
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let task_type: String = row.get(2)?;
    let status: String = row.get(12)?;
    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        task_type: task_type.parse().map_err(|e| conversion_error(2, e))?,
        command: row.get(3)?,
        args: json_at(row, 4)?,
        workdir: row.get(5)?,
        env: json_at(row, 6)?,
        timeout: to_u64(row.get(7)?),
        priority: row.get(8)?,
        retry_count: row.get(9)?,
        retry_delay: to_u64(row.get(10)?),
        max_retries: row.get(11)?,
        status: status.parse().map_err(|e| conversion_error(12, e))?,
        exit_code: row.get(13)?,
        stdout: row.get(14)?,
        stderr: row.get(15)?,
        error: row.get(16)?,
        machine_id: row.get(17)?,
        group_id: row.get(18)?,
        parent_id: row.get(19)?,
        depends_on: json_at(row, 20)?,
        assigned_agent_id: row.get(21)?,
        attempt_id: row.get(22)?,
        lease_expires_at: time_at(row, 23)?,
        created_at: time_at(row, 24)?,
        assigned_at: time_at(row, 25)?,
        started_at: time_at(row, 26)?,
        ended_at: time_at(row, 27)?,
        synced: row.get(28)?,
    })
}
