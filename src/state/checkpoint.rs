//! 检查点存储：每个执行 ID 一条持久记录（序列化的 ExecutionContext）
//!
//! - InMemoryCheckpointStore：进程内，测试用
//! - JsonFileCheckpointStore：目录下每个执行一个 `<id>.json`
//! - SqliteCheckpointStore：rusqlite，表 `checkpoints(execution_id PRIMARY KEY, ...)`

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::core::AgentError;
use crate::state::ExecutionContext;

pub trait CheckpointStore: Send + Sync {
    /// 覆盖写入该执行的最新状态
    fn save(&self, context: &ExecutionContext) -> Result<(), AgentError>;

    fn load(&self, execution_id: &str) -> Result<Option<ExecutionContext>, AgentError>;

    fn delete(&self, execution_id: &str) -> Result<(), AgentError>;

    /// 已持久化的执行 ID（排序）
    fn list(&self) -> Result<Vec<String>, AgentError>;
}

fn checkpoint_err(e: impl std::fmt::Display) -> AgentError {
    AgentError::CheckpointError(e.to_string())
}

fn encode(context: &ExecutionContext) -> Result<String, AgentError> {
    serde_json::to_string(context).map_err(checkpoint_err)
}

fn decode(data: &str) -> Result<ExecutionContext, AgentError> {
    serde_json::from_str(data).map_err(checkpoint_err)
}

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    records: Mutex<HashMap<String, String>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn save(&self, context: &ExecutionContext) -> Result<(), AgentError> {
        let data = encode(context)?;
        self.records().insert(context.execution_id.clone(), data);
        Ok(())
    }

    fn load(&self, execution_id: &str) -> Result<Option<ExecutionContext>, AgentError> {
        self.records()
            .get(execution_id)
            .map(|data| decode(data))
            .transpose()
    }

    fn delete(&self, execution_id: &str) -> Result<(), AgentError> {
        self.records().remove(execution_id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, AgentError> {
        let mut ids: Vec<String> = self.records().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// 目录下每个执行一个 JSON 文件；写入先落临时文件再 rename
#[derive(Debug)]
pub struct JsonFileCheckpointStore {
    dir: PathBuf,
}

impl JsonFileCheckpointStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, AgentError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(checkpoint_err)?;
        Ok(Self { dir })
    }

    fn path_for(&self, execution_id: &str) -> PathBuf {
        // 执行 ID 仅保留安全字符，避免路径穿越
        let file: String = execution_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{file}.json"))
    }
}

impl CheckpointStore for JsonFileCheckpointStore {
    fn save(&self, context: &ExecutionContext) -> Result<(), AgentError> {
        let path = self.path_for(&context.execution_id);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_string_pretty(context).map_err(checkpoint_err)?;
        std::fs::write(&tmp, data).map_err(checkpoint_err)?;
        std::fs::rename(&tmp, &path).map_err(checkpoint_err)
    }

    fn load(&self, execution_id: &str) -> Result<Option<ExecutionContext>, AgentError> {
        let path = self.path_for(execution_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path).map_err(checkpoint_err)?;
        decode(&data).map(Some)
    }

    fn delete(&self, execution_id: &str) -> Result<(), AgentError> {
        let path = self.path_for(execution_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(checkpoint_err(e)),
        }
    }

    fn list(&self) -> Result<Vec<String>, AgentError> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(checkpoint_err)? {
            let path = entry.map_err(checkpoint_err)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, AgentError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(checkpoint_err)?;
            }
        }
        let conn = Connection::open(db_path).map_err(checkpoint_err)?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, AgentError> {
        let conn = Connection::open_in_memory().map_err(checkpoint_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, AgentError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                execution_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                state TEXT NOT NULL,
                context TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )
        .map_err(checkpoint_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn save(&self, context: &ExecutionContext) -> Result<(), AgentError> {
        let data = encode(context)?;
        let state = serde_json::to_value(context.state)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        self.conn()
            .execute(
                "INSERT INTO checkpoints (execution_id, session_id, state, context, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(execution_id) DO UPDATE SET
                    session_id = excluded.session_id,
                    state = excluded.state,
                    context = excluded.context,
                    updated_at = excluded.updated_at",
                params![
                    context.execution_id,
                    context.session_id,
                    state,
                    data,
                    context.updated_at.to_rfc3339()
                ],
            )
            .map_err(checkpoint_err)?;
        Ok(())
    }

    fn load(&self, execution_id: &str) -> Result<Option<ExecutionContext>, AgentError> {
        let data: Option<String> = self
            .conn()
            .query_row(
                "SELECT context FROM checkpoints WHERE execution_id = ?1",
                params![execution_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(checkpoint_err)?;
        data.as_deref().map(decode).transpose()
    }

    fn delete(&self, execution_id: &str) -> Result<(), AgentError> {
        self.conn()
            .execute(
                "DELETE FROM checkpoints WHERE execution_id = ?1",
                params![execution_id],
            )
            .map_err(checkpoint_err)?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, AgentError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached("SELECT execution_id FROM checkpoints ORDER BY execution_id")
            .map_err(checkpoint_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(checkpoint_err)?;
        let ids = rows.collect::<Result<Vec<_>, _>>().map_err(checkpoint_err)?;
        Ok(ids)
    }
}
