use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::config::PetConfig;
use crate::conversation::{ConversationTurn, Role};

/// Persistence collaborator behind the conversation log.
///
/// `read` returns `Ok(None)` when no log has been written yet; that is not an
/// error. `write` replaces the whole stored sequence as one atomic unit.
#[async_trait]
pub trait Store: Send + Sync {
    async fn read(&self) -> Result<Option<Vec<ConversationTurn>>>;
    async fn write(&self, turns: &[ConversationTurn]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Json,
    Sqlite,
}

impl StoreBackend {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" | "file" => Some(StoreBackend::Json),
            "sqlite" | "db" => Some(StoreBackend::Sqlite),
            _ => None,
        }
    }
}

pub fn open_store(config: &PetConfig) -> Result<Arc<dyn Store>> {
    match config.store_backend {
        StoreBackend::Json => {
            tracing::info!("Conversation store: JSON file {}", config.store_path);
            Ok(Arc::new(JsonFileStore::new(&config.store_path)))
        }
        StoreBackend::Sqlite => {
            tracing::info!("Conversation store: SQLite {}", config.store_path);
            Ok(Arc::new(SqliteStore::open(&config.store_path)?))
        }
    }
}

/// The whole log as one pretty-printed JSON array, replaced via temp file
/// and rename so readers never observe a half-written file.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "conversation.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn read(&self) -> Result<Option<Vec<ConversationTurn>>> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {:?}", self.path));
            }
        };

        if data.trim().is_empty() {
            return Ok(Some(Vec::new()));
        }

        serde_json::from_str::<Vec<ConversationTurn>>(&data)
            .map(Some)
            .with_context(|| format!("Failed to parse {:?}", self.path))
    }

    async fn write(&self, turns: &[ConversationTurn]) -> Result<()> {
        let json = serde_json::to_string_pretty(turns).context("Failed to serialize turns")?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
        }

        let temp = self.temp_path();
        tokio::fs::write(&temp, json)
            .await
            .with_context(|| format!("Failed to write {:?}", temp))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {:?}", self.path))?;
        Ok(())
    }
}

/// SQLite-backed flat log: one `turns` table, rewritten inside a single
/// transaction per write.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open {:?}", path.as_ref()))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"CREATE TABLE IF NOT EXISTS turns (
                seq INTEGER PRIMARY KEY,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                idle INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS log_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );"#,
        )
        .context("Failed to create conversation schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    fn read_turns(conn: &Connection) -> Result<Option<Vec<ConversationTurn>>> {
        let written: Option<String> = match conn.query_row(
            "SELECT value FROM log_meta WHERE key = 'written_at'",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => Some(value),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };
        if written.is_none() {
            return Ok(None);
        }

        let mut stmt =
            conn.prepare("SELECT role, content, timestamp, idle FROM turns ORDER BY seq ASC")?;
        let turns = stmt
            .query_map([], |row| {
                let role: String = row.get(0)?;
                let timestamp: String = row.get(2)?;
                Ok((role, row.get::<_, String>(1)?, timestamp, row.get::<_, bool>(3)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(role, content, timestamp, idle)| {
                let role = Role::parse(&role)
                    .ok_or_else(|| anyhow::anyhow!("Unknown role '{}' in turns table", role))?;
                let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                    .with_context(|| format!("Bad timestamp '{}' in turns table", timestamp))?
                    .with_timezone(&Utc);
                Ok(ConversationTurn {
                    role,
                    content,
                    timestamp,
                    idle,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(turns))
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn read(&self) -> Result<Option<Vec<ConversationTurn>>> {
        let conn = self.lock_conn()?;
        Self::read_turns(&conn).context("Failed to read conversation from SQLite")
    }

    async fn write(&self, turns: &[ConversationTurn]) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM turns", [])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO turns (seq, role, content, timestamp, idle) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (seq, turn) in turns.iter().enumerate() {
                insert.execute(params![
                    seq as i64,
                    turn.role.as_str(),
                    turn.content,
                    turn.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
                    turn.idle,
                ])?;
            }
        }
        tx.execute(
            "INSERT OR REPLACE INTO log_meta (key, value) VALUES ('written_at', ?1)",
            [Utc::now().to_rfc3339()],
        )?;
        tx.commit()
            .context("Failed to commit conversation to SQLite")?;
        Ok(())
    }
}

/// In-process store, handy for embedding and tests.
#[derive(Default)]
pub struct MemoryStore {
    turns: Mutex<Option<Vec<ConversationTurn>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_turns(turns: Vec<ConversationTurn>) -> Self {
        Self {
            turns: Mutex::new(Some(turns)),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn read(&self) -> Result<Option<Vec<ConversationTurn>>> {
        let guard = self
            .turns
            .lock()
            .map_err(|e| anyhow::anyhow!("Memory store lock poisoned: {}", e))?;
        Ok(guard.clone())
    }

    async fn write(&self, turns: &[ConversationTurn]) -> Result<()> {
        let mut guard = self
            .turns
            .lock()
            .map_err(|e| anyhow::anyhow!("Memory store lock poisoned: {}", e))?;
        *guard = Some(turns.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_turns() -> Vec<ConversationTurn> {
        vec![
            ConversationTurn::pet("Hi, I'm BoBo. Nice to meet you."),
            ConversationTurn::user("hello"),
            ConversationTurn::pet("hi!"),
            ConversationTurn::mumble("It is quiet."),
        ]
    }

    #[tokio::test]
    async fn json_store_reports_missing_file_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("conversation.json"));
        assert!(store.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn json_store_rewrite_of_read_is_lossless() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("conversation.json"));
        let turns = sample_turns();
        store.write(&turns).await.unwrap();

        let first = store.read().await.unwrap().unwrap();
        store.write(&first).await.unwrap();
        let second = store.read().await.unwrap().unwrap();

        assert_eq!(first, turns);
        assert_eq!(second, turns);
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn json_store_reads_original_server_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversation.json");
        std::fs::write(
            &path,
            r#"[
  { "role": "assistant", "content": "Hi, I'm BoBo. Nice to meet you." },
  { "role": "user", "content": "hello" }
]"#,
        )
        .unwrap();

        let turns = JsonFileStore::new(&path).read().await.unwrap().unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::Pet);
        assert_eq!(turns[1].content, "hello");
    }

    #[tokio::test]
    async fn json_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversation.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = JsonFileStore::new(&path).read().await.unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[tokio::test]
    async fn json_store_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested/deeper/conversation.json"));
        store.write(&sample_turns()).await.unwrap();
        assert_eq!(store.read().await.unwrap().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn sqlite_store_is_not_found_until_first_write() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.read().await.unwrap().is_none());

        store.write(&[]).await.unwrap();
        assert_eq!(store.read().await.unwrap(), Some(Vec::new()));
    }

    #[tokio::test]
    async fn sqlite_store_rewrite_of_read_is_lossless() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("conversation.db")).unwrap();
        let turns = sample_turns();
        store.write(&turns).await.unwrap();

        let first = store.read().await.unwrap().unwrap();
        store.write(&first).await.unwrap();
        assert_eq!(store.read().await.unwrap().unwrap(), turns);
    }

    #[tokio::test]
    async fn sqlite_store_write_replaces_previous_sequence() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.write(&sample_turns()).await.unwrap();
        store
            .write(&[ConversationTurn::pet("fresh start")])
            .await
            .unwrap();
        let turns = store.read().await.unwrap().unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].content, "fresh start");
    }

    #[test]
    fn parses_store_backend_names() {
        assert_eq!(StoreBackend::parse("JSON"), Some(StoreBackend::Json));
        assert_eq!(StoreBackend::parse("sqlite"), Some(StoreBackend::Sqlite));
        assert_eq!(StoreBackend::parse("redis"), None);
    }
}
