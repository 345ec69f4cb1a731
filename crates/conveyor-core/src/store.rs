use crate::error::{ConveyorError, ConveyorResult};
use crate::task::{Task, TaskStatus};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::PathBuf;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Narrow repository interface for durable task records.
///
/// The backing technology is swappable; the core only ever calls these five
/// operations.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn save(&self, task: &Task) -> ConveyorResult<()>;
    async fn load(&self, id: Uuid) -> ConveyorResult<Option<Task>>;
    async fn query_by_status(&self, status: &TaskStatus) -> ConveyorResult<Vec<Task>>;
    async fn delete(&self, id: Uuid) -> ConveyorResult<()>;
    async fn list(&self) -> ConveyorResult<Vec<Uuid>>;
}

/// In-memory store. Default for tests and single-process embedding.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<Uuid, Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn save(&self, task: &Task) -> ConveyorResult<()> {
        self.tasks.write().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn load(&self, id: Uuid) -> ConveyorResult<Option<Task>> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn query_by_status(&self, status: &TaskStatus) -> ConveyorResult<Vec<Task>> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| match (&t.status, status) {
                (TaskStatus::Failed { .. }, TaskStatus::Failed { .. }) => true,
                (a, b) => a == b,
            })
            .cloned()
            .collect())
    }

    async fn delete(&self, id: Uuid) -> ConveyorResult<()> {
        self.tasks.write().await.remove(&id);
        Ok(())
    }

    async fn list(&self) -> ConveyorResult<Vec<Uuid>> {
        Ok(self.tasks.read().await.keys().copied().collect())
    }
}

/// File-based task store (one JSON file per task id).
pub struct FileTaskStore {
    dir: PathBuf,
}

impl FileTaskStore {
    pub async fn new(dir: PathBuf) -> ConveyorResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn task_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn save(&self, task: &Task) -> ConveyorResult<()> {
        let path = self.task_path(task.id);
        let json = serde_json::to_string_pretty(task)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    async fn load(&self, id: Uuid) -> ConveyorResult<Option<Task>> {
        let path = self.task_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let task: Task = serde_json::from_str(&data)
            .map_err(|e| ConveyorError::Store(format!("failed to parse task record: {e}")))?;
        Ok(Some(task))
    }

    async fn query_by_status(&self, status: &TaskStatus) -> ConveyorResult<Vec<Task>> {
        let mut out = Vec::new();
        for id in self.list().await? {
            if let Some(task) = self.load(id).await? {
                let matches = match (&task.status, status) {
                    (TaskStatus::Failed { .. }, TaskStatus::Failed { .. }) => true,
                    (a, b) => a == b,
                };
                if matches {
                    out.push(task);
                }
            }
        }
        Ok(out)
    }

    async fn delete(&self, id: Uuid) -> ConveyorResult<()> {
        let path = self.task_path(id);
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn list(&self) -> ConveyorResult<Vec<Uuid>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(".json") {
                    if let Ok(id) = Uuid::parse_str(stem) {
                        ids.push(id);
                    }
                }
            }
        }
        Ok(ids)
    }
}

/// Repository interface for control-plane records that must survive a
/// restart: schedule definitions, workflow instance snapshots, agent
/// records. Keys are the record's own id rendered as a string.
#[async_trait]
pub trait RecordStore<R>: Send + Sync
where
    R: Send + Sync,
{
    async fn put(&self, key: &str, record: &R) -> ConveyorResult<()>;
    async fn get(&self, key: &str) -> ConveyorResult<Option<R>>;
    async fn remove(&self, key: &str) -> ConveyorResult<()>;
    async fn load_all(&self) -> ConveyorResult<Vec<R>>;
}

/// In-memory record store. Default for tests and single-process embedding.
pub struct MemoryRecordStore<R> {
    records: RwLock<HashMap<String, R>>,
}

impl<R> MemoryRecordStore<R> {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl<R> Default for MemoryRecordStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R> RecordStore<R> for MemoryRecordStore<R>
where
    R: Clone + Send + Sync,
{
    async fn put(&self, key: &str, record: &R) -> ConveyorResult<()> {
        self.records
            .write()
            .await
            .insert(key.to_string(), record.clone());
        Ok(())
    }

    async fn get(&self, key: &str) -> ConveyorResult<Option<R>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn remove(&self, key: &str) -> ConveyorResult<()> {
        self.records.write().await.remove(key);
        Ok(())
    }

    async fn load_all(&self) -> ConveyorResult<Vec<R>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

/// File-based record store (one JSON file per key). Keys must be
/// filesystem-safe; ids and agent names are.
pub struct FileRecordStore<R> {
    dir: PathBuf,
    _marker: PhantomData<fn() -> R>,
}

impl<R> FileRecordStore<R> {
    pub async fn new(dir: PathBuf) -> ConveyorResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            _marker: PhantomData,
        })
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl<R> RecordStore<R> for FileRecordStore<R>
where
    R: Serialize + DeserializeOwned + Send + Sync,
{
    async fn put(&self, key: &str, record: &R) -> ConveyorResult<()> {
        let json = serde_json::to_string_pretty(record)?;
        tokio::fs::write(self.record_path(key), json).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> ConveyorResult<Option<R>> {
        let path = self.record_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let record = serde_json::from_str(&data)
            .map_err(|e| ConveyorError::Store(format!("failed to parse record: {e}")))?;
        Ok(Some(record))
    }

    async fn remove(&self, key: &str) -> ConveyorResult<()> {
        let path = self.record_path(key);
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn load_all(&self) -> ConveyorResult<Vec<R>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_str().map_or(false, |n| n.ends_with(".json")) {
                let data = tokio::fs::read_to_string(entry.path()).await?;
                let record = serde_json::from_str(&data)
                    .map_err(|e| ConveyorError::Store(format!("failed to parse record: {e}")))?;
                out.push(record);
            }
        }
        Ok(out)
    }
}
