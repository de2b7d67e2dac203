//! 记忆存储：跨运行保存记忆条目
//!
//! 写入只追加（record_outcome 与外部整理工具），读取可被多个运行并发进行，不需要运行级锁。
//! InMemoryStore 超过容量时淘汰最旧的非程序记忆；JsonlMemoryStore 每条一行 JSON 追加到文件。

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::core::error::Result;
use crate::memory::types::{MemoryItem, MemoryKind};

/// 记忆存储 trait
pub trait MemoryStore: Send + Sync {
    fn insert(&self, item: MemoryItem) -> Result<()>;

    /// 当前全部条目（副本）
    fn snapshot(&self) -> Vec<MemoryItem>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 内存实现
#[derive(Clone)]
pub struct InMemoryStore {
    items: Arc<RwLock<Vec<MemoryItem>>>,
    max_entries: usize,
}

impl InMemoryStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            items: Arc::new(RwLock::new(Vec::new())),
            max_entries: max_entries.max(1),
        }
    }

    pub fn with_items(items: Vec<MemoryItem>, max_entries: usize) -> Self {
        let store = Self::new(max_entries);
        for item in items {
            store.push(item);
        }
        store
    }

    fn push(&self, item: MemoryItem) {
        let mut items = self.items.write().unwrap_or_else(|e| e.into_inner());
        items.push(item);
        while items.len() > self.max_entries {
            // 程序记忆由人工整理，不自动淘汰
            let oldest = items
                .iter()
                .enumerate()
                .filter(|(_, m)| m.kind != MemoryKind::Procedural)
                .min_by_key(|(_, m)| m.created_at)
                .map(|(i, _)| i);
            match oldest {
                Some(i) => {
                    items.remove(i);
                }
                None => break,
            }
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl MemoryStore for InMemoryStore {
    fn insert(&self, item: MemoryItem) -> Result<()> {
        self.push(item);
        Ok(())
    }

    fn snapshot(&self) -> Vec<MemoryItem> {
        self.items.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn len(&self) -> usize {
        self.items.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// JSONL 文件实现：启动时加载，写入时先追加文件再更新内存
pub struct JsonlMemoryStore {
    path: PathBuf,
    inner: InMemoryStore,
    file_lock: Mutex<()>,
}

impl JsonlMemoryStore {
    pub fn open(path: impl AsRef<Path>, max_entries: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut items = Vec::new();
        if path.exists() {
            let reader = BufReader::new(std::fs::File::open(&path)?);
            for (n, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<MemoryItem>(&line) {
                    Ok(item) => items.push(item),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), line = n + 1, error = %e, "Skipping malformed memory line")
                    }
                }
            }
        } else if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        tracing::debug!(path = %path.display(), items = items.len(), "Memory store loaded");
        Ok(Self {
            path,
            inner: InMemoryStore::with_items(items, max_entries),
            file_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MemoryStore for JsonlMemoryStore {
    fn insert(&self, item: MemoryItem) -> Result<()> {
        let line = serde_json::to_string(&item)?;
        {
            let _guard = self.file_lock.lock().unwrap_or_else(|e| e.into_inner());
            let mut f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            writeln!(f, "{line}")?;
        }
        self.inner.insert(item)
    }

    fn snapshot(&self) -> Vec<MemoryItem> {
        self.inner.snapshot()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}
