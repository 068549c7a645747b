// 有界缓存（TTL + LRU）
//
// 引擎内两种用途：
// - 秒传标记：fingerprint -> "uploaded"，命中即跳过上传
// - 断点续传快照：task_id -> 分片完成状态，恢复时读取
//
// 过期策略：读取时惰性淘汰；容量满时淘汰最久未访问的条目
// 支持导出/导入 (key, value, 过期时间戳) 三元组列表

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// 默认最大条目数
pub const DEFAULT_MAX_ENTRIES: usize = 200;

/// 默认 TTL：24 小时
pub const DEFAULT_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    /// 过期时间（Unix 毫秒）
    expires_at_ms: i64,
    /// LRU 访问序号，越大越新
    touched: u64,
}

/// 导出条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheExportEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub expires_at_ms: i64,
}

#[derive(Debug, Default)]
struct CacheInner {
    map: HashMap<String, CacheEntry>,
    /// 访问序号发生器
    tick: u64,
}

/// 有界缓存
#[derive(Debug)]
pub struct BoundedCache {
    inner: parking_lot::Mutex<CacheInner>,
    max_entries: usize,
    default_ttl: Duration,
}

impl BoundedCache {
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            inner: parking_lot::Mutex::new(CacheInner::default()),
            max_entries: max_entries.max(1),
            default_ttl,
        }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// 读取条目；已过期的条目在此处惰性淘汰
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut inner = self.inner.lock();
        let now = Self::now_ms();

        let expired = match inner.map.get(key) {
            Some(entry) => entry.expires_at_ms <= now,
            None => return None,
        };

        if expired {
            inner.map.remove(key);
            debug!("缓存条目已过期，惰性淘汰: {}", key);
            return None;
        }

        inner.tick += 1;
        let tick = inner.tick;
        let entry = inner.map.get_mut(key)?;
        entry.touched = tick;
        Some(entry.value.clone())
    }

    /// 写入条目（默认 TTL）
    pub fn put(&self, key: &str, value: serde_json::Value) {
        self.put_with_ttl(key, value, self.default_ttl);
    }

    /// 写入条目（指定 TTL），容量满时淘汰最久未访问的条目
    pub fn put_with_ttl(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let expires_at_ms = Self::now_ms() + ttl.as_millis() as i64;

        inner.map.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at_ms,
                touched: tick,
            },
        );

        // 容量检查
        while inner.map.len() > self.max_entries {
            if let Some(oldest) = inner
                .map
                .iter()
                .min_by_key(|(_, entry)| entry.touched)
                .map(|(key, _)| key.clone())
            {
                inner.map.remove(&oldest);
                debug!("缓存容量已满，LRU 淘汰: {}", oldest);
            } else {
                break;
            }
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().map.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().map.clear();
    }

    /// 导出全部未过期条目，按访问顺序（旧 -> 新）排列
    pub fn export(&self) -> Vec<CacheExportEntry> {
        let inner = self.inner.lock();
        let now = Self::now_ms();

        let mut entries: Vec<(&String, &CacheEntry)> = inner
            .map
            .iter()
            .filter(|(_, entry)| entry.expires_at_ms > now)
            .collect();
        entries.sort_by_key(|(_, entry)| entry.touched);

        entries
            .into_iter()
            .map(|(key, entry)| CacheExportEntry {
                key: key.clone(),
                value: entry.value.clone(),
                expires_at_ms: entry.expires_at_ms,
            })
            .collect()
    }

    /// 导入条目：丢弃已过期的，超出容量时保留列表尾部（较新的）条目
    pub fn import(&self, entries: Vec<CacheExportEntry>) -> usize {
        let now = Self::now_ms();
        let mut inner = self.inner.lock();
        let mut imported = 0;

        let fresh: Vec<CacheExportEntry> = entries
            .into_iter()
            .filter(|entry| entry.expires_at_ms > now)
            .collect();

        // 超量时只取尾部 max_entries 个
        let skip = fresh.len().saturating_sub(self.max_entries);
        for entry in fresh.into_iter().skip(skip) {
            inner.tick += 1;
            let tick = inner.tick;
            inner.map.insert(
                entry.key,
                CacheEntry {
                    value: entry.value,
                    expires_at_ms: entry.expires_at_ms,
                    touched: tick,
                },
            );
            imported += 1;
        }

        // 导入后再做一次容量裁剪
        while inner.map.len() > self.max_entries {
            if let Some(oldest) = inner
                .map
                .iter()
                .min_by_key(|(_, entry)| entry.touched)
                .map(|(key, _)| key.clone())
            {
                inner.map.remove(&oldest);
            } else {
                break;
            }
        }

        imported
    }
}

impl Default for BoundedCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, Duration::from_secs(DEFAULT_TTL_SECS))
    }
}
