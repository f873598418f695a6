//! 有界缓存：条目数 + 字节数双上限，按评分淘汰
//!
//! 评分 = 2 × priority + min(access_count / 10, 5) − 距上次访问的小时数，分低者先淘汰；
//! priority >= 10 的条目被钉住，永不因容量或过期被淘汰。

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::substrate::Mesh;

/// 钉住阈值
pub const PIN_PRIORITY: u32 = 10;

/// 缓存值的字节数估算
pub trait SizeEstimate {
    fn size_bytes(&self) -> usize;
}

impl SizeEstimate for Value {
    fn size_bytes(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

impl SizeEstimate for Mesh {
    fn size_bytes(&self) -> usize {
        Mesh::size_bytes(self)
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub data: T,
    pub last_accessed_at: Instant,
    pub access_count: u64,
    pub size_bytes: usize,
    pub priority: u32,
    pub pinned: bool,
}

impl<T> CacheEntry<T> {
    fn new(data: T, size_bytes: usize, priority: u32) -> Self {
        Self {
            data,
            last_accessed_at: Instant::now(),
            access_count: 0,
            size_bytes,
            priority,
            pinned: priority >= PIN_PRIORITY,
        }
    }

    pub fn eviction_score(&self, now: Instant) -> f64 {
        let age_hours = now.saturating_duration_since(self.last_accessed_at).as_secs_f64() / 3600.0;
        let frequency = (self.access_count as f64 / 10.0).min(5.0);
        2.0 * self.priority as f64 + frequency - age_hours
    }

    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_accessed_at)
    }
}

/// 插入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted { evicted: usize },
    /// 淘汰后仍超过硬上限（或单条即超上限），未插入
    Rejected,
}

impl InsertOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub max_entries: usize,
    pub max_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub rejected: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheInner<T> {
    entries: HashMap<String, CacheEntry<T>>,
    bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    rejected: u64,
}

impl<T> CacheInner<T> {
    fn remove(&mut self, key: &str) -> Option<CacheEntry<T>> {
        let entry = self.entries.remove(key)?;
        self.bytes = self.bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    /// 非钉住条目，按淘汰评分升序
    fn eviction_order(&self, now: Instant) -> Vec<(f64, String)> {
        let mut candidates: Vec<(f64, String)> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.pinned)
            .map(|(k, e)| (e.eviction_score(now), k.clone()))
            .collect();
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));
        candidates
    }
}

pub struct BoundedCache<T> {
    name: &'static str,
    max_entries: usize,
    max_bytes: usize,
    cleanup_threshold: f64,
    max_evictions_per_pass: usize,
    inner: Mutex<CacheInner<T>>,
}

impl<T: SizeEstimate + Clone> BoundedCache<T> {
    pub fn new(
        name: &'static str,
        max_entries: usize,
        max_bytes: usize,
        cleanup_threshold: f64,
        max_evictions_per_pass: usize,
    ) -> Self {
        Self {
            name,
            max_entries,
            max_bytes,
            cleanup_threshold: cleanup_threshold.clamp(0.0, 1.0),
            max_evictions_per_pass,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                rejected: 0,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, CacheInner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 插入或覆盖；覆盖被拒绝时旧值保留
    pub fn insert(&self, key: impl Into<String>, data: T, priority: u32) -> InsertOutcome {
        let key = key.into();
        let size = data.size_bytes();
        let mut inner = self.inner();
        // 旧条目不参与淘汰，容量按替换后的结果计算
        let (old_bytes, old_entries) = inner
            .entries
            .get(&key)
            .map_or((0, 0), |e| (e.size_bytes, 1));

        if size > self.max_bytes || self.max_entries == 0 {
            inner.rejected += 1;
            debug!(cache = self.name, key = %key, size, "Entry larger than cache, rejected");
            return InsertOutcome::Rejected;
        }

        let soft_bytes = self.max_bytes as f64 * self.cleanup_threshold;
        let soft_entries = self.max_entries as f64 * self.cleanup_threshold;
        let over_soft = |inner: &CacheInner<T>| {
            (inner.bytes - old_bytes + size) as f64 > soft_bytes
                || (inner.entries.len() - old_entries + 1) as f64 > soft_entries
        };

        let mut evicted = 0;
        if over_soft(&inner) {
            let candidates = inner.eviction_order(Instant::now());
            for (score, victim) in candidates.into_iter().filter(|(_, k)| *k != key) {
                if evicted >= self.max_evictions_per_pass || !over_soft(&inner) {
                    break;
                }
                inner.remove(&victim);
                inner.evictions += 1;
                evicted += 1;
                debug!(cache = self.name, key = %victim, score, "Evicted entry");
            }
        }

        if inner.bytes - old_bytes + size > self.max_bytes
            || inner.entries.len() - old_entries + 1 > self.max_entries
        {
            inner.rejected += 1;
            debug!(cache = self.name, key = %key, size, "Cache full, insert rejected");
            return InsertOutcome::Rejected;
        }

        inner.remove(&key);
        inner.bytes += size;
        inner
            .entries
            .insert(key, CacheEntry::new(data, size, priority));
        InsertOutcome::Inserted { evicted }
    }

    /// 命中时刷新访问时间与次数
    pub fn get(&self, key: &str) -> Option<T> {
        let mut inner = self.inner();
        let found = match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.last_accessed_at = Instant::now();
                entry.access_count += 1;
                Some(entry.data.clone())
            }
            None => None,
        };
        if found.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        found
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner().entries.contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<T> {
        self.inner().remove(key).map(|e| e.data)
    }

    /// 淘汰超过 max_age 未访问的非钉住条目
    pub fn evict_older_than(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut inner = self.inner();
        let stale: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| !e.pinned && e.age(now) > max_age)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            inner.remove(key);
        }
        inner.evictions += stale.len() as u64;
        stale.len()
    }

    /// 占用比例：条目数与字节数相对各自上限，取较高者
    pub fn utilization(&self) -> f64 {
        let inner = self.inner();
        let by_entries = inner.entries.len() as f64 / self.max_entries.max(1) as f64;
        let by_bytes = inner.bytes as f64 / self.max_bytes.max(1) as f64;
        by_entries.max(by_bytes)
    }

    /// 按评分淘汰，直到占用不超过容量的 ratio；钉住条目保留，不受单次淘汰数限制
    pub fn shrink_to(&self, ratio: f64) -> usize {
        let target_bytes = self.max_bytes as f64 * ratio;
        let target_entries = self.max_entries as f64 * ratio;
        let mut inner = self.inner();
        let candidates = inner.eviction_order(Instant::now());
        let mut evicted = 0;
        for (_, victim) in candidates {
            if inner.bytes as f64 <= target_bytes && inner.entries.len() as f64 <= target_entries {
                break;
            }
            inner.remove(&victim);
            evicted += 1;
        }
        inner.evictions += evicted as u64;
        if evicted > 0 {
            debug!(cache = self.name, evicted, ratio, "Cache shrunk");
        }
        evicted
    }

    /// 原地修改所有条目；闭包返回 true 表示已修改，随后重算其大小
    pub fn update_all<F>(&self, mut f: F) -> usize
    where
        F: FnMut(&mut T) -> bool,
    {
        let mut inner = self.inner();
        let mut changed = 0;
        let mut delta: isize = 0;
        for entry in inner.entries.values_mut() {
            if f(&mut entry.data) {
                let size = entry.data.size_bytes();
                delta += size as isize - entry.size_bytes as isize;
                entry.size_bytes = size;
                changed += 1;
            }
        }
        inner.bytes = (inner.bytes as isize + delta).max(0) as usize;
        changed
    }

    pub fn clear(&self) -> usize {
        let mut inner = self.inner();
        let n = inner.entries.len();
        inner.entries.clear();
        inner.bytes = 0;
        n
    }

    pub fn len(&self) -> usize {
        self.inner().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.inner().bytes
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner();
        CacheStats {
            entries: inner.entries.len(),
            bytes: inner.bytes,
            max_entries: self.max_entries,
            max_bytes: self.max_bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            rejected: inner.rejected,
        }
    }
}
