//! 树块缓存
//!
//! 以 `(逻辑地址, 长度)` 为键的 LRU 缓存。脏树块被钉住：驱逐只挑干净块，
//! 全部为脏时扩容而不是丢弃。

use crate::ctree::{EbFlags, ExtentBuffer};
use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::num::NonZeroUsize;
use lru::LruCache;

/// 默认缓存树块数
pub const DEFAULT_CACHE_SIZE: usize = 256;

type CacheKey = (u64, u32);

/// 缓存统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// 命中次数
    pub hits: u64,
    /// 未命中次数
    pub misses: u64,
    /// 驱逐次数
    pub evictions: u64,
    /// 当前脏块数量
    pub dirty_blocks: usize,
}

impl CacheStats {
    /// 命中率
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// 树块缓存
pub struct ExtentCache {
    cache: LruCache<CacheKey, ExtentBuffer>,
    dirty_set: BTreeSet<CacheKey>,
    stats: CacheStats,
}

impl core::fmt::Debug for ExtentCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExtentCache")
            .field("len", &self.cache.len())
            .field("cap", &self.cache.cap())
            .field("dirty", &self.dirty_set.len())
            .finish()
    }
}

impl ExtentCache {
    /// 创建缓存（容量为 0 时按 1 处理）
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN)),
            dirty_set: BTreeSet::new(),
            stats: CacheStats::default(),
        }
    }

    fn key(eb: &ExtentBuffer) -> CacheKey {
        (eb.start(), eb.len() as u32)
    }

    /// 查找树块（更新 LRU 顺序）
    pub fn get(&mut self, bytenr: u64, len: u32) -> Option<&ExtentBuffer> {
        match self.cache.get(&(bytenr, len)) {
            Some(eb) => {
                self.stats.hits += 1;
                log::trace!("[CACHE] hit {:#x}", bytenr);
                Some(eb)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// 查看树块（不影响 LRU 顺序和统计）
    pub fn peek(&self, bytenr: u64, len: u32) -> Option<&ExtentBuffer> {
        self.cache.peek(&(bytenr, len))
    }

    /// 插入或替换树块
    ///
    /// 替换脏块时保留 DIRTY 状态。
    pub fn insert(&mut self, mut eb: ExtentBuffer) {
        let key = Self::key(&eb);
        if self.dirty_set.contains(&key) {
            eb.set_flag(EbFlags::DIRTY);
        }
        if !self.cache.contains(&key) && self.cache.len() >= self.cache.cap().get() {
            self.evict_one();
        }
        self.cache.put(key, eb);
    }

    /// 驱逐最久未使用的干净块；全部为脏时扩容
    fn evict_one(&mut self) {
        let victim = self
            .cache
            .iter()
            .rev()
            .map(|(k, _)| *k)
            .find(|k| !self.dirty_set.contains(k));

        match victim {
            Some(key) => {
                self.cache.pop(&key);
                self.stats.evictions += 1;
                log::trace!("[CACHE] evicted {:#x}", key.0);
            }
            None => {
                let cap = self.cache.cap().get() + 1;
                log::debug!("[CACHE] all {} buffers dirty, growing to {}", self.cache.len(), cap);
                self.cache
                    .resize(NonZeroUsize::new(cap).unwrap_or(NonZeroUsize::MIN));
            }
        }
    }

    /// 标记树块为脏并放入缓存
    pub fn mark_dirty(&mut self, mut eb: ExtentBuffer) {
        eb.set_flag(EbFlags::DIRTY | EbFlags::UPTODATE);
        let key = Self::key(&eb);
        if self.dirty_set.insert(key) {
            log::debug!(
                "[CACHE] mark_dirty {:#x}, total_dirty={}",
                key.0,
                self.dirty_set.len()
            );
        }
        self.stats.dirty_blocks = self.dirty_set.len();
        self.insert(eb);
    }

    /// 清除脏状态
    pub fn clear_dirty(&mut self, bytenr: u64, len: u32) {
        let key = (bytenr, len);
        self.dirty_set.remove(&key);
        if let Some(eb) = self.cache.peek_mut(&key) {
            eb.clear_flag(EbFlags::DIRTY);
        }
        self.stats.dirty_blocks = self.dirty_set.len();
    }

    /// 全部脏块（按逻辑地址排序）
    pub fn dirty_buffers(&self) -> Vec<ExtentBuffer> {
        self.dirty_set
            .iter()
            .filter_map(|k| self.cache.peek(k).cloned())
            .collect()
    }

    /// 脏块数
    pub fn dirty_count(&self) -> usize {
        self.dirty_set.len()
    }

    /// 使树块失效
    pub fn invalidate(&mut self, bytenr: u64, len: u32) -> Option<ExtentBuffer> {
        let key = (bytenr, len);
        if self.dirty_set.remove(&key) {
            log::warn!("[CACHE] invalidating dirty buffer {:#x}", bytenr);
        }
        self.stats.dirty_blocks = self.dirty_set.len();
        self.cache.pop(&key)
    }

    /// 清空缓存
    ///
    /// # 返回
    ///
    /// 被丢弃的脏块数
    pub fn cleanup(&mut self) -> usize {
        let dropped = self.dirty_set.len();
        if dropped > 0 {
            log::warn!("[CACHE] dropping {} dirty buffers", dropped);
        }
        self.cache.clear();
        self.dirty_set.clear();
        self.stats.dirty_blocks = 0;
        dropped
    }

    /// 当前缓存的树块数
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// 容量
    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }

    /// 统计信息
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl Default for ExtentCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eb(start: u64) -> ExtentBuffer {
        ExtentBuffer::new_empty(start, 4096, 5, 0, 1, &[0; 16])
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = ExtentCache::new(2);
        cache.insert(eb(0x1000));
        cache.insert(eb(0x2000));
        // 访问 0x1000，使 0x2000 成为最久未使用
        assert!(cache.get(0x1000, 4096).is_some());
        cache.insert(eb(0x3000));
        assert!(cache.peek(0x2000, 4096).is_none());
        assert!(cache.peek(0x1000, 4096).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_dirty_pinned() {
        let mut cache = ExtentCache::new(2);
        cache.mark_dirty(eb(0x1000));
        cache.mark_dirty(eb(0x2000));
        cache.insert(eb(0x3000));
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.capacity(), 3);
        assert!(cache.peek(0x1000, 4096).unwrap().is_dirty());

        cache.insert(eb(0x4000));
        // 唯一的干净块被驱逐
        assert!(cache.peek(0x3000, 4096).is_none());
        assert_eq!(cache.dirty_count(), 2);
    }

    #[test]
    fn test_key_includes_length() {
        let mut cache = ExtentCache::new(4);
        cache.insert(eb(0x1000));
        assert!(cache.get(0x1000, 16384).is_none());
        assert!(cache.get(0x1000, 4096).is_some());
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_clear_dirty_and_cleanup() {
        let mut cache = ExtentCache::new(4);
        cache.mark_dirty(eb(0x2000));
        cache.mark_dirty(eb(0x1000));
        let dirty: Vec<u64> = cache.dirty_buffers().iter().map(|e| e.start()).collect();
        assert_eq!(dirty, [0x1000, 0x2000]);

        cache.clear_dirty(0x1000, 4096);
        assert!(!cache.peek(0x1000, 4096).unwrap().is_dirty());
        assert_eq!(cache.cleanup(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_replace_keeps_dirty() {
        let mut cache = ExtentCache::new(4);
        cache.mark_dirty(eb(0x1000));
        let mut fresh = eb(0x1000);
        fresh.set_generation(9);
        cache.insert(fresh);
        let got = cache.peek(0x1000, 4096).unwrap();
        assert!(got.is_dirty());
        assert_eq!(got.generation(), 9);
    }
}
