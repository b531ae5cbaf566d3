//! 线程安全 LRU 缓存，可选按秒计的条目寿命。
//!
//! 语义:
//! - Set 命中时移到 MRU 并覆盖值与过期时间，未命中插入 MRU；
//!   超过 max_size 时淘汰 LRU 端。
//! - 任何写操作后从 LRU 端清扫所有已过期条目（stale_return 时跳过）。
//! - Get 命中已过期条目时删除并按未命中处理。

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

pub type EvictCallback<K, V> = Box<dyn Fn(&K, &V) + Send + Sync>;

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

struct Entry<V> {
    value: V,
    expires: i64,
}

struct Inner<K, V> {
    map: HashMap<K, Entry<V>>,
    // 队首为最久未使用
    order: VecDeque<K>,
}

pub struct LruCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    max_age: i64,
    max_size: usize,
    update_age_on_get: bool,
    stale_return: bool,
    on_evict: Option<EvictCallback<K, V>>,
    clock: Clock,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl<K: Hash + Eq + Clone, V: Clone> LruCache<K, V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_age: 0,
            max_size: 0,
            update_age_on_get: false,
            stale_return: false,
            on_evict: None,
            clock: Arc::new(unix_now),
        }
    }

    /// 条目最大寿命（秒）。<= 0 关闭 TTL。
    pub fn with_age(mut self, max_age: i64) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Get 命中时重新计时
    pub fn with_update_age_on_get(mut self) -> Self {
        self.update_age_on_get = true;
        self
    }

    /// 过期条目照常返回，且不做清扫
    pub fn with_stale_return(mut self) -> Self {
        self.stale_return = true;
        self
    }

    pub fn with_evict<F>(mut self, f: F) -> Self
    where
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        self.on_evict = Some(Box::new(f));
        self
    }

    /// 注入时钟（测试用虚拟时钟）
    pub fn with_clock<F>(mut self, f: F) -> Self
    where
        F: Fn() -> i64 + Send + Sync + 'static,
    {
        self.clock = Arc::new(f);
        self
    }

    pub fn set(&self, key: K, value: V) {
        let expires = if self.max_age > 0 {
            (self.clock)() + self.max_age
        } else {
            0
        };
        self.set_with_expire(key, value, expires);
    }

    pub fn set_with_expire(&self, key: K, value: V, expires: i64) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(entry) = inner.map.get_mut(&key) {
            entry.value = value;
            entry.expires = expires;
            move_to_back(&mut inner.order, &key);
        } else {
            inner.map.insert(key.clone(), Entry { value, expires });
            inner.order.push_back(key);
            if self.max_size > 0 && inner.map.len() > self.max_size {
                if let Some(oldest) = inner.order.front().cloned() {
                    self.delete_locked(&mut inner, &oldest);
                }
            }
        }

        self.sweep_expired(&mut inner);
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();

        let expires = inner.map.get(key)?.expires;
        if !self.stale_return && self.max_age > 0 && expires <= (self.clock)() {
            self.delete_locked(&mut inner, key);
            self.sweep_expired(&mut inner);
            return None;
        }

        move_to_back(&mut inner.order, key);
        let new_expires = if self.max_age > 0 && self.update_age_on_get {
            Some((self.clock)() + self.max_age)
        } else {
            None
        };
        let entry = inner.map.get_mut(key).expect("order/map out of sync");
        if let Some(e) = new_expires {
            entry.expires = e;
        }
        Some(entry.value.clone())
    }

    pub fn delete(&self, key: &K) {
        let mut inner = self.inner.lock().unwrap();
        self.delete_locked(&mut inner, key);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().unwrap().map.contains_key(key)
    }

    fn sweep_expired(&self, inner: &mut Inner<K, V>) {
        if self.stale_return || self.max_age <= 0 {
            return;
        }
        let now = (self.clock)();
        while let Some(front) = inner.order.front().cloned() {
            let expired = inner.map.get(&front).map(|e| e.expires <= now);
            if expired == Some(true) {
                self.delete_locked(inner, &front);
            } else {
                break;
            }
        }
    }

    fn delete_locked(&self, inner: &mut Inner<K, V>, key: &K) {
        if let Some(entry) = inner.map.remove(key) {
            if let Some(pos) = inner.order.iter().position(|k| k == key) {
                inner.order.remove(pos);
            }
            if let Some(cb) = &self.on_evict {
                cb(key, &entry.value);
            }
        }
    }
}

fn move_to_back<K: Eq>(order: &mut VecDeque<K>, key: &K) {
    if let Some(pos) = order.iter().position(|k| k == key) {
        if let Some(k) = order.remove(pos) {
            order.push_back(k);
        }
    }
}

impl<K: Hash + Eq + Clone, V: Clone> Default for LruCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    #[test]
    fn evicts_least_recently_set() {
        let cache = LruCache::new().with_max_size(3);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("c", 3);
        assert_eq!(cache.get(&"a"), Some(1)); // a 变为 MRU
        cache.set("d", 4); // 淘汰 b

        assert!(cache.contains(&"a"));
        assert!(!cache.contains(&"b"));
        assert!(cache.contains(&"c"));
        assert!(cache.contains(&"d"));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn size_bound_holds_after_overflow() {
        let cache = LruCache::new().with_max_size(4);
        for i in 0..10 {
            cache.set(i, i);
        }
        assert_eq!(cache.len(), 4);
        // 留下的应是最近写入的 4 个
        for i in 6..10 {
            assert_eq!(cache.get(&i), Some(i));
        }
    }

    #[test]
    fn expired_entry_removed_on_next_mutation() {
        let clock = Arc::new(AtomicI64::new(100));
        let c = clock.clone();
        let cache = LruCache::new()
            .with_age(1)
            .with_clock(move || c.load(Ordering::SeqCst));

        cache.set("a", 1);
        clock.store(102, Ordering::SeqCst); // 前进 2 秒
        cache.set("b", 2); // 任意写操作触发清扫

        assert!(!cache.contains(&"a"));
        assert!(cache.contains(&"b"));
    }

    #[test]
    fn expired_entry_misses_on_get() {
        let clock = Arc::new(AtomicI64::new(100));
        let c = clock.clone();
        let cache = LruCache::new()
            .with_age(5)
            .with_clock(move || c.load(Ordering::SeqCst));

        cache.set("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));
        clock.store(106, Ordering::SeqCst);
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn update_age_on_get_extends_life() {
        let clock = Arc::new(AtomicI64::new(0));
        let c = clock.clone();
        let cache = LruCache::new()
            .with_age(10)
            .with_update_age_on_get()
            .with_clock(move || c.load(Ordering::SeqCst));

        cache.set("a", 1);
        clock.store(8, Ordering::SeqCst);
        assert_eq!(cache.get(&"a"), Some(1)); // 续期到 18
        clock.store(15, Ordering::SeqCst);
        assert_eq!(cache.get(&"a"), Some(1));
    }

    #[test]
    fn stale_return_keeps_expired() {
        let clock = Arc::new(AtomicI64::new(0));
        let c = clock.clone();
        let cache = LruCache::new()
            .with_age(1)
            .with_stale_return()
            .with_clock(move || c.load(Ordering::SeqCst));

        cache.set("a", 1);
        clock.store(100, Ordering::SeqCst);
        assert_eq!(cache.get(&"a"), Some(1));
    }

    #[test]
    fn evict_callback_fires() {
        let evicted = Arc::new(AtomicUsize::new(0));
        let e = evicted.clone();
        let cache: LruCache<&str, i32> = LruCache::new()
            .with_max_size(1)
            .with_evict(move |_, _| {
                e.fetch_add(1, Ordering::SeqCst);
            });

        cache.set("a", 1);
        cache.set("b", 2); // 淘汰 a
        cache.delete(&"b"); // 显式删除
        assert_eq!(evicted.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn zero_max_age_disables_ttl() {
        let cache = LruCache::new();
        cache.set("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));
    }

    #[test]
    fn overwrite_moves_to_mru() {
        let cache = LruCache::new().with_max_size(2);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("a", 10); // a 成为 MRU
        cache.set("c", 3); // 淘汰 b

        assert_eq!(cache.get(&"a"), Some(10));
        assert!(!cache.contains(&"b"));
    }
}
