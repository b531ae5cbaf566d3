//! 按键单飞闩锁。
//!
//! UDP NAT 条目和 per-uid 统计的安装都走这个模式：同一键的并发首包只允许
//! 一个安装者，其余任务等待闩锁，醒来后从主表读取已发布的值。
//!
//! 闩锁条目在广播后立即删除，下一次同键复用会分配全新的 Notify；
//! 安装者的守卫在 Drop（含 panic 展开）时放行等待者，安装失败不会卡死后来者。

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

pub struct SingleFlight<K> {
    inflight: Mutex<HashMap<K, Arc<Notify>>>,
}

pub enum Begin<'a, K: Hash + Eq + Clone> {
    /// 本任务是安装者，负责把值写进主表后丢弃守卫。
    Leader(LatchGuard<'a, K>),
    /// 有别的安装者在途，调用 `wait` 后重读主表。
    Follower,
}

impl<K: Hash + Eq + Clone> SingleFlight<K> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn begin(&self, key: K) -> Begin<'_, K> {
        let mut inflight = self.inflight.lock().unwrap();
        match inflight.entry(key.clone()) {
            Entry::Occupied(_) => Begin::Follower,
            Entry::Vacant(v) => {
                let notify = Arc::new(Notify::new());
                v.insert(notify.clone());
                Begin::Leader(LatchGuard {
                    owner: self,
                    key,
                    notify,
                })
            }
        }
    }

    /// 等待键上的在途安装结束。没有在途安装时立刻返回。
    pub async fn wait(&self, key: &K) {
        loop {
            let Some(notify) = self.latch_of(key) else {
                return;
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // 注册后复核：条目消失或换代说明安装已结束
            match self.latch_of(key) {
                Some(current) if Arc::ptr_eq(&current, &notify) => {}
                _ => return,
            }
            notified.await;
        }
    }

    fn latch_of(&self, key: &K) -> Option<Arc<Notify>> {
        self.inflight.lock().unwrap().get(key).cloned()
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }
}

impl<K: Hash + Eq + Clone> Default for SingleFlight<K> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LatchGuard<'a, K: Hash + Eq + Clone> {
    owner: &'a SingleFlight<K>,
    key: K,
    notify: Arc<Notify>,
}

impl<K: Hash + Eq + Clone> Drop for LatchGuard<'_, K> {
    fn drop(&mut self) {
        let mut inflight = self.owner.inflight.lock().unwrap();
        inflight.remove(&self.key);
        drop(inflight);
        self.notify.notify_waiters();
    }
}
