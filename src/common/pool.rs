//! 中转缓冲区池。
//!
//! UDP 下行泵和 NAT 头模板都从这里取缓冲区，避免每包分配。
//! 归还通过 `PooledBuf` 的 Drop 完成，所有退出路径都会归还。

use std::sync::{Arc, Mutex};

/// 比 64KB UDP 最大报文多留 2KB 余量
pub const RELAY_BUFFER_SIZE: usize = 20 * 1024;

const MAX_POOLED: usize = 64;

pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    buf_size: usize,
}

impl BufferPool {
    pub fn new(buf_size: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            buf_size,
        })
    }

    pub fn relay() -> Arc<Self> {
        Self::new(RELAY_BUFFER_SIZE)
    }

    pub fn get(self: &Arc<Self>) -> PooledBuf {
        let buf = {
            let mut free = self.free.lock().unwrap();
            free.pop()
        };
        let buf = buf.unwrap_or_else(|| vec![0u8; self.buf_size]);
        PooledBuf {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    fn put(&self, mut buf: Vec<u8>) {
        if buf.len() != self.buf_size {
            buf.resize(self.buf_size, 0);
        }
        let mut free = self.free.lock().unwrap();
        if free.len() < MAX_POOLED {
            free.push(buf);
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

pub struct PooledBuf {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl std::ops::Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().expect("buffer already returned")
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().expect("buffer already returned")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}
