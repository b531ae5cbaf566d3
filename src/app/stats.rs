//! 按 uid 的流量统计与连接登记。
//!
//! `AppStats` 进程生命周期内不销毁；活跃计数归零时盖 deactivate 时间戳，
//! 再次活跃时清零。字节数由装饰器在读写路径上原子累加。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::common::{Destination, Result};
use crate::proxy::{OutboundPacketConn, ProxyStream};

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Default)]
pub struct AppStats {
    tcp_conn: AtomicI32,
    udp_conn: AtomicI32,
    tcp_conn_total: AtomicU32,
    udp_conn_total: AtomicU32,
    pub uplink: AtomicU64,
    pub downlink: AtomicU64,
    deactivate_at: AtomicI64,
}

impl AppStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn activate_tcp(&self) {
        self.tcp_conn.fetch_add(1, Ordering::SeqCst);
        self.tcp_conn_total.fetch_add(1, Ordering::Relaxed);
        self.deactivate_at.store(0, Ordering::SeqCst);
    }

    pub fn release_tcp(&self) {
        let tcp = self.tcp_conn.fetch_sub(1, Ordering::SeqCst) - 1;
        if tcp + self.udp_conn.load(Ordering::SeqCst) == 0 {
            self.deactivate_at.store(unix_now(), Ordering::SeqCst);
        }
    }

    pub fn activate_udp(&self) {
        self.udp_conn.fetch_add(1, Ordering::SeqCst);
        self.udp_conn_total.fetch_add(1, Ordering::Relaxed);
        self.deactivate_at.store(0, Ordering::SeqCst);
    }

    pub fn release_udp(&self) {
        let udp = self.udp_conn.fetch_sub(1, Ordering::SeqCst) - 1;
        if udp + self.tcp_conn.load(Ordering::SeqCst) == 0 {
            self.deactivate_at.store(unix_now(), Ordering::SeqCst);
        }
    }

    pub fn tcp_conn(&self) -> i32 {
        self.tcp_conn.load(Ordering::SeqCst)
    }

    pub fn udp_conn(&self) -> i32 {
        self.udp_conn.load(Ordering::SeqCst)
    }

    pub fn tcp_conn_total(&self) -> u32 {
        self.tcp_conn_total.load(Ordering::Relaxed)
    }

    pub fn udp_conn_total(&self) -> u32 {
        self.udp_conn_total.load(Ordering::Relaxed)
    }

    /// 活跃时为 0，否则为最后归零的 unix 秒
    pub fn deactivate_at(&self) -> i64 {
        self.deactivate_at.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self, uid: u32) -> AppStatsSnapshot {
        AppStatsSnapshot {
            uid,
            tcp_conn: self.tcp_conn(),
            udp_conn: self.udp_conn(),
            tcp_conn_total: self.tcp_conn_total(),
            udp_conn_total: self.udp_conn_total(),
            uplink: self.uplink.load(Ordering::Relaxed),
            downlink: self.downlink.load(Ordering::Relaxed),
            deactivate_at: self.deactivate_at(),
        }
    }
}

/// 宿主侧读取的统计快照
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStatsSnapshot {
    pub uid: u32,
    pub tcp_conn: i32,
    pub udp_conn: i32,
    pub tcp_conn_total: u32,
    pub udp_conn_total: u32,
    pub uplink: u64,
    pub downlink: u64,
    pub deactivate_at: i64,
}

/// 入站 TCP 流装饰器：读计 uplink，写计 downlink。
pub struct StatsStream {
    inner: ProxyStream,
    stats: Arc<AppStats>,
}

impl StatsStream {
    pub fn new(inner: ProxyStream, stats: Arc<AppStats>) -> Self {
        Self { inner, stats }
    }
}

impl AsyncRead for StatsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n > 0 {
                    self.stats.uplink.fetch_add(n as u64, Ordering::Relaxed);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl AsyncWrite for StatsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                self.stats.downlink.fetch_add(n as u64, Ordering::Relaxed);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// 代理侧 packet-conn 装饰器：write_to 计 uplink，read_from 计 downlink。
pub struct StatsPacketConn {
    inner: Box<dyn OutboundPacketConn>,
    stats: Arc<AppStats>,
}

impl StatsPacketConn {
    pub fn new(inner: Box<dyn OutboundPacketConn>, stats: Arc<AppStats>) -> Self {
        Self { inner, stats }
    }
}

#[async_trait]
impl OutboundPacketConn for StatsPacketConn {
    async fn write_to(&self, data: &[u8], dest: &Destination) -> Result<usize> {
        let n = self.inner.write_to(data, dest).await?;
        self.stats.uplink.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, Option<SocketAddr>)> {
        let (n, addr) = self.inner.read_from(buf).await?;
        self.stats.downlink.fetch_add(n as u64, Ordering::Relaxed);
        Ok((n, addr))
    }

    fn close(&self) {
        self.inner.close();
    }
}

/// 主连接表。表里的每个条目对应一条活跃流；shutdown 逐个取消。
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: Mutex<HashMap<u64, CancellationToken>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        })
    }

    pub fn register(self: &Arc<Self>) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.connections.lock().unwrap().insert(id, token.clone());
        ConnectionGuard {
            id,
            token,
            registry: Arc::clone(self),
        }
    }

    pub fn len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 取消所有已登记的流。条目由各自守卫的 Drop 移除。
    pub fn close_all(&self) {
        let connections = self.connections.lock().unwrap();
        for token in connections.values() {
            token.cancel();
        }
    }
}

pub struct ConnectionGuard {
    id: u64,
    token: CancellationToken,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.connections.lock().unwrap().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deactivate_tracks_active_counters() {
        let stats = AppStats::new();

        stats.activate_tcp();
        assert_eq!(stats.deactivate_at(), 0);
        stats.activate_udp();
        stats.release_tcp();
        // udp 仍活跃
        assert_eq!(stats.deactivate_at(), 0);
        stats.release_udp();
        assert_ne!(stats.deactivate_at(), 0);

        assert_eq!(stats.tcp_conn_total(), 1);
        assert_eq!(stats.udp_conn_total(), 1);
        assert_eq!(stats.tcp_conn(), 0);
        assert_eq!(stats.udp_conn(), 0);
    }

    #[test]
    fn reactivation_clears_deactivate() {
        let stats = AppStats::new();
        stats.activate_tcp();
        stats.release_tcp();
        assert_ne!(stats.deactivate_at(), 0);
        stats.activate_udp();
        assert_eq!(stats.deactivate_at(), 0);
        stats.release_udp();
    }

    #[tokio::test]
    async fn stats_stream_counts_both_directions() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (client, mut server) = tokio::io::duplex(256);
        let stats = AppStats::new();
        let mut wrapped = StatsStream::new(Box::new(client), stats.clone());

        server.write_all(b"from-remote").await.unwrap();
        let mut buf = [0u8; 32];
        let n = wrapped.read(&mut buf).await.unwrap();
        assert_eq!(stats.uplink.load(Ordering::Relaxed), n as u64);

        wrapped.write_all(b"to-remote").await.unwrap();
        assert_eq!(stats.downlink.load(Ordering::Relaxed), 9);
    }

    #[test]
    fn snapshot_serializes_for_the_host() {
        let stats = AppStats::new();
        stats.activate_tcp();
        stats.uplink.fetch_add(512, Ordering::Relaxed);

        let json = serde_json::to_string(&stats.snapshot(10_123)).unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["uid"], 10_123);
        assert_eq!(v["tcpConn"], 1);
        assert_eq!(v["uplink"], 512);
        assert_eq!(v["deactivateAt"], 0);
        stats.release_tcp();
    }

    #[test]
    fn registry_guard_lifecycle() {
        let registry = ConnectionRegistry::new();
        let g1 = registry.register();
        let g2 = registry.register();
        assert_eq!(registry.len(), 2);
        assert_ne!(g1.id(), g2.id());

        drop(g1);
        assert_eq!(registry.len(), 1);

        registry.close_all();
        assert!(g2.token().is_cancelled());
        drop(g2);
        assert!(registry.is_empty());
    }
}
