//! TCP 委托。
//!
//! 轻量引擎不做 TCP 状态机：把客户端的段改写成
//! `镜像地址:客户端口 → 设备地址:监听端口` 再注回设备，让宿主内核栈完成
//! 握手与重组；监听器 accept 到的 socket 经端口键的会话表还原出真实
//! (来源, 目的) 后交给流表。内核发往镜像地址的回包做反向改写。
//!
//! 会话表用带 TTL 的 LRU，活跃流每包续期。

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::{Destination, LruCache, Result};
use crate::packet::{checksum, Ipv4Packet, Ipv6Packet, TcpSegment, PROTO_TCP};
use crate::proxy::TunHandler;

use super::TunWriter;

/// 回包反射用的保留地址，不会出现在真实流量里
const MIRROR4: Ipv4Addr = Ipv4Addr::new(172, 19, 0, 254);
const MIRROR6: Ipv6Addr = Ipv6Addr::new(0xfdfe, 0xdcba, 0x9876, 0, 0, 0, 0, 0xfe);

/// 会话空闲超时（秒）
const SESSION_TTL: i64 = 300;

#[derive(Clone)]
struct Session<A> {
    source: (A, u16),
    destination: (A, u16),
}

pub(crate) struct TcpRedirect {
    writer: Arc<TunWriter>,
    sessions4: Arc<LruCache<u16, Session<Ipv4Addr>>>,
    sessions6: Arc<LruCache<u16, Session<Ipv6Addr>>>,
    port4: u16,
    port6: u16,
    cancel: CancellationToken,
}

impl TcpRedirect {
    pub(crate) fn new(handler: Arc<dyn TunHandler>, writer: Arc<TunWriter>) -> Result<Self> {
        let sessions4 = Arc::new(
            LruCache::new()
                .with_age(SESSION_TTL)
                .with_update_age_on_get(),
        );
        let sessions6 = Arc::new(
            LruCache::new()
                .with_age(SESSION_TTL)
                .with_update_age_on_get(),
        );

        let cancel = CancellationToken::new();

        let listener4 = std::net::TcpListener::bind("0.0.0.0:0")?;
        listener4.set_nonblocking(true)?;
        let port4 = listener4.local_addr()?.port();
        spawn_accept_loop(
            tokio::net::TcpListener::from_std(listener4)?,
            handler.clone(),
            sessions4.clone(),
            cancel.clone(),
            |session: &Session<Ipv4Addr>| {
                (
                    Destination::tcp(IpAddr::V4(session.source.0), session.source.1),
                    Destination::tcp(IpAddr::V4(session.destination.0), session.destination.1),
                )
            },
        );

        let listener6 = std::net::TcpListener::bind("[::]:0")?;
        listener6.set_nonblocking(true)?;
        let port6 = listener6.local_addr()?.port();
        spawn_accept_loop(
            tokio::net::TcpListener::from_std(listener6)?,
            handler,
            sessions6.clone(),
            cancel.clone(),
            |session: &Session<Ipv6Addr>| {
                (
                    Destination::tcp(IpAddr::V6(session.source.0), session.source.1),
                    Destination::tcp(IpAddr::V6(session.destination.0), session.destination.1),
                )
            },
        );

        Ok(Self {
            writer,
            sessions4,
            sessions6,
            port4,
            port6,
            cancel,
        })
    }

    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn process_v4(&self, buffer: &mut [u8]) -> Result<()> {
        let (src, dst, total, header_len) = {
            let ip = Ipv4Packet::parse(&*buffer)?;
            (
                ip.source(),
                ip.destination(),
                ip.total_len() as usize,
                ip.header_len(),
            )
        };
        let (src_port, dst_port, syn_only) = {
            let ip = Ipv4Packet::parse(&*buffer)?;
            let tcp = TcpSegment::parse(ip.transport())?;
            (tcp.source_port(), tcp.destination_port(), tcp.is_syn_only())
        };

        let (new_src, new_src_port, new_dst, new_dst_port) = if dst == MIRROR4 {
            // 内核回包：src=设备:监听口 dst=镜像:客户端口
            let Some(session) = self.sessions4.get(&dst_port) else {
                debug!(port = dst_port, "no tcp session for reflected packet");
                return Ok(());
            };
            (
                session.destination.0,
                session.destination.1,
                session.source.0,
                session.source.1,
            )
        } else {
            // 客户端方向：SYN 建会话，后续包续期
            if syn_only {
                self.sessions4.set(
                    src_port,
                    Session {
                        source: (src, src_port),
                        destination: (dst, dst_port),
                    },
                );
            } else if self.sessions4.get(&src_port).is_none() {
                debug!(port = src_port, "tcp packet without session");
                return Ok(());
            }
            (MIRROR4, src_port, src, self.port4)
        };

        let mut ip = Ipv4Packet::parse(&mut *buffer)?;
        ip.set_source(new_src);
        ip.set_destination(new_dst);
        {
            let transport_len = (total - header_len) as u16;
            let pseudo = checksum::pseudo_sum_v4(new_src, new_dst, PROTO_TCP, transport_len);
            let mut tcp = TcpSegment::parse(ip.transport_mut())?;
            tcp.set_source_port(new_src_port);
            tcp.set_destination_port(new_dst_port);
            tcp.update_checksum(pseudo);
        }
        ip.update_checksum();

        self.write(&buffer[..total])
    }

    pub(crate) fn process_v6(&self, buffer: &mut [u8]) -> Result<()> {
        let (src, dst, payload_len) = {
            let ip = Ipv6Packet::parse(&*buffer)?;
            (ip.source(), ip.destination(), ip.payload_len())
        };
        let (src_port, dst_port, syn_only) = {
            let ip = Ipv6Packet::parse(&*buffer)?;
            let tcp = TcpSegment::parse(ip.transport())?;
            (tcp.source_port(), tcp.destination_port(), tcp.is_syn_only())
        };

        let (new_src, new_src_port, new_dst, new_dst_port) = if dst == MIRROR6 {
            let Some(session) = self.sessions6.get(&dst_port) else {
                debug!(port = dst_port, "no tcp session for reflected packet");
                return Ok(());
            };
            (
                session.destination.0,
                session.destination.1,
                session.source.0,
                session.source.1,
            )
        } else {
            if syn_only {
                self.sessions6.set(
                    src_port,
                    Session {
                        source: (src, src_port),
                        destination: (dst, dst_port),
                    },
                );
            } else if self.sessions6.get(&src_port).is_none() {
                debug!(port = src_port, "tcp packet without session");
                return Ok(());
            }
            (MIRROR6, src_port, src, self.port6)
        };

        let mut ip = Ipv6Packet::parse(&mut *buffer)?;
        ip.set_source(new_src);
        ip.set_destination(new_dst);
        {
            let pseudo = checksum::pseudo_sum_v6(new_src, new_dst, PROTO_TCP, payload_len as u32);
            let mut tcp = TcpSegment::parse(ip.transport_mut())?;
            tcp.set_source_port(new_src_port);
            tcp.set_destination_port(new_dst_port);
            tcp.update_checksum(pseudo);
        }

        let total = crate::packet::IPV6_HEADER_LEN + payload_len as usize;
        self.write(&buffer[..total])
    }

    fn write(&self, packet: &[u8]) -> Result<()> {
        self.writer.write_packet(packet)?;
        Ok(())
    }
}

fn spawn_accept_loop<A: Clone + Send + Sync + 'static>(
    listener: tokio::net::TcpListener,
    handler: Arc<dyn TunHandler>,
    sessions: Arc<LruCache<u16, Session<A>>>,
    cancel: CancellationToken,
    endpoints: fn(&Session<A>) -> (Destination, Destination),
) {
    tokio::spawn(async move {
        loop {
            let (conn, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        debug!(error = %e, "tcp redirect accept failed");
                        break;
                    }
                },
            };

            let Some(session) = sessions.get(&peer.port()) else {
                debug!(peer = %peer, "accepted connection without session");
                continue;
            };
            let (source, destination) = endpoints(&session);

            let handler = handler.clone();
            tokio::spawn(async move {
                let _ = conn.set_nodelay(true);
                handler
                    .new_connection(source, destination, Box::new(conn))
                    .await;
            });
        }
    });
}
