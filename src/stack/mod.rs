//! 用户态栈引擎。
//!
//! 与轻量 NAT 互换的另一套数据通路：链路端点收包后在用户态完成
//! NIC→TCP/IP→socket 的归约，把每条 TCP 流呈现为 AsyncRead+AsyncWrite
//! 流交给流表，UDP 逐包走 `new_packet`，ICMP echo 原地反射。
//! TCP 面只做按序收发的最小实现（v4 与 v6 同一条路径）：SYN/SYN-ACK
//! 建立、数据即 ACK、FIN/RST 拆除，不做重传与窗口管理。

pub mod endpoint;
pub mod pcap;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::common::{Destination, Error, Result};
use crate::config;
use crate::packet::{
    self, build_tcp_packet, build_udp_packet, Ipv4Packet, Ipv6Packet, UdpDatagram,
};
use crate::proxy::{FlowCloser, Tun, TunHandler, WriteBack};

use endpoint::{NetworkDispatcher, RwEndpoint};
use pcap::PcapWriter;

/// 同时活跃的 TCP 流上限
const MAX_TCP_CONNECTIONS: usize = 4096;
/// 每方向的分段队列深度
const TCP_CHANNEL_DEPTH: usize = 256;

const FLAG_FIN: u8 = 0x01;
const FLAG_SYN: u8 = 0x02;
const FLAG_RST: u8 = 0x04;
const FLAG_ACK: u8 = 0x10;
const FLAG_PSH: u8 = 0x08;

pub struct StackTun {
    endpoint: Arc<RwEndpoint>,
}

impl StackTun {
    pub fn new(fd: i32, mtu: i32, handler: Arc<dyn TunHandler>, pcap: bool) -> Result<Self> {
        let pcap_writer = if pcap {
            let stamp = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let path = std::path::PathBuf::from(config::external_assets_path())
                .join("pcap")
                .join(format!("{stamp}.pcap"));
            Some(Arc::new(PcapWriter::create(&path)?))
        } else {
            None
        };

        let endpoint = Arc::new(RwEndpoint::new(fd, mtu.max(576) as u32, pcap_writer)?);
        let stack = NetStack::new(endpoint.clone(), handler);
        endpoint.start(stack);

        Ok(Self { endpoint })
    }
}

#[async_trait]
impl Tun for StackTun {
    async fn stop(&self) {
        // 先汇合读包任务，fd 只在没有读者之后关闭
        self.endpoint.attach(None).await;
        self.endpoint.close();
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct FlowKey {
    src: SocketAddr,
    dst: SocketAddr,
}

struct TcpState {
    client_seq_next: u32,
    server_seq_next: u32,
}

#[derive(Clone)]
struct TcpEntry {
    to_stream: mpsc::Sender<Vec<u8>>,
    state: Arc<Mutex<TcpState>>,
}

struct NetStack {
    endpoint: Arc<RwEndpoint>,
    handler: Arc<dyn TunHandler>,
    tcp_table: Mutex<HashMap<FlowKey, TcpEntry>>,
    active_tcp: AtomicUsize,
    weak: Weak<NetStack>,
}

impl NetStack {
    fn new(endpoint: Arc<RwEndpoint>, handler: Arc<dyn TunHandler>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            endpoint,
            handler,
            tcp_table: Mutex::new(HashMap::new()),
            active_tcp: AtomicUsize::new(0),
            weak: weak.clone(),
        })
    }

    fn process(&self, mut buffer: Vec<u8>) -> Result<()> {
        match packet::ip_version(&buffer) {
            Some(4) => {
                let protocol = Ipv4Packet::parse(buffer.as_slice())?.protocol();
                match protocol {
                    packet::PROTO_ICMP => {
                        if let Some(total) = crate::nat::icmp::make_echo_reply_v4(&mut buffer)? {
                            self.endpoint.write_packet(&buffer[..total])?;
                        }
                        Ok(())
                    }
                    packet::PROTO_UDP => self.handle_udp(&buffer, false),
                    packet::PROTO_TCP => self.handle_tcp(&buffer, false),
                    _ => Ok(()),
                }
            }
            Some(6) => {
                let next_header = Ipv6Packet::parse(buffer.as_slice())?.next_header();
                match next_header {
                    packet::PROTO_ICMPV6 => {
                        if let Some(total) = crate::nat::icmp::make_echo_reply_v6(&mut buffer)? {
                            self.endpoint.write_packet(&buffer[..total])?;
                        }
                        Ok(())
                    }
                    packet::PROTO_UDP => self.handle_udp(&buffer, true),
                    packet::PROTO_TCP => self.handle_tcp(&buffer, true),
                    _ => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    fn handle_udp(&self, buffer: &[u8], v6: bool) -> Result<()> {
        let (source, destination, payload) = if v6 {
            let ip = Ipv6Packet::parse(buffer)?;
            let udp = UdpDatagram::parse(ip.transport())?;
            (
                Destination::udp(ip.source().into(), udp.source_port()),
                Destination::udp(ip.destination().into(), udp.destination_port()),
                Bytes::copy_from_slice(udp.payload()),
            )
        } else {
            let ip = Ipv4Packet::parse(buffer)?;
            let udp = UdpDatagram::parse(ip.transport())?;
            (
                Destination::udp(ip.source().into(), udp.source_port()),
                Destination::udp(ip.destination().into(), udp.destination_port()),
                Bytes::copy_from_slice(udp.payload()),
            )
        };

        let endpoint = self.endpoint.clone();
        let reply_dst = source.socket_addr();
        let default_src = destination.socket_addr();
        let write_back: WriteBack = Arc::new(move |data: &[u8], origin| {
            let from = match origin {
                Some(addr) if addr.is_ipv6() == default_src.is_ipv6() => addr,
                _ => default_src,
            };
            let pkt = build_udp_packet(from, reply_dst, data)?;
            endpoint.write_packet(&pkt)?;
            Ok(data.len())
        });
        let closer: FlowCloser = Box::new(|| {});

        let handler = self.handler.clone();
        tokio::spawn(async move {
            handler
                .new_packet(source, destination, payload, write_back, closer)
                .await;
        });
        Ok(())
    }

    fn handle_tcp(&self, buffer: &[u8], v6: bool) -> Result<()> {
        let (src_ip, dst_ip, transport_start, transport_end): (IpAddr, IpAddr, usize, usize) =
            if v6 {
                let ip = Ipv6Packet::parse(buffer)?;
                (
                    ip.source().into(),
                    ip.destination().into(),
                    packet::IPV6_HEADER_LEN,
                    packet::IPV6_HEADER_LEN + ip.payload_len() as usize,
                )
            } else {
                let ip = Ipv4Packet::parse(buffer)?;
                (
                    ip.source().into(),
                    ip.destination().into(),
                    ip.header_len(),
                    ip.total_len() as usize,
                )
            };
        let transport = &buffer[transport_start..transport_end];
        if transport.len() < packet::TCP_MIN_HEADER_LEN {
            return Err(Error::Parse("tcp segment shorter than header"));
        }

        let src = SocketAddr::new(src_ip, u16::from_be_bytes([transport[0], transport[1]]));
        let dst = SocketAddr::new(dst_ip, u16::from_be_bytes([transport[2], transport[3]]));
        let key = FlowKey { src, dst };

        let flags = transport[13];
        let client_seq = u32::from_be_bytes([transport[4], transport[5], transport[6], transport[7]]);
        let data_offset = ((transport[12] >> 4) as usize) * 4;
        let payload = if transport.len() > data_offset {
            &transport[data_offset..]
        } else {
            &[]
        };

        let existing = { self.tcp_table.lock().unwrap().get(&key).cloned() };
        if let Some(entry) = existing {
            if flags & (FLAG_RST | FLAG_FIN) != 0 {
                let _ = entry.to_stream.try_send(Vec::new());
                self.drop_entry(&key);
                return Ok(());
            }
            if payload.is_empty() {
                return Ok(());
            }

            let (server_seq, client_ack) = {
                let mut state = entry.state.lock().unwrap();
                let next = client_seq.wrapping_add(payload.len() as u32);
                if next > state.client_seq_next {
                    state.client_seq_next = next;
                }
                (state.server_seq_next, state.client_seq_next)
            };

            // 队列满则不 ACK，等客户端重传
            if entry.to_stream.try_send(payload.to_vec()).is_ok() {
                let ack = build_tcp_packet(dst, src, server_seq, client_ack, FLAG_ACK, &[])?;
                self.endpoint.write_packet(&ack)?;
            }
            return Ok(());
        }

        // 新流只认 SYN
        if flags & FLAG_SYN == 0 || flags & FLAG_ACK != 0 {
            return Ok(());
        }
        if self.active_tcp.load(Ordering::Relaxed) >= MAX_TCP_CONNECTIONS {
            warn!(src = %src, dst = %dst, "tcp connection limit reached, dropping syn");
            return Ok(());
        }

        let (stack_tx, stream_rx) = mpsc::channel::<Vec<u8>>(TCP_CHANNEL_DEPTH);
        let (stream_tx, mut stack_rx) = mpsc::channel::<Vec<u8>>(TCP_CHANNEL_DEPTH);
        let stream = StackTcpStream::new(stream_rx, stream_tx, src, dst);

        let state = Arc::new(Mutex::new(TcpState {
            client_seq_next: client_seq.wrapping_add(1),
            server_seq_next: 1,
        }));

        {
            let mut st = state.lock().unwrap();
            let syn_ack = build_tcp_packet(
                dst,
                src,
                st.server_seq_next,
                st.client_seq_next,
                FLAG_SYN | FLAG_ACK,
                &[],
            )?;
            self.endpoint.write_packet(&syn_ack)?;
            st.server_seq_next = st.server_seq_next.wrapping_add(1);
        }

        self.tcp_table.lock().unwrap().insert(
            key.clone(),
            TcpEntry {
                to_stream: stack_tx,
                state: state.clone(),
            },
        );
        self.active_tcp.fetch_add(1, Ordering::Relaxed);

        // 下行注入：代理侧数据按序打包成 PSH|ACK
        let endpoint = self.endpoint.clone();
        let writer_state = state;
        tokio::spawn(async move {
            while let Some(data) = stack_rx.recv().await {
                if data.is_empty() {
                    break;
                }
                let (seq, ack) = {
                    let st = writer_state.lock().unwrap();
                    (st.server_seq_next, st.client_seq_next)
                };
                match build_tcp_packet(dst, src, seq, ack, FLAG_PSH | FLAG_ACK, &data) {
                    Ok(pkt) => {
                        if endpoint.write_packet(&pkt).is_ok() {
                            let mut st = writer_state.lock().unwrap();
                            st.server_seq_next = st.server_seq_next.wrapping_add(data.len() as u32);
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "tcp injection failed");
                        break;
                    }
                }
            }
        });

        // 流交给流表；流结束后拆表
        let this = self.weak.upgrade().expect("stack alive");
        let handler = self.handler.clone();
        tokio::spawn(async move {
            handler
                .new_connection(src.into(), Destination::tcp(dst.ip(), dst.port()), Box::new(stream))
                .await;
            this.drop_entry(&FlowKey { src, dst });
        });

        debug!(src = %src, dst = %dst, "userspace stack accepted tcp flow");
        Ok(())
    }

    fn drop_entry(&self, key: &FlowKey) {
        if self.tcp_table.lock().unwrap().remove(key).is_some() {
            self.active_tcp.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl NetworkDispatcher for NetStack {
    fn deliver(&self, packet: Vec<u8>) {
        match self.process(packet) {
            Ok(()) => {}
            Err(Error::Parse(reason)) => debug!(reason = reason, "stack dropped malformed packet"),
            Err(e) => debug!(error = %e, "stack packet processing failed"),
        }
    }
}

/// 栈抽出的 TCP 流，作为 ProxyStream 交给流表。
pub struct StackTcpStream {
    rx: mpsc::Receiver<Vec<u8>>,
    tx: mpsc::Sender<Vec<u8>>,
    read_buf: Vec<u8>,
    read_pos: usize,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    read_closed: bool,
}

impl StackTcpStream {
    fn new(
        rx: mpsc::Receiver<Vec<u8>>,
        tx: mpsc::Sender<Vec<u8>>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Self {
        Self {
            rx,
            tx,
            read_buf: Vec::new(),
            read_pos: 0,
            local_addr,
            remote_addr,
            read_closed: false,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

impl tokio::io::AsyncRead for StackTcpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.read_pos < self.read_buf.len() {
            let to_copy = (self.read_buf.len() - self.read_pos).min(buf.remaining());
            let start = self.read_pos;
            buf.put_slice(&self.read_buf[start..start + to_copy]);
            self.read_pos += to_copy;
            if self.read_pos >= self.read_buf.len() {
                self.read_buf.clear();
                self.read_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        if self.read_closed {
            return Poll::Ready(Ok(()));
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => {
                if data.is_empty() {
                    self.read_closed = true;
                    return Poll::Ready(Ok(()));
                }
                let to_copy = data.len().min(buf.remaining());
                buf.put_slice(&data[..to_copy]);
                if to_copy < data.len() {
                    self.read_buf = data;
                    self.read_pos = to_copy;
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => {
                self.read_closed = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl tokio::io::AsyncWrite for StackTcpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let data = buf.to_vec();
        let len = data.len();
        match self.tx.try_send(data) {
            Ok(()) => Poll::Ready(Ok(len)),
            Err(mpsc::error::TrySendError::Full(_)) => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stack channel closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // 空 vec 作为 EOF 信号
        let _ = self.tx.try_send(Vec::new());
        Poll::Ready(Ok(()))
    }
}
