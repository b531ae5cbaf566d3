//! 用户态栈引擎端到端：SYN 握手应答与 UDP 转发。

#![cfg(unix)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tun2ray::common::{Destination, Error, Result};
use tun2ray::packet::{self, checksum, Ipv4Packet};
use tun2ray::proxy::{
    DispatchContext, Dispatcher, ErrorHandler, LocalResolver, OutboundPacketConn, ProxyLink,
};
use tun2ray::{Ipv6Mode, Tun2ray, TunConfig, TunImplementation};

fn packet_socketpair() -> (i32, i32) {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    (fds[0], fds[1])
}

fn peer_send(fd: i32, data: &[u8]) {
    let n = unsafe { libc::send(fd, data.as_ptr().cast(), data.len(), 0) };
    assert_eq!(n as usize, data.len());
}

async fn peer_recv(fd: i32) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; 65535];
    for _ in 0..400 {
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), libc::MSG_DONTWAIT) };
        if n > 0 {
            buf.truncate(n as usize);
            return Some(buf);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    None
}

struct Quiet;

impl ErrorHandler for Quiet {
    fn handle_error(&self, _err: &str) {}
}

struct EmptyResolver;

impl LocalResolver for EmptyResolver {
    fn lookup_ip(&self, _network: &str, _host: &str) -> std::result::Result<String, String> {
        Ok(String::new())
    }
}

struct SinkConn {
    tx: mpsc::UnboundedSender<(Vec<u8>, Destination)>,
    cancel: CancellationToken,
}

#[async_trait]
impl OutboundPacketConn for SinkConn {
    async fn write_to(&self, data: &[u8], dest: &Destination) -> Result<usize> {
        self.tx
            .send((data.to_vec(), *dest))
            .map_err(|_| Error::Dispatch("upstream gone".to_string()))?;
        Ok(data.len())
    }

    async fn read_from(&self, _buf: &mut [u8]) -> Result<(usize, Option<SocketAddr>)> {
        self.cancel.cancelled().await;
        Err(Error::Io(std::io::Error::other("closed")))
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

struct StackDispatcher {
    tcp_dispatches: AtomicUsize,
    udp_tx: mpsc::UnboundedSender<(Vec<u8>, Destination)>,
    destinations: Mutex<Vec<Destination>>,
}

#[async_trait]
impl Dispatcher for StackDispatcher {
    async fn dispatch(&self, _ctx: DispatchContext, destination: Destination) -> Result<ProxyLink> {
        self.tcp_dispatches.fetch_add(1, Ordering::SeqCst);
        self.destinations.lock().unwrap().push(destination);
        let (local, _remote) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(local);
        Ok(ProxyLink {
            reader: Box::new(r),
            writer: Box::new(w),
        })
    }

    async fn dial_udp(&self, _ctx: DispatchContext) -> Result<Box<dyn OutboundPacketConn>> {
        Ok(Box::new(SinkConn {
            tx: self.udp_tx.clone(),
            cancel: CancellationToken::new(),
        }))
    }
}

fn build_core(
    fd: i32,
) -> (
    Arc<Tun2ray>,
    Arc<StackDispatcher>,
    mpsc::UnboundedReceiver<(Vec<u8>, Destination)>,
) {
    let (udp_tx, udp_rx) = mpsc::unbounded_channel();
    let dispatcher = Arc::new(StackDispatcher {
        tcp_dispatches: AtomicUsize::new(0),
        udp_tx,
        destinations: Mutex::new(Vec::new()),
    });
    let core = Tun2ray::new(TunConfig {
        fd,
        mtu: 1500,
        gateway4: "10.233.0.1".to_string(),
        gateway6: String::new(),
        ipv6_mode: Ipv6Mode::Enable,
        implementation: TunImplementation::Stack,
        protect: false,
        fake_dns: false,
        hijack_dns: false,
        sniffing: false,
        override_destination: false,
        debug: false,
        dump_uid: false,
        traffic_stats: false,
        pcap: false,
        dispatcher: dispatcher.clone(),
        protector: None,
        error_handler: Arc::new(Quiet),
        local_resolver: Arc::new(EmptyResolver),
        uid_dumper: None,
    })
    .expect("core construction");
    (core, dispatcher, udp_rx)
}

#[tokio::test]
async fn syn_handshake_and_dispatch() {
    let (tun_fd, peer) = packet_socketpair();
    let (core, dispatcher, _udp_rx) = build_core(tun_fd);

    let syn = packet::build_tcp_packet_v4(
        "10.0.0.2:40000".parse().unwrap(),
        "93.184.216.34:443".parse().unwrap(),
        1000,
        0,
        0x02,
        &[],
    )
    .unwrap();
    peer_send(peer, &syn);

    let reply = peer_recv(peer).await.expect("syn-ack");
    let ip = Ipv4Packet::parse(reply.as_slice()).unwrap();
    assert_eq!(ip.source().to_string(), "93.184.216.34");
    assert_eq!(ip.destination().to_string(), "10.0.0.2");
    let transport = ip.transport();
    assert_eq!(transport[13], 0x12); // SYN|ACK
    let pseudo = ip.pseudo_sum(transport.len() as u16);
    assert!(checksum::verify(pseudo, transport));

    // 流已交给 dispatcher，目的为真实目标
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if dispatcher.tcp_dispatches.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("tcp flow dispatched");
    assert_eq!(
        dispatcher.destinations.lock().unwrap()[0].net_addr(),
        "93.184.216.34:443"
    );

    core.close().await;
    unsafe { libc::close(peer) };
}

#[tokio::test]
async fn udp_forwarded_through_handler() {
    let (tun_fd, peer) = packet_socketpair();
    let (core, _dispatcher, mut udp_rx) = build_core(tun_fd);

    let query = packet::build_udp_packet(
        "10.0.0.2:5000".parse().unwrap(),
        "8.8.4.4:53".parse().unwrap(),
        b"stack-query",
    )
    .unwrap();
    peer_send(peer, &query);

    let (payload, dest) = tokio::time::timeout(Duration::from_secs(2), udp_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload, b"stack-query");
    assert_eq!(dest.net_addr(), "8.8.4.4:53");

    core.close().await;
    unsafe { libc::close(peer) };
}
