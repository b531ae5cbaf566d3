//! 流表核心。
//!
//! 引擎（system NAT 或用户态栈）把逻辑流交到这里：TCP 走
//! `new_connection`，UDP 每包走 `new_packet`。这里负责 dns-in 识别、
//! uid 归属与钳制、嗅探请求、per-uid 统计与 UDP NAT 条目的单飞安装、
//! dispatcher 交接、双向中继和下行泵，以及关停时的整体清理。

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::{Begin, BufferPool, Destination, Network, Result, SingleFlight};
use crate::config::{self, TunConfig, TunImplementation};
use crate::proxy::{
    DispatchContext, Dispatcher, FlowCloser, Inbound, NoopProtector, OutboundPacketConn,
    ProxyLink, ProxyStream, SniffingRequest, Tun, TunHandler, UidDumper, WriteBack, TAG_DNS_IN,
    TAG_TUN,
};

use super::dialer::{self, ProtectedDialer};
use super::stats::{AppStats, ConnectionRegistry, StatsPacketConn, StatsStream};

/// Android 系统应用桶
const SYSTEM_UID: u32 = 1000;
/// 普通应用 uid 下界
const FIRST_APP_UID: u32 = 10_000;
/// UDP 路径上高于此值的归属视为损坏
const MAX_VALID_UID: u32 = 19_999;

pub struct Tun2ray {
    router: Option<IpAddr>,
    dispatcher: Arc<dyn Dispatcher>,
    uid_dumper: Option<Arc<dyn UidDumper>>,

    fake_dns: bool,
    hijack_dns: bool,
    sniffing: bool,
    override_destination: bool,
    debug: bool,
    dump_uid: bool,
    traffic_stats: bool,

    self_uid: u32,

    udp_table: Mutex<HashMap<String, Arc<dyn OutboundPacketConn>>>,
    app_stats: Mutex<HashMap<u32, Arc<AppStats>>>,
    nat_latch: SingleFlight<String>,
    stats_latch: SingleFlight<u32>,

    registry: Arc<ConnectionRegistry>,
    pool: Arc<BufferPool>,

    device: Mutex<Option<Box<dyn Tun>>>,
    weak: Weak<Tun2ray>,
}

fn process_uid() -> u32 {
    #[cfg(unix)]
    unsafe {
        libc::getuid()
    }
    #[cfg(not(unix))]
    0
}

impl Tun2ray {
    pub fn new(config: TunConfig) -> Result<Arc<Self>> {
        config::init_logging(config.debug);

        let protector: Arc<dyn crate::proxy::Protector> = if config.protect {
            config
                .protector
                .clone()
                .unwrap_or_else(|| Arc::new(NoopProtector))
        } else {
            Arc::new(NoopProtector)
        };

        let router = config.gateway4.parse::<IpAddr>().ok();

        let table = Arc::new_cyclic(|weak| Tun2ray {
            router,
            dispatcher: config.dispatcher.clone(),
            uid_dumper: config.uid_dumper.clone(),
            fake_dns: config.fake_dns,
            hijack_dns: config.hijack_dns,
            sniffing: config.sniffing,
            override_destination: config.override_destination,
            debug: config.debug,
            dump_uid: config.dump_uid,
            traffic_stats: config.traffic_stats,
            self_uid: process_uid(),
            udp_table: Mutex::new(HashMap::new()),
            app_stats: Mutex::new(HashMap::new()),
            nat_latch: SingleFlight::new(),
            stats_latch: SingleFlight::new(),
            registry: ConnectionRegistry::new(),
            pool: BufferPool::relay(),
            device: Mutex::new(None),
            weak: weak.clone(),
        });

        let handler: Arc<dyn TunHandler> = table.clone();
        let device: Box<dyn Tun> = match config.implementation {
            TunImplementation::System => Box::new(crate::nat::SystemTun::new(
                config.fd,
                config.mtu,
                handler,
                config.error_handler.clone(),
            )?),
            TunImplementation::Stack => Box::new(crate::stack::StackTun::new(
                config.fd,
                config.mtu,
                handler,
                config.pcap,
            )?),
        };
        *table.device.lock().unwrap() = Some(device);

        let resolver = config.local_resolver.clone();
        let protected = Arc::new(ProtectedDialer::new(
            protector,
            resolver.clone(),
            config.ipv6_mode,
        ));
        dialer::use_alternative_dialer(Some(protected));

        if config.protect {
            dialer::set_lookup_fn(Some(Arc::new(move |network, host| {
                crate::dns::lookup_ips(&*resolver, network, host)
            })));
        } else {
            dialer::set_lookup_fn(None);
        }

        Ok(table)
    }

    /// 关停：卸载进程级注入点，停设备并等读包任务汇合，再取消所有登记的流。
    pub async fn close(&self) {
        dialer::use_alternative_dialer(None);
        dialer::set_lookup_fn(None);

        let device = self.device.lock().unwrap().take();
        if let Some(device) = device {
            device.stop().await;
        }

        self.registry.close_all();
    }

    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    pub fn app_stats_of(&self, uid: u32) -> Option<Arc<AppStats>> {
        self.app_stats.lock().unwrap().get(&uid).cloned()
    }

    /// 全部 uid 的统计快照，JSON 形式交给宿主。
    pub fn stats_json(&self) -> String {
        let snapshots: Vec<_> = {
            let stats = self.app_stats.lock().unwrap();
            stats.iter().map(|(uid, s)| s.snapshot(*uid)).collect()
        };
        serde_json::to_string(&snapshots).unwrap_or_else(|_| "[]".to_string())
    }

    fn is_router(&self, addr: IpAddr) -> bool {
        self.router == Some(addr)
    }

    fn make_inbound(&self, source: Destination, is_dns: bool) -> Inbound {
        Inbound {
            source,
            tag: if is_dns { TAG_DNS_IN } else { TAG_TUN },
            network_type: config::network_type(),
            wifi_ssid: config::wifi_ssid(),
            uid: 0,
        }
    }

    fn sniffing_request(&self, is_dns: bool, network: Network) -> Option<SniffingRequest> {
        if is_dns || !(self.sniffing || self.fake_dns) {
            return None;
        }
        let mut protocols = Vec::new();
        if self.fake_dns {
            protocols.push("fakedns");
        }
        if self.sniffing {
            match network {
                Network::Tcp => protocols.extend(["http", "tls"]),
                Network::Udp => protocols.push("quic"),
            }
        }
        Some(SniffingRequest {
            enabled: true,
            protocols,
            metadata_only: self.fake_dns && !self.sniffing,
            route_only: !self.override_destination,
        })
    }

    /// 取或建 uid 的统计桶。并发首流只允许一个安装者。
    async fn bind_stats(&self, uid: u32) -> Arc<AppStats> {
        if let Some(stats) = self.app_stats.lock().unwrap().get(&uid) {
            return stats.clone();
        }
        match self.stats_latch.begin(uid) {
            Begin::Leader(guard) => {
                let stats = AppStats::new();
                self.app_stats.lock().unwrap().insert(uid, stats.clone());
                drop(guard);
                stats
            }
            Begin::Follower => {
                self.stats_latch.wait(&uid).await;
                self.app_stats
                    .lock()
                    .unwrap()
                    .get(&uid)
                    .cloned()
                    .expect("unexpected sync read failed")
            }
        }
    }

    /// TCP 路径的 uid 解析。返回 (钳制后 uid, 是否本进程流量)。
    fn resolve_uid_tcp(&self, source: &Destination, destination: &Destination) -> (u32, bool) {
        let Some(dumper) = &self.uid_dumper else {
            return (0, false);
        };
        let Ok(mut uid) = dumper.dump_uid(source, destination) else {
            return (0, false);
        };

        let self_flow = uid > 0 && uid == self.self_uid;
        if self.debug && !self_flow && uid >= FIRST_APP_UID {
            match dumper.uid_info(uid) {
                Ok(i) => info!(
                    label = %i.label, uid = uid, package = %i.package_name,
                    "[TCP] {} ==> {}", source.net_addr(), destination.net_addr()
                ),
                Err(_) => info!("[TCP] {} ==> {}", source.net_addr(), destination.net_addr()),
            }
        }
        if uid < FIRST_APP_UID {
            uid = SYSTEM_UID;
        }
        (uid, self_flow)
    }

    /// UDP 路径的 uid 解析：高位损坏值先重置，再做常规钳制。
    fn resolve_uid_udp(
        &self,
        source: &Destination,
        destination: &Destination,
        is_dns: bool,
    ) -> (u32, bool) {
        let Some(dumper) = &self.uid_dumper else {
            return (0, false);
        };
        let Ok(mut uid) = dumper.dump_uid(source, destination) else {
            return (0, false);
        };

        if uid > MAX_VALID_UID {
            debug!(uid = uid, "bad connection owner, reset to system bucket");
            uid = SYSTEM_UID;
        }

        let self_flow = uid > 0 && uid == self.self_uid;
        if self.debug && !self_flow && uid >= SYSTEM_UID {
            let tag = if is_dns { "DNS" } else { "UDP" };
            let info = dumper.uid_info(uid).or_else(|_| dumper.uid_info(SYSTEM_UID));
            match info {
                Ok(i) => info!(
                    label = %i.label, uid = uid, package = %i.package_name,
                    "[{}] {} ==> {}", tag, source.net_addr(), destination.net_addr()
                ),
                Err(_) => info!("[{}] {} ==> {}", tag, source.net_addr(), destination.net_addr()),
            }
        }
        if uid < FIRST_APP_UID {
            uid = SYSTEM_UID;
        }
        (uid, self_flow)
    }

    /// 尝试经由已安装的 NAT 条目投递。表中有条目即返回 true（投递失败
    /// 会关闭上游连接，由下行泵负责拆表）。
    async fn send_to(&self, nat_key: &str, destination: &Destination, data: &[u8]) -> bool {
        let conn = {
            let table = self.udp_table.lock().unwrap();
            table.get(nat_key).cloned()
        };
        let Some(conn) = conn else {
            return false;
        };
        if let Err(e) = conn.write_to(data, destination).await {
            debug!(nat_key = nat_key, error = %e, "[UDP] upstream write failed");
            conn.close();
        }
        true
    }

    async fn relay(&self, stream: ProxyStream, link: ProxyLink, cancel: CancellationToken) {
        let (mut up_read, mut down_write) = tokio::io::split(stream);
        let ProxyLink {
            reader: mut link_read,
            writer: mut link_write,
        } = link;

        // 任一方向收尾即放弃另一方向；drop 关闭两端
        tokio::select! {
            _ = tokio::io::copy(&mut up_read, &mut link_write) => {}
            _ = tokio::io::copy(&mut link_read, &mut down_write) => {}
            _ = cancel.cancelled() => {}
        }
    }
}

#[async_trait]
impl TunHandler for Tun2ray {
    async fn new_connection(&self, source: Destination, destination: Destination, stream: ProxyStream) {
        let is_dns = self.is_router(destination.address);
        // 原先考虑过把目的端口 53 一并视作 DNS，保持停用

        let mut inbound = self.make_inbound(source, is_dns);

        let (uid, self_flow) = if self.dump_uid || self.traffic_stats {
            self.resolve_uid_tcp(&source, &destination)
        } else {
            (0, false)
        };
        inbound.uid = uid;

        let sniffing = self.sniffing_request(is_dns, Network::Tcp);
        let ctx = DispatchContext { inbound, sniffing };

        let stats = if self.traffic_stats && !self_flow && !is_dns {
            Some(self.bind_stats(uid).await)
        } else {
            None
        };
        let stream: ProxyStream = match &stats {
            Some(s) => {
                s.activate_tcp();
                Box::new(StatsStream::new(stream, s.clone()))
            }
            None => stream,
        };

        let guard = self.registry.register();

        let link = match self.dispatcher.dispatch(ctx, destination).await {
            Ok(link) => link,
            Err(e) => {
                warn!(dest = %destination, error = %e, "[TCP] dispatch failed");
                if let Some(s) = &stats {
                    s.release_tcp();
                }
                return;
            }
        };

        self.relay(stream, link, guard.token()).await;

        drop(guard);
        if let Some(s) = &stats {
            s.release_tcp();
        }
    }

    async fn new_packet(
        &self,
        source: Destination,
        destination: Destination,
        data: Bytes,
        write_back: WriteBack,
        closer: FlowCloser,
    ) {
        let nat_key = source.net_addr();

        // 快路径：条目已在
        if self.send_to(&nat_key, &destination, &data).await {
            closer();
            return;
        }

        let latch_guard = match self.nat_latch.begin(nat_key.clone()) {
            Begin::Follower => {
                self.nat_latch.wait(&nat_key).await;
                // 安装者失败时条目缺失，该报文随之丢弃
                self.send_to(&nat_key, &destination, &data).await;
                closer();
                return;
            }
            Begin::Leader(guard) => guard,
        };

        let mut is_dns = self.is_router(destination.address);
        if !is_dns && self.hijack_dns {
            is_dns = crate::dns::is_hijackable_query(&data);
        }

        let mut inbound = self.make_inbound(source, is_dns);

        let (uid, self_flow) = if self.dump_uid || self.traffic_stats {
            self.resolve_uid_udp(&source, &destination, is_dns)
        } else {
            (0, false)
        };
        inbound.uid = uid;

        let sniffing = self.sniffing_request(is_dns, Network::Udp);
        let ctx = DispatchContext { inbound, sniffing };

        let conn = match self.dispatcher.dial_udp(ctx).await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "[UDP] dial failed");
                closer();
                return; // latch_guard Drop 放行等待者
            }
        };

        let stats = if self.traffic_stats && !self_flow && !is_dns {
            Some(self.bind_stats(uid).await)
        } else {
            None
        };
        let conn: Arc<dyn OutboundPacketConn> = match &stats {
            Some(s) => {
                s.activate_udp();
                Arc::new(StatsPacketConn::new(conn, s.clone()))
            }
            None => Arc::from(conn),
        };

        let guard = self.registry.register();
        self.udp_table
            .lock()
            .unwrap()
            .insert(nat_key.clone(), conn.clone());

        // 先投递触发安装的这包，再放行等待者，保证同源首两包有序
        if let Err(e) = conn.write_to(&data, &destination).await {
            debug!(nat_key = %nat_key, error = %e, "[UDP] first write failed");
            conn.close();
        }
        drop(latch_guard);

        // 下行泵：上游回包 → write_back → TUN
        let this = self.weak.upgrade().expect("flow table alive while packets arrive");
        let pool = self.pool.clone();
        let token = guard.token();
        tokio::spawn(async move {
            let mut buf = pool.get();
            loop {
                let read = tokio::select! {
                    r = conn.read_from(&mut buf) => r,
                    _ = token.cancelled() => break,
                };
                let (n, addr) = match read {
                    Ok(v) => v,
                    Err(_) => break,
                };
                let origin = if is_dns { None } else { addr };
                if let Err(e) = write_back(&buf[..n], origin) {
                    debug!(nat_key = %nat_key, error = %e, "[UDP] write back failed");
                    break;
                }
            }

            drop(buf);
            conn.close();
            closer();
            this.udp_table.lock().unwrap().remove(&nat_key);
            drop(guard);
            if let Some(s) = stats {
                s.release_udp();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Error;
    use crate::proxy::UidInfo;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    /// 录制型 dispatcher：TCP 返回 duplex 对端，UDP 返回管道 packet-conn。
    struct MockDispatcher {
        dials: AtomicUsize,
        contexts: Mutex<Vec<DispatchContext>>,
        udp_tx: mpsc::UnboundedSender<(Vec<u8>, Destination)>,
        reply_rx: Mutex<Option<mpsc::UnboundedReceiver<(Vec<u8>, Option<SocketAddr>)>>>,
        fail: bool,
    }

    impl MockDispatcher {
        fn new() -> (
            Arc<Self>,
            mpsc::UnboundedReceiver<(Vec<u8>, Destination)>,
            mpsc::UnboundedSender<(Vec<u8>, Option<SocketAddr>)>,
        ) {
            let (udp_tx, udp_rx) = mpsc::unbounded_channel();
            let (reply_tx, reply_rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    dials: AtomicUsize::new(0),
                    contexts: Mutex::new(Vec::new()),
                    udp_tx,
                    reply_rx: Mutex::new(Some(reply_rx)),
                    fail: false,
                }),
                udp_rx,
                reply_tx,
            )
        }

        fn contexts(&self) -> Vec<DispatchContext> {
            self.contexts.lock().unwrap().clone()
        }
    }

    struct MockPacketConn {
        tx: mpsc::UnboundedSender<(Vec<u8>, Destination)>,
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, Option<SocketAddr>)>>,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl OutboundPacketConn for MockPacketConn {
        async fn write_to(&self, data: &[u8], dest: &Destination) -> Result<usize> {
            self.tx
                .send((data.to_vec(), *dest))
                .map_err(|_| Error::Dispatch("upstream gone".to_string()))?;
            Ok(data.len())
        }

        async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, Option<SocketAddr>)> {
            let mut rx = self.rx.lock().await;
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    Err(Error::Io(std::io::Error::other("closed")))
                }
                msg = rx.recv() => match msg {
                    Some((data, addr)) => {
                        buf[..data.len()].copy_from_slice(&data);
                        Ok((data.len(), addr))
                    }
                    None => Err(Error::Io(std::io::Error::other("upstream closed"))),
                },
            }
        }

        fn close(&self) {
            self.cancel.cancel();
        }
    }

    #[async_trait]
    impl Dispatcher for MockDispatcher {
        async fn dispatch(&self, ctx: DispatchContext, _destination: Destination) -> Result<ProxyLink> {
            self.contexts.lock().unwrap().push(ctx);
            if self.fail {
                return Err(Error::Dispatch("refused".to_string()));
            }
            let (local, _remote) = tokio::io::duplex(1024);
            let (r, w) = tokio::io::split(local);
            Ok(ProxyLink {
                reader: Box::new(r),
                writer: Box::new(w),
            })
        }

        async fn dial_udp(&self, ctx: DispatchContext) -> Result<Box<dyn OutboundPacketConn>> {
            self.contexts.lock().unwrap().push(ctx);
            self.dials.fetch_add(1, Ordering::SeqCst);
            let rx = self
                .reply_rx
                .lock()
                .unwrap()
                .take()
                .expect("only one upstream dial expected");
            Ok(Box::new(MockPacketConn {
                tx: self.udp_tx.clone(),
                rx: tokio::sync::Mutex::new(rx),
                cancel: CancellationToken::new(),
            }))
        }
    }

    struct FixedUidDumper(u32);

    impl UidDumper for FixedUidDumper {
        fn dump_uid(&self, _s: &Destination, _d: &Destination) -> Result<u32> {
            Ok(self.0)
        }

        fn uid_info(&self, uid: u32) -> Result<UidInfo> {
            Ok(UidInfo {
                label: format!("app-{uid}"),
                package_name: format!("com.example.app{uid}"),
            })
        }
    }

    struct TableOptions {
        dispatcher: Arc<dyn Dispatcher>,
        uid_dumper: Option<Arc<dyn UidDumper>>,
        sniffing: bool,
        fake_dns: bool,
        hijack_dns: bool,
        override_destination: bool,
        traffic_stats: bool,
    }

    fn test_table(opts: TableOptions) -> Arc<Tun2ray> {
        Arc::new_cyclic(|weak| Tun2ray {
            router: Some("10.233.0.1".parse().unwrap()),
            dispatcher: opts.dispatcher,
            uid_dumper: opts.uid_dumper,
            fake_dns: opts.fake_dns,
            hijack_dns: opts.hijack_dns,
            sniffing: opts.sniffing,
            override_destination: opts.override_destination,
            debug: false,
            dump_uid: true,
            traffic_stats: opts.traffic_stats,
            self_uid: process_uid(),
            udp_table: Mutex::new(HashMap::new()),
            app_stats: Mutex::new(HashMap::new()),
            nat_latch: SingleFlight::new(),
            stats_latch: SingleFlight::new(),
            registry: ConnectionRegistry::new(),
            pool: BufferPool::relay(),
            device: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    fn noop_write_back() -> WriteBack {
        Arc::new(|data: &[u8], _origin| Ok(data.len()))
    }

    fn source(port: u16) -> Destination {
        Destination::udp("192.168.1.2".parse().unwrap(), port)
    }

    fn dns_dest() -> Destination {
        Destination::udp("8.8.8.8".parse().unwrap(), 53)
    }

    #[tokio::test]
    async fn concurrent_first_packets_dial_once() {
        let (dispatcher, mut udp_rx, _reply_tx) = MockDispatcher::new();
        let table = test_table(TableOptions {
            dispatcher: dispatcher.clone(),
            uid_dumper: None,
            sniffing: false,
            fake_dns: false,
            hijack_dns: false,
            override_destination: false,
            traffic_stats: false,
        });

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let table = table.clone();
            handles.push(tokio::spawn(async move {
                table
                    .new_packet(
                        source(5000),
                        dns_dest(),
                        Bytes::from(vec![i]),
                        noop_write_back(),
                        Box::new(|| {}),
                    )
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(dispatcher.dials.load(Ordering::SeqCst), 1);

        // 全部 8 个载荷都应送达上游
        let mut seen = 0;
        while let Ok((_data, dest)) = udp_rx.try_recv() {
            assert_eq!(dest, dns_dest());
            seen += 1;
        }
        assert_eq!(seen, 8);
        assert_eq!(table.udp_table.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn first_two_packets_arrive_in_order() {
        let (dispatcher, mut udp_rx, _reply_tx) = MockDispatcher::new();
        let table = test_table(TableOptions {
            dispatcher,
            uid_dumper: None,
            sniffing: false,
            fake_dns: false,
            hijack_dns: false,
            override_destination: false,
            traffic_stats: false,
        });

        table
            .new_packet(source(5000), dns_dest(), Bytes::from_static(b"first"), noop_write_back(), Box::new(|| {}))
            .await;
        table
            .new_packet(source(5000), dns_dest(), Bytes::from_static(b"second"), noop_write_back(), Box::new(|| {}))
            .await;

        assert_eq!(udp_rx.recv().await.unwrap().0, b"first");
        assert_eq!(udp_rx.recv().await.unwrap().0, b"second");
    }

    #[tokio::test]
    async fn replies_flow_through_write_back() {
        let (dispatcher, mut udp_rx, reply_tx) = MockDispatcher::new();
        let table = test_table(TableOptions {
            dispatcher,
            uid_dumper: None,
            sniffing: false,
            fake_dns: false,
            hijack_dns: false,
            override_destination: false,
            traffic_stats: false,
        });

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let write_back: WriteBack = Arc::new(move |data: &[u8], origin| {
            let _ = seen_tx.send((data.to_vec(), origin));
            Ok(data.len())
        });

        table
            .new_packet(source(5000), dns_dest(), Bytes::from_static(b"ping"), write_back, Box::new(|| {}))
            .await;
        let _ = udp_rx.recv().await;

        let origin: SocketAddr = "8.8.8.8:53".parse().unwrap();
        reply_tx.send((b"pong".to_vec(), Some(origin))).unwrap();

        let (payload, got_origin) = seen_rx.recv().await.unwrap();
        assert_eq!(payload, b"pong");
        assert_eq!(got_origin, Some(origin));
    }

    #[tokio::test]
    async fn concurrent_tcp_flows_share_one_app_stats() {
        let (dispatcher, _udp_rx, _reply_tx) = MockDispatcher::new();
        let table = test_table(TableOptions {
            dispatcher,
            uid_dumper: Some(Arc::new(FixedUidDumper(10_123))),
            sniffing: false,
            fake_dns: false,
            hijack_dns: false,
            override_destination: false,
            traffic_stats: true,
        });

        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = table.clone();
            handles.push(tokio::spawn(async move { table.bind_stats(10_123).await }));
        }
        let mut first: Option<Arc<AppStats>> = None;
        for h in handles {
            let stats = h.await.unwrap();
            if let Some(prev) = &first {
                assert!(Arc::ptr_eq(prev, &stats), "all flows must observe one AppStats");
            } else {
                first = Some(stats);
            }
        }
        assert_eq!(table.app_stats.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deactivate_flips_with_counters() {
        let (dispatcher, _udp_rx, _reply_tx) = MockDispatcher::new();
        let table = test_table(TableOptions {
            dispatcher,
            uid_dumper: Some(Arc::new(FixedUidDumper(10_500))),
            sniffing: false,
            fake_dns: false,
            hijack_dns: false,
            override_destination: false,
            traffic_stats: true,
        });

        let stats = table.bind_stats(10_500).await;
        stats.activate_tcp();
        stats.activate_udp();
        assert_eq!(stats.deactivate_at(), 0);
        stats.release_tcp();
        assert_eq!(stats.deactivate_at(), 0);
        stats.release_udp();
        assert_ne!(stats.deactivate_at(), 0);
    }

    #[tokio::test]
    async fn tcp_sniffing_request_shape() {
        let (dispatcher, _udp_rx, _reply_tx) = MockDispatcher::new();
        let table = test_table(TableOptions {
            dispatcher: dispatcher.clone(),
            uid_dumper: Some(Arc::new(FixedUidDumper(10_123))),
            sniffing: true,
            fake_dns: false,
            hijack_dns: false,
            override_destination: false,
            traffic_stats: false,
        });

        let (client, _server) = tokio::io::duplex(64);
        table
            .new_connection(
                Destination::tcp("10.0.0.2".parse().unwrap(), 40000),
                Destination::tcp("1.1.1.1".parse().unwrap(), 443),
                Box::new(client),
            )
            .await;

        let ctxs = dispatcher.contexts();
        assert_eq!(ctxs.len(), 1);
        let ctx = &ctxs[0];
        assert_eq!(ctx.inbound.tag, TAG_TUN);
        assert_eq!(ctx.inbound.uid, 10_123);
        let sniff = ctx.sniffing.as_ref().unwrap();
        assert_eq!(sniff.protocols, vec!["http", "tls"]);
        assert!(sniff.route_only);
        assert!(!sniff.metadata_only);
    }

    #[tokio::test]
    async fn gateway_destination_tagged_dns_without_sniffing() {
        let (dispatcher, _udp_rx, _reply_tx) = MockDispatcher::new();
        let table = test_table(TableOptions {
            dispatcher: dispatcher.clone(),
            uid_dumper: None,
            sniffing: true,
            fake_dns: true,
            hijack_dns: false,
            override_destination: false,
            traffic_stats: false,
        });

        let (client, _server) = tokio::io::duplex(64);
        table
            .new_connection(
                Destination::tcp("10.0.0.2".parse().unwrap(), 40000),
                Destination::tcp("10.233.0.1".parse().unwrap(), 53),
                Box::new(client),
            )
            .await;

        let ctxs = dispatcher.contexts();
        assert_eq!(ctxs[0].inbound.tag, TAG_DNS_IN);
        assert!(ctxs[0].sniffing.is_none());
    }

    #[tokio::test]
    async fn corrupt_udp_uid_clamped_to_system_bucket() {
        let (dispatcher, mut udp_rx, _reply_tx) = MockDispatcher::new();
        let table = test_table(TableOptions {
            dispatcher: dispatcher.clone(),
            uid_dumper: Some(Arc::new(FixedUidDumper(25_000))),
            sniffing: false,
            fake_dns: false,
            hijack_dns: false,
            override_destination: false,
            traffic_stats: true,
        });

        table
            .new_packet(source(6000), dns_dest(), Bytes::from_static(b"x"), noop_write_back(), Box::new(|| {}))
            .await;
        let _ = udp_rx.recv().await;

        let ctxs = dispatcher.contexts();
        assert_eq!(ctxs[0].inbound.uid, SYSTEM_UID);
        // 统计桶也落在 1000
        assert!(table.app_stats_of(SYSTEM_UID).is_some());
        assert!(table.app_stats_of(25_000).is_none());
    }

    #[tokio::test]
    async fn hijack_dns_marks_a_query_as_dns() {
        let (dispatcher, mut udp_rx, _reply_tx) = MockDispatcher::new();
        let table = test_table(TableOptions {
            dispatcher: dispatcher.clone(),
            uid_dumper: None,
            sniffing: true,
            fake_dns: false,
            hijack_dns: true,
            override_destination: false,
            traffic_stats: false,
        });

        // class IN / type A 查询
        let mut query = vec![0x12u8, 0x34, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        query.extend_from_slice(&[7]);
        query.extend_from_slice(b"example");
        query.extend_from_slice(&[3]);
        query.extend_from_slice(b"com");
        query.push(0);
        query.extend_from_slice(&[0, 1, 0, 1]);

        // 目的地址不是网关，仍应因载荷判定为 DNS
        table
            .new_packet(
                source(7000),
                Destination::udp("9.9.9.9".parse().unwrap(), 53),
                Bytes::from(query),
                noop_write_back(),
                Box::new(|| {}),
            )
            .await;
        let _ = udp_rx.recv().await;

        let ctxs = dispatcher.contexts();
        assert_eq!(ctxs[0].inbound.tag, TAG_DNS_IN);
        assert!(ctxs[0].sniffing.is_none());
    }

    #[tokio::test]
    async fn udp_sniffing_adds_quic() {
        let (dispatcher, mut udp_rx, _reply_tx) = MockDispatcher::new();
        let table = test_table(TableOptions {
            dispatcher: dispatcher.clone(),
            uid_dumper: None,
            sniffing: true,
            fake_dns: true,
            hijack_dns: false,
            override_destination: true,
            traffic_stats: false,
        });

        table
            .new_packet(
                source(7100),
                Destination::udp("1.2.3.4".parse().unwrap(), 443),
                Bytes::from_static(b"quic-initial"),
                noop_write_back(),
                Box::new(|| {}),
            )
            .await;
        let _ = udp_rx.recv().await;

        let sniff = dispatcher.contexts()[0].sniffing.clone().unwrap();
        assert_eq!(sniff.protocols, vec!["fakedns", "quic"]);
        assert!(!sniff.route_only); // override destination 开启
        assert!(!sniff.metadata_only); // sniffing 同时开启
    }

    #[tokio::test]
    async fn closer_runs_once_per_flow_teardown() {
        let (dispatcher, mut udp_rx, reply_tx) = MockDispatcher::new();
        let table = test_table(TableOptions {
            dispatcher,
            uid_dumper: None,
            sniffing: false,
            fake_dns: false,
            hijack_dns: false,
            override_destination: false,
            traffic_stats: false,
        });

        let closed = Arc::new(AtomicU32::new(0));
        let c = closed.clone();
        table
            .new_packet(
                source(8000),
                dns_dest(),
                Bytes::from_static(b"x"),
                noop_write_back(),
                Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;
        let _ = udp_rx.recv().await;

        // 上游断开 → 泵退出 → 拆表
        drop(reply_tx);
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            loop {
                if closed.load(Ordering::SeqCst) == 1 && table.udp_table.lock().unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("udp teardown must run");
        assert_eq!(table.active_connections(), 0);
    }
}
