//! 外部协作方契约。
//!
//! 代理核心（dispatcher）、本地 resolver、uid dumper、protector 都由宿主
//! 注入，这里只定义接口。数据通路侧的 `Tun` / `TunHandler` 是两套引擎
//! （system NAT 与用户态栈）共用的上行接口。

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::common::{Destination, Result};

pub const TAG_TUN: &str = "tun";
pub const TAG_DNS_IN: &str = "dns-in";

/// 双向代理流（入站侧）
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type ProxyStream = Box<dyn AsyncStream>;

/// dispatch 返回的读写对
pub struct ProxyLink {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

/// 每流入站元数据
#[derive(Debug, Clone)]
pub struct Inbound {
    pub source: Destination,
    pub tag: &'static str,
    pub network_type: String,
    pub wifi_ssid: String,
    pub uid: u32,
}

/// 提示 dispatcher 做 L7 嗅探（HTTP Host / TLS SNI / QUIC）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SniffingRequest {
    pub enabled: bool,
    pub protocols: Vec<&'static str>,
    /// 仅 fakedns 时只取元数据
    pub metadata_only: bool,
    /// 不覆盖目标地址，只用于路由
    pub route_only: bool,
}

#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub inbound: Inbound,
    pub sniffing: Option<SniffingRequest>,
}

/// 代理侧无连接会话
#[async_trait]
pub trait OutboundPacketConn: Send + Sync {
    async fn write_to(&self, data: &[u8], dest: &Destination) -> Result<usize>;

    /// 返回 (长度, 来源)。来源缺失时调用方回落到原始目的地址。
    async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, Option<SocketAddr>)>;

    /// 幂等；会使挂起的 read_from 以错误返回。
    fn close(&self);
}

/// 代理核心。黑盒：接收逻辑目的地，返回读写对或 packet-conn。
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, ctx: DispatchContext, destination: Destination) -> Result<ProxyLink>;

    async fn dial_udp(&self, ctx: DispatchContext) -> Result<Box<dyn OutboundPacketConn>>;
}

/// 本地 DNS。network ∈ {"ip","ip4","ip6"}；返回逗号分隔的 IP 串，
/// 空串表示空响应；错误串可携带 "rcode: <n> ..."。
pub trait LocalResolver: Send + Sync {
    fn lookup_ip(&self, network: &str, host: &str) -> std::result::Result<String, String>;
}

#[derive(Debug, Clone)]
pub struct UidInfo {
    pub label: String,
    pub package_name: String,
}

/// 连接归属查询（Android procfs / netlink 实现在宿主侧）
pub trait UidDumper: Send + Sync {
    fn dump_uid(&self, source: &Destination, destination: &Destination) -> Result<u32>;
    fn uid_info(&self, uid: u32) -> Result<UidInfo>;
}

/// 标记 socket 绕过隧道
pub trait Protector: Send + Sync {
    fn protect(&self, fd: i32) -> bool;
}

/// protect 关闭时的替身
pub struct NoopProtector;

impl Protector for NoopProtector {
    fn protect(&self, _fd: i32) -> bool {
        true
    }
}

pub trait ErrorHandler: Send + Sync {
    fn handle_error(&self, err: &str);
}

/// 数据通路引擎句柄
#[async_trait]
pub trait Tun: Send + Sync {
    /// 停止读包任务，等它汇合后释放设备。幂等。
    async fn stop(&self);
}

/// 上行回调：把上游回包写回设备。参数为 (载荷, 来源)。
pub type WriteBack = Arc<dyn Fn(&[u8], Option<SocketAddr>) -> Result<usize> + Send + Sync>;

/// 流拆除时释放每流资源（UDP NAT 的头模板等）
pub type FlowCloser = Box<dyn FnOnce() + Send>;

/// 引擎把逻辑流交给流表的接口
#[async_trait]
pub trait TunHandler: Send + Sync {
    /// 新 TCP 流。阻塞到流结束。
    async fn new_connection(&self, source: Destination, destination: Destination, stream: ProxyStream);

    /// 入站 UDP 报文。首包会安装 NAT 条目并启动下行泵。
    async fn new_packet(
        &self,
        source: Destination,
        destination: Destination,
        data: Bytes,
        write_back: WriteBack,
        closer: FlowCloser,
    );
}
