//! 受保护拨号器与进程级注入点。
//!
//! 代理核心的出站 socket 都经由这里：先用本地 resolver 按 IPv6 策略排好
//! 地址顺序，再建 socket、调 protector 给 fd 打标记让内核绕开隧道，最后
//! 连接。没有这一层，代理出站流量会原路折返 TUN。
//!
//! 安装/卸载是显式的进程级操作，核心关闭时必须卸载，避免串进下一次会话。

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::common::{Destination, Error, ResolveError, Result};
use crate::config::Ipv6Mode;
use crate::dns;
use crate::proxy::{LocalResolver, Protector};

/// 代理核心打开真实互联网 socket 用的拨号器。
#[async_trait]
pub trait SystemDialer: Send + Sync {
    async fn dial_tcp(&self, destination: &Destination) -> Result<tokio::net::TcpStream>;

    /// 绑定一个与 peer 同族的 UDP socket。
    async fn bind_udp(&self, peer: SocketAddr) -> Result<tokio::net::UdpSocket>;
}

static ALTERNATIVE_DIALER: RwLock<Option<Arc<dyn SystemDialer>>> = RwLock::new(None);

pub type LookupFn =
    Arc<dyn Fn(&str, &str) -> std::result::Result<Vec<IpAddr>, ResolveError> + Send + Sync>;

static LOOKUP_FN: RwLock<Option<LookupFn>> = RwLock::new(None);

/// 安装（或传 None 卸载）进程级替代拨号器。
pub fn use_alternative_dialer(dialer: Option<Arc<dyn SystemDialer>>) {
    *ALTERNATIVE_DIALER.write().unwrap() = dialer;
}

pub fn alternative_dialer() -> Option<Arc<dyn SystemDialer>> {
    ALTERNATIVE_DIALER.read().unwrap().clone()
}

/// 替换（或传 None 还原）进程级本地 DNS 查询。仅在 protect 开启时设置。
pub fn set_lookup_fn(lookup: Option<LookupFn>) {
    *LOOKUP_FN.write().unwrap() = lookup;
}

pub fn lookup_fn() -> Option<LookupFn> {
    LOOKUP_FN.read().unwrap().clone()
}

pub struct ProtectedDialer {
    protector: Arc<dyn Protector>,
    resolver: Arc<dyn LocalResolver>,
    ipv6_mode: Ipv6Mode,
}

impl ProtectedDialer {
    pub fn new(
        protector: Arc<dyn Protector>,
        resolver: Arc<dyn LocalResolver>,
        ipv6_mode: Ipv6Mode,
    ) -> Self {
        Self {
            protector,
            resolver,
            ipv6_mode,
        }
    }

    /// 解析域名并按 IPv6 策略排序：prefer → v6 在前，enable → v4 在前，
    /// disable/only 本身就是单族查询。
    pub fn resolve_ordered(&self, domain: &str) -> std::result::Result<Vec<IpAddr>, ResolveError> {
        let ips = dns::lookup_ips(&*self.resolver, self.ipv6_mode.lookup_network(), domain)?;
        match self.ipv6_mode {
            Ipv6Mode::Disable | Ipv6Mode::Only => Ok(ips),
            Ipv6Mode::Prefer => Ok(partition(ips, true)),
            Ipv6Mode::Enable => Ok(partition(ips, false)),
        }
    }

    fn protect_fd(&self, fd: i32) -> Result<()> {
        if self.protector.protect(fd) {
            Ok(())
        } else {
            Err(Error::Protect(format!("protect fd {fd} rejected")))
        }
    }

    async fn connect_once(&self, addr: SocketAddr) -> Result<tokio::net::TcpStream> {
        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };
        let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
        socket.set_nonblocking(true)?;

        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            self.protect_fd(socket.as_raw_fd())?;
        }

        let socket = tokio::net::TcpSocket::from_std_stream(socket.into());
        let stream = socket.connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

fn partition(ips: Vec<IpAddr>, v6_first: bool) -> Vec<IpAddr> {
    let (v6, v4): (Vec<IpAddr>, Vec<IpAddr>) = ips.into_iter().partition(|ip| ip.is_ipv6());
    if v6_first {
        v6.into_iter().chain(v4).collect()
    } else {
        v4.into_iter().chain(v6).collect()
    }
}

#[async_trait]
impl SystemDialer for ProtectedDialer {
    async fn dial_tcp(&self, destination: &Destination) -> Result<tokio::net::TcpStream> {
        let addr = destination.socket_addr();
        match self.connect_once(addr).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                debug!(addr = %addr, error = %e, "protected dial failed");
                Err(e)
            }
        }
    }

    async fn bind_udp(&self, peer: SocketAddr) -> Result<tokio::net::UdpSocket> {
        let (domain, bind_addr): (socket2::Domain, SocketAddr) = if peer.is_ipv4() {
            (socket2::Domain::IPV4, "0.0.0.0:0".parse().unwrap())
        } else {
            (socket2::Domain::IPV6, "[::]:0".parse().unwrap())
        };
        let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
        socket.set_nonblocking(true)?;

        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            self.protect_fd(socket.as_raw_fd())?;
        }

        socket.bind(&bind_addr.into())?;
        let socket = tokio::net::UdpSocket::from_std(socket.into())?;
        Ok(socket)
    }
}

/// 把域名整条拨号路径包起来：resolve_ordered + 逐地址尝试。
pub async fn dial_host(dialer: &ProtectedDialer, host: &str, port: u16) -> Result<tokio::net::TcpStream> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return dialer.dial_tcp(&Destination::tcp(ip, port)).await;
    }

    let ips = dialer.resolve_ordered(host)?;

    let mut last_err = None;
    for ip in ips {
        match dialer.dial_tcp(&Destination::tcp(ip, port)).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or(Error::Resolve(ResolveError::EmptyResponse)))
}
