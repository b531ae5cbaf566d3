use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// 网络类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// 流端点：地址 + 端口 + 网络类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Destination {
    pub address: IpAddr,
    pub port: u16,
    pub network: Network,
}

impl Destination {
    pub fn tcp(address: IpAddr, port: u16) -> Self {
        Self {
            address,
            port,
            network: Network::Tcp,
        }
    }

    pub fn udp(address: IpAddr, port: u16) -> Self {
        Self {
            address,
            port,
            network: Network::Udp,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// "ip:port" 形式。UDP NAT 表以来源的 net_addr 为键。
    pub fn net_addr(&self) -> String {
        self.socket_addr().to_string()
    }
}

impl From<SocketAddr> for Destination {
    fn from(addr: SocketAddr) -> Self {
        Destination::tcp(addr.ip(), addr.port())
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.socket_addr())
    }
}
