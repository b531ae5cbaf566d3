//! IP/UDP/TCP/ICMP 报文的零拷贝视图与构造器。
//!
//! 视图直接落在收包缓冲区上，NAT 改写通过 setter 原地完成。
//! IPv6 只看固定 40 字节头的第一个 next-header，不处理扩展头。

pub mod checksum;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::common::{Error, Result};

pub const IPV4_MIN_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;
pub const UDP_HEADER_LEN: usize = 8;
pub const TCP_MIN_HEADER_LEN: usize = 20;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_ICMPV6: u8 = 58;

/// 首半字节。空包返回 None。
pub fn ip_version(packet: &[u8]) -> Option<u8> {
    packet.first().map(|b| b >> 4)
}

/// IPv4 头视图
pub struct Ipv4Packet<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> Ipv4Packet<B> {
    pub fn parse(buf: B) -> Result<Self> {
        let data = buf.as_ref();
        if data.len() < IPV4_MIN_HEADER_LEN {
            return Err(Error::Parse("ipv4 packet shorter than minimum header"));
        }
        if data[0] >> 4 != 4 {
            return Err(Error::Parse("not an ipv4 packet"));
        }
        let ihl = ((data[0] & 0x0f) as usize) * 4;
        if ihl < IPV4_MIN_HEADER_LEN || data.len() < ihl {
            return Err(Error::Parse("invalid ipv4 header length"));
        }
        let total = u16::from_be_bytes([data[2], data[3]]) as usize;
        if total < ihl || total > data.len() {
            return Err(Error::Parse("ipv4 total length out of bounds"));
        }
        Ok(Self { buf })
    }

    pub fn header_len(&self) -> usize {
        ((self.buf.as_ref()[0] & 0x0f) as usize) * 4
    }

    pub fn total_len(&self) -> u16 {
        let d = self.buf.as_ref();
        u16::from_be_bytes([d[2], d[3]])
    }

    pub fn protocol(&self) -> u8 {
        self.buf.as_ref()[9]
    }

    pub fn source(&self) -> Ipv4Addr {
        let d = self.buf.as_ref();
        Ipv4Addr::new(d[12], d[13], d[14], d[15])
    }

    pub fn destination(&self) -> Ipv4Addr {
        let d = self.buf.as_ref();
        Ipv4Addr::new(d[16], d[17], d[18], d[19])
    }

    /// IP 头之后的传输层段（以 total length 为界）。
    pub fn transport(&self) -> &[u8] {
        let hl = self.header_len();
        let total = self.total_len() as usize;
        &self.buf.as_ref()[hl..total]
    }

    pub fn pseudo_sum(&self, transport_len: u16) -> u32 {
        checksum::pseudo_sum_v4(self.source(), self.destination(), self.protocol(), transport_len)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Ipv4Packet<B> {
    pub fn set_source(&mut self, addr: Ipv4Addr) {
        self.buf.as_mut()[12..16].copy_from_slice(&addr.octets());
    }

    pub fn set_destination(&mut self, addr: Ipv4Addr) {
        self.buf.as_mut()[16..20].copy_from_slice(&addr.octets());
    }

    pub fn set_total_len(&mut self, len: u16) {
        self.buf.as_mut()[2..4].copy_from_slice(&len.to_be_bytes());
    }

    /// 清零后重算 IP 头校验和并写回。
    pub fn update_checksum(&mut self) {
        let hl = self.header_len();
        let d = self.buf.as_mut();
        d[10..12].copy_from_slice(&[0, 0]);
        let ck = checksum::checksum(&d[..hl]);
        d[10..12].copy_from_slice(&ck.to_be_bytes());
    }

    pub fn transport_mut(&mut self) -> &mut [u8] {
        let hl = self.header_len();
        let total = self.total_len() as usize;
        &mut self.buf.as_mut()[hl..total]
    }
}

/// IPv6 固定头视图
pub struct Ipv6Packet<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> Ipv6Packet<B> {
    pub fn parse(buf: B) -> Result<Self> {
        let data = buf.as_ref();
        if data.len() < IPV6_HEADER_LEN {
            return Err(Error::Parse("ipv6 packet shorter than fixed header"));
        }
        if data[0] >> 4 != 6 {
            return Err(Error::Parse("not an ipv6 packet"));
        }
        let payload = u16::from_be_bytes([data[4], data[5]]) as usize;
        if IPV6_HEADER_LEN + payload > data.len() {
            return Err(Error::Parse("ipv6 payload length out of bounds"));
        }
        Ok(Self { buf })
    }

    pub fn payload_len(&self) -> u16 {
        let d = self.buf.as_ref();
        u16::from_be_bytes([d[4], d[5]])
    }

    pub fn next_header(&self) -> u8 {
        self.buf.as_ref()[6]
    }

    pub fn source(&self) -> Ipv6Addr {
        let mut o = [0u8; 16];
        o.copy_from_slice(&self.buf.as_ref()[8..24]);
        Ipv6Addr::from(o)
    }

    pub fn destination(&self) -> Ipv6Addr {
        let mut o = [0u8; 16];
        o.copy_from_slice(&self.buf.as_ref()[24..40]);
        Ipv6Addr::from(o)
    }

    pub fn transport(&self) -> &[u8] {
        let end = IPV6_HEADER_LEN + self.payload_len() as usize;
        &self.buf.as_ref()[IPV6_HEADER_LEN..end]
    }

    pub fn pseudo_sum(&self, transport_len: u32) -> u32 {
        checksum::pseudo_sum_v6(self.source(), self.destination(), self.next_header(), transport_len)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Ipv6Packet<B> {
    pub fn set_source(&mut self, addr: Ipv6Addr) {
        self.buf.as_mut()[8..24].copy_from_slice(&addr.octets());
    }

    pub fn set_destination(&mut self, addr: Ipv6Addr) {
        self.buf.as_mut()[24..40].copy_from_slice(&addr.octets());
    }

    pub fn set_payload_len(&mut self, len: u16) {
        self.buf.as_mut()[4..6].copy_from_slice(&len.to_be_bytes());
    }

    pub fn transport_mut(&mut self) -> &mut [u8] {
        let end = IPV6_HEADER_LEN + self.payload_len() as usize;
        &mut self.buf.as_mut()[IPV6_HEADER_LEN..end]
    }
}

/// UDP 头视图（落在传输层切片上）
pub struct UdpDatagram<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> UdpDatagram<B> {
    pub fn parse(buf: B) -> Result<Self> {
        if buf.as_ref().len() < UDP_HEADER_LEN {
            return Err(Error::Parse("udp datagram shorter than header"));
        }
        Ok(Self { buf })
    }

    pub fn source_port(&self) -> u16 {
        let d = self.buf.as_ref();
        u16::from_be_bytes([d[0], d[1]])
    }

    pub fn destination_port(&self) -> u16 {
        let d = self.buf.as_ref();
        u16::from_be_bytes([d[2], d[3]])
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf.as_ref()[UDP_HEADER_LEN..]
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> UdpDatagram<B> {
    pub fn set_source_port(&mut self, port: u16) {
        self.buf.as_mut()[0..2].copy_from_slice(&port.to_be_bytes());
    }

    pub fn set_destination_port(&mut self, port: u16) {
        self.buf.as_mut()[2..4].copy_from_slice(&port.to_be_bytes());
    }

    pub fn set_len(&mut self, len: u16) {
        self.buf.as_mut()[4..6].copy_from_slice(&len.to_be_bytes());
    }

    pub fn set_checksum(&mut self, ck: u16) {
        self.buf.as_mut()[6..8].copy_from_slice(&ck.to_be_bytes());
    }
}

/// TCP 段视图（重定向 NAT 只改端口和校验和）
pub struct TcpSegment<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> TcpSegment<B> {
    pub fn parse(buf: B) -> Result<Self> {
        if buf.as_ref().len() < TCP_MIN_HEADER_LEN {
            return Err(Error::Parse("tcp segment shorter than header"));
        }
        Ok(Self { buf })
    }

    pub fn source_port(&self) -> u16 {
        let d = self.buf.as_ref();
        u16::from_be_bytes([d[0], d[1]])
    }

    pub fn destination_port(&self) -> u16 {
        let d = self.buf.as_ref();
        u16::from_be_bytes([d[2], d[3]])
    }

    pub fn flags(&self) -> u8 {
        self.buf.as_ref()[13]
    }

    pub fn is_syn_only(&self) -> bool {
        self.flags() & 0x12 == 0x02
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> TcpSegment<B> {
    pub fn set_source_port(&mut self, port: u16) {
        self.buf.as_mut()[0..2].copy_from_slice(&port.to_be_bytes());
    }

    pub fn set_destination_port(&mut self, port: u16) {
        self.buf.as_mut()[2..4].copy_from_slice(&port.to_be_bytes());
    }

    /// 清零后基于伪头部分和重算整段校验和。
    pub fn update_checksum(&mut self, pseudo: u32) {
        let d = self.buf.as_mut();
        d[16..18].copy_from_slice(&[0, 0]);
        let ck = checksum::transport_checksum(pseudo, d);
        d[16..18].copy_from_slice(&ck.to_be_bytes());
    }
}

/// 构造完整 UDP 报文（用户态栈写回用）。地址族必须一致。
pub fn build_udp_packet(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Result<Vec<u8>> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    match (src.ip(), dst.ip()) {
        (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => {
            let total = IPV4_MIN_HEADER_LEN + udp_len;
            if total > u16::MAX as usize {
                return Err(Error::Parse("udp packet exceeds 65535 bytes"));
            }
            let mut pkt = vec![0u8; total];
            pkt[0] = 0x45;
            pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
            pkt[8] = 64; // TTL
            pkt[9] = PROTO_UDP;
            pkt[12..16].copy_from_slice(&src_ip.octets());
            pkt[16..20].copy_from_slice(&dst_ip.octets());

            pkt[20..22].copy_from_slice(&src.port().to_be_bytes());
            pkt[22..24].copy_from_slice(&dst.port().to_be_bytes());
            pkt[24..26].copy_from_slice(&(udp_len as u16).to_be_bytes());
            pkt[28..].copy_from_slice(payload);

            let pseudo = checksum::pseudo_sum_v4(src_ip, dst_ip, PROTO_UDP, udp_len as u16);
            let ck = checksum::transport_checksum(pseudo, &pkt[20..]);
            pkt[26..28].copy_from_slice(&ck.to_be_bytes());

            let ipck = {
                let header = &pkt[..IPV4_MIN_HEADER_LEN];
                checksum::checksum(header)
            };
            pkt[10..12].copy_from_slice(&ipck.to_be_bytes());
            Ok(pkt)
        }
        (IpAddr::V6(src_ip), IpAddr::V6(dst_ip)) => {
            if udp_len > u16::MAX as usize {
                return Err(Error::Parse("udp payload exceeds 65535 bytes"));
            }
            let mut pkt = vec![0u8; IPV6_HEADER_LEN + udp_len];
            pkt[0] = 0x60;
            pkt[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
            pkt[6] = PROTO_UDP;
            pkt[7] = 64; // hop limit
            pkt[8..24].copy_from_slice(&src_ip.octets());
            pkt[24..40].copy_from_slice(&dst_ip.octets());

            pkt[40..42].copy_from_slice(&src.port().to_be_bytes());
            pkt[42..44].copy_from_slice(&dst.port().to_be_bytes());
            pkt[44..46].copy_from_slice(&(udp_len as u16).to_be_bytes());
            pkt[48..].copy_from_slice(payload);

            let pseudo = checksum::pseudo_sum_v6(src_ip, dst_ip, PROTO_UDP, udp_len as u32);
            let ck = checksum::transport_checksum(pseudo, &pkt[40..]);
            pkt[46..48].copy_from_slice(&ck.to_be_bytes());
            Ok(pkt)
        }
        _ => Err(Error::Parse("mixed address families in udp packet")),
    }
}

/// 构造完整 TCP 段（用户态栈注入用），按端点地址族选择 v4/v6。
pub fn build_tcp_packet(
    src: SocketAddr,
    dst: SocketAddr,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Result<Vec<u8>> {
    match (src.ip(), dst.ip()) {
        (IpAddr::V4(_), IpAddr::V4(_)) => build_tcp_packet_v4(src, dst, seq, ack, flags, payload),
        (IpAddr::V6(_), IpAddr::V6(_)) => build_tcp_packet_v6(src, dst, seq, ack, flags, payload),
        _ => Err(Error::Parse("mixed address families in tcp packet")),
    }
}

/// 构造 IPv4 TCP 段。
pub fn build_tcp_packet_v4(
    src: SocketAddr,
    dst: SocketAddr,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let (src_ip, dst_ip) = match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => (s, d),
        _ => return Err(Error::Parse("tcp injection requires ipv4 endpoints")),
    };

    let total = IPV4_MIN_HEADER_LEN + TCP_MIN_HEADER_LEN + payload.len();
    if total > u16::MAX as usize {
        return Err(Error::Parse("tcp packet exceeds 65535 bytes"));
    }

    let mut pkt = vec![0u8; total];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    pkt[8] = 64;
    pkt[9] = PROTO_TCP;
    pkt[12..16].copy_from_slice(&src_ip.octets());
    pkt[16..20].copy_from_slice(&dst_ip.octets());

    pkt[20..22].copy_from_slice(&src.port().to_be_bytes());
    pkt[22..24].copy_from_slice(&dst.port().to_be_bytes());
    pkt[24..28].copy_from_slice(&seq.to_be_bytes());
    pkt[28..32].copy_from_slice(&ack.to_be_bytes());
    pkt[32] = 5 << 4; // data offset
    pkt[33] = flags;
    pkt[34..36].copy_from_slice(&65535u16.to_be_bytes()); // window
    pkt[40..].copy_from_slice(payload);

    let tcp_len = (TCP_MIN_HEADER_LEN + payload.len()) as u16;
    let pseudo = checksum::pseudo_sum_v4(src_ip, dst_ip, PROTO_TCP, tcp_len);
    let ck = checksum::transport_checksum(pseudo, &pkt[20..]);
    pkt[36..38].copy_from_slice(&ck.to_be_bytes());

    let ipck = checksum::checksum(&pkt[..IPV4_MIN_HEADER_LEN]);
    pkt[10..12].copy_from_slice(&ipck.to_be_bytes());

    Ok(pkt)
}

/// 构造 IPv6 TCP 段。
pub fn build_tcp_packet_v6(
    src: SocketAddr,
    dst: SocketAddr,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let (src_ip, dst_ip) = match (src.ip(), dst.ip()) {
        (IpAddr::V6(s), IpAddr::V6(d)) => (s, d),
        _ => return Err(Error::Parse("tcp injection requires ipv6 endpoints")),
    };

    let tcp_len = TCP_MIN_HEADER_LEN + payload.len();
    if tcp_len > u16::MAX as usize {
        return Err(Error::Parse("tcp payload exceeds 65535 bytes"));
    }

    let mut pkt = vec![0u8; IPV6_HEADER_LEN + tcp_len];
    pkt[0] = 0x60;
    pkt[4..6].copy_from_slice(&(tcp_len as u16).to_be_bytes());
    pkt[6] = PROTO_TCP;
    pkt[7] = 64; // hop limit
    pkt[8..24].copy_from_slice(&src_ip.octets());
    pkt[24..40].copy_from_slice(&dst_ip.octets());

    let base = IPV6_HEADER_LEN;
    pkt[base..base + 2].copy_from_slice(&src.port().to_be_bytes());
    pkt[base + 2..base + 4].copy_from_slice(&dst.port().to_be_bytes());
    pkt[base + 4..base + 8].copy_from_slice(&seq.to_be_bytes());
    pkt[base + 8..base + 12].copy_from_slice(&ack.to_be_bytes());
    pkt[base + 12] = 5 << 4; // data offset
    pkt[base + 13] = flags;
    pkt[base + 14..base + 16].copy_from_slice(&65535u16.to_be_bytes()); // window
    pkt[base + TCP_MIN_HEADER_LEN..].copy_from_slice(payload);

    let pseudo = checksum::pseudo_sum_v6(src_ip, dst_ip, PROTO_TCP, tcp_len as u32);
    let ck = checksum::transport_checksum(pseudo, &pkt[base..]);
    pkt[base + 16..base + 18].copy_from_slice(&ck.to_be_bytes());

    Ok(pkt)
}
