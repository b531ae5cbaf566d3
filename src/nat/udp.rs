//! UDP NAT。
//!
//! 每条流建一次回包头模板：IP 头快照（目的已改写为原始来源）加 8 字节
//! UDP 头。上游每个回包经 write_back 套模板、改来源、修长度与两个校验和
//! 后整包写回设备。模板的暂存缓冲区来自池，流拆除时由 closer 归还。

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::common::{Destination, Error, PooledBuf, Result};
use crate::packet::{checksum, Ipv4Packet, Ipv6Packet, UdpDatagram, IPV6_HEADER_LEN, PROTO_UDP, UDP_HEADER_LEN};
use crate::proxy::{FlowCloser, WriteBack};

use super::{Engine, TunWriter};

struct ReplyTemplate {
    /// IP 头 + UDP 最小头，目的字段已指回原始来源
    header: Vec<u8>,
    ip_header_len: usize,
    v6: bool,
    /// 回包的目的端（原始来源）
    reply_dst: SocketAddr,
    /// 回包的默认来源（原始目的）
    default_src: SocketAddr,
    scratch: Mutex<Option<PooledBuf>>,
    writer: Arc<TunWriter>,
}

impl ReplyTemplate {
    /// 组装并发出一个回包。origin 缺失或族不符时退回原始目的地址。
    fn write_reply(&self, payload: &[u8], origin: Option<SocketAddr>) -> Result<usize> {
        let mut guard = self.scratch.lock().unwrap();
        let scratch = guard
            .as_mut()
            .ok_or_else(|| Error::Io(std::io::Error::other("udp flow already closed")))?;

        let header_len = self.header.len();
        let total = header_len + payload.len();
        if total > scratch.len() {
            return Err(Error::Io(std::io::Error::other("reply exceeds buffer")));
        }

        scratch[..header_len].copy_from_slice(&self.header);
        scratch[header_len..total].copy_from_slice(payload);
        let out = &mut scratch[..total];

        let source = match origin {
            Some(addr) if addr.is_ipv6() == self.v6 => addr,
            _ => self.default_src,
        };
        let udp_len = (UDP_HEADER_LEN + payload.len()) as u16;

        let pseudo;
        if self.v6 {
            let (std::net::IpAddr::V6(src), std::net::IpAddr::V6(dst)) =
                (source.ip(), self.reply_dst.ip())
            else {
                return Err(Error::Parse("address family mismatch in udp reply"));
            };
            out[8..24].copy_from_slice(&src.octets());
            out[4..6].copy_from_slice(&udp_len.to_be_bytes());
            pseudo = checksum::pseudo_sum_v6(src, dst, PROTO_UDP, udp_len as u32);
        } else {
            let (std::net::IpAddr::V4(src), std::net::IpAddr::V4(dst)) =
                (source.ip(), self.reply_dst.ip())
            else {
                return Err(Error::Parse("address family mismatch in udp reply"));
            };
            out[12..16].copy_from_slice(&src.octets());
            out[2..4].copy_from_slice(&(total as u16).to_be_bytes());
            out[10..12].copy_from_slice(&[0, 0]);
            let ipck = checksum::checksum(&out[..self.ip_header_len]);
            out[10..12].copy_from_slice(&ipck.to_be_bytes());
            pseudo = checksum::pseudo_sum_v4(src, dst, PROTO_UDP, udp_len);
        }

        let udp = &mut out[self.ip_header_len..];
        udp[0..2].copy_from_slice(&source.port().to_be_bytes());
        udp[4..6].copy_from_slice(&udp_len.to_be_bytes());
        udp[6..8].copy_from_slice(&[0, 0]);
        let ck = checksum::transport_checksum(pseudo, udp);
        udp[6..8].copy_from_slice(&ck.to_be_bytes());

        self.writer.write_packet(out)?;
        Ok(payload.len())
    }

    fn release(&self) {
        *self.scratch.lock().unwrap() = None;
    }
}

fn hand_off(
    engine: &Arc<Engine>,
    source: Destination,
    destination: Destination,
    data: Bytes,
    template: ReplyTemplate,
) {
    let template = Arc::new(template);
    let write_back: WriteBack = {
        let template = template.clone();
        Arc::new(move |payload: &[u8], origin| template.write_reply(payload, origin))
    };
    let closer: FlowCloser = Box::new(move || template.release());

    let handler = engine.handler.clone();
    tokio::spawn(async move {
        handler
            .new_packet(source, destination, data, write_back, closer)
            .await;
    });
}

pub(crate) fn process_v4(engine: &Arc<Engine>, buffer: &mut [u8]) -> Result<()> {
    let ip = Ipv4Packet::parse(&*buffer)?;
    let ip_header_len = ip.header_len();
    let src_addr = ip.source();
    let dst_addr = ip.destination();
    let udp = UdpDatagram::parse(ip.transport())?;
    let src_port = udp.source_port();
    let dst_port = udp.destination_port();
    let data = Bytes::copy_from_slice(udp.payload());

    // 快照 IP+UDP 头并把目的指回来源
    let mut header = buffer[..ip_header_len + UDP_HEADER_LEN].to_vec();
    header[16..20].copy_from_slice(&src_addr.octets());
    header[ip_header_len + 2..ip_header_len + 4].copy_from_slice(&src_port.to_be_bytes());

    let template = ReplyTemplate {
        header,
        ip_header_len,
        v6: false,
        reply_dst: SocketAddr::new(src_addr.into(), src_port),
        default_src: SocketAddr::new(dst_addr.into(), dst_port),
        scratch: Mutex::new(Some(engine.pool.get())),
        writer: engine.writer.clone(),
    };

    hand_off(
        engine,
        Destination::udp(src_addr.into(), src_port),
        Destination::udp(dst_addr.into(), dst_port),
        data,
        template,
    );
    Ok(())
}

pub(crate) fn process_v6(engine: &Arc<Engine>, buffer: &mut [u8]) -> Result<()> {
    let ip = Ipv6Packet::parse(&*buffer)?;
    let src_addr = ip.source();
    let dst_addr = ip.destination();
    let udp = UdpDatagram::parse(ip.transport())?;
    let src_port = udp.source_port();
    let dst_port = udp.destination_port();
    let data = Bytes::copy_from_slice(udp.payload());

    let mut header = buffer[..IPV6_HEADER_LEN + UDP_HEADER_LEN].to_vec();
    header[24..40].copy_from_slice(&src_addr.octets());
    header[IPV6_HEADER_LEN + 2..IPV6_HEADER_LEN + 4].copy_from_slice(&src_port.to_be_bytes());

    let template = ReplyTemplate {
        header,
        ip_header_len: IPV6_HEADER_LEN,
        v6: true,
        reply_dst: SocketAddr::new(src_addr.into(), src_port),
        default_src: SocketAddr::new(dst_addr.into(), dst_port),
        scratch: Mutex::new(Some(engine.pool.get())),
        writer: engine.writer.clone(),
    };

    hand_off(
        engine,
        Destination::udp(src_addr.into(), src_port),
        Destination::udp(dst_addr.into(), dst_port),
        data,
        template,
    );
    Ok(())
}
