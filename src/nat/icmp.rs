//! ICMP echo 反射。
//!
//! 只认 v4 type 8 / v6 type 128 且 code 0 的 echo request：对调地址、
//! 改写类型为 reply、重算校验和。无任何状态。两套引擎共用这里的原地
//! 改写，自行负责把结果写回设备。

use crate::common::{Error, Result};
use crate::packet::{checksum, Ipv4Packet, Ipv6Packet};

use super::TunWriter;

const ICMPV4_ECHO_REQUEST: u8 = 8;
const ICMPV4_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// 把 IPv4 echo request 原地改成 reply。返回应写回的字节数；
/// 非 echo request 返回 None（丢弃）。
pub(crate) fn make_echo_reply_v4(packet: &mut [u8]) -> Result<Option<usize>> {
    let mut ip = Ipv4Packet::parse(&mut *packet)?;
    {
        let icmp = ip.transport();
        if icmp.len() < 8 {
            return Err(Error::Parse("icmp message shorter than header"));
        }
        if icmp[0] != ICMPV4_ECHO_REQUEST || icmp[1] != 0 {
            return Ok(None);
        }
    }

    let source = ip.source();
    let destination = ip.destination();
    ip.set_source(destination);
    ip.set_destination(source);
    ip.update_checksum();

    let icmp = ip.transport_mut();
    icmp[0] = ICMPV4_ECHO_REPLY;
    icmp[2..4].copy_from_slice(&[0, 0]);
    // v4 的 ICMP 校验和只覆盖报文本身
    let ck = checksum::checksum(icmp);
    icmp[2..4].copy_from_slice(&ck.to_be_bytes());

    Ok(Some(ip.total_len() as usize))
}

/// ICMPv6 版本；校验和带伪头 (src, dst, length, next-header)。
pub(crate) fn make_echo_reply_v6(packet: &mut [u8]) -> Result<Option<usize>> {
    let mut ip = Ipv6Packet::parse(&mut *packet)?;
    {
        let icmp = ip.transport();
        if icmp.len() < 8 {
            return Err(Error::Parse("icmpv6 message shorter than header"));
        }
        if icmp[0] != ICMPV6_ECHO_REQUEST || icmp[1] != 0 {
            return Ok(None);
        }
    }

    let source = ip.source();
    let destination = ip.destination();
    ip.set_source(destination);
    ip.set_destination(source);

    let transport_len = ip.payload_len() as u32;
    let pseudo = ip.pseudo_sum(transport_len);
    let icmp = ip.transport_mut();
    icmp[0] = ICMPV6_ECHO_REPLY;
    icmp[2..4].copy_from_slice(&[0, 0]);
    let ck = checksum::transport_checksum(pseudo, icmp);
    icmp[2..4].copy_from_slice(&ck.to_be_bytes());

    Ok(Some(crate::packet::IPV6_HEADER_LEN + transport_len as usize))
}

pub(crate) fn reflect_v4(writer: &TunWriter, packet: &mut [u8]) -> Result<()> {
    if let Some(total) = make_echo_reply_v4(packet)? {
        writer.write_packet(&packet[..total])?;
    }
    Ok(())
}

pub(crate) fn reflect_v6(writer: &TunWriter, packet: &mut [u8]) -> Result<()> {
    if let Some(total) = make_echo_reply_v6(packet)? {
        writer.write_packet(&packet[..total])?;
    }
    Ok(())
}
