//! RFC 1071 互联网校验和。
//!
//! 所有写回 TUN 的包都必须带有效的 IP 头校验和（v4）和带伪头的传输层
//! 校验和。调用方先把校验和字段清零，再把一补结果存回。

use std::net::{Ipv4Addr, Ipv6Addr};

/// 按 16 位大端字累加，奇数尾字节补零在高位。返回未折叠的部分和。
pub fn sum(data: &[u8], initial: u32) -> u32 {
    let mut acc = initial;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        acc = acc.wrapping_add(u16::from_be_bytes([chunk[0], chunk[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        acc = acc.wrapping_add((*last as u32) << 8);
    }
    acc
}

/// 折叠进位并取一补。
pub fn fold(mut acc: u32) -> u16 {
    while acc >> 16 != 0 {
        acc = (acc & 0xFFFF) + (acc >> 16);
    }
    !(acc as u16)
}

pub fn checksum(data: &[u8]) -> u16 {
    fold(sum(data, 0))
}

/// IPv4 伪头部分和: src + dst + proto + 传输层长度
pub fn pseudo_sum_v4(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, transport_len: u16) -> u32 {
    let mut acc = sum(&src.octets(), 0);
    acc = sum(&dst.octets(), acc);
    acc = acc.wrapping_add(proto as u32);
    acc.wrapping_add(transport_len as u32)
}

/// IPv6 伪头部分和: src + dst + 上层长度 + next-header
pub fn pseudo_sum_v6(src: Ipv6Addr, dst: Ipv6Addr, next_header: u8, transport_len: u32) -> u32 {
    let mut acc = sum(&src.octets(), 0);
    acc = sum(&dst.octets(), acc);
    acc = acc.wrapping_add(transport_len);
    acc.wrapping_add(next_header as u32)
}

/// 在伪头部分和之上累加传输层段（校验和字段需已清零）。
pub fn transport_checksum(pseudo: u32, segment: &[u8]) -> u16 {
    fold(sum(segment, pseudo))
}

/// 分段累加（头与载荷不连续时使用）。
pub fn transport_checksum_parts(pseudo: u32, header: &[u8], payload: &[u8]) -> u16 {
    debug_assert!(header.len() % 2 == 0, "transport header is even-sized");
    fold(sum(payload, sum(header, pseudo)))
}

/// 校验收到的段。和为 0xFFFF（折叠前）时有效。
pub fn verify(pseudo: u32, segment: &[u8]) -> bool {
    fold(sum(segment, pseudo)) == 0
}
