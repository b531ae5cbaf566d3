//! 本地 DNS 桥接的解析工具。
//!
//! - 劫持判定：只认 class IN 的 A/AAAA 查询，其余类型放行。
//! - resolver 响应解析：逗号分隔 IP 串 → 有序地址表；空串与 rcode
//!   错误映射为各自的哨兵错误。

use std::net::IpAddr;

use tracing::debug;

use crate::common::ResolveError;
use crate::proxy::LocalResolver;

const QTYPE_A: u16 = 1;
const QTYPE_AAAA: u16 = 28;
const QCLASS_IN: u16 = 1;

/// 报文是否为可劫持的 DNS 查询（class IN、type A 或 AAAA）。
pub fn is_hijackable_query(payload: &[u8]) -> bool {
    match parse_question(payload) {
        Some((qtype, qclass)) => {
            qclass == QCLASS_IN && (qtype == QTYPE_A || qtype == QTYPE_AAAA)
        }
        None => false,
    }
}

/// 取第一个 question 的 (QTYPE, QCLASS)。非查询或畸形报文返回 None。
fn parse_question(payload: &[u8]) -> Option<(u16, u16)> {
    if payload.len() < 12 {
        return None;
    }

    let flags = u16::from_be_bytes([payload[2], payload[3]]);
    if flags & 0x8000 != 0 {
        return None; // QR=1，响应
    }
    let qdcount = u16::from_be_bytes([payload[4], payload[5]]);
    if qdcount == 0 {
        return None;
    }

    // QNAME
    let mut pos = 12;
    loop {
        let len = *payload.get(pos)? as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        // 查询里不应出现压缩指针
        if len & 0xC0 == 0xC0 {
            return None;
        }
        pos += 1 + len;
        if pos >= payload.len() {
            return None;
        }
    }

    if pos + 4 > payload.len() {
        return None;
    }
    let qtype = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
    let qclass = u16::from_be_bytes([payload[pos + 2], payload[pos + 3]]);
    Some((qtype, qclass))
}

/// 调用本地 resolver 并解析其响应串。
pub fn lookup_ips(
    resolver: &dyn LocalResolver,
    network: &str,
    host: &str,
) -> Result<Vec<IpAddr>, ResolveError> {
    let response = resolver
        .lookup_ip(network, host)
        .map_err(|msg| ResolveError::from_message(&msg))?;

    if response.is_empty() {
        return Err(ResolveError::EmptyResponse);
    }

    let mut ips = Vec::new();
    for entry in response.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        match entry.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => {
                // v4-mapped 地址还原为 v4
                if let Some(v4) = v6.to_ipv4_mapped() {
                    ips.push(IpAddr::V4(v4));
                } else {
                    ips.push(IpAddr::V6(v6));
                }
            }
            Ok(ip) => ips.push(ip),
            Err(_) => {
                debug!(host = host, entry = entry, "resolver returned unparsable address");
            }
        }
    }

    if ips.is_empty() {
        return Err(ResolveError::EmptyResponse);
    }
    Ok(ips)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 最小 DNS 查询: id=0x1234, QD=1, name, qtype, qclass
    fn build_query(name: &[&str], qtype: u16, qclass: u16, qr_response: bool) -> Vec<u8> {
        let mut q = vec![0x12, 0x34, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        if qr_response {
            q[2] = 0x80;
        }
        for label in name {
            q.push(label.len() as u8);
            q.extend_from_slice(label.as_bytes());
        }
        q.push(0);
        q.extend_from_slice(&qtype.to_be_bytes());
        q.extend_from_slice(&qclass.to_be_bytes());
        q
    }

    struct FixedResolver(std::result::Result<String, String>);

    impl LocalResolver for FixedResolver {
        fn lookup_ip(&self, _network: &str, _host: &str) -> std::result::Result<String, String> {
            self.0.clone()
        }
    }

    #[test]
    fn a_and_aaaa_queries_hijackable() {
        let a = build_query(&["example", "com"], QTYPE_A, QCLASS_IN, false);
        let aaaa = build_query(&["example", "com"], QTYPE_AAAA, QCLASS_IN, false);
        assert!(is_hijackable_query(&a));
        assert!(is_hijackable_query(&aaaa));
    }

    #[test]
    fn other_types_fall_through() {
        let txt = build_query(&["example", "com"], 16, QCLASS_IN, false);
        let chaos = build_query(&["version", "bind"], QTYPE_A, 3, false);
        assert!(!is_hijackable_query(&txt));
        assert!(!is_hijackable_query(&chaos));
    }

    #[test]
    fn responses_and_garbage_rejected() {
        let resp = build_query(&["example", "com"], QTYPE_A, QCLASS_IN, true);
        assert!(!is_hijackable_query(&resp));
        assert!(!is_hijackable_query(b"short"));
        assert!(!is_hijackable_query(&[0u8; 12]));
    }

    #[test]
    fn lookup_orders_and_maps_v4() {
        let r = FixedResolver(Ok("::ffff:1.2.3.4,2001:db8::1, 5.6.7.8".to_string()));
        let ips = lookup_ips(&r, "ip", "example.com").unwrap();
        assert_eq!(
            ips,
            vec![
                "1.2.3.4".parse::<IpAddr>().unwrap(),
                "2001:db8::1".parse::<IpAddr>().unwrap(),
                "5.6.7.8".parse::<IpAddr>().unwrap(),
            ]
        );
    }

    #[test]
    fn blank_entries_dropped() {
        let r = FixedResolver(Ok("1.2.3.4,, ,5.6.7.8".to_string()));
        let ips = lookup_ips(&r, "ip", "example.com").unwrap();
        assert_eq!(ips.len(), 2);
    }

    #[test]
    fn empty_response_sentinel() {
        let r = FixedResolver(Ok(String::new()));
        assert_eq!(lookup_ips(&r, "ip", "x").unwrap_err(), ResolveError::EmptyResponse);

        let all_blank = FixedResolver(Ok(" , ".to_string()));
        assert_eq!(lookup_ips(&all_blank, "ip", "x").unwrap_err(), ResolveError::EmptyResponse);
    }

    #[test]
    fn rcode_error_mapped() {
        let r = FixedResolver(Err("rcode: 3 NXDOMAIN".to_string()));
        assert_eq!(lookup_ips(&r, "ip", "x").unwrap_err(), ResolveError::Rcode(3));
    }
}
