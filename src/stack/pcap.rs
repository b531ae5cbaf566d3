//! pcap 抓包输出。
//!
//! 标准 pcap 全局头加逐包记录，链路类型 RAW IP。只是旁路观测，
//! 不属于数据通路契约；写失败静默忽略。

use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;
const SNAPLEN: u32 = 65535;
/// LINKTYPE_RAW: 裸 IPv4/IPv6
const LINKTYPE_RAW: u32 = 101;

pub struct PcapWriter {
    file: Mutex<std::fs::File>,
}

impl PcapWriter {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = std::fs::File::create(path)?;

        let mut header = Vec::with_capacity(24);
        header.extend_from_slice(&PCAP_MAGIC.to_le_bytes());
        header.extend_from_slice(&VERSION_MAJOR.to_le_bytes());
        header.extend_from_slice(&VERSION_MINOR.to_le_bytes());
        header.extend_from_slice(&0i32.to_le_bytes()); // thiszone
        header.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
        header.extend_from_slice(&SNAPLEN.to_le_bytes());
        header.extend_from_slice(&LINKTYPE_RAW.to_le_bytes());
        file.write_all(&header)?;

        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn record(&self, packet: &[u8]) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let caplen = packet.len().min(SNAPLEN as usize);

        let mut record = Vec::with_capacity(16 + caplen);
        record.extend_from_slice(&(now.as_secs() as u32).to_le_bytes());
        record.extend_from_slice(&now.subsec_micros().to_le_bytes());
        record.extend_from_slice(&(caplen as u32).to_le_bytes());
        record.extend_from_slice(&(packet.len() as u32).to_le_bytes());
        record.extend_from_slice(&packet[..caplen]);

        let mut file = self.file.lock().unwrap();
        if let Err(e) = file.write_all(&record) {
            debug!(error = %e, "pcap record write failed");
        }
    }
}
