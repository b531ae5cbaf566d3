//! 链路层端点。
//!
//! 独占 TUN fd：附着后起一个读包任务把入站包交给网络分发器；出站支持
//! 单包写与聚合成一次 writev 的批量写。无链路头、无硬件能力、链路地址
//! 为空。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::common::{Error, Result};

use super::pcap::PcapWriter;

/// 入站包的去向（上层网络栈）。
pub trait NetworkDispatcher: Send + Sync {
    fn deliver(&self, packet: Vec<u8>);
}

struct ReaderTask {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

pub struct RwEndpoint {
    fd: i32,
    mtu: RwLock<u32>,
    attached: Arc<Mutex<Option<ReaderTask>>>,
    fd_closed: AtomicBool,
    pcap: Option<Arc<PcapWriter>>,
}

impl RwEndpoint {
    #[cfg(unix)]
    pub fn new(fd: i32, mtu: u32, pcap: Option<Arc<PcapWriter>>) -> Result<Self> {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
        }
        Ok(Self {
            fd,
            mtu: RwLock::new(mtu),
            attached: Arc::new(Mutex::new(None)),
            fd_closed: AtomicBool::new(false),
            pcap,
        })
    }

    /// 附着分发器并启动读包任务；传 None 则停止任务并等它汇合后才返回，
    /// 之后关 fd 不会撞上仍在读的任务。幂等：重复附着或重复摘除都是空操作。
    pub async fn attach(&self, dispatcher: Option<Arc<dyn NetworkDispatcher>>) {
        match dispatcher {
            Some(dispatcher) => self.start(dispatcher),
            None => {
                let task = self.attached.lock().unwrap().take();
                if let Some(task) = task {
                    task.cancel.cancel();
                    let _ = task.handle.await;
                }
            }
        }
    }

    /// 同步启动读包任务（构造期用；`attach(Some)` 也走这里）。
    pub(crate) fn start(&self, dispatcher: Arc<dyn NetworkDispatcher>) {
        let mut attached = self.attached.lock().unwrap();
        if attached.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(read_loop(
            self.fd,
            dispatcher,
            cancel.clone(),
            self.attached.clone(),
            self.pcap.clone(),
        ));
        *attached = Some(ReaderTask { cancel, handle });
    }

    pub fn is_attached(&self) -> bool {
        self.attached.lock().unwrap().is_some()
    }

    pub fn mtu(&self) -> u32 {
        *self.mtu.read().unwrap()
    }

    pub fn set_mtu(&self, mtu: u32) {
        *self.mtu.write().unwrap() = mtu;
    }

    /// 写出一个包。错误不重试，翻译后交给调用方。
    pub fn write_packet(&self, packet: &[u8]) -> Result<usize> {
        if let Some(pcap) = &self.pcap {
            pcap.record(packet);
        }
        loop {
            let n = unsafe { libc::write(self.fd, packet.as_ptr().cast(), packet.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Io(err));
        }
    }

    /// 批量写：聚合成一次 writev。
    pub fn write_packets(&self, packets: &[&[u8]]) -> Result<usize> {
        if packets.is_empty() {
            return Ok(0);
        }
        if let Some(pcap) = &self.pcap {
            for packet in packets {
                pcap.record(packet);
            }
        }

        // 预留容量避免追加时反复扩容。取 47 是因为启用 SWGSO 时单个
        // 65KB TCP 段会拆成 46 个 1420 字节加 1 个 216 字节的分段。
        const BATCH: usize = 47;
        let mut iovecs: Vec<libc::iovec> = Vec::with_capacity(BATCH.max(packets.len()));
        for packet in packets {
            iovecs.push(libc::iovec {
                iov_base: packet.as_ptr() as *mut _,
                iov_len: packet.len(),
            });
        }

        loop {
            let n = unsafe { libc::writev(self.fd, iovecs.as_ptr(), iovecs.len() as i32) };
            if n >= 0 {
                return Ok(packets.len());
            }
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Io(err));
        }
    }

    /// 关闭 fd。幂等。
    pub fn close(&self) {
        if !self.fd_closed.swap(true, Ordering::SeqCst) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

/// 读包循环：瞬态错误退避，不可恢复错误摘除端点。
async fn read_loop(
    fd: i32,
    dispatcher: Arc<dyn NetworkDispatcher>,
    cancel: CancellationToken,
    attached: Arc<Mutex<Option<ReaderTask>>>,
    pcap: Option<Arc<PcapWriter>>,
) {
    let mut buf = vec![0u8; 65535];

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n > 0 {
            let packet = buf[..n as usize].to_vec();
            if let Some(pcap) = &pcap {
                pcap.record(&packet);
            }
            dispatcher.deliver(packet);
            continue;
        }
        if n == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            continue;
        }

        let err = std::io::Error::last_os_error();
        match err.kind() {
            std::io::ErrorKind::WouldBlock => {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(2)) => {}
                    _ = cancel.cancelled() => break,
                }
            }
            std::io::ErrorKind::Interrupted => {}
            _ => {
                warn!(error = %err, "endpoint read failed, detaching");
                // 不可恢复：自行摘除
                if let Some(task) = attached.lock().unwrap().take() {
                    task.cancel.cancel();
                }
                break;
            }
        }
    }

    debug!("endpoint reader stopped");
}
