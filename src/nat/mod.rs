//! 轻量 "system" 引擎。
//!
//! 直接在 fd 上收发原始 IP 包：ICMP echo 就地反射，UDP 走带头模板的
//! per-flow NAT，TCP 重写后反射给内核栈终结（见 `tcp` 模块），其余协议
//! 静默丢弃。没有完整 IP 栈，不重组、不分片。

pub mod icmp;
pub mod tcp;
pub mod udp;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::{Error, Result};
use crate::packet::{self, Ipv4Packet, Ipv6Packet};
use crate::proxy::{ErrorHandler, Tun, TunHandler};

/// 设备写端。写错误不重试，原样交给调用方。
pub(crate) struct TunWriter {
    inner: WriterInner,
}

enum WriterInner {
    #[cfg(unix)]
    Fd(i32),
    #[cfg(test)]
    Sink(std::sync::Mutex<Vec<Vec<u8>>>),
}

impl TunWriter {
    #[cfg(unix)]
    pub(crate) fn from_fd(fd: i32) -> Self {
        Self {
            inner: WriterInner::Fd(fd),
        }
    }

    /// 测试用：把写出的包收集起来
    #[cfg(test)]
    pub(crate) fn sink() -> Self {
        Self {
            inner: WriterInner::Sink(std::sync::Mutex::new(Vec::new())),
        }
    }

    #[cfg(test)]
    pub(crate) fn take_written(&self) -> Vec<Vec<u8>> {
        match &self.inner {
            WriterInner::Sink(sink) => std::mem::take(&mut sink.lock().unwrap()),
            #[allow(unreachable_patterns)]
            _ => Vec::new(),
        }
    }

    pub(crate) fn write_packet(&self, packet: &[u8]) -> Result<usize> {
        match &self.inner {
            #[cfg(unix)]
            WriterInner::Fd(fd) => loop {
                let n = unsafe { libc::write(*fd, packet.as_ptr().cast(), packet.len()) };
                if n >= 0 {
                    return Ok(n as usize);
                }
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::Io(err));
            },
            #[cfg(test)]
            WriterInner::Sink(sink) => {
                sink.lock().unwrap().push(packet.to_vec());
                Ok(packet.len())
            }
        }
    }
}

struct Engine {
    writer: Arc<TunWriter>,
    handler: Arc<dyn TunHandler>,
    tcp: tcp::TcpRedirect,
    pool: Arc<crate::common::BufferPool>,
}

pub struct SystemTun {
    engine: Arc<Engine>,
    cancel: CancellationToken,
    mtu: i32,
}

impl SystemTun {
    #[cfg(unix)]
    pub fn new(
        fd: i32,
        mtu: i32,
        handler: Arc<dyn TunHandler>,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Result<Self> {
        set_nonblocking(fd)?;

        let writer = Arc::new(TunWriter::from_fd(fd));
        let tcp = tcp::TcpRedirect::new(handler.clone(), writer.clone())?;
        let engine = Arc::new(Engine {
            writer,
            handler,
            tcp,
            pool: crate::common::BufferPool::relay(),
        });

        let cancel = CancellationToken::new();
        let loop_engine = engine.clone();
        let loop_cancel = cancel.clone();
        tokio::spawn(async move {
            read_loop(fd, loop_engine, loop_cancel, error_handler).await;
        });

        Ok(Self {
            engine,
            cancel,
            mtu,
        })
    }

    pub fn mtu(&self) -> i32 {
        self.mtu
    }
}

#[async_trait::async_trait]
impl Tun for SystemTun {
    async fn stop(&self) {
        // 读包任务在退出时自行关 fd，这里只负责取消
        self.cancel.cancel();
        self.engine.tcp.stop();
    }
}

#[cfg(unix)]
fn set_nonblocking(fd: i32) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// 读包主循环。瞬态错误退避重试，不可恢复错误上报后停机。
#[cfg(unix)]
async fn read_loop(
    fd: i32,
    engine: Arc<Engine>,
    cancel: CancellationToken,
    error_handler: Arc<dyn ErrorHandler>,
) {
    let mut buf = vec![0u8; 65535];

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n > 0 {
            engine.process(&mut buf[..n as usize]);
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
                error_handler.handle_error(&format!("read tun: {err}"));
                break;
            }
        }
    }

    unsafe {
        libc::close(fd);
    }
}

impl Engine {
    /// 分类器：首半字节定族，校验长度，按传输协议分发。未知协议静默丢弃。
    fn process(self: &Arc<Self>, buffer: &mut [u8]) {
        let result = match packet::ip_version(buffer) {
            Some(4) => self.process_v4(buffer),
            Some(6) => self.process_v6(buffer),
            _ => Ok(()),
        };
        if let Err(Error::Parse(reason)) = result {
            debug!(reason = reason, "dropping malformed packet");
        } else if let Err(e) = result {
            debug!(error = %e, "packet processing failed");
        }
    }

    fn process_v4(self: &Arc<Self>, buffer: &mut [u8]) -> Result<()> {
        let protocol = Ipv4Packet::parse(&*buffer)?.protocol();
        match protocol {
            packet::PROTO_ICMP => icmp::reflect_v4(&self.writer, buffer),
            packet::PROTO_UDP => udp::process_v4(self, buffer),
            packet::PROTO_TCP => self.tcp.process_v4(buffer),
            _ => Ok(()),
        }
    }

    fn process_v6(self: &Arc<Self>, buffer: &mut [u8]) -> Result<()> {
        let next_header = Ipv6Packet::parse(&*buffer)?.next_header();
        match next_header {
            packet::PROTO_ICMPV6 => icmp::reflect_v6(&self.writer, buffer),
            packet::PROTO_UDP => udp::process_v6(self, buffer),
            packet::PROTO_TCP => self.tcp.process_v6(buffer),
            _ => Ok(()),
        }
    }
}
