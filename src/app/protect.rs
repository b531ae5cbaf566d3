//! protect 服务端。
//!
//! 文件系统命名 socket；客户端每连接发一条携带单个 fd 的 `SCM_RIGHTS`
//! 辅助消息，服务端调 protector 标记该 fd，回一个字节：0x01 成功，
//! 0x00 失败。accept 出错或显式关闭时退出。

#![cfg(unix)]

use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::common::{Error, Result};
use crate::proxy::Protector;

pub const PROTECT_FAILED: u8 = 0;
pub const PROTECT_SUCCESS: u8 = 1;

pub struct ProtectServer {
    path: PathBuf,
    cancel: CancellationToken,
}

impl ProtectServer {
    pub fn close(&self) {
        self.cancel.cancel();
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for ProtectServer {
    fn drop(&mut self) {
        self.close();
    }
}

/// 绑定命名 socket 并启动服务。已存在的旧 socket 文件先移除。
pub fn serve_protect(path: &str, protector: Arc<dyn Protector>) -> Result<ProtectServer> {
    let path = PathBuf::from(path);
    let _ = std::fs::remove_file(&path);

    let listener = UnixListener::bind(&path)?;
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o777))?;
    }

    let cancel = CancellationToken::new();
    let loop_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            let conn = tokio::select! {
                _ = loop_cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((conn, _)) => conn,
                    Err(e) => {
                        warn!(error = %e, "protect server accept failed, shutting down");
                        break;
                    }
                },
            };

            let protector = protector.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_client(conn, protector).await {
                    debug!(error = %e, "protect client handling failed");
                }
            });
        }
    });

    Ok(ProtectServer { path, cancel })
}

async fn handle_client(mut conn: UnixStream, protector: Arc<dyn Protector>) -> Result<()> {
    let fd = recv_fd(&conn).await?;

    let ok = protector.protect(fd);
    // 客户端自己持有原 fd，这份 dup 标记完即可释放
    unsafe {
        libc::close(fd);
    }

    let reply = if ok { PROTECT_SUCCESS } else { PROTECT_FAILED };
    conn.write_all(&[reply]).await?;

    // 等对端先断开，避免回执还没读到就收到 RST
    let mut drain = [0u8; 1];
    let _ = conn.read(&mut drain).await;
    Ok(())
}

/// 收取恰好一条携带单个 fd 的辅助消息。
async fn recv_fd(conn: &UnixStream) -> Result<RawFd> {
    loop {
        conn.readable().await?;
        match conn.try_io(Interest::READABLE, || recvmsg_one_fd(conn.as_raw_fd())) {
            Ok(fd) => return Ok(fd),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn recvmsg_one_fd(socket: RawFd) -> std::io::Result<RawFd> {
    unsafe {
        let mut data = [0u8; 1];
        let mut iov = libc::iovec {
            iov_base: data.as_mut_ptr().cast(),
            iov_len: data.len(),
        };
        // u64 数组保证 cmsghdr 对齐
        let mut cmsg_buf = [0u64; 8];

        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr().cast();
        msg.msg_controllen = mem::size_of_val(&cmsg_buf) as _;

        let n = libc::recvmsg(socket, &mut msg, 0);
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(std::io::Error::other("no ancillary message"));
        }
        if (*cmsg).cmsg_level != libc::SOL_SOCKET || (*cmsg).cmsg_type != libc::SCM_RIGHTS {
            return Err(std::io::Error::other("unexpected ancillary message type"));
        }
        let expected_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as usize;
        if (*cmsg).cmsg_len as usize != expected_len {
            return Err(std::io::Error::other("ancillary message does not carry exactly one fd"));
        }

        let fd = *(libc::CMSG_DATA(cmsg) as *const RawFd);
        if fd < 0 {
            return Err(std::io::Error::other("invalid fd in ancillary message"));
        }
        Ok(fd)
    }
}

/// 客户端侧：把 fd 发给 protect 服务并等待回执。宿主进程内自测用。
pub async fn request_protect(path: &str, fd: RawFd) -> Result<bool> {
    let conn = UnixStream::connect(path).await?;

    loop {
        conn.writable().await?;
        match conn.try_io(Interest::WRITABLE, || sendmsg_one_fd(conn.as_raw_fd(), fd)) {
            Ok(()) => break,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let mut conn = conn;
    let mut reply = [0u8; 1];
    conn.read_exact(&mut reply).await?;
    match reply[0] {
        PROTECT_SUCCESS => Ok(true),
        PROTECT_FAILED => Ok(false),
        other => Err(Error::Protect(format!("unexpected protect reply {other:#x}"))),
    }
}

fn sendmsg_one_fd(socket: RawFd, fd: RawFd) -> std::io::Result<()> {
    unsafe {
        let mut data = [0u8; 1];
        let mut iov = libc::iovec {
            iov_base: data.as_mut_ptr().cast(),
            iov_len: data.len(),
        };
        let mut cmsg_buf = [0u64; 8];

        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr().cast();
        msg.msg_controllen = libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as _;

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        std::ptr::copy_nonoverlapping(&fd as *const RawFd, libc::CMSG_DATA(cmsg) as *mut RawFd, 1);

        let n = libc::sendmsg(socket, &msg, 0);
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}
