use thiserror::Error;

/// DNS 解析失败的细分：上游以 "rcode: <n> ..." 字符串报告 rcode。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("rcode: {0}")]
    Rcode(u8),

    #[error("empty response")]
    EmptyResponse,

    #[error("{0}")]
    Other(String),
}

impl ResolveError {
    /// 解析本地 resolver 的错误字符串。`"rcode: 3 NXDOMAIN"` → `Rcode(3)`。
    pub fn from_message(msg: &str) -> Self {
        if let Some(rest) = msg.strip_prefix("rcode:") {
            if let Some(n) = rest.split_whitespace().next() {
                if let Ok(code) = n.parse::<u8>() {
                    return ResolveError::Rcode(code);
                }
            }
        }
        ResolveError::Other(msg.to_string())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// 畸形数据包。调用方静默丢弃，不上报。
    #[error("malformed packet: {0}")]
    Parse(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("resolve failed: {0}")]
    Resolve(#[from] ResolveError),

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("protect failed: {0}")]
    Protect(String),

    #[error("config error: {0}")]
    Config(String),
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(io) => io,
            other => std::io::Error::other(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
