//! 核心配置与进程级环境状态。

pub mod json;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::common::{Error, Result};
use crate::proxy::{Dispatcher, ErrorHandler, LocalResolver, Protector, UidDumper};

pub use json::strip_json;

/// IPv6 策略。prefer 回复 v6 在前，enable 回复 v4 在前。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv6Mode {
    Disable,
    Enable,
    Prefer,
    Only,
}

impl Ipv6Mode {
    pub fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            0 => Ok(Ipv6Mode::Disable),
            1 => Ok(Ipv6Mode::Enable),
            2 => Ok(Ipv6Mode::Prefer),
            3 => Ok(Ipv6Mode::Only),
            other => Err(Error::Config(format!("unknown ipv6 mode {other}"))),
        }
    }

    /// 本地 resolver 的查询网络
    pub fn lookup_network(&self) -> &'static str {
        match self {
            Ipv6Mode::Disable => "ip4",
            Ipv6Mode::Only => "ip6",
            _ => "ip",
        }
    }
}

/// 数据通路引擎选择
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunImplementation {
    /// 完整用户态栈
    Stack,
    /// 轻量 NAT
    System,
}

impl TunImplementation {
    pub fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            0 => Ok(TunImplementation::Stack),
            1 => Ok(TunImplementation::System),
            other => Err(Error::Config(format!("unknown tun implementation {other}"))),
        }
    }
}

/// 建核参数。构造一次，建核时消费。
pub struct TunConfig {
    pub fd: i32,
    pub mtu: i32,
    pub gateway4: String,
    pub gateway6: String,
    pub ipv6_mode: Ipv6Mode,
    pub implementation: TunImplementation,

    pub protect: bool,
    pub fake_dns: bool,
    pub hijack_dns: bool,
    pub sniffing: bool,
    pub override_destination: bool,
    pub debug: bool,
    pub dump_uid: bool,
    pub traffic_stats: bool,
    pub pcap: bool,

    pub dispatcher: Arc<dyn Dispatcher>,
    pub protector: Option<Arc<dyn Protector>>,
    pub error_handler: Arc<dyn ErrorHandler>,
    pub local_resolver: Arc<dyn LocalResolver>,
    pub uid_dumper: Option<Arc<dyn UidDumper>>,
}

static LOGGING_INIT: AtomicBool = AtomicBool::new(false);

/// 安装全局日志订阅器。debug=false 时只留 WARN。重复调用无效果。
pub fn init_logging(debug: bool) {
    if LOGGING_INIT.swap(true, Ordering::SeqCst) {
        return;
    }

    #[cfg(all(target_os = "android", feature = "android"))]
    {
        let level = if debug { log::LevelFilter::Debug } else { log::LevelFilter::Warn };
        android_logger::init_once(android_logger::Config::default().with_max_level(level));
        return;
    }

    #[allow(unreachable_code)]
    {
        let filter = if debug { "tun2ray=debug" } else { "tun2ray=warn" };
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
            )
            .try_init();
    }
}

/// 平台侧写入的进程级状态（网络类型、SSID、资产目录）。
struct Platform {
    network_type: RwLock<String>,
    wifi_ssid: RwLock<String>,
    internal_assets: RwLock<String>,
    external_assets: RwLock<String>,
}

static PLATFORM: Platform = Platform {
    network_type: RwLock::new(String::new()),
    wifi_ssid: RwLock::new(String::new()),
    internal_assets: RwLock::new(String::new()),
    external_assets: RwLock::new(String::new()),
};

pub fn set_network_type(value: &str) {
    *PLATFORM.network_type.write().unwrap() = value.to_string();
}

pub fn network_type() -> String {
    PLATFORM.network_type.read().unwrap().clone()
}

pub fn set_wifi_ssid(value: &str) {
    *PLATFORM.wifi_ssid.write().unwrap() = value.to_string();
}

pub fn wifi_ssid() -> String {
    PLATFORM.wifi_ssid.read().unwrap().clone()
}

pub fn set_assets_paths(internal: &str, external: &str) {
    *PLATFORM.internal_assets.write().unwrap() = internal.to_string();
    *PLATFORM.external_assets.write().unwrap() = external.to_string();
}

pub fn internal_assets_path() -> String {
    PLATFORM.internal_assets.read().unwrap().clone()
}

pub fn external_assets_path() -> String {
    PLATFORM.external_assets.read().unwrap().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv6_mode_raw_values() {
        assert_eq!(Ipv6Mode::from_raw(0).unwrap(), Ipv6Mode::Disable);
        assert_eq!(Ipv6Mode::from_raw(2).unwrap(), Ipv6Mode::Prefer);
        assert!(Ipv6Mode::from_raw(9).is_err());
    }

    #[test]
    fn lookup_network_per_mode() {
        assert_eq!(Ipv6Mode::Disable.lookup_network(), "ip4");
        assert_eq!(Ipv6Mode::Only.lookup_network(), "ip6");
        assert_eq!(Ipv6Mode::Enable.lookup_network(), "ip");
        assert_eq!(Ipv6Mode::Prefer.lookup_network(), "ip");
    }

    #[test]
    fn implementation_raw_values() {
        assert_eq!(TunImplementation::from_raw(0).unwrap(), TunImplementation::Stack);
        assert_eq!(TunImplementation::from_raw(1).unwrap(), TunImplementation::System);
        assert!(TunImplementation::from_raw(5).is_err());
    }
}
