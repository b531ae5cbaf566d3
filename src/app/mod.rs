#[cfg(all(target_os = "android", feature = "android"))]
pub mod android;
pub mod certs;
pub mod dialer;
pub mod protect;
pub mod stats;
pub mod tun2ray;

pub use certs::update_root_store;
pub use dialer::{ProtectedDialer, SystemDialer};
pub use stats::{AppStats, AppStatsSnapshot, ConnectionRegistry};
pub use tun2ray::Tun2ray;

#[cfg(unix)]
pub use protect::{serve_protect, ProtectServer};
