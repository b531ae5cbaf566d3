//! tun2ray — 把移动端 TUN 设备桥接到可插拔代理核心的数据通路库。
//!
//! 两套互换的引擎落在同一张流表上：
//! - `nat`：轻量 NAT，ICMP 反射、UDP 头模板改写、TCP 反射给内核栈；
//! - `stack`：用户态栈，把包归约成 socket 级别的流。
//!
//! 代理核心（dispatcher）、本地 resolver、uid dumper、protector 都是
//! 外部协作方，契约见 `proxy` 模块。

pub mod app;
pub mod common;
pub mod config;
pub mod dns;
pub mod nat;
pub mod packet;
pub mod proxy;
pub mod stack;

pub use app::{Tun2ray, update_root_store};
pub use common::{Destination, Error, LruCache, Network, ResolveError, Result};
pub use config::{strip_json, Ipv6Mode, TunConfig, TunImplementation};
