//! Android JNI 桥接。
//!
//! 平台侧经 `io.tun2ray.core.Tun2RayCore` 写入进程级状态（网络类型、
//! SSID、资产目录）并启动 protect 服务。核心生命周期由宿主经 cdylib
//! 直接驱动，不在这里暴露。

#![cfg(all(target_os = "android", feature = "android"))]

use jni::objects::{JClass, JString};
use jni::sys::{jboolean, jstring, JNI_FALSE, JNI_TRUE};
use jni::JNIEnv;

use crate::config;

fn get_string(env: &mut JNIEnv, s: &JString) -> Option<String> {
    env.get_string(s).ok().map(|v| v.into())
}

#[no_mangle]
pub extern "system" fn Java_io_tun2ray_core_Tun2RayCore_setNetworkType(
    mut env: JNIEnv,
    _class: JClass,
    value: JString,
) {
    if let Some(value) = get_string(&mut env, &value) {
        config::set_network_type(&value);
    }
}

#[no_mangle]
pub extern "system" fn Java_io_tun2ray_core_Tun2RayCore_setWifiSsid(
    mut env: JNIEnv,
    _class: JClass,
    value: JString,
) {
    if let Some(value) = get_string(&mut env, &value) {
        config::set_wifi_ssid(&value);
    }
}

#[no_mangle]
pub extern "system" fn Java_io_tun2ray_core_Tun2RayCore_setAssetsPaths(
    mut env: JNIEnv,
    _class: JClass,
    internal: JString,
    external: JString,
) {
    let internal = get_string(&mut env, &internal).unwrap_or_default();
    let external = get_string(&mut env, &external).unwrap_or_default();
    config::set_assets_paths(&internal, &external);
}

#[no_mangle]
pub extern "system" fn Java_io_tun2ray_core_Tun2RayCore_updateRootStore(
    _env: JNIEnv,
    _class: JClass,
    use_system: jboolean,
) -> jboolean {
    match super::certs::update_root_store(use_system == JNI_TRUE) {
        Ok(()) => JNI_TRUE,
        Err(_) => JNI_FALSE,
    }
}

#[no_mangle]
pub extern "system" fn Java_io_tun2ray_core_Tun2RayCore_version(
    mut env: JNIEnv,
    _class: JClass,
) -> jstring {
    match env.new_string(env!("CARGO_PKG_VERSION")) {
        Ok(s) => s.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}
