//! 根证书库切换。
//!
//! `use_system = true` 走系统信任库（本层不持有任何根）；否则从内部资产
//! 目录的 Mozilla 根证书包加载，文件缺失或为空时退回 webpki-roots 内置
//! 集合。setter 幂等，反复切换收敛到最后一次的状态。

use std::path::Path;
use std::sync::{Arc, RwLock};

use rustls::RootCertStore;
use tracing::{debug, warn};

use crate::common::Result;
use crate::config::internal_assets_path;

pub const MOZILLA_INCLUDED_PEM: &str = "mozilla_included.pem";

static ROOT_STORE: RwLock<Option<Arc<RootCertStore>>> = RwLock::new(None);

/// 当前生效的替换根库。None 表示使用系统信任库。
pub fn root_store() -> Option<Arc<RootCertStore>> {
    ROOT_STORE.read().unwrap().clone()
}

pub fn update_root_store(use_system: bool) -> Result<()> {
    if use_system {
        *ROOT_STORE.write().unwrap() = None;
        return Ok(());
    }

    let mut store = RootCertStore::empty();

    let bundle = Path::new(&internal_assets_path()).join(MOZILLA_INCLUDED_PEM);
    match std::fs::read(&bundle) {
        Ok(pem) => {
            let mut pem_slice = pem.as_slice();
            let certs = rustls_pemfile::certs(&mut pem_slice).filter_map(|c| c.ok());
            let (added, ignored) = store.add_parsable_certificates(certs);
            debug!(added = added, ignored = ignored, path = %bundle.display(), "loaded root bundle");
        }
        Err(e) => {
            warn!(path = %bundle.display(), error = %e, "root bundle unreadable, falling back to built-in roots");
        }
    }

    if store.is_empty() {
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    *ROOT_STORE.write().unwrap() = Some(Arc::new(store));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggling_is_idempotent_and_convergent() {
        update_root_store(false).unwrap();
        let replaced = root_store().expect("replacement store installed");
        assert!(!replaced.is_empty());

        // 再切一次不应叠加或报错
        update_root_store(false).unwrap();
        assert!(!root_store().unwrap().is_empty());

        update_root_store(true).unwrap();
        assert!(root_store().is_none());
        update_root_store(true).unwrap();
        assert!(root_store().is_none());
    }
}
