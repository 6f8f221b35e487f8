use std::sync::OnceLock;

use clipsync_core::derive_device_id;

static LOCAL_DEVICE_ID: OnceLock<String> = OnceLock::new();

/// Identifier of this device, computed once per process.
pub fn local_device_id() -> &'static str {
    LOCAL_DEVICE_ID.get_or_init(|| {
        let host = std::env::var("COMPUTERNAME")
            .ok()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|name| name.trim().to_owned())
            })
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "unknown-host".to_owned());
        let user = std::env::var("USERNAME")
            .ok()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "unknown-user".to_owned());
        derive_device_id(&host, &user)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_device_id_is_cached() {
        let first = local_device_id();
        assert!(!first.is_empty());
        assert!(std::ptr::eq(first, local_device_id()));
    }
}
