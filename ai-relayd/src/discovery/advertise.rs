use mdns_sd::{ServiceDaemon, ServiceInfo};
use anyhow::{Context, Result};
use shared::protocol::TXT_VERSION;
use crate::config::AdvertiseConfig;

/// Announce a local inference backend so relays on the network can find it
pub fn register_backend(daemon: &ServiceDaemon, config: &AdvertiseConfig) -> Result<ServiceInfo> {
    let service_info = build_service_info(config)?;

    daemon
        .register(service_info.clone())
        .context("Failed to register mDNS service")?;

    tracing::info!(
        service_type = %config.service_type,
        instance = %config.instance,
        port = config.port,
        "Advertising inference backend"
    );

    Ok(service_info)
}

pub fn unregister_backend(daemon: &ServiceDaemon, service_info: &ServiceInfo) -> Result<()> {
    daemon
        .unregister(service_info.get_fullname())
        .context("Failed to unregister mDNS service")?;

    tracing::info!("Unregistered {}", service_info.get_fullname());
    Ok(())
}

fn build_service_info(config: &AdvertiseConfig) -> Result<ServiceInfo> {
    let hostname = hostname::get()
        .context("Failed to get system hostname")?
        .to_string_lossy()
        .to_string();
    let host = format!("{}.local.", hostname.trim_end_matches('.'));

    let mut properties = config.properties.clone();
    properties
        .entry(TXT_VERSION.to_string())
        .or_insert_with(|| env!("CARGO_PKG_VERSION").to_string());

    let service_info = match &config.address {
        Some(address) => ServiceInfo::new(
            &config.service_type,
            &config.instance,
            &host,
            address.as_str(),
            config.port,
            properties,
        ),
        None => ServiceInfo::new(
            &config.service_type,
            &config.instance,
            &host,
            (),
            config.port,
            properties,
        )
        .map(ServiceInfo::enable_addr_auto),
    }
    .context("Failed to create ServiceInfo")?;

    Ok(service_info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use shared::protocol::{AI_SERVICE_TYPE, TXT_MODEL};

    fn config(address: Option<&str>) -> AdvertiseConfig {
        AdvertiseConfig {
            instance: "laptop-1".to_string(),
            port: 11434,
            address: address.map(str::to_string),
            service_type: AI_SERVICE_TYPE.to_string(),
            properties: HashMap::from([(TXT_MODEL.to_string(), "llama3".to_string())]),
        }
    }

    #[test]
    fn test_service_info_with_fixed_address() {
        let info = build_service_info(&config(Some("192.168.1.10"))).unwrap();

        assert_eq!(info.get_fullname(), "laptop-1._ai._tcp.local.");
        assert_eq!(info.get_port(), 11434);
        assert!(info.get_addresses().contains(&"192.168.1.10".parse().unwrap()));
        assert_eq!(info.get_property_val_str(TXT_MODEL), Some("llama3"));
        assert_eq!(info.get_property_val_str(TXT_VERSION), Some(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_service_info_auto_address() {
        let info = build_service_info(&config(None)).unwrap();

        assert!(info.get_addresses().is_empty());
    }

    #[test]
    fn test_configured_version_not_overwritten() {
        let mut cfg = config(Some("192.168.1.10"));
        cfg.properties.insert(TXT_VERSION.to_string(), "custom".to_string());

        let info = build_service_info(&cfg).unwrap();
        assert_eq!(info.get_property_val_str(TXT_VERSION), Some("custom"));
    }
}
