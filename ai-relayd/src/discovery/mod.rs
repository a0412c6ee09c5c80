pub mod advertise;
pub mod browser;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use shared::types::ServiceRecord;
use crate::registry::ServiceRegistry;

/// Receives service announcements from a discovery mechanism.
///
/// Handlers may run concurrently with each other and with registry readers.
pub trait DiscoveryHandler: Send + Sync {
    fn on_service_added(&self, service_type: &str, instance_name: &str);
    fn on_service_updated(&self, service_type: &str, instance_name: &str);
    fn on_service_removed(&self, service_type: &str, instance_name: &str);
}

/// Address and metadata for an announced instance
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub endpoint: SocketAddr,
    pub properties: HashMap<String, String>,
}

/// Turns an instance name into something the relay can connect to
pub trait Resolver: Send + Sync {
    fn resolve(&self, service_type: &str, instance_name: &str) -> Option<Resolved>;
}

impl<R: Resolver + ?Sized> Resolver for Arc<R> {
    fn resolve(&self, service_type: &str, instance_name: &str) -> Option<Resolved> {
        (**self).resolve(service_type, instance_name)
    }
}

/// Applies discovery events to the registry
pub struct RegistryListener<R> {
    registry: Arc<ServiceRegistry>,
    resolver: R,
}

impl<R: Resolver> RegistryListener<R> {
    pub fn new(registry: Arc<ServiceRegistry>, resolver: R) -> Self {
        Self { registry, resolver }
    }

    fn resolve_and_upsert(&self, service_type: &str, instance_name: &str) {
        // Unresolvable instances are dropped; a later announcement or an
        // explicit removal settles their state.
        let Some(resolved) = self.resolver.resolve(service_type, instance_name) else {
            tracing::debug!(
                service_type,
                instance = instance_name,
                "Dropping unresolvable service event"
            );
            return;
        };

        tracing::info!(
            service_type,
            instance = instance_name,
            endpoint = %resolved.endpoint,
            "Service available"
        );
        self.registry.upsert_record(
            ServiceRecord::new(instance_name, resolved.endpoint)
                .with_properties(resolved.properties),
        );
    }
}

impl<R: Resolver> DiscoveryHandler for RegistryListener<R> {
    fn on_service_added(&self, service_type: &str, instance_name: &str) {
        self.resolve_and_upsert(service_type, instance_name);
    }

    fn on_service_updated(&self, service_type: &str, instance_name: &str) {
        self.resolve_and_upsert(service_type, instance_name);
    }

    fn on_service_removed(&self, service_type: &str, instance_name: &str) {
        if self.registry.remove(instance_name) {
            tracing::info!(service_type, instance = instance_name, "Service removed");
        } else {
            tracing::debug!(service_type, instance = instance_name, "Removal for unknown service");
        }
    }
}
