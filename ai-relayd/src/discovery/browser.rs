use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::Future;
use anyhow::{Context, Result};
use super::{DiscoveryHandler, Resolved, Resolver};

type RecvResult = (usize, flume::Receiver<ServiceEvent>, std::result::Result<ServiceEvent, flume::RecvError>);
type RecvFuture = Pin<Box<dyn Future<Output = RecvResult> + Send>>;

/// Each future owns a clone of the receiver so the set of pending receives can
/// live in one FuturesUnordered.
fn make_recv_future(idx: usize, rx: flume::Receiver<ServiceEvent>) -> RecvFuture {
    Box::pin(async move {
        let result = rx.recv_async().await;
        (idx, rx, result)
    })
}

/// Latest resolution the mDNS daemon delivered for each instance.
///
/// mdns-sd resolves instances itself and hands the result over in
/// `ServiceResolved`; the browser records it here and the listener resolves
/// against it.
#[derive(Debug, Default)]
pub struct ResolutionCache {
    entries: Mutex<HashMap<(String, String), Resolved>>,
}

impl ResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of a resolution. Returns whether the instance had a
    /// usable resolution before this one.
    pub(crate) fn record(&self, service_type: &str, instance: &str, resolved: Option<Resolved>) -> bool {
        let key = (service_type.to_string(), instance.to_string());
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match resolved {
            Some(resolved) => entries.insert(key, resolved).is_some(),
            None => entries.remove(&key).is_some(),
        }
    }

    fn forget(&self, service_type: &str, instance: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(service_type.to_string(), instance.to_string()));
    }

    /// Drop an instance's resolutions under every service type
    pub fn forget_instance(&self, instance: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(_, name), _| name != instance);
    }

    /// Another service type under which `instance` is still resolved
    fn other_type_for(&self, service_type: &str, instance: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|(ty, name)| name == instance && ty != service_type)
            .map(|(ty, _)| ty.clone())
            .min()
    }
}

impl Resolver for ResolutionCache {
    fn resolve(&self, service_type: &str, instance_name: &str) -> Option<Resolved> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(service_type.to_string(), instance_name.to_string()))
            .cloned()
    }
}

pub async fn run_browser(
    daemon: ServiceDaemon,
    service_types: Vec<String>,
    handler: Arc<dyn DiscoveryHandler>,
    cache: Arc<ResolutionCache>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut type_futures: FuturesUnordered<RecvFuture> = FuturesUnordered::new();

    for (idx, service_type) in service_types.iter().enumerate() {
        let receiver = daemon
            .browse(service_type)
            .with_context(|| format!("Failed to browse {}", service_type))?;
        tracing::info!(service_type = %service_type, "Browsing for services");
        type_futures.push(make_recv_future(idx, receiver));
    }

    loop {
        tokio::select! {
            Some((idx, rx, result)) = type_futures.next() => {
                match result {
                    Ok(event) => {
                        handle_event(&cache, handler.as_ref(), event);
                        type_futures.push(make_recv_future(idx, rx));
                    }
                    Err(e) => {
                        tracing::warn!(
                            service_type = %service_types[idx],
                            "Browse receiver disconnected: {}",
                            e
                        );
                    }
                }
            }

            _ = cancel.cancelled() => {
                tracing::info!("mDNS browser shutting down");
                break;
            }
        }
    }

    for service_type in &service_types {
        if let Err(e) = daemon.stop_browse(service_type) {
            tracing::debug!(service_type = %service_type, "Failed to stop browse: {}", e);
        }
    }

    Ok(())
}

/// Translate one mdns-sd event into listener calls
fn handle_event(cache: &ResolutionCache, handler: &dyn DiscoveryHandler, event: ServiceEvent) {
    match event {
        ServiceEvent::ServiceFound(service_type, fullname) => {
            tracing::debug!(service_type = %service_type, "Found {}, awaiting resolution", fullname);
        }
        ServiceEvent::ServiceResolved(info) => {
            let service_type = info.get_type();
            let instance = instance_label(info.get_fullname(), service_type);
            let known = cache.record(service_type, instance, resolve_info(&info));
            if known {
                handler.on_service_updated(service_type, instance);
            } else {
                handler.on_service_added(service_type, instance);
            }
        }
        ServiceEvent::ServiceRemoved(service_type, fullname) => {
            let instance = instance_label(&fullname, &service_type);
            cache.forget(&service_type, instance);
            // The registry is keyed by label; a goodbye under one type must not
            // drop an instance still announced under another.
            match cache.other_type_for(&service_type, instance) {
                Some(remaining) => handler.on_service_updated(&remaining, instance),
                None => handler.on_service_removed(&service_type, instance),
            }
        }
        _ => {}
    }
}

/// Instance label from a DNS-SD full name:
/// "laptop-1._ai._tcp.local." under "_ai._tcp.local." is "laptop-1".
pub fn instance_label<'a>(fullname: &'a str, service_type: &str) -> &'a str {
    fullname
        .strip_suffix(service_type)
        .and_then(|rest| rest.strip_suffix('.'))
        .filter(|label| !label.is_empty())
        .unwrap_or(fullname)
}

/// Endpoint and TXT properties of a resolved announcement, if it is usable
fn resolve_info(info: &ServiceInfo) -> Option<Resolved> {
    if info.get_port() == 0 {
        tracing::debug!("Skipping {}: no port", info.get_fullname());
        return None;
    }

    let Some(ip) = pick_address(info.get_addresses().iter().copied()) else {
        tracing::debug!("Skipping {}: no addresses", info.get_fullname());
        return None;
    };

    let properties = info
        .get_properties()
        .iter()
        .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
        .collect();

    Some(Resolved {
        endpoint: SocketAddr::new(ip, info.get_port()),
        properties,
    })
}

/// Prefer IPv4, which needs no scope id to be reachable; lowest address wins
/// so repeated resolutions pick the same one.
fn pick_address(addresses: impl IntoIterator<Item = IpAddr>) -> Option<IpAddr> {
    addresses
        .into_iter()
        .filter(|ip| !ip.is_unspecified())
        .min_by_key(|ip| (ip.is_ipv6(), *ip))
}
