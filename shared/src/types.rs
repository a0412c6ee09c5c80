use std::collections::HashMap;
use std::net::SocketAddr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// A discovered AI inference service.
/// This is the shape the relay daemon stores and returns from its listing API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Instance label assigned by the announcer, e.g. "laptop-1"
    pub name: String,

    /// Address and port the service accepts requests on
    pub endpoint: SocketAddr,

    /// TXT record key-value pairs, e.g. model=llama3
    #[serde(default)]
    pub properties: HashMap<String, String>,

    /// First time this service was seen
    pub first_seen: DateTime<Utc>,

    /// Last discovery event for this service
    pub last_seen: DateTime<Utc>,
}

impl ServiceRecord {
    pub fn new(name: impl Into<String>, endpoint: SocketAddr) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            endpoint,
            properties: HashMap::new(),
            first_seen: now,
            last_seen: now,
        }
    }

    pub fn with_properties(mut self, properties: HashMap<String, String>) -> Self {
        self.properties = properties;
        self
    }
}
