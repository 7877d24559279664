//! Backend descriptor store
//!
//! Immutable lookup table of backend instances, built once from static
//! configuration. Building fails if any descriptor is malformed, which aborts
//! coordinator startup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use switchyard_common::config::{BackendConfig, DeviceGroupConfig, LaunchConfig, ThroughputClass};
use switchyard_common::error::{Result, SwitchyardError};
use tracing::info;

/// Static description of one backend instance
#[derive(Debug, Clone, PartialEq)]
pub struct BackendDescriptor {
    pub id: String,
    pub endpoint: String,
    pub device_group: String,
    /// Devices of the backend's device group
    pub devices: Vec<u32>,
    pub max_context_tokens: u64,
    pub specializations: Vec<String>,
    pub throughput_class: ThroughputClass,
    pub aliases: Vec<String>,
    pub launch: Option<LaunchConfig>,
    /// Overrides the supervisor's default startup wait
    pub startup_timeout: Option<Duration>,
}

impl BackendDescriptor {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.specializations.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    /// Whether a request of `tokens` fits the backend's context window
    pub fn fits(&self, tokens: u64) -> bool {
        self.max_context_tokens >= tokens
    }

    /// Whether the supervisor launches this backend itself
    pub fn is_managed(&self) -> bool {
        self.launch.is_some()
    }
}

/// Read-only descriptor table
#[derive(Debug, Default)]
pub struct DescriptorStore {
    /// Descriptors in configuration order
    ordered: Vec<Arc<BackendDescriptor>>,

    by_id: HashMap<String, Arc<BackendDescriptor>>,

    /// Alias (lowercased) to backend id
    aliases: HashMap<String, String>,
}

impl DescriptorStore {
    /// Build the store, failing fast on malformed descriptors
    pub fn from_config(groups: &[DeviceGroupConfig], backends: &[BackendConfig]) -> Result<Self> {
        let groups: HashMap<&str, &DeviceGroupConfig> =
            groups.iter().map(|g| (g.id.as_str(), g)).collect();

        let mut store = DescriptorStore::default();

        for backend in backends {
            if backend.id.trim().is_empty() {
                return Err(SwitchyardError::config("Backend id must not be empty"));
            }
            if backend.endpoint.trim().is_empty() {
                return Err(SwitchyardError::config(format!(
                    "Backend {} has an empty endpoint",
                    backend.id
                )));
            }
            let group = groups.get(backend.device_group.as_str()).ok_or_else(|| {
                SwitchyardError::config(format!(
                    "Backend {} references unknown device group {}",
                    backend.id, backend.device_group
                ))
            })?;
            if backend.max_context_tokens <= 0 {
                return Err(SwitchyardError::config(format!(
                    "Backend {} declares invalid max context length {}",
                    backend.id, backend.max_context_tokens
                )));
            }
            if store.by_id.contains_key(&backend.id) {
                return Err(SwitchyardError::config(format!("Duplicate backend id: {}", backend.id)));
            }

            let descriptor = Arc::new(BackendDescriptor {
                id: backend.id.clone(),
                endpoint: backend.endpoint.trim_end_matches('/').to_string(),
                device_group: backend.device_group.clone(),
                devices: group.devices.clone(),
                max_context_tokens: backend.max_context_tokens as u64,
                specializations: backend.specializations.clone(),
                throughput_class: backend.throughput_class,
                aliases: backend.aliases.clone(),
                launch: backend.launch.clone(),
                startup_timeout: backend.startup_timeout_secs.map(Duration::from_secs),
            });

            store.by_id.insert(descriptor.id.clone(), descriptor.clone());
            store.ordered.push(descriptor);
        }

        for descriptor in &store.ordered {
            for alias in &descriptor.aliases {
                let key = alias.to_lowercase();
                if store.by_id.contains_key(alias) || store.aliases.contains_key(&key) {
                    return Err(SwitchyardError::config(format!(
                        "Alias {} of backend {} is ambiguous",
                        alias, descriptor.id
                    )));
                }
                store.aliases.insert(key, descriptor.id.clone());
            }
        }

        info!("Loaded {} backend descriptors", store.ordered.len());
        Ok(store)
    }

    /// All descriptors, in configuration order
    pub fn all(&self) -> &[Arc<BackendDescriptor>] {
        &self.ordered
    }

    pub fn get(&self, id: &str) -> Option<&Arc<BackendDescriptor>> {
        self.by_id.get(id)
    }

    /// Look up by id or alias (aliases match case-insensitively)
    pub fn resolve(&self, name: &str) -> Option<&Arc<BackendDescriptor>> {
        let name = name.trim();
        self.by_id.get(name).or_else(|| {
            self.aliases
                .get(&name.to_lowercase())
                .and_then(|id| self.by_id.get(id))
        })
    }

    /// Descriptors carrying a specialization tag
    pub fn with_tag(&self, tag: &str) -> Vec<Arc<BackendDescriptor>> {
        self.ordered.iter().filter(|d| d.has_tag(tag)).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}
