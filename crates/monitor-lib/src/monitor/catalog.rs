//! Instance type → vCPU lookup owned by the monitor

use crate::models::InstanceType;
use dashmap::DashMap;
use tracing::debug;

/// vCPU count assumed for unknown instance types
pub const DEFAULT_VCPUS: u32 = 1;

/// In-memory catalog refreshed whenever the instance type feed emits
#[derive(Debug, Default)]
pub struct InstanceTypeCatalog {
    vcpus: DashMap<String, u32>,
}

impl InstanceTypeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the catalog contents with a fresh feed snapshot
    pub fn update_instance_types(&self, types: Vec<InstanceType>) {
        self.vcpus.clear();
        for instance in types {
            if instance.vcpus == 0 {
                debug!(instance_type = %instance.name, "Ignoring instance type without vCPUs");
                continue;
            }
            self.vcpus.insert(instance.name, instance.vcpus);
        }
        debug!(count = self.vcpus.len(), "Instance type catalog updated");
    }

    pub fn vcpus_for(&self, instance_type: Option<&str>) -> u32 {
        instance_type
            .and_then(|name| self.vcpus.get(name).map(|entry| *entry.value()))
            .unwrap_or(DEFAULT_VCPUS)
    }

    pub fn len(&self) -> usize {
        self.vcpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vcpus.is_empty()
    }
}
