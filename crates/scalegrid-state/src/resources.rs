//! Resource lists: named, signed quantities.
//!
//! Canonical units: `cpu` in millicores, `memory` in bytes, everything else
//! (extended resources such as `nvidia.com/gpu`) as plain counts. Amounts
//! are signed so that waste computations can go negative.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// CPU in millicores.
pub const CPU: &str = "cpu";

/// Memory in bytes.
pub const MEMORY: &str = "memory";

/// One gibibyte in bytes.
pub const GIB: i64 = 1024 * 1024 * 1024;

/// An ordered map of resource name to quantity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceList(BTreeMap<String, i64>);

impl ResourceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, name: &str, amount: i64) -> Self {
        self.set(name, amount);
        self
    }

    /// Shorthand for a cpu/memory pair (`cpu` in cores, `memory` in GiB).
    pub fn cpu_mem(cores: i64, memory_gib: i64) -> Self {
        Self::new()
            .with(CPU, cores * 1000)
            .with(MEMORY, memory_gib * GIB)
    }

    pub fn get(&self, name: &str) -> i64 {
        self.0.get(name).copied().unwrap_or(0)
    }

    pub fn set(&mut self, name: &str, amount: i64) {
        self.0.insert(name.to_string(), amount);
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|v| *v == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Add every quantity of `other` to `self`.
    pub fn add(&mut self, other: &ResourceList) {
        for (name, amount) in other.iter() {
            *self.0.entry(name.to_string()).or_insert(0) += amount;
        }
    }

    /// `self - other`, with every resulting quantity floored at zero.
    pub fn saturating_sub(&self, other: &ResourceList) -> ResourceList {
        let mut out = self.clone();
        for (name, amount) in other.iter() {
            let entry = out.0.entry(name.to_string()).or_insert(0);
            *entry = (*entry - amount).max(0);
        }
        out
    }

    /// `self - other`, quantities may go negative.
    pub fn signed_sub(&self, other: &ResourceList) -> ResourceList {
        let mut out = self.clone();
        for (name, amount) in other.iter() {
            *out.0.entry(name.to_string()).or_insert(0) -= amount;
        }
        out
    }

    /// True if every positive quantity in `request` is available in `self`.
    pub fn covers(&self, request: &ResourceList) -> bool {
        request
            .iter()
            .filter(|(_, amount)| *amount > 0)
            .all(|(name, amount)| self.get(name) >= amount)
    }

    /// Sum a sequence of resource lists.
    pub fn sum<'a>(lists: impl IntoIterator<Item = &'a ResourceList>) -> ResourceList {
        let mut total = ResourceList::new();
        for list in lists {
            total.add(list);
        }
        total
    }
}
