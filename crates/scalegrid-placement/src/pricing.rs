//! Instance pricing and resource normalization weights.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use scalegrid_state::{CPU, GIB, MEMORY, ResourceList};

use crate::error::{ScoreError, ScoreResult};

/// Resource name → weight of one normalized unit.
pub type ResourceWeightMap = BTreeMap<String, f64>;

/// Source of hourly instance prices.
pub trait InstancePricingAccess: Send + Sync {
    fn hourly_price(&self, region: &str, instance_type: &str) -> ScoreResult<f64>;
}

/// Source of per-instance-type normalization weights.
pub trait ResourceWeights: Send + Sync {
    fn weights(&self, instance_type: &str) -> &ResourceWeightMap;
}

/// One row of a pricing table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstancePrice {
    pub region: String,
    pub instance_type: String,
    pub hourly_price: f64,
}

/// In-memory pricing table keyed by `(region, instance_type)`.
#[derive(Debug, Clone, Default)]
pub struct StaticPricing {
    prices: HashMap<(String, String), f64>,
}

impl StaticPricing {
    pub fn from_prices(prices: impl IntoIterator<Item = InstancePrice>) -> ScoreResult<Self> {
        let mut table = HashMap::new();
        for p in prices {
            if !p.hourly_price.is_finite() || p.hourly_price <= 0.0 {
                return Err(ScoreError::InvalidPrice {
                    instance_type: p.instance_type,
                    price: p.hourly_price,
                });
            }
            table.insert((p.region, p.instance_type), p.hourly_price);
        }
        debug!(entries = table.len(), "pricing table loaded");
        Ok(Self { prices: table })
    }

    /// Parse a JSON array of [`InstancePrice`] rows.
    pub fn from_json(json: &str) -> ScoreResult<Self> {
        let rows: Vec<InstancePrice> =
            serde_json::from_str(json).map_err(|e| ScoreError::InvalidPricing(e.to_string()))?;
        Self::from_prices(rows)
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

impl InstancePricingAccess for StaticPricing {
    fn hourly_price(&self, region: &str, instance_type: &str) -> ScoreResult<f64> {
        self.prices
            .get(&(region.to_string(), instance_type.to_string()))
            .copied()
            .ok_or_else(|| ScoreError::PriceNotFound {
                region: region.to_string(),
                instance_type: instance_type.to_string(),
            })
    }
}

/// Default weights plus per-instance-type overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightTable {
    #[serde(default = "default_weights")]
    pub default: ResourceWeightMap,
    #[serde(default)]
    pub instance_types: HashMap<String, ResourceWeightMap>,
}

/// One core weighs as much as 8 GiB of memory; one GPU as 20 cores.
fn default_weights() -> ResourceWeightMap {
    BTreeMap::from([
        (CPU.to_string(), 1.0),
        (MEMORY.to_string(), 0.125),
        ("nvidia.com/gpu".to_string(), 20.0),
    ])
}

impl Default for WeightTable {
    fn default() -> Self {
        Self {
            default: default_weights(),
            instance_types: HashMap::new(),
        }
    }
}

impl ResourceWeights for WeightTable {
    fn weights(&self, instance_type: &str) -> &ResourceWeightMap {
        self.instance_types
            .get(instance_type)
            .unwrap_or(&self.default)
    }
}

/// Weighted sum of `resources`: cpu counted in cores, memory in GiB, the
/// rest as plain counts. Resources without a weight contribute nothing.
pub fn normalized_units(resources: &ResourceList, weights: &ResourceWeightMap) -> f64 {
    resources
        .iter()
        .filter_map(|(name, amount)| {
            let weight = weights.get(name)?;
            let amount = match name {
                CPU => amount as f64 / 1000.0,
                MEMORY => amount as f64 / GIB as f64,
                _ => amount as f64,
            };
            Some(weight * amount)
        })
        .sum()
}
