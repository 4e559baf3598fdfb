use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use crate::ids::PlanId;
use crate::quota::Allowance;

/// Plan catalog file contents
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogFile {
    /// Purchasable plans
    pub plans: Vec<Plan>,
}

/// A purchasable bundle of data and/or time allowance
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Plan {
    /// Unique identifier
    pub id: PlanId,

    /// Display name
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Data allowance in bytes
    pub data: Allowance,

    /// Time allowance in seconds
    pub time: Allowance,

    /// Price in minor currency units
    #[serde(default)]
    pub price_cents: u64,

    /// Days the plan is advertised as valid for
    #[serde(default = "default_validity_days")]
    pub validity_days: u32,

    /// Inactive plans stay readable but cannot be issued
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_validity_days() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

/// Read-only catalog of plans, shared by the ledger and the engine
#[derive(Debug, Clone, Default)]
pub struct PlanCatalog {
    plans: Arc<HashMap<PlanId, Arc<Plan>>>,
    order: Arc<Vec<PlanId>>,
}

impl PlanCatalog {
    /// Build a catalog, validating the plan definitions
    pub fn new(plans: Vec<Plan>) -> Result<Self> {
        validate_plans(&plans)?;

        let order = plans.iter().map(|p| p.id.clone()).collect();
        let plans = plans
            .into_iter()
            .map(|p| (p.id.clone(), Arc::new(p)))
            .collect();

        Ok(Self {
            plans: Arc::new(plans),
            order: Arc::new(order),
        })
    }

    /// Look up a plan by id
    pub fn get(&self, id: &PlanId) -> Option<Arc<Plan>> {
        self.plans.get(id).cloned()
    }

    /// All plans in catalog order
    pub fn plans(&self) -> Vec<Arc<Plan>> {
        self.order
            .iter()
            .filter_map(|id| self.plans.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

/// Load and validate the plan catalog from a YAML file
pub fn load_catalog(path: &Path) -> Result<PlanCatalog> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan catalog: {}", path.display()))?;

    let file: CatalogFile = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse plan catalog: {}", path.display()))?;

    PlanCatalog::new(file.plans)
        .with_context(|| format!("Invalid plan catalog: {}", path.display()))
}

/// Validate plan definitions
pub fn validate_plans(plans: &[Plan]) -> Result<()> {
    if plans.is_empty() {
        anyhow::bail!("Catalog must define at least one plan");
    }

    let mut seen = HashSet::new();
    for plan in plans {
        if !seen.insert(&plan.id) {
            anyhow::bail!("Duplicate plan ID: {}", plan.id);
        }

        validate_plan(plan).with_context(|| format!("Invalid plan '{}'", plan.id))?;
    }

    Ok(())
}

fn validate_plan(plan: &Plan) -> Result<()> {
    if plan.id.as_str().trim().is_empty() {
        anyhow::bail!("Plan ID cannot be empty");
    }

    if plan.name.trim().is_empty() {
        anyhow::bail!("Plan name cannot be empty");
    }

    // A plan must grant something a session can run on
    if plan.data.is_exhausted() && plan.time.is_exhausted() {
        anyhow::bail!("Plan grants neither data nor time");
    }

    Ok(())
}

/// Example catalog file content
pub const EXAMPLE_CATALOG: &str = include_str!("../example-plans.yaml");

#[cfg(test)]
mod tests {
    use super::*;

    fn make_plan(id: &str, data: Allowance, time: Allowance) -> Plan {
        Plan {
            id: PlanId::from(id),
            name: format!("Plan {}", id),
            description: String::new(),
            data,
            time,
            price_cents: 500,
            validity_days: 30,
            active: true,
        }
    }

    #[test]
    fn example_catalog_is_valid() {
        let file: CatalogFile = serde_yaml::from_str(EXAMPLE_CATALOG).unwrap();
        let catalog = PlanCatalog::new(file.plans).unwrap();
        assert!(!catalog.is_empty());
    }

    #[test]
    fn parses_unlimited_allowances() {
        let yaml = r#"
plans:
  - id: day-pass
    name: Day Pass
    data: unlimited
    time: 86400
    price_cents: 250
"#;
        let file: CatalogFile = serde_yaml::from_str(yaml).unwrap();
        let plan = &file.plans[0];
        assert_eq!(plan.data, Allowance::Unlimited);
        assert_eq!(plan.time, Allowance::Limited(86400));
        assert!(plan.active);
        assert_eq!(plan.validity_days, 30);
    }

    #[test]
    fn catalog_preserves_order() {
        let catalog = PlanCatalog::new(vec![
            make_plan("b", Allowance::Limited(1), Allowance::Unlimited),
            make_plan("a", Allowance::Limited(1), Allowance::Unlimited),
        ])
        .unwrap();

        let ids: Vec<_> = catalog.plans().iter().map(|p| p.id.to_string()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(catalog.get(&PlanId::from("a")).is_some());
        assert!(catalog.get(&PlanId::from("zzz")).is_none());
    }

    #[test]
    fn test_validate_requires_plans() {
        assert!(PlanCatalog::new(vec![]).is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let plan = make_plan("p1", Allowance::Limited(1), Allowance::Limited(1));
        assert!(PlanCatalog::new(vec![plan.clone(), plan]).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_plan() {
        let plan = make_plan("p1", Allowance::ZERO, Allowance::ZERO);
        assert!(PlanCatalog::new(vec![plan]).is_err());
    }

    #[test]
    fn test_validate_rejects_blank_name() {
        let mut plan = make_plan("p1", Allowance::Limited(1), Allowance::Limited(1));
        plan.name = "  ".to_string();
        assert!(PlanCatalog::new(vec![plan]).is_err());
    }

    #[test]
    fn load_catalog_from_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("plans.yaml");
        std::fs::write(&path, EXAMPLE_CATALOG).unwrap();

        let catalog = load_catalog(&path).unwrap();
        assert!(catalog.len() >= 1);
    }
}
