//! Product-category catalog
//!
//! Categories are managed by an external catalog service; the engine only
//! needs to know whether a category exists and how it is charged.

use crate::types::{ProductCategory, ProductCategoryId};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Lookup of chargeable product categories
pub trait ProductCatalog: Send + Sync {
    /// Resolve a category or fail with `UnknownCategory`
    fn category(&self, id: &ProductCategoryId) -> Result<ProductCategory>;

    /// All known categories
    fn categories(&self) -> Vec<ProductCategory>;
}

/// Catalog seeded from configuration, extendable at runtime
#[derive(Debug, Default)]
pub struct StaticCatalog {
    categories: RwLock<HashMap<ProductCategoryId, ProductCategory>>,
}

impl StaticCatalog {
    /// Create catalog from a list of categories
    pub fn new(categories: impl IntoIterator<Item = ProductCategory>) -> Self {
        let map = categories
            .into_iter()
            .map(|category| (category.id.clone(), category))
            .collect();
        Self {
            categories: RwLock::new(map),
        }
    }

    /// Add or replace a category
    pub fn register(&self, category: ProductCategory) {
        tracing::info!(category = %category.id, charge_type = ?category.charge_type, "Registered product category");
        self.categories.write().insert(category.id.clone(), category);
    }
}

impl ProductCatalog for StaticCatalog {
    fn category(&self, id: &ProductCategoryId) -> Result<ProductCategory> {
        self.categories
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownCategory(id.to_string()))
    }

    fn categories(&self) -> Vec<ProductCategory> {
        let mut all: Vec<_> = self.categories.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChargeType, ProductType};

    #[test]
    fn test_lookup_and_register() {
        let cpu = ProductCategory {
            id: ProductCategoryId::new("cpu", "hpc"),
            product_type: ProductType::Compute,
            charge_type: ChargeType::Absolute,
        };
        let catalog = StaticCatalog::new(vec![cpu.clone()]);
        assert_eq!(catalog.category(&cpu.id).unwrap(), cpu);

        let storage = ProductCategoryId::new("cephfs", "hpc");
        assert!(matches!(
            catalog.category(&storage),
            Err(Error::UnknownCategory(_))
        ));

        catalog.register(ProductCategory {
            id: storage.clone(),
            product_type: ProductType::Storage,
            charge_type: ChargeType::DifferentialQuota,
        });
        assert_eq!(catalog.categories().len(), 2);
        assert_eq!(
            catalog.category(&storage).unwrap().charge_type,
            ChargeType::DifferentialQuota
        );
    }
}
