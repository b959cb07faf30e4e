use arc_swap::ArcSwap;
use cyder_tools::log::info;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use super::cache::types::{CacheGroup, CacheModelPrice};
use super::ledger::PriceData;
use super::registry::AUTO_GROUP;
use super::store::{Store, StoreError};
use crate::config::RelayConfig;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PricingError {
    #[error("model {0} has no configured price")]
    UnpricedModel(String),
    #[error("group {0} does not exist")]
    UnknownGroup(String),
}

#[derive(Debug, Default)]
struct Tables {
    groups: HashMap<String, CacheGroup>,
    prices: HashMap<String, CacheModelPrice>,
}

/// Group ratios and model prices, swapped as a whole on refresh.
#[derive(Default)]
pub struct PriceTable {
    tables: ArcSwap<Tables>,
}

impl PriceTable {
    pub fn new(groups: Vec<CacheGroup>, prices: Vec<CacheModelPrice>) -> Self {
        let table = Self::default();
        table.load(groups, prices);
        table
    }

    pub fn load(&self, groups: Vec<CacheGroup>, prices: Vec<CacheModelPrice>) {
        let tables = Tables {
            groups: groups.into_iter().map(|g| (g.name.clone(), g)).collect(),
            prices: prices.into_iter().map(|p| (p.model_name.clone(), p)).collect(),
        };
        self.tables.store(Arc::new(tables));
    }

    pub async fn refresh(&self, store: &dyn Store) -> Result<(), StoreError> {
        let groups = store.list_groups().await?;
        let prices = store.list_model_prices().await?;
        info!("Price table refreshed: {} groups, {} model prices", groups.len(), prices.len());
        self.load(groups, prices);
        Ok(())
    }

    pub fn group_exists(&self, name: &str) -> bool {
        self.tables.load().groups.contains_key(name)
    }

    /// Groups a user may select on a token: every usable group plus their own.
    pub fn is_usable_by(&self, group: &str, user_group: &str) -> bool {
        if group == AUTO_GROUP || group == user_group {
            return true;
        }
        self.tables.load().groups.get(group).is_some_and(|g| g.usable)
    }

    /// Builds the price shape for `model` billed under `group`.
    pub fn price_data(&self, model: &str, group: &str, relay: &RelayConfig) -> Result<PriceData, PricingError> {
        let tables = self.tables.load();
        let group_ratio = tables
            .groups
            .get(group)
            .map(|g| g.ratio)
            .ok_or_else(|| PricingError::UnknownGroup(group.to_string()))?;

        let price = match tables.prices.get(model) {
            Some(price) => price.clone(),
            None => match relay.unpriced_model_ratio {
                Some(ratio) => CacheModelPrice {
                    model_name: model.to_string(),
                    model_ratio: ratio,
                    completion_ratio: 1.0,
                    cache_ratio: 1.0,
                    model_price: None,
                },
                None => return Err(PricingError::UnpricedModel(model.to_string())),
            },
        };

        let use_price = price.model_price.is_some();
        let model_price = price.model_price.unwrap_or(0.0);
        let free_model = if use_price { model_price <= 0.0 } else { price.model_ratio <= 0.0 };
        Ok(PriceData {
            use_price,
            model_ratio: price.model_ratio,
            completion_ratio: price.completion_ratio,
            cache_ratio: price.cache_ratio,
            group_ratio,
            model_price,
            free_model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PriceTable {
        PriceTable::new(
            vec![
                CacheGroup { name: "g_default".into(), ratio: 1.0, description: String::new(), usable: true },
                CacheGroup { name: "vip".into(), ratio: 0.5, description: String::new(), usable: false },
            ],
            vec![
                CacheModelPrice { model_name: "m".into(), model_ratio: 1.0, completion_ratio: 2.0, cache_ratio: 0.1, model_price: None },
                CacheModelPrice { model_name: "mj_imagine".into(), model_ratio: 0.0, completion_ratio: 1.0, cache_ratio: 1.0, model_price: Some(0.02) },
            ],
        )
    }

    #[test]
    fn test_price_data_for_ratio_and_per_call_models() {
        let table = table();
        let relay = RelayConfig::default();

        let ratio = table.price_data("m", "vip", &relay).unwrap();
        assert!(!ratio.use_price);
        assert_eq!(ratio.group_ratio, 0.5);
        assert_eq!(ratio.completion_ratio, 2.0);
        assert!(!ratio.free_model);

        let per_call = table.price_data("mj_imagine", "g_default", &relay).unwrap();
        assert!(per_call.use_price);
        assert!(!per_call.free_model);
    }

    #[test]
    fn test_unpriced_and_unknown_group() {
        let table = table();
        let mut relay = RelayConfig::default();
        assert_eq!(
            table.price_data("x", "g_default", &relay),
            Err(PricingError::UnpricedModel("x".into()))
        );
        relay.unpriced_model_ratio = Some(0.0);
        assert!(table.price_data("x", "g_default", &relay).unwrap().free_model);
        assert_eq!(
            table.price_data("m", "nope", &relay),
            Err(PricingError::UnknownGroup("nope".into()))
        );
    }

    #[test]
    fn test_group_usability() {
        let table = table();
        assert!(table.is_usable_by("g_default", "vip"));
        assert!(table.is_usable_by("vip", "vip"));
        assert!(!table.is_usable_by("vip", "g_default"));
        assert!(table.is_usable_by("auto", "g_default"));
    }
}
