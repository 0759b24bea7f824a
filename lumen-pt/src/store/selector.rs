//! Tier selector
//!
//! Maps a commitment tier to the store for its partition. Selection is pure:
//! the stores are built once up front and handed out by reference count.

use super::{SqliteProgressStore, StoreHandle};
use lumen_common::{Error, Result, Tier};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;

/// Holds one store per tier
#[derive(Clone)]
pub struct TierSelector {
    stores: HashMap<Tier, StoreHandle>,
    default_tier: Tier,
}

impl TierSelector {
    /// SQLite stores for all four tiers over one pool
    pub fn sqlite(pool: SqlitePool, default_tier: Tier) -> Self {
        let stores = Tier::ALL
            .iter()
            .map(|&tier| {
                let store: StoreHandle = Arc::new(SqliteProgressStore::new(pool.clone(), tier));
                (tier, store)
            })
            .collect();

        Self {
            stores,
            default_tier,
        }
    }

    /// Build from arbitrary stores; every tier must be covered exactly once
    pub fn from_stores(
        stores: impl IntoIterator<Item = StoreHandle>,
        default_tier: Tier,
    ) -> Result<Self> {
        let mut map = HashMap::new();
        for store in stores {
            let tier = store.tier();
            if map.insert(tier, store).is_some() {
                return Err(Error::Config(format!("duplicate store for '{}' tier", tier)));
            }
        }
        if let Some(missing) = Tier::ALL.iter().find(|t| !map.contains_key(t)) {
            return Err(Error::Config(format!("no store for '{}' tier", missing)));
        }

        Ok(Self {
            stores: map,
            default_tier,
        })
    }

    pub fn default_tier(&self) -> Tier {
        self.default_tier
    }

    /// Store for a known tier
    pub fn select_store(&self, tier: Tier) -> StoreHandle {
        // Constructors guarantee every tier is present
        Arc::clone(&self.stores[&tier])
    }

    /// Store for a raw tier value; unknown values are [`Error::InvalidTier`]
    pub fn select(&self, raw: &str) -> Result<StoreHandle> {
        let tier: Tier = raw.parse()?;
        Ok(self.select_store(tier))
    }

    /// Tier for a raw value, falling back to the default tier
    pub fn resolve(&self, raw: Option<&str>) -> Tier {
        Tier::parse_or(raw, self.default_tier)
    }

    /// Store for a raw value, falling back to the default tier
    pub fn select_or_default(&self, raw: Option<&str>) -> StoreHandle {
        self.select_store(self.resolve(raw))
    }
}
