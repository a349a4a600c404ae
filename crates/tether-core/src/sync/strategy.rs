//! Pluggable per-entity conflict strategies.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::models::{EntityType, OfflineChangeRecord, Resolution};
use crate::Result;

/// Decides how a detected conflict is resolved.
#[async_trait]
pub trait ConflictStrategy: Send + Sync {
    async fn choose(&self, conflict: &OfflineChangeRecord) -> Result<Resolution>;
}

/// Always answers with the same resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedStrategy(pub Resolution);

#[async_trait]
impl ConflictStrategy for FixedStrategy {
    async fn choose(&self, _conflict: &OfflineChangeRecord) -> Result<Resolution> {
        Ok(self.0)
    }
}

/// Adapts a synchronous closure into a strategy.
pub struct FnStrategy<F>(F);

impl<F> FnStrategy<F>
where
    F: Fn(&OfflineChangeRecord) -> Result<Resolution> + Send + Sync,
{
    pub const fn new(choose: F) -> Self {
        Self(choose)
    }
}

#[async_trait]
impl<F> ConflictStrategy for FnStrategy<F>
where
    F: Fn(&OfflineChangeRecord) -> Result<Resolution> + Send + Sync,
{
    async fn choose(&self, conflict: &OfflineChangeRecord) -> Result<Resolution> {
        (self.0)(conflict)
    }
}

/// Strategy lookup by entity type. Unregistered types resolve `RemoteWins`.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: HashMap<EntityType, Arc<dyn ConflictStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the strategy for one entity type.
    pub fn register(
        &mut self,
        entity_type: EntityType,
        strategy: impl ConflictStrategy + 'static,
    ) -> &mut Self {
        self.strategies.insert(entity_type, Arc::new(strategy));
        self
    }

    /// Register a closure as the strategy for one entity type.
    pub fn register_fn<F>(&mut self, entity_type: EntityType, choose: F) -> &mut Self
    where
        F: Fn(&OfflineChangeRecord) -> Result<Resolution> + Send + Sync + 'static,
    {
        self.register(entity_type, FnStrategy::new(choose))
    }

    pub fn is_registered(&self, entity_type: EntityType) -> bool {
        self.strategies.contains_key(&entity_type)
    }

    pub(crate) fn strategy_for(&self, entity_type: EntityType) -> Arc<dyn ConflictStrategy> {
        self.strategies
            .get(&entity_type)
            .cloned()
            .unwrap_or_else(|| Arc::new(FixedStrategy(Resolution::RemoteWins)))
    }
}
