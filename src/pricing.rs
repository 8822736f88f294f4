//! Price book: read-through lookup of per-model rates and the cost formula.
//! The store is the cache; rates are read once per computation.

use crate::store::{ModelPricingRecord, Store, StoreError};

#[derive(Clone)]
pub struct PriceBook {
    store: Store,
}

impl PriceBook {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn get(&self, model: &str) -> Result<Option<ModelPricingRecord>, StoreError> {
        self.store.pricing(model).await
    }

    pub async fn list(&self) -> Result<Vec<ModelPricingRecord>, StoreError> {
        self.store.all_pricing().await
    }

    /// Upserts the rate row and appends a history entry atomically.
    pub async fn set(
        &self,
        model: &str,
        input_cost_per_million: f64,
        output_cost_per_million: f64,
        changed_by: &str,
    ) -> Result<ModelPricingRecord, StoreError> {
        self.store
            .set_pricing(model, input_cost_per_million, output_cost_per_million, changed_by)
            .await
    }

    /// Cost of one completion at the rates current right now. A model with no
    /// price row costs zero.
    pub async fn cost_for(
        &self,
        model: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> Result<f64, StoreError> {
        let Some(pricing) = self.get(model).await? else {
            return Ok(0.0);
        };
        Ok(compute_cost(
            prompt_tokens,
            completion_tokens,
            pricing.input_cost_per_million,
            pricing.output_cost_per_million,
        ))
    }
}

pub fn compute_cost(
    prompt_tokens: u64,
    completion_tokens: u64,
    input_cost_per_million: f64,
    output_cost_per_million: f64,
) -> f64 {
    (prompt_tokens as f64 / 1_000_000.0) * input_cost_per_million
        + (completion_tokens as f64 / 1_000_000.0) * output_cost_per_million
}
