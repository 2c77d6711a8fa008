use std::sync::Arc;

use dashmap::DashMap;

use super::{DynChain, WorkChain};
use crate::error::EngineError;
use crate::repository::ProvenanceRepository;

/// Chains the engine can start or resume, keyed by name.
///
/// A persisted chain only stores its name, so the same chain must be
/// registered in every engine that may resume it.
pub struct ChainRegistry<R: ProvenanceRepository + 'static> {
    chains: DashMap<String, Arc<dyn DynChain<R>>>,
}

impl<R: ProvenanceRepository + 'static> Default for ChainRegistry<R> {
    fn default() -> Self {
        Self {
            chains: DashMap::new(),
        }
    }
}

impl<R: ProvenanceRepository + 'static> ChainRegistry<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `chain`, replacing any chain with the same name.
    pub fn register<C: WorkChain>(&self, chain: C) -> Result<(), EngineError> {
        let name = chain.name().to_string();
        let outline = chain.outline();
        if outline.is_empty() {
            return Err(EngineError::Validation(format!("chain '{name}' has an empty outline")));
        }
        outline
            .validate()
            .map_err(|e| EngineError::Validation(format!("chain '{name}': {e}")))?;

        tracing::debug!(chain = %name, steps = outline.len(), "registered chain");
        self.chains.insert(name, Arc::new(chain));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn DynChain<R>>, EngineError> {
        self.chains
            .get(name)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| EngineError::UnknownChain(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.chains.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.chains.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }
}
