//! Registry of engines, one per operator.

use crate::engine::{Engine, OperatorKind};
use crate::external::{EngineSettings, ExternalEngine};
use crate::pipeline::PipelineError;
use crate::reference::ReferenceEngine;
use indexmap::IndexMap;
use std::sync::Arc;

/// Which engine runs each operator.
#[derive(Clone)]
pub struct EngineRegistry {
    engines: IndexMap<OperatorKind, Arc<dyn Engine>>,
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            engines: IndexMap::new(),
        }
    }

    /// In-process engines for every operator.
    pub fn reference() -> Self {
        let mut registry = Self::new();
        for operator in OperatorKind::ALL {
            registry.register(ReferenceEngine::new(operator));
        }
        registry
    }

    /// Subprocess engines for every operator, sharing one settings value.
    pub fn external(settings: &EngineSettings) -> Self {
        let mut registry = Self::new();
        for operator in OperatorKind::ALL {
            registry.register(ExternalEngine::new(operator, settings.clone()));
        }
        registry
    }

    /// Register an engine for the operator it reports, replacing any previous one.
    pub fn register(&mut self, engine: impl Engine + 'static) {
        self.engines.insert(engine.operator(), Arc::new(engine));
    }

    pub fn get(&self, operator: OperatorKind) -> Option<Arc<dyn Engine>> {
        self.engines.get(&operator).cloned()
    }

    pub fn require(&self, operator: OperatorKind) -> Result<Arc<dyn Engine>, PipelineError> {
        self.get(operator)
            .ok_or(PipelineError::EngineNotRegistered(operator))
    }

    pub fn iter(&self) -> impl Iterator<Item = (OperatorKind, &dyn Engine)> {
        self.engines.iter().map(|(op, engine)| (*op, engine.as_ref()))
    }

    /// Number of registered engines.
    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_reference_covers_all_operators() {
        let registry = EngineRegistry::reference();
        assert_eq!(registry.len(), OperatorKind::ALL.len());
        for op in OperatorKind::ALL {
            let engine = registry.require(op).unwrap();
            assert_eq!(engine.operator(), op);
            assert_eq!(engine.name(), "reference");
        }
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = EngineRegistry::reference();
        let settings = EngineSettings {
            root: Path::new("/opt/engine").to_path_buf(),
            ..EngineSettings::default()
        };
        registry.register(ExternalEngine::new(OperatorKind::Filter, settings));
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.get(OperatorKind::Filter).unwrap().name(), "external");
        assert_eq!(registry.get(OperatorKind::Join).unwrap().name(), "reference");
    }

    #[test]
    fn test_missing_engine() {
        let registry = EngineRegistry::new();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.require(OperatorKind::Aggregate),
            Err(PipelineError::EngineNotRegistered(OperatorKind::Aggregate))
        ));
    }
}
