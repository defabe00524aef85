//! Plugin SPI
//!
//! A plugin can widen every stage of the pipeline without touching the core:
//! extra combinator descriptors, lowering rewrites, compile rules, and
//! conductor state handlers, plus a finish hook run just before a terminal
//! return. Registration merges into the host tables; existing names are
//! never overridden. Plugins cannot mutate a compiled FSM.

use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::compile::CompileRule;
use crate::conduct::StateHandler;
use crate::lower::RewriteFn;
use crate::types::CombinatorDescriptor;

/// Plugin registration errors.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin '{plugin}' tried to override {what} '{name}'")]
    Conflict {
        plugin: String,
        what: &'static str,
        name: String,
    },
}

/// Extension surface for the composer, compiler, and conductor.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Additional combinator descriptors.
    fn combinators(&self) -> Vec<CombinatorDescriptor> {
        Vec::new()
    }

    /// Additional lowering rewrites, keyed by combinator kind.
    fn rewrites(&self) -> Vec<(String, RewriteFn)> {
        Vec::new()
    }

    /// Additional compile rules, keyed by combinator kind.
    fn compile_rules(&self) -> Vec<(String, CompileRule)> {
        Vec::new()
    }

    /// Additional conductor state handlers, keyed by custom state kind.
    fn state_handlers(&self) -> Vec<(String, Arc<dyn StateHandler>)> {
        Vec::new()
    }

    /// Hook run on the final params just before a terminal return.
    fn on_finish(&self, _params: &mut Value) {}
}
