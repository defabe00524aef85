//! # Maestro Core
//!
//! Composition compiler and conductor for a serverless orchestration
//! framework.
//!
//! This crate contains:
//! - the combinator registry and builder (compositions from typed calls or
//!   JSON documents)
//! - the lowerer (labeling and rewrites from the enhanced combinator set to
//!   the primitive set)
//! - the compiler (lowered AST to a flat FSM with relative jumps)
//! - the conductor (FSM execution with scoped variables, catch frames, and
//!   the `$resume` continuation protocol)
//!
//! This crate does NOT care about:
//! - how actions are actually invoked (the host supplies an [`ActionClient`])
//! - action deployment or packaging
//! - persistence of FSM state beyond the resume token the host carries

pub mod compile;
pub mod compose;
pub mod conduct;
pub mod expr;
pub mod lower;
pub mod plugin;
pub mod types;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::compile::{CompileError, Compiler, Fsm, FunctionExec, State};
    pub use crate::compose::{parse_action_name, ComposeError, Composer, Task};
    pub use crate::conduct::{
        ActionClient, ActionError, ConductError, Conductor, ConductorConfig, Frame, Outcome,
        ResumeState, RuntimeState, StateHandler,
    };
    pub use crate::expr::{ExprError, EXEC_KIND_EXPR, EXEC_KIND_NODEJS};
    pub use crate::lower::LowerTarget;
    pub use crate::plugin::{Plugin, PluginError};
    pub use crate::types::{
        ArgKind, ArgSpec, CombinatorDescriptor, CombinatorRegistry, Composition,
    };
}

// Re-export key types at crate root
pub use compile::{CompileError, Compiler, Fsm, State};
pub use compose::{parse_action_name, ComposeError, Composer, Task};
pub use conduct::{
    ActionClient, ActionError, ConductError, Conductor, ConductorConfig, Outcome, ResumeState,
};
pub use lower::LowerTarget;
pub use plugin::{Plugin, PluginError};
pub use types::{CombinatorRegistry, Composition};
