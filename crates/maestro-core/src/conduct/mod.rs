//! Conductor module
//!
//! The conductor executes a compiled FSM one state at a time over a
//! parameter object and a runtime stack. It is responsible for:
//! - frame discipline: let/mask scopes and catch frames
//! - error propagation: boxing scalar params and unwinding to catch frames
//! - the continuation protocol: suspending at synchronous action states and
//!   resuming from a host-supplied `$resume` token
//!
//! A conduction is single-threaded and cooperative; the only suspension
//! points are action states.

mod stack;

pub use stack::{Frame, ResumeState};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;

use crate::compile::{Fsm, FunctionExec, State};
use crate::expr::{self, Expr, EXEC_KIND_EXPR};
use crate::plugin::{Plugin, PluginError};

/// Conductor protocol and invariant errors. Runtime errors inside a
/// composition are not errors at this level; they surface as `{error: ...}`
/// parameter objects.
#[derive(Debug, Error)]
pub enum ConductError {
    /// Malformed input from the host, e.g. a bad `$resume` token.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Invariant violation, e.g. a pop from an empty stack.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ConductError {
    /// HTTP-style status code class for the host.
    pub fn code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::Internal(_) => 500,
        }
    }
}

/// Action invocation failures reported by the client.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("action '{0}' not found")]
    NotFound(String),

    #[error("invalid action name: {0}")]
    InvalidName(String),

    #[error("action failed: {0}")]
    Failed(String),
}

/// Remote action invocation capability.
#[async_trait]
pub trait ActionClient: Send + Sync {
    /// Invoke an action and wait for its result object.
    async fn invoke(&self, name: &str, params: Value) -> Result<Value, ActionError>;

    /// Fire an asynchronous invocation; resolves to the activation
    /// descriptor, not the action result.
    async fn fire(&self, name: &str, params: Value) -> Result<Value, ActionError>;
}

/// The conductor's working tuple: parameter object, FSM index (`None` when
/// terminal), and the runtime stack growing on the front.
#[derive(Debug)]
pub struct RuntimeState {
    pub params: Value,
    pub state: Option<usize>,
    pub stack: VecDeque<Frame>,
}

/// Handler for a plugin-registered state kind. Runs after the default
/// successor has been applied; it may overwrite `p.state` to branch.
pub trait StateHandler: Send + Sync {
    fn handle(&self, payload: &Value, p: &mut RuntimeState) -> Result<(), ConductError>;
}

/// Conductor tuning knobs.
#[derive(Debug, Clone)]
pub struct ConductorConfig {
    /// Upper bound on executed states per conduction; a runaway FSM fails
    /// with an internal error instead of spinning.
    pub step_limit: u64,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            step_limit: 1_000_000,
        }
    }
}

/// Result of one conduction: either the composition terminated, or it needs
/// the host to invoke an action and re-enter with `$resume`.
#[derive(Debug)]
pub enum Outcome {
    Complete {
        params: Value,
    },
    Suspended {
        action: String,
        params: Value,
        resume: ResumeState,
    },
}

impl Outcome {
    /// The host-facing JSON shape: `{params}` or `{error, ...}` when
    /// terminal, `{action, params, state: {"$resume": ...}}` when suspended.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Complete { params } => {
                if params.get("error").is_some() {
                    params.clone()
                } else {
                    json!({ "params": params })
                }
            }
            Self::Suspended {
                action,
                params,
                resume,
            } => json!({
                "action": action,
                "params": params,
                "state": { "$resume": resume },
            }),
        }
    }
}

/// Executes a compiled FSM against parameter objects.
pub struct Conductor {
    fsm: Fsm,
    /// Precompiled function bodies, aligned with the state list.
    exprs: Vec<Option<Expr>>,
    client: Option<Arc<dyn ActionClient>>,
    handlers: BTreeMap<String, Arc<dyn StateHandler>>,
    finishers: Vec<Arc<dyn Plugin>>,
    config: ConductorConfig,
}

impl Conductor {
    /// Create a conductor, precompiling every expression-dialect function
    /// state. Other exec dialects are left to fail at runtime so compiled
    /// compositions stay deployable.
    pub fn new(fsm: Fsm) -> Result<Self, ConductError> {
        let mut exprs = Vec::with_capacity(fsm.len());
        for (index, state) in fsm.states.iter().enumerate() {
            let compiled = match state {
                State::Function { exec, .. } if exec.kind == EXEC_KIND_EXPR => {
                    Some(expr::compile(&exec.code).map_err(|err| {
                        ConductError::Internal(format!(
                            "function at state {index} does not compile: {err}"
                        ))
                    })?)
                }
                _ => None,
            };
            exprs.push(compiled);
        }
        Ok(Self {
            fsm,
            exprs,
            client: None,
            handlers: BTreeMap::new(),
            finishers: Vec::new(),
            config: ConductorConfig::default(),
        })
    }

    /// Attach the action client used for asynchronous action states.
    pub fn with_client(mut self, client: Arc<dyn ActionClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Override the conductor configuration.
    pub fn with_config(mut self, config: ConductorConfig) -> Self {
        self.config = config;
        self
    }

    /// Merge a plugin's state handlers and keep it for the finish hook.
    /// Existing kinds are never overridden.
    pub fn register_plugin(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        for (kind, handler) in plugin.state_handlers() {
            if self.handlers.contains_key(&kind) {
                return Err(PluginError::Conflict {
                    plugin: plugin.name().to_string(),
                    what: "state handler",
                    name: kind,
                });
            }
            self.handlers.insert(kind, handler);
        }
        self.finishers.push(plugin);
        Ok(())
    }

    /// Advance the composition until it terminates or suspends for a
    /// synchronous action invocation.
    pub async fn conduct(&self, params: Value) -> Result<Outcome, ConductError> {
        let mut p = self.enter(params)?;
        let mut steps: u64 = 0;

        while let Some(index) = p.state {
            steps += 1;
            if steps > self.config.step_limit {
                return Err(ConductError::Internal(format!(
                    "step limit of {} exceeded",
                    self.config.step_limit
                )));
            }
            let node = self.fsm.states.get(index).ok_or_else(|| {
                ConductError::Internal(format!("state {index} is outside the fsm"))
            })?;

            // default successor; terminal when the state has no next
            p.state = match node.next() {
                Some(offset) => Some(self.offset_target(index, offset)?),
                None => None,
            };

            match node {
                State::Pass { .. } => {}
                State::Empty { .. } => self.inspect(&mut p),
                State::Let { vars, .. } => {
                    let frame = match vars {
                        Some(vars) => Frame::let_frame(vars.clone()),
                        None => Frame::mask(),
                    };
                    p.stack.push_front(frame);
                }
                State::Exit { .. } => {
                    if p.stack.pop_front().is_none() {
                        return Err(ConductError::Internal(
                            "pop from empty stack".to_string(),
                        ));
                    }
                }
                State::Try { catch, .. } => {
                    let target = self.offset_target(index, *catch)?;
                    p.stack.push_front(Frame::catch(target));
                }
                State::Choice {
                    then, otherwise, ..
                } => {
                    let offset = if expr::truthy(p.params.get("value")) {
                        *then
                    } else {
                        *otherwise
                    };
                    p.state = Some(self.offset_target(index, offset)?);
                }
                State::Action {
                    name, asynchronous, ..
                } => {
                    if *asynchronous {
                        let fired = match &self.client {
                            Some(client) => client.fire(name, p.params.clone()).await,
                            None => Err(ActionError::Failed(
                                "no action client configured".to_string(),
                            )),
                        };
                        p.params = match fired {
                            Ok(descriptor) => descriptor,
                            Err(err) => json!({ "error": err.to_string() }),
                        };
                        self.inspect(&mut p);
                    } else {
                        tracing::debug!(
                            action = %name,
                            state = index,
                            "suspending for action invocation"
                        );
                        return Ok(Outcome::Suspended {
                            action: name.clone(),
                            params: p.params,
                            resume: ResumeState {
                                state: p.state,
                                stack: p.stack,
                            },
                        });
                    }
                }
                State::Function { exec, .. } => {
                    self.run_function(index, exec, &mut p);
                    self.inspect(&mut p);
                }
                State::Custom { kind, payload, .. } => {
                    let handler = self.handlers.get(kind).ok_or_else(|| {
                        ConductError::Internal(format!("no handler for state kind '{kind}'"))
                    })?;
                    handler.handle(payload, &mut p)?;
                }
            }
        }

        let mut params = p.params;
        for plugin in &self.finishers {
            plugin.on_finish(&mut params);
        }
        tracing::info!(error = params.get("error").is_some(), "composition complete");
        Ok(Outcome::Complete { params })
    }

    /// Set up the runtime state, adopting a `$resume` token if present.
    fn enter(&self, mut params: Value) -> Result<RuntimeState, ConductError> {
        let resume = params
            .as_object_mut()
            .and_then(|map| map.remove("$resume"));
        let mut p = RuntimeState {
            params,
            state: if self.fsm.is_empty() { None } else { Some(0) },
            stack: VecDeque::new(),
        };

        if let Some(resume) = resume {
            let resume: ResumeState = serde_json::from_value(resume)
                .map_err(|err| ConductError::BadRequest(format!("malformed $resume: {err}")))?;
            if let Some(state) = resume.state {
                if state >= self.fsm.len() {
                    return Err(ConductError::BadRequest(format!(
                        "malformed $resume: state {state} is outside the fsm"
                    )));
                }
            }
            for frame in &resume.stack {
                if let Frame::Catch { catch } = frame {
                    if *catch >= self.fsm.len() {
                        return Err(ConductError::BadRequest(format!(
                            "malformed $resume: catch target {catch} is outside the fsm"
                        )));
                    }
                }
            }
            p.state = resume.state;
            p.stack = resume.stack;
            // a sync action just returned; its result may carry an error
            self.inspect(&mut p);
        }
        Ok(p)
    }

    fn offset_target(&self, index: usize, offset: i64) -> Result<usize, ConductError> {
        let target = index as i64 + offset;
        if target < 0 || target >= self.fsm.len() as i64 {
            return Err(ConductError::Internal(format!(
                "jump from state {index} by {offset} lands outside the fsm"
            )));
        }
        Ok(target as usize)
    }

    /// Box scalar params and, on `{error}` params, unwind the stack to the
    /// nearest catch frame. The sole error-propagation mechanism.
    fn inspect(&self, p: &mut RuntimeState) {
        if !p.params.is_object() {
            let value = std::mem::take(&mut p.params);
            p.params = json!({ "value": value });
        }
        if let Some(error) = p.params.get("error").cloned() {
            p.params = json!({ "error": error });
            loop {
                match p.stack.pop_front() {
                    Some(Frame::Catch { catch }) => {
                        tracing::debug!(handler = catch, "unwound to catch frame");
                        p.state = Some(catch);
                        break;
                    }
                    Some(_) => {}
                    None => {
                        tracing::warn!("error with no enclosing handler, terminating");
                        p.state = None;
                        break;
                    }
                }
            }
        }
    }

    /// Evaluate a function state over the collapsed variable environment,
    /// then write updated locals back into their innermost visible frames.
    fn run_function(&self, index: usize, exec: &FunctionExec, p: &mut RuntimeState) {
        let Some(compiled) = self.exprs.get(index).and_then(Option::as_ref) else {
            p.params = json!({
                "error": format!("cannot evaluate exec kind '{}'", exec.kind)
            });
            return;
        };

        // visible let-frames, innermost first, honoring mask frames
        let mut visible: Vec<usize> = Vec::new();
        let mut masked = 0usize;
        for (position, frame) in p.stack.iter().enumerate() {
            match frame {
                Frame::Let { vars: None } => masked += 1,
                Frame::Let { vars: Some(_) } => {
                    if masked == 0 {
                        visible.push(position);
                    } else {
                        masked -= 1;
                    }
                }
                Frame::Catch { .. } => {}
            }
        }

        // collapse outermost to innermost so inner bindings shadow outer ones
        let mut vars: BTreeMap<String, Value> = BTreeMap::new();
        for &position in visible.iter().rev() {
            if let Frame::Let { vars: Some(frame) } = &p.stack[position] {
                for (name, value) in frame {
                    vars.insert(name.clone(), value.clone());
                }
            }
        }

        let outcome = {
            let mut scope = expr::Scope {
                params: &p.params,
                vars: &mut vars,
            };
            expr::eval(compiled, &mut scope)
        };

        // propagate finals into the innermost visible frame per symbol
        for (name, value) in vars {
            for &position in &visible {
                if let Frame::Let { vars: Some(frame) } = &mut p.stack[position] {
                    if frame.contains_key(&name) {
                        frame.insert(name.clone(), value.clone());
                        break;
                    }
                }
            }
        }

        match outcome {
            Err(err) => {
                tracing::debug!(state = index, error = %err, "function evaluation failed");
                p.params = json!({ "error": err.to_string() });
            }
            Ok(None) => {}
            Ok(Some(result)) => {
                if expr::is_function_payload(&result) {
                    p.params = json!({
                        "error": "function must not return a function value"
                    });
                } else {
                    p.params = result;
                }
            }
        }
    }
}
