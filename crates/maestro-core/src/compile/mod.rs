//! Compiler module
//!
//! Translates a lowered, labeled composition into a flat FSM. States are
//! linearised and connected with relative jumps so fragments stay
//! position-independent: `chain` concatenates two fragments by pointing the
//! last state of the front at the first state of the back.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::plugin::{Plugin, PluginError};
use crate::types::Composition;

/// Compilation errors.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("no compile rule for combinator '{0}'")]
    UnsupportedCombinator(String),

    #[error("malformed composition node '{kind}': {reason}")]
    MalformedNode { kind: String, reason: String },

    #[error("invalid fsm: {0}")]
    InvalidFsm(String),
}

fn malformed(kind: &str, reason: impl Into<String>) -> CompileError {
    CompileError::MalformedNode {
        kind: kind.to_string(),
        reason: reason.into(),
    }
}

/// Executable payload of a `function` state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionExec {
    pub kind: String,
    pub code: Value,
}

/// One FSM state. Offsets (`next`, `then`, `else`, `catch`) are relative to
/// the state's own index; an absent `next` makes the state terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum State {
    Pass {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    Empty {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    Action {
        name: String,
        #[serde(rename = "async", default, skip_serializing_if = "std::ops::Not::not")]
        asynchronous: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    Function {
        exec: FunctionExec,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    Let {
        /// Variable declarations, or null for a mask frame.
        #[serde(rename = "let")]
        vars: Option<Map<String, Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    Exit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    Try {
        catch: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    Choice {
        then: i64,
        #[serde(rename = "else")]
        otherwise: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    /// Plugin-registered state kind.
    Custom {
        kind: String,
        #[serde(default)]
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
}

impl State {
    pub(crate) fn pass() -> Self {
        State::Pass {
            next: None,
            path: None,
        }
    }

    pub(crate) fn pass_at(path: Option<String>) -> Self {
        State::Pass { next: None, path }
    }

    /// Relative offset of the successor state, if any.
    pub fn next(&self) -> Option<i64> {
        match self {
            State::Pass { next, .. }
            | State::Empty { next, .. }
            | State::Action { next, .. }
            | State::Function { next, .. }
            | State::Let { next, .. }
            | State::Exit { next, .. }
            | State::Try { next, .. }
            | State::Custom { next, .. } => *next,
            State::Choice { .. } => None,
        }
    }

    pub(crate) fn set_next(&mut self, offset: i64) {
        match self {
            State::Pass { next, .. }
            | State::Empty { next, .. }
            | State::Action { next, .. }
            | State::Function { next, .. }
            | State::Let { next, .. }
            | State::Exit { next, .. }
            | State::Try { next, .. }
            | State::Custom { next, .. } => *next = Some(offset),
            // a choice branches through then/else and never falls through
            State::Choice { .. } => {}
        }
    }

    /// Debug label assigned by `label`.
    pub fn path(&self) -> Option<&str> {
        match self {
            State::Pass { path, .. }
            | State::Empty { path, .. }
            | State::Action { path, .. }
            | State::Function { path, .. }
            | State::Let { path, .. }
            | State::Exit { path, .. }
            | State::Try { path, .. }
            | State::Choice { path, .. }
            | State::Custom { path, .. } => path.as_deref(),
        }
    }
}

/// A compiled composition: an ordered list of states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fsm {
    pub states: Vec<State>,
}

impl Fsm {
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Check structural invariants: every relative jump lands inside the
    /// state list, and no choice opens the FSM.
    pub fn validate(&self) -> Result<(), CompileError> {
        let len = self.states.len() as i64;
        let check = |index: usize, what: &str, offset: i64| -> Result<(), CompileError> {
            let target = index as i64 + offset;
            if target < 0 || target >= len {
                return Err(CompileError::InvalidFsm(format!(
                    "state {index} {what} offset {offset} lands outside [0, {len})"
                )));
            }
            Ok(())
        };

        for (index, state) in self.states.iter().enumerate() {
            if let Some(next) = state.next() {
                check(index, "next", next)?;
            }
            match state {
                State::Choice {
                    then, otherwise, ..
                } => {
                    if index == 0 {
                        return Err(CompileError::InvalidFsm(
                            "choice state without a preceding test".to_string(),
                        ));
                    }
                    check(index, "then", *then)?;
                    check(index, "else", *otherwise)?;
                }
                State::Try { catch, .. } => check(index, "catch", *catch)?,
                _ => {}
            }
        }
        Ok(())
    }
}

/// Concatenate two fragments; the front's last state falls through to the
/// back's first state.
fn chain(mut front: Vec<State>, back: Vec<State>) -> Vec<State> {
    if let Some(last) = front.last_mut() {
        last.set_next(1);
    }
    front.extend(back);
    front
}

/// Per-combinator compile rule.
pub type CompileRule = fn(&Compiler, &Composition) -> Result<Vec<State>, CompileError>;

/// AST-to-FSM compiler with a rule table keyed by combinator kind.
pub struct Compiler {
    rules: BTreeMap<String, CompileRule>,
}

impl Compiler {
    /// Compiler over the primitive combinator set.
    pub fn new() -> Self {
        let mut rules: BTreeMap<String, CompileRule> = BTreeMap::new();
        rules.insert("sequence".to_string(), rule_sequence);
        rules.insert("action".to_string(), rule_action);
        rules.insert("function".to_string(), rule_function);
        rules.insert("let".to_string(), rule_let);
        rules.insert("mask".to_string(), rule_mask);
        rules.insert("try".to_string(), rule_try);
        rules.insert("finally".to_string(), rule_finally);
        rules.insert("if_nosave".to_string(), rule_if_nosave);
        rules.insert("while_nosave".to_string(), rule_while_nosave);
        rules.insert("dowhile_nosave".to_string(), rule_dowhile_nosave);
        rules.insert("empty".to_string(), rule_empty);
        Self { rules }
    }

    /// Merge a plugin's compile rules. Existing kinds are never overridden.
    pub fn register_plugin(&mut self, plugin: &dyn Plugin) -> Result<(), PluginError> {
        for (kind, rule) in plugin.compile_rules() {
            if self.rules.contains_key(&kind) {
                return Err(PluginError::Conflict {
                    plugin: plugin.name().to_string(),
                    what: "compile rule",
                    name: kind,
                });
            }
            self.rules.insert(kind, rule);
        }
        Ok(())
    }

    /// Compile a lowered composition into a validated FSM.
    pub fn compile(&self, tree: &Composition) -> Result<Fsm, CompileError> {
        let fsm = Fsm {
            states: self.compile_node(tree)?,
        };
        fsm.validate()?;
        tracing::debug!(states = fsm.len(), "compiled composition");
        Ok(fsm)
    }

    /// Compile one node into an FSM fragment.
    pub fn compile_node(&self, node: &Composition) -> Result<Vec<State>, CompileError> {
        let rule = self
            .rules
            .get(node.kind())
            .ok_or_else(|| CompileError::UnsupportedCombinator(node.kind().to_string()))?;
        rule(self, node)
    }

    /// Compile a child list into one chained fragment; an empty list becomes
    /// a single pass.
    fn compile_list(&self, nodes: &[Composition]) -> Result<Vec<State>, CompileError> {
        let mut fsm: Vec<State> = Vec::new();
        for node in nodes {
            let fragment = self.compile_node(node)?;
            fsm = if fsm.is_empty() {
                fragment
            } else {
                chain(fsm, fragment)
            };
        }
        if fsm.is_empty() {
            fsm.push(State::pass());
        }
        Ok(fsm)
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

fn node_path(node: &Composition) -> Option<String> {
    node.path().map(str::to_string)
}

fn child<'a>(node: &'a Composition, name: &str) -> Result<&'a Composition, CompileError> {
    node.child(name)
        .ok_or_else(|| malformed(node.kind(), format!("missing argument '{name}'")))
}

// ============ compile rules ============

fn rule_sequence(compiler: &Compiler, node: &Composition) -> Result<Vec<State>, CompileError> {
    let components = node.components().unwrap_or(&[]);
    Ok(chain(
        vec![State::pass_at(node_path(node))],
        compiler.compile_list(components)?,
    ))
}

fn rule_empty(_compiler: &Compiler, node: &Composition) -> Result<Vec<State>, CompileError> {
    Ok(vec![State::Empty {
        next: None,
        path: node_path(node),
    }])
}

fn rule_action(_compiler: &Compiler, node: &Composition) -> Result<Vec<State>, CompileError> {
    let name = node
        .string_value("name")
        .ok_or_else(|| malformed("action", "missing action name"))?
        .to_string();
    Ok(vec![State::Action {
        name,
        asynchronous: node.bool_value("async"),
        next: None,
        path: node_path(node),
    }])
}

fn rule_function(_compiler: &Compiler, node: &Composition) -> Result<Vec<State>, CompileError> {
    let exec = node
        .value("function")
        .and_then(|payload| payload.get("exec"))
        .cloned()
        .ok_or_else(|| malformed("function", "missing exec payload"))?;
    let exec: FunctionExec = serde_json::from_value(exec)
        .map_err(|err| malformed("function", format!("invalid exec payload: {err}")))?;
    Ok(vec![State::Function {
        exec,
        next: None,
        path: node_path(node),
    }])
}

fn rule_let(compiler: &Compiler, node: &Composition) -> Result<Vec<State>, CompileError> {
    let declarations = node
        .value("declarations")
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| malformed("let", "missing declarations object"))?;
    let open = vec![State::Let {
        vars: Some(declarations),
        next: None,
        path: node_path(node),
    }];
    let body = compiler.compile_list(node.components().unwrap_or(&[]))?;
    Ok(chain(
        chain(open, body),
        vec![State::Exit {
            next: None,
            path: None,
        }],
    ))
}

fn rule_mask(compiler: &Compiler, node: &Composition) -> Result<Vec<State>, CompileError> {
    let open = vec![State::Let {
        vars: None,
        next: None,
        path: node_path(node),
    }];
    let body = compiler.compile_list(node.components().unwrap_or(&[]))?;
    Ok(chain(
        chain(open, body),
        vec![State::Exit {
            next: None,
            path: None,
        }],
    ))
}

fn rule_try(compiler: &Compiler, node: &Composition) -> Result<Vec<State>, CompileError> {
    let body = compiler.compile_node(child(node, "body")?)?;
    let handler_body = compiler.compile_node(child(node, "handler")?)?;
    let handler_len = handler_body.len() as i64;
    // both paths converge on the trailing pass after the handler
    let handler = chain(handler_body, vec![State::pass()]);

    let open = State::Try {
        catch: body.len() as i64 + 2,
        next: None,
        path: node_path(node),
    };
    let mut fsm = chain(
        chain(vec![open], body),
        vec![State::Exit {
            next: Some(handler_len + 1),
            path: None,
        }],
    );
    fsm.extend(handler);
    Ok(fsm)
}

fn rule_finally(compiler: &Compiler, node: &Composition) -> Result<Vec<State>, CompileError> {
    let body = compiler.compile_node(child(node, "body")?)?;
    let finalizer = compiler.compile_node(child(node, "finalizer")?)?;

    let open = State::Try {
        catch: body.len() as i64 + 2,
        next: None,
        path: node_path(node),
    };
    let fsm = chain(
        chain(vec![open], body),
        vec![State::Exit {
            next: None,
            path: None,
        }],
    );
    Ok(chain(fsm, finalizer))
}

fn rule_if_nosave(compiler: &Compiler, node: &Composition) -> Result<Vec<State>, CompileError> {
    let test = compiler.compile_node(child(node, "test")?)?;
    let mut consequent = compiler.compile_node(child(node, "consequent")?)?;
    let alternate_body = match node.child("alternate") {
        Some(alternate) => compiler.compile_node(alternate)?,
        None => vec![State::pass()],
    };
    // both branches converge on the trailing pass after the alternate
    let alternate = chain(alternate_body, vec![State::pass()]);

    let choice = State::Choice {
        then: 1,
        otherwise: consequent.len() as i64 + 1,
        path: None,
    };
    let mut fsm = chain(
        chain(vec![State::pass_at(node_path(node))], test),
        vec![choice],
    );
    if let Some(last) = consequent.last_mut() {
        last.set_next(alternate.len() as i64);
    }
    fsm.extend(consequent);
    fsm.extend(alternate);
    Ok(fsm)
}

fn rule_while_nosave(compiler: &Compiler, node: &Composition) -> Result<Vec<State>, CompileError> {
    let test = compiler.compile_node(child(node, "test")?)?;
    let mut body = compiler.compile_node(child(node, "body")?)?;
    let test_len = test.len() as i64;
    let body_len = body.len() as i64;

    let choice = State::Choice {
        then: 1,
        otherwise: body_len + 1,
        path: None,
    };
    let mut fsm = chain(
        chain(vec![State::pass_at(node_path(node))], test),
        vec![choice],
    );
    if let Some(last) = body.last_mut() {
        last.set_next(-(test_len + body_len));
    }
    fsm.extend(body);
    fsm.push(State::pass());
    Ok(fsm)
}

fn rule_dowhile_nosave(
    compiler: &Compiler,
    node: &Composition,
) -> Result<Vec<State>, CompileError> {
    let body = compiler.compile_node(child(node, "body")?)?;
    let test = compiler.compile_node(child(node, "test")?)?;
    let body_len = body.len() as i64;
    let test_len = test.len() as i64;

    let choice = State::Choice {
        then: -(body_len + test_len),
        otherwise: 1,
        path: None,
    };
    let mut fsm = chain(
        chain(chain(vec![State::pass_at(node_path(node))], body), test),
        vec![choice],
    );
    fsm.push(State::pass());
    Ok(fsm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::{Composer, Task};
    use crate::lower::LowerTarget;
    use serde_json::json;

    fn compile_lowered(composer: &Composer, tree: Composition) -> Fsm {
        let lowered = composer.lower(tree, &LowerTarget::Max).unwrap();
        Compiler::new().compile(&lowered).unwrap()
    }

    #[test]
    fn test_sequence_chains_children_with_fall_through() {
        let composer = Composer::new();
        let fsm = compile_lowered(
            &composer,
            composer
                .sequence(vec![Task::from("a"), Task::from("b")])
                .unwrap(),
        );

        assert_eq!(fsm.len(), 3);
        assert!(matches!(fsm.states[0], State::Pass { next: Some(1), .. }));
        assert!(
            matches!(&fsm.states[1], State::Action { name, next: Some(1), .. } if name == "/_/a")
        );
        assert!(matches!(&fsm.states[2], State::Action { name, next: None, .. } if name == "/_/b"));
    }

    #[test]
    fn test_empty_sequence_compiles_to_leading_and_body_pass() {
        let composer = Composer::new();
        let fsm = compile_lowered(&composer, composer.sequence(vec![]).unwrap());
        assert_eq!(fsm.len(), 2);
        assert!(matches!(fsm.states[1], State::Pass { next: None, .. }));
    }

    #[test]
    fn test_let_brackets_body_with_exit() {
        let composer = Composer::new();
        let fsm = compile_lowered(
            &composer,
            composer
                .let_(json!({"x": 5}), vec![Task::expr(json!(["var", "x"]))])
                .unwrap(),
        );

        assert_eq!(fsm.len(), 3);
        assert!(
            matches!(&fsm.states[0], State::Let { vars: Some(vars), next: Some(1), .. }
                if vars.get("x") == Some(&json!(5)))
        );
        assert!(matches!(fsm.states[1], State::Function { next: Some(1), .. }));
        assert!(matches!(fsm.states[2], State::Exit { next: None, .. }));
    }

    #[test]
    fn test_mask_compiles_to_null_let_frame() {
        let composer = Composer::new();
        let fsm = compile_lowered(&composer, composer.mask(vec![Task::from("a")]).unwrap());
        assert!(matches!(&fsm.states[0], State::Let { vars: None, .. }));
    }

    #[test]
    fn test_try_catch_offset_reaches_handler_and_exit_skips_it() {
        let composer = Composer::new();
        let fsm = compile_lowered(
            &composer,
            composer.try_(Task::from("body"), Task::from("handler")).unwrap(),
        );

        // [try, body, exit, handler, pass]
        assert_eq!(fsm.len(), 5);
        let State::Try { catch, next, .. } = &fsm.states[0] else {
            panic!("expected try state");
        };
        assert_eq!((*catch, *next), (3, Some(1)));
        assert!(matches!(fsm.states[2], State::Exit { next: Some(2), .. }));
        assert!(
            matches!(&fsm.states[3], State::Action { name, next: Some(1), .. } if name == "/_/handler")
        );
        assert!(matches!(fsm.states[4], State::Pass { next: None, .. }));
    }

    #[test]
    fn test_finally_falls_through_exit_into_finalizer() {
        let composer = Composer::new();
        let fsm = compile_lowered(
            &composer,
            composer
                .finally(Task::from("body"), Task::from("fin"))
                .unwrap(),
        );

        // [try, body, exit, finalizer]
        assert_eq!(fsm.len(), 4);
        let State::Try { catch, .. } = &fsm.states[0] else {
            panic!("expected try state");
        };
        assert_eq!(*catch, 3);
        assert!(matches!(fsm.states[2], State::Exit { next: Some(1), .. }));
    }

    #[test]
    fn test_if_nosave_branch_offsets_converge_on_join_pass() {
        let composer = Composer::new();
        let fsm = compile_lowered(
            &composer,
            composer
                .if_nosave(
                    Task::expr(json!(["lit", true])),
                    Task::from("yes"),
                    Task::from("no"),
                )
                .unwrap(),
        );

        // [pass, test, choice, consequent, alternate, join]
        assert_eq!(fsm.len(), 6);
        let State::Choice { then, otherwise, .. } = &fsm.states[2] else {
            panic!("expected choice state");
        };
        assert_eq!((*then, *otherwise), (1, 2));
        assert!(
            matches!(&fsm.states[3], State::Action { name, next: Some(2), .. } if name == "/_/yes")
        );
        assert!(
            matches!(&fsm.states[4], State::Action { name, next: Some(1), .. } if name == "/_/no")
        );
        assert!(matches!(fsm.states[5], State::Pass { next: None, .. }));
    }

    #[test]
    fn test_while_nosave_body_jumps_back_to_test() {
        let composer = Composer::new();
        let fsm = compile_lowered(
            &composer,
            composer
                .while_nosave(Task::expr(json!(["lit", false])), Task::from("body"))
                .unwrap(),
        );

        // [pass, test, choice, body, pass]
        assert_eq!(fsm.len(), 5);
        let State::Choice { then, otherwise, .. } = &fsm.states[2] else {
            panic!("expected choice state");
        };
        assert_eq!((*then, *otherwise), (1, 2));
        assert!(matches!(fsm.states[3], State::Action { next: Some(-2), .. }));
    }

    #[test]
    fn test_dowhile_nosave_choice_loops_back_to_body() {
        let composer = Composer::new();
        let fsm = compile_lowered(
            &composer,
            composer
                .dowhile_nosave(Task::from("body"), Task::expr(json!(["lit", false])))
                .unwrap(),
        );

        // [pass, body, test, choice, pass]
        assert_eq!(fsm.len(), 5);
        let State::Choice { then, otherwise, .. } = &fsm.states[3] else {
            panic!("expected choice state");
        };
        assert_eq!((*then, *otherwise), (-2, 1));
    }

    #[test]
    fn test_compile_rejects_unlowered_combinators() {
        let composer = Composer::new();
        let tree = composer.retain(vec![Task::from("a")]).unwrap();
        let err = Compiler::new().compile(&tree).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedCombinator(kind) if kind == "retain"));
    }

    #[test]
    fn test_validate_rejects_out_of_range_jumps() {
        let fsm = Fsm {
            states: vec![State::Pass {
                next: Some(5),
                path: None,
            }],
        };
        assert!(matches!(fsm.validate(), Err(CompileError::InvalidFsm(_))));

        let fsm = Fsm {
            states: vec![
                State::pass(),
                State::Try {
                    catch: -4,
                    next: Some(1),
                    path: None,
                },
                State::pass(),
            ],
        };
        assert!(matches!(fsm.validate(), Err(CompileError::InvalidFsm(_))));
    }

    #[test]
    fn test_lowered_fsms_always_validate_and_round_trip_serde() {
        let composer = Composer::new();
        let trees = vec![
            composer.retry(2, vec![Task::from("act/flaky")]).unwrap(),
            composer.repeat(3, vec![Task::from("act/step")]).unwrap(),
            composer
                .if_(
                    Task::expr(json!(["lit", true])),
                    Task::from("y"),
                    Task::from("n"),
                )
                .unwrap(),
            composer.retain_catch(vec![Task::from("act/risky")]).unwrap(),
        ];
        for tree in trees {
            let fsm = compile_lowered(&composer, tree);
            fsm.validate().unwrap();

            let wire = serde_json::to_value(&fsm).unwrap();
            let back: Fsm = serde_json::from_value(wire).unwrap();
            assert_eq!(back, fsm);
        }
    }

    #[test]
    fn test_action_state_carries_async_flag_and_path() {
        let composer = Composer::new();
        let mut tree = composer
            .sequence(vec![Task::Composition(
                composer
                    .action("act/bg", Some(&json!({"async": true})))
                    .unwrap(),
            )])
            .unwrap();
        composer.label(&mut tree);
        let fsm = compile_lowered(&composer, tree);

        let State::Action {
            asynchronous, path, ..
        } = &fsm.states[1]
        else {
            panic!("expected action state");
        };
        assert!(*asynchronous);
        assert_eq!(path.as_deref(), Some("[0]"));
    }
}
