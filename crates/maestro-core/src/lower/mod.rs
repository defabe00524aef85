//! Lowering module
//!
//! Two concerns live here:
//! - labeling: assign every node a path string recording its position
//! - rewriting: replace enhanced combinators with equivalent subtrees over
//!   the primitive set
//!
//! Every rewrite is a pure function from a node to a replacement tree. The
//! lowerer rewrites the current root until its kind is in the target set or
//! no rewrite exists, restores the original label on the replacement root,
//! then recurses into children.

use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::compose::ComposeError;
use crate::expr::EXEC_KIND_EXPR;
use crate::types::{version_at_most, CombinatorRegistry, Composition};

/// A pure rewrite from an enhanced combinator node to a replacement tree.
pub type RewriteFn = fn(&Composition) -> Result<Composition, ComposeError>;

/// Lowering target selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LowerTarget {
    /// No lowering.
    Off,
    /// Lower maximally, down to the primitive set.
    Max,
    /// Stop at any of the listed combinator kinds.
    Kinds(Vec<String>),
    /// Keep combinators whose `since` version is at most this bound.
    Version(String),
}

impl LowerTarget {
    /// Parse a target from its config spelling: "max"/"true"/"" lower
    /// maximally, "off"/"false" disable lowering, a dotted version string
    /// targets by version, anything else is a comma-separated kind list.
    pub fn parse(spec: &str) -> Self {
        let spec = spec.trim();
        match spec {
            "" | "max" | "true" => Self::Max,
            "off" | "false" | "none" => Self::Off,
            _ if spec.starts_with(|c: char| c.is_ascii_digit()) => {
                Self::Version(spec.to_string())
            }
            _ => Self::Kinds(
                spec.split(',')
                    .map(|kind| kind.trim().to_string())
                    .filter(|kind| !kind.is_empty())
                    .collect(),
            ),
        }
    }
}

/// Assign each node a path recording its position in the root: `[i]` for a
/// variadic child at index i, `.name` for a named argument. The root's path
/// is the empty string.
pub fn label(tree: &mut Composition) {
    label_at(tree, "");
}

fn label_at(node: &mut Composition, path: &str) {
    node.set_path(path);
    if let Some(components) = node.take_components() {
        let mut labeled = Vec::with_capacity(components.len());
        for (index, mut child) in components.into_iter().enumerate() {
            label_at(&mut child, &format!("{path}[{index}]"));
            labeled.push(child);
        }
        node.set_components(labeled);
    }
    for name in node.child_names() {
        if let Some(mut child) = node.take_child(&name) {
            label_at(&mut child, &format!("{path}.{name}"));
            node.insert_child(name, child);
        }
    }
}

/// Lower a tree to the target set, preserving labels across rewrites.
pub fn lower_tree(
    registry: &CombinatorRegistry,
    rewrites: &BTreeMap<String, RewriteFn>,
    mut tree: Composition,
    target: &LowerTarget,
) -> Result<Composition, ComposeError> {
    if *target == LowerTarget::Off {
        return Ok(tree);
    }

    loop {
        if kind_in_target(registry, target, tree.kind()) {
            break;
        }
        let Some(rewrite) = rewrites.get(tree.kind()) else {
            break;
        };
        let original_path = tree.path().map(str::to_string);
        tracing::debug!(kind = %tree.kind(), path = ?original_path, "lowering combinator");
        let mut replacement = rewrite(&tree)?;
        if let Some(path) = original_path {
            replacement.set_path(path);
        }
        tree = replacement;
    }

    if let Some(components) = tree.take_components() {
        let lowered = components
            .into_iter()
            .map(|child| lower_tree(registry, rewrites, child, target))
            .collect::<Result<Vec<_>, _>>()?;
        tree.set_components(lowered);
    }
    for name in tree.child_names() {
        if let Some(child) = tree.take_child(&name) {
            tree.insert_child(name, lower_tree(registry, rewrites, child, target)?);
        }
    }
    Ok(tree)
}

fn kind_in_target(registry: &CombinatorRegistry, target: &LowerTarget, kind: &str) -> bool {
    match target {
        LowerTarget::Off => true,
        LowerTarget::Max => false,
        LowerTarget::Kinds(kinds) => kinds.iter().any(|k| k == kind),
        LowerTarget::Version(bound) => registry
            .get(kind)
            .map(|descriptor| version_at_most(&descriptor.since, bound))
            .unwrap_or(false),
    }
}

/// The canonical rewrite table.
pub(crate) fn builtin_rewrites() -> BTreeMap<String, RewriteFn> {
    let mut rewrites: BTreeMap<String, RewriteFn> = BTreeMap::new();
    rewrites.insert("empty".to_string(), rw_empty);
    rewrites.insert("seq".to_string(), rw_seq);
    rewrites.insert("value".to_string(), rw_value);
    rewrites.insert("literal".to_string(), rw_value);
    rewrites.insert("retain".to_string(), rw_retain);
    rewrites.insert("retain_catch".to_string(), rw_retain_catch);
    rewrites.insert("if".to_string(), rw_if);
    rewrites.insert("while".to_string(), rw_while);
    rewrites.insert("dowhile".to_string(), rw_dowhile);
    rewrites.insert("repeat".to_string(), rw_repeat);
    rewrites.insert("retry".to_string(), rw_retry);
    rewrites.insert("composition".to_string(), rw_composition);
    rewrites
}

// ============ rewrite helpers ============

fn func(code: Value) -> Composition {
    Composition::new("function")
        .with_value("function", json!({"exec": {"kind": EXEC_KIND_EXPR, "code": code}}))
}

fn sequence_of(children: Vec<Composition>) -> Composition {
    Composition::new("sequence").with_components(children)
}

fn mask_of(children: Vec<Composition>) -> Composition {
    Composition::new("mask").with_components(children)
}

fn let_of(declarations: Value, children: Vec<Composition>) -> Composition {
    Composition::new("let")
        .with_value("declarations", declarations)
        .with_components(children)
}

fn components_of(node: &Composition) -> Vec<Composition> {
    node.components().map(<[_]>::to_vec).unwrap_or_default()
}

fn required_child(node: &Composition, name: &str) -> Result<Composition, ComposeError> {
    node.child(name).cloned().ok_or_else(|| ComposeError::InvalidArgument {
        combinator: node.kind().to_string(),
        reason: format!("missing argument '{name}'"),
    })
}

/// Save the current params into the `params` variable, leaving them flowing.
fn save_params() -> Composition {
    func(json!(["set", "params", ["params"]]))
}

/// Restore the saved `params` variable as the current params.
fn restore_params() -> Composition {
    func(json!(["var", "params"]))
}

/// Decrement `count` and continue while it has not gone negative.
fn count_down() -> Value {
    json!(["do", ["set", "count", ["-", ["var", "count"], 1]], [">=", ["var", "count"], 0]])
}

// ============ rewrites ============

fn rw_empty(_node: &Composition) -> Result<Composition, ComposeError> {
    Ok(sequence_of(Vec::new()))
}

fn rw_seq(node: &Composition) -> Result<Composition, ComposeError> {
    Ok(sequence_of(components_of(node)))
}

fn rw_value(node: &Composition) -> Result<Composition, ComposeError> {
    let value = node.value("value").cloned().unwrap_or_else(|| json!({}));
    Ok(let_of(
        json!({ "value": value }),
        vec![func(json!(["var", "value"]))],
    ))
}

fn rw_retain(node: &Composition) -> Result<Composition, ComposeError> {
    Ok(let_of(
        json!({"params": null}),
        vec![
            save_params(),
            mask_of(components_of(node)),
            func(json!({"params": ["var", "params"], "result": ["params"]})),
        ],
    ))
}

fn rw_retain_catch(node: &Composition) -> Result<Composition, ComposeError> {
    let body = sequence_of(components_of(node));
    let caught = Composition::new("finally")
        .with_child("body", body)
        .with_child("finalizer", func(json!({"result": ["params"]})));
    Ok(sequence_of(vec![
        Composition::new("retain").with_components(vec![caught]),
        func(json!({"params": ["param", "params"], "result": ["param", "result.result"]})),
    ]))
}

fn rw_if(node: &Composition) -> Result<Composition, ComposeError> {
    let test = required_child(node, "test")?;
    let consequent = required_child(node, "consequent")?;
    let alternate = node
        .child("alternate")
        .cloned()
        .unwrap_or_else(|| Composition::new("empty"));
    Ok(let_of(
        json!({"params": null}),
        vec![
            save_params(),
            Composition::new("if_nosave")
                .with_child("test", mask_of(vec![test]))
                .with_child(
                    "consequent",
                    sequence_of(vec![restore_params(), mask_of(vec![consequent])]),
                )
                .with_child(
                    "alternate",
                    sequence_of(vec![restore_params(), mask_of(vec![alternate])]),
                ),
        ],
    ))
}

fn rw_while(node: &Composition) -> Result<Composition, ComposeError> {
    let test = required_child(node, "test")?;
    let body = required_child(node, "body")?;
    Ok(let_of(
        json!({"params": null}),
        vec![
            save_params(),
            Composition::new("while_nosave")
                .with_child("test", mask_of(vec![test]))
                .with_child(
                    "body",
                    sequence_of(vec![restore_params(), mask_of(vec![body]), save_params()]),
                ),
            restore_params(),
        ],
    ))
}

fn rw_dowhile(node: &Composition) -> Result<Composition, ComposeError> {
    let body = required_child(node, "body")?;
    let test = required_child(node, "test")?;
    Ok(let_of(
        json!({"params": null}),
        vec![
            save_params(),
            Composition::new("dowhile_nosave")
                .with_child(
                    "body",
                    sequence_of(vec![restore_params(), mask_of(vec![body]), save_params()]),
                )
                .with_child("test", mask_of(vec![test])),
            restore_params(),
        ],
    ))
}

fn rw_repeat(node: &Composition) -> Result<Composition, ComposeError> {
    let count = node.value("count").cloned().ok_or_else(|| {
        ComposeError::InvalidArgument {
            combinator: "repeat".to_string(),
            reason: "missing argument 'count'".to_string(),
        }
    })?;
    Ok(let_of(
        json!({ "count": count }),
        vec![Composition::new("while")
            .with_child("test", func(count_down()))
            .with_child("body", mask_of(vec![sequence_of(components_of(node))]))],
    ))
}

fn rw_retry(node: &Composition) -> Result<Composition, ComposeError> {
    let count = node.value("count").cloned().ok_or_else(|| {
        ComposeError::InvalidArgument {
            combinator: "retry".to_string(),
            reason: "missing argument 'count'".to_string(),
        }
    })?;
    let attempt = Composition::new("finally")
        .with_child("body", func(json!(["param", "params"])))
        .with_child(
            "finalizer",
            mask_of(vec![
                Composition::new("retain_catch").with_components(components_of(node))
            ]),
        );
    Ok(let_of(
        json!({ "count": count }),
        vec![
            func(json!({"params": ["params"]})),
            Composition::new("dowhile")
                .with_child("body", attempt)
                .with_child(
                    "test",
                    func(json!([
                        "and",
                        ["defined", ["param", "result.error"]],
                        count_down()
                    ])),
                ),
            func(json!(["param", "result"])),
        ],
    ))
}

fn rw_composition(node: &Composition) -> Result<Composition, ComposeError> {
    required_child(node, "composition")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::{Composer, Task};

    fn primitive_kinds(tree: &Composition, kinds: &mut Vec<String>) {
        kinds.push(tree.kind().to_string());
        if let Some(components) = tree.components() {
            for child in components {
                primitive_kinds(child, kinds);
            }
        }
        for (_, child) in tree.children() {
            primitive_kinds(child, kinds);
        }
    }

    #[test]
    fn test_label_assigns_component_and_named_paths() {
        let composer = Composer::new();
        let mut tree = composer
            .try_(
                Task::Composition(
                    composer
                        .sequence(vec![Task::from("a"), Task::from("b")])
                        .unwrap(),
                ),
                Task::from("h"),
            )
            .unwrap();
        composer.label(&mut tree);

        assert_eq!(tree.path(), Some(""));
        assert_eq!(tree.child("body").unwrap().path(), Some(".body"));
        assert_eq!(tree.child("handler").unwrap().path(), Some(".handler"));
        let body = tree.child("body").unwrap();
        assert_eq!(body.components().unwrap()[0].path(), Some(".body[0]"));
        assert_eq!(body.components().unwrap()[1].path(), Some(".body[1]"));
    }

    #[test]
    fn test_value_lowers_to_let_over_function() {
        let composer = Composer::new();
        let tree = composer.value(json!(42)).unwrap();
        let lowered = composer.lower(tree, &LowerTarget::Max).unwrap();

        assert_eq!(lowered.kind(), "let");
        assert_eq!(lowered.value("declarations"), Some(&json!({"value": 42})));
        assert_eq!(lowered.components().unwrap()[0].kind(), "function");
    }

    #[test]
    fn test_max_lowering_reaches_the_primitive_set() {
        let composer = Composer::new();
        let tree = composer
            .retry(2, vec![Task::from("act/flaky")])
            .unwrap();
        let lowered = composer.lower(tree, &LowerTarget::Max).unwrap();

        let mut kinds = Vec::new();
        primitive_kinds(&lowered, &mut kinds);
        for kind in &kinds {
            assert!(
                matches!(
                    kind.as_str(),
                    "sequence"
                        | "if_nosave"
                        | "while_nosave"
                        | "dowhile_nosave"
                        | "try"
                        | "finally"
                        | "let"
                        | "mask"
                        | "action"
                        | "function"
                ),
                "kind '{}' escaped lowering",
                kind
            );
        }
    }

    #[test]
    fn test_lowering_is_idempotent_and_identity_on_primitives() {
        let composer = Composer::new();
        let mut tree = composer
            .let_(
                json!({"x": 1}),
                vec![Task::expr(json!(["var", "x"])), Task::from("act/echo")],
            )
            .unwrap();
        composer.label(&mut tree);

        let once = composer.lower(tree.clone(), &LowerTarget::Max).unwrap();
        let twice = composer.lower(once.clone(), &LowerTarget::Max).unwrap();
        assert_eq!(once, twice);

        // a tree already made of primitives is untouched
        assert_eq!(once, composer.lower(tree, &LowerTarget::Max).unwrap());
    }

    #[test]
    fn test_root_labels_survive_rewrites() {
        let composer = Composer::new();
        let mut tree = composer
            .sequence(vec![Task::Composition(composer.value(json!(7)).unwrap())])
            .unwrap();
        composer.label(&mut tree);

        let lowered = composer.lower(tree, &LowerTarget::Max).unwrap();
        assert_eq!(lowered.path(), Some(""));
        // the value node was replaced by a let; the label stays on the new root
        assert_eq!(lowered.components().unwrap()[0].path(), Some("[0]"));
    }

    #[test]
    fn test_kind_target_stops_at_listed_combinators() {
        let composer = Composer::new();
        let tree = composer.retain(vec![Task::from("act/echo")]).unwrap();
        let lowered = composer
            .lower(tree.clone(), &LowerTarget::Kinds(vec!["retain".to_string()]))
            .unwrap();
        assert_eq!(lowered.kind(), "retain");

        let fully = composer.lower(tree, &LowerTarget::Max).unwrap();
        assert_eq!(fully.kind(), "let");
    }

    #[test]
    fn test_version_target_keeps_combinators_within_bound() {
        let composer = Composer::new();

        // `if` is 0.4.0: kept at 0.4.0, rewritten below it
        let tree = composer
            .if_(Task::expr(json!(["lit", true])), Task::from("y"), Task::from("n"))
            .unwrap();
        let kept = composer
            .lower(tree.clone(), &LowerTarget::Version("0.4.0".to_string()))
            .unwrap();
        assert_eq!(kept.kind(), "if");
        let rewritten = composer
            .lower(tree, &LowerTarget::Version("0.1.0".to_string()))
            .unwrap();
        assert_eq!(rewritten.kind(), "let");

        // `retry` is 0.5.0: rewritten at 0.4.0 but its expansion may keep
        // other 0.4.0 combinators
        let retry = composer.retry(1, vec![Task::from("act/echo")]).unwrap();
        let lowered = composer
            .lower(retry, &LowerTarget::Version("0.4.0".to_string()))
            .unwrap();
        assert_eq!(lowered.kind(), "let");
        assert_eq!(lowered.components().unwrap()[1].kind(), "dowhile");
    }

    #[test]
    fn test_off_target_disables_lowering() {
        let composer = Composer::new();
        let tree = composer.repeat(3, vec![Task::from("act/echo")]).unwrap();
        let untouched = composer.lower(tree.clone(), &LowerTarget::Off).unwrap();
        assert_eq!(untouched, tree);
    }

    #[test]
    fn test_parse_target_spellings() {
        assert_eq!(LowerTarget::parse("max"), LowerTarget::Max);
        assert_eq!(LowerTarget::parse(""), LowerTarget::Max);
        assert_eq!(LowerTarget::parse("off"), LowerTarget::Off);
        assert_eq!(
            LowerTarget::parse("0.4.0"),
            LowerTarget::Version("0.4.0".to_string())
        );
        assert_eq!(
            LowerTarget::parse("retain, retry"),
            LowerTarget::Kinds(vec!["retain".to_string(), "retry".to_string()])
        );
    }
}
