//! Combinator builder module
//!
//! The composer is the front door of the pipeline. It owns the combinator
//! registry and builds validated AST nodes three ways:
//! - a typed surface (one method per combinator over [`Task`] arguments)
//! - a positional JSON surface ([`Composer::build`]) with the full argument
//!   discipline (too-many / missing / type checks)
//! - [`Composer::deserialize`] for JSON composition documents
//!
//! It also fronts the lowerer: `label` assigns path labels and `lower`
//! rewrites enhanced combinators down to a target set.

mod names;

pub use names::parse_action_name;

use serde_json::{json, Value};
use thiserror::Error;

use crate::expr::{self, ExprError, EXEC_KIND_EXPR, EXEC_KIND_NODEJS, NATIVE_CODE_MARKER};
use crate::lower::{self, LowerTarget, RewriteFn};
use crate::plugin::{Plugin, PluginError};
use crate::types::{ArgKind, CombinatorDescriptor, CombinatorRegistry, Composition};

/// Build-time errors raised while constructing compositions.
#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("too many arguments in combinator '{0}'")]
    TooManyArguments(String),

    #[error("invalid argument for combinator '{combinator}': {reason}")]
    InvalidArgument { combinator: String, reason: String },

    #[error("invalid name: '{0}'")]
    InvalidName(String),

    #[error("undefined combinator: '{0}'")]
    UndefinedCombinator(String),

    #[error("invalid expression: {0}")]
    Expr(#[from] ExprError),
}

fn invalid(combinator: &str, reason: impl Into<String>) -> ComposeError {
    ComposeError::InvalidArgument {
        combinator: combinator.to_string(),
        reason: reason.into(),
    }
}

/// A task argument for the typed builder surface, mirroring the `task`
/// coercion table: nothing, an existing composition, an inline expression, or
/// an action name.
#[derive(Debug, Clone)]
pub enum Task {
    None,
    Composition(Composition),
    Expr(Value),
    Action(String),
}

impl Task {
    /// An inline-expression task.
    pub fn expr(code: Value) -> Self {
        Self::Expr(code)
    }
}

impl From<Composition> for Task {
    fn from(composition: Composition) -> Self {
        Self::Composition(composition)
    }
}

impl From<&str> for Task {
    fn from(name: &str) -> Self {
        Self::Action(name.to_string())
    }
}

impl From<String> for Task {
    fn from(name: String) -> Self {
        Self::Action(name)
    }
}

/// Composition builder over the combinator registry.
pub struct Composer {
    registry: CombinatorRegistry,
    rewrites: std::collections::BTreeMap<String, RewriteFn>,
}

impl Composer {
    /// Create a composer over the built-in combinator table and rewrites.
    pub fn new() -> Self {
        Self {
            registry: CombinatorRegistry::builtin(),
            rewrites: lower::builtin_rewrites(),
        }
    }

    /// The active combinator registry.
    pub fn registry(&self) -> &CombinatorRegistry {
        &self.registry
    }

    /// Merge a plugin's combinators and rewrites. Existing names are never
    /// overridden; a collision fails registration.
    pub fn register_plugin(&mut self, plugin: &dyn Plugin) -> Result<(), PluginError> {
        for descriptor in plugin.combinators() {
            let name = descriptor.name.clone();
            if !self.registry.insert(descriptor) {
                return Err(PluginError::Conflict {
                    plugin: plugin.name().to_string(),
                    what: "combinator",
                    name,
                });
            }
        }
        for (kind, rewrite) in plugin.rewrites() {
            if self.rewrites.contains_key(&kind) {
                return Err(PluginError::Conflict {
                    plugin: plugin.name().to_string(),
                    what: "rewrite",
                    name: kind,
                });
            }
            self.rewrites.insert(kind, rewrite);
        }
        tracing::debug!(plugin = %plugin.name(), "registered composer plugin");
        Ok(())
    }

    // ============ positional JSON surface ============

    /// Build a composition from a combinator name and positional JSON
    /// arguments, enforcing the declared argument discipline.
    pub fn build(&self, kind: &str, args: Vec<Value>) -> Result<Composition, ComposeError> {
        let descriptor = self
            .registry
            .get(kind)
            .ok_or_else(|| ComposeError::UndefinedCombinator(kind.to_string()))?
            .clone();
        if !descriptor.components && args.len() > descriptor.args.len() {
            return Err(ComposeError::TooManyArguments(kind.to_string()));
        }

        match kind {
            "action" => {
                let name = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid("action", "name must be a string"))?;
                self.action(name, args.get(1))
            }
            "function" => {
                let payload = args
                    .into_iter()
                    .next()
                    .ok_or_else(|| invalid("function", "missing function payload"))?;
                self.function(payload)
            }
            "composition" => {
                let name = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid("composition", "name must be a string"))?
                    .to_string();
                let body = args
                    .get(1)
                    .cloned()
                    .ok_or_else(|| invalid("composition", "missing composition body"))?;
                let body = self.task(body)?;
                self.composition(&name, Task::Composition(body), args.get(2))
            }
            _ => self.build_generic(&descriptor, args),
        }
    }

    fn build_generic(
        &self,
        descriptor: &CombinatorDescriptor,
        args: Vec<Value>,
    ) -> Result<Composition, ComposeError> {
        let kind = descriptor.name.as_str();
        let mut node = Composition::new(kind);
        let mut args = args.into_iter();

        for spec in &descriptor.args {
            let arg = args.next();
            match spec.kind {
                ArgKind::Composition => match arg {
                    Some(value) => node = node.with_child(spec.name.as_str(), self.task(value)?),
                    None if spec.optional => {}
                    None => {
                        return Err(invalid(kind, format!("missing argument '{}'", spec.name)))
                    }
                },
                ArgKind::Value => {
                    let value = arg.unwrap_or_else(|| json!({}));
                    if expr::is_function_payload(&value) {
                        return Err(invalid(
                            kind,
                            format!("argument '{}' must not be a function", spec.name),
                        ));
                    }
                    node = node.with_value(spec.name.as_str(), value);
                }
                ArgKind::Object => match arg {
                    Some(value) if value.is_object() => {
                        node = node.with_value(spec.name.as_str(), value)
                    }
                    Some(_) => {
                        return Err(invalid(
                            kind,
                            format!("argument '{}' must be an object", spec.name),
                        ))
                    }
                    None if spec.optional => {}
                    None => {
                        return Err(invalid(kind, format!("missing argument '{}'", spec.name)))
                    }
                },
                ArgKind::String => match arg {
                    Some(Value::String(s)) => node = node.with_value(spec.name.as_str(), json!(s)),
                    Some(_) => {
                        return Err(invalid(
                            kind,
                            format!("argument '{}' must be a string", spec.name),
                        ))
                    }
                    None if spec.optional => {}
                    None => {
                        return Err(invalid(kind, format!("missing argument '{}'", spec.name)))
                    }
                },
                ArgKind::Number => match arg {
                    Some(value) if value.is_number() => {
                        node = node.with_value(spec.name.as_str(), value)
                    }
                    Some(_) => {
                        return Err(invalid(
                            kind,
                            format!("argument '{}' must be a number", spec.name),
                        ))
                    }
                    None if spec.optional => {}
                    None => {
                        return Err(invalid(kind, format!("missing argument '{}'", spec.name)))
                    }
                },
            }
        }

        if descriptor.components {
            let components = args
                .map(|value| self.task(value))
                .collect::<Result<Vec<_>, _>>()?;
            node = node.with_components(components);
        }

        Ok(node)
    }

    /// Coerce a JSON value into a task composition: null becomes `empty`, a
    /// composition document deserializes, an inline expression becomes a
    /// `function`, a string becomes an `action`, anything else is invalid.
    pub fn task(&self, value: Value) -> Result<Composition, ComposeError> {
        match value {
            Value::Null => Ok(self.empty()),
            Value::Object(ref map)
                if map
                    .get("type")
                    .and_then(Value::as_str)
                    .map(|t| self.registry.contains(t))
                    .unwrap_or(false) =>
            {
                self.deserialize(&value)
            }
            value if expr::is_expression(&value) => self.function(value),
            Value::String(name) => self.action(&name, None),
            other => Err(invalid("task", format!("cannot coerce {other} to a task"))),
        }
    }

    fn task_arg(&self, task: Task) -> Result<Composition, ComposeError> {
        match task {
            Task::None => Ok(self.empty()),
            Task::Composition(composition) => Ok(composition),
            Task::Expr(code) => self.function_expr(code),
            Task::Action(name) => self.action(&name, None),
        }
    }

    fn task_list(&self, tasks: Vec<Task>) -> Result<Vec<Composition>, ComposeError> {
        tasks.into_iter().map(|t| self.task_arg(t)).collect()
    }

    // ============ typed surface ============

    /// The empty composition.
    pub fn empty(&self) -> Composition {
        Composition::new("empty")
    }

    /// Run tasks in order.
    pub fn sequence(&self, tasks: Vec<Task>) -> Result<Composition, ComposeError> {
        Ok(Composition::new("sequence").with_components(self.task_list(tasks)?))
    }

    /// Alias of `sequence`.
    pub fn seq(&self, tasks: Vec<Task>) -> Result<Composition, ComposeError> {
        Ok(Composition::new("seq").with_components(self.task_list(tasks)?))
    }

    /// Conditional preserving caller params around the test.
    pub fn if_(
        &self,
        test: Task,
        consequent: Task,
        alternate: Task,
    ) -> Result<Composition, ComposeError> {
        Ok(Composition::new("if")
            .with_child("test", self.task_arg(test)?)
            .with_child("consequent", self.task_arg(consequent)?)
            .with_child("alternate", self.task_arg(alternate)?))
    }

    /// Conditional; the consequent and alternate receive the test output.
    pub fn if_nosave(
        &self,
        test: Task,
        consequent: Task,
        alternate: Task,
    ) -> Result<Composition, ComposeError> {
        Ok(Composition::new("if_nosave")
            .with_child("test", self.task_arg(test)?)
            .with_child("consequent", self.task_arg(consequent)?)
            .with_child("alternate", self.task_arg(alternate)?))
    }

    /// Loop preserving params around the test.
    pub fn while_(&self, test: Task, body: Task) -> Result<Composition, ComposeError> {
        Ok(Composition::new("while")
            .with_child("test", self.task_arg(test)?)
            .with_child("body", self.task_arg(body)?))
    }

    /// Loop; the body receives the test output.
    pub fn while_nosave(&self, test: Task, body: Task) -> Result<Composition, ComposeError> {
        Ok(Composition::new("while_nosave")
            .with_child("test", self.task_arg(test)?)
            .with_child("body", self.task_arg(body)?))
    }

    /// Body-first loop preserving params around the test.
    pub fn dowhile(&self, body: Task, test: Task) -> Result<Composition, ComposeError> {
        Ok(Composition::new("dowhile")
            .with_child("body", self.task_arg(body)?)
            .with_child("test", self.task_arg(test)?))
    }

    /// Body-first loop; the body receives the test output on repeat.
    pub fn dowhile_nosave(&self, body: Task, test: Task) -> Result<Composition, ComposeError> {
        Ok(Composition::new("dowhile_nosave")
            .with_child("body", self.task_arg(body)?)
            .with_child("test", self.task_arg(test)?))
    }

    /// Install an error handler around the body.
    pub fn try_(&self, body: Task, handler: Task) -> Result<Composition, ComposeError> {
        Ok(Composition::new("try")
            .with_child("body", self.task_arg(body)?)
            .with_child("handler", self.task_arg(handler)?))
    }

    /// Run the finalizer whether or not the body errors.
    pub fn finally(&self, body: Task, finalizer: Task) -> Result<Composition, ComposeError> {
        Ok(Composition::new("finally")
            .with_child("body", self.task_arg(body)?)
            .with_child("finalizer", self.task_arg(finalizer)?))
    }

    /// Scoped variable declarations around the tasks.
    pub fn let_(&self, declarations: Value, tasks: Vec<Task>) -> Result<Composition, ComposeError> {
        if !declarations.is_object() {
            return Err(invalid("let", "declarations must be an object"));
        }
        Ok(Composition::new("let")
            .with_value("declarations", declarations)
            .with_components(self.task_list(tasks)?))
    }

    /// Hide the enclosing let-frame from the nested tasks.
    pub fn mask(&self, tasks: Vec<Task>) -> Result<Composition, ComposeError> {
        Ok(Composition::new("mask").with_components(self.task_list(tasks)?))
    }

    /// Remote action invocation.
    pub fn action(&self, name: &str, options: Option<&Value>) -> Result<Composition, ComposeError> {
        let qualified = parse_action_name(name)?;
        let mut node = Composition::new("action").with_value("name", Value::String(qualified));
        if let Some(options) = options {
            let map = options
                .as_object()
                .ok_or_else(|| invalid("action", "options must be an object"))?;
            if let Some(sequence) = map.get("sequence") {
                let items = sequence
                    .as_array()
                    .ok_or_else(|| invalid("action", "options.sequence must be an array"))?;
                let mut components = Vec::with_capacity(items.len());
                for item in items {
                    let name = item
                        .as_str()
                        .ok_or_else(|| invalid("action", "sequence entries must be strings"))?;
                    components.push(Value::String(parse_action_name(name)?));
                }
                node = node.with_value(
                    "exec",
                    json!({"kind": "sequence", "components": components}),
                );
            } else if let Some(code) = map.get("action") {
                node = node.with_value("exec", self.exec_payload(code)?);
            }
            if map.get("async").and_then(Value::as_bool) == Some(true) {
                node = node.with_value("async", Value::Bool(true));
            }
        }
        Ok(node)
    }

    /// Inline code. Accepts an expression tree (validated eagerly), a raw
    /// source string (native-code markers forbidden), or an exec payload.
    pub fn function(&self, payload: Value) -> Result<Composition, ComposeError> {
        let exec = self.exec_payload(&payload)?;
        Ok(Composition::new("function").with_value("function", json!({ "exec": exec })))
    }

    /// Inline code known to be an expression tree, including object
    /// templates that would otherwise read as exec payloads.
    pub fn function_expr(&self, code: Value) -> Result<Composition, ComposeError> {
        expr::compile(&code)?;
        Ok(Composition::new("function")
            .with_value("function", json!({"exec": {"kind": EXEC_KIND_EXPR, "code": code}})))
    }

    fn exec_payload(&self, code: &Value) -> Result<Value, ComposeError> {
        if expr::is_expression(code) {
            expr::compile(code)?;
            return Ok(json!({"kind": EXEC_KIND_EXPR, "code": code}));
        }
        match code {
            Value::String(source) => {
                check_native(source)?;
                Ok(json!({"kind": EXEC_KIND_NODEJS, "code": source}))
            }
            Value::Object(map) => {
                if let Some(exec) = map.get("exec") {
                    return self.exec_payload(exec);
                }
                let inner = map
                    .get("code")
                    .ok_or_else(|| invalid("function", "payload must carry code"))?;
                let kind = map
                    .get("kind")
                    .and_then(Value::as_str)
                    .unwrap_or(EXEC_KIND_NODEJS);
                if kind == EXEC_KIND_EXPR {
                    expr::compile(inner)?;
                } else if let Some(source) = inner.as_str() {
                    check_native(source)?;
                }
                Ok(json!({"kind": kind, "code": inner}))
            }
            other => Err(invalid(
                "function",
                format!("cannot use {other} as function code"),
            )),
        }
    }

    /// Named, deployable composition.
    pub fn composition(
        &self,
        name: &str,
        body: Task,
        options: Option<&Value>,
    ) -> Result<Composition, ComposeError> {
        let qualified = parse_action_name(name)?;
        let mut node = Composition::new("composition")
            .with_value("name", Value::String(qualified))
            .with_child("composition", self.task_arg(body)?);
        if let Some(options) = options {
            let map = options
                .as_object()
                .ok_or_else(|| invalid("composition", "options must be an object"))?;
            if map.get("async").and_then(Value::as_bool) == Some(true) {
                node = node.with_value("async", Value::Bool(true));
            }
        }
        Ok(node)
    }

    /// Attach the input params to the output.
    pub fn retain(&self, tasks: Vec<Task>) -> Result<Composition, ComposeError> {
        Ok(Composition::new("retain").with_components(self.task_list(tasks)?))
    }

    /// Attach the input params to the output, catching errors.
    pub fn retain_catch(&self, tasks: Vec<Task>) -> Result<Composition, ComposeError> {
        Ok(Composition::new("retain_catch").with_components(self.task_list(tasks)?))
    }

    /// Run the tasks `count` times.
    pub fn repeat(&self, count: i64, tasks: Vec<Task>) -> Result<Composition, ComposeError> {
        Ok(Composition::new("repeat")
            .with_value("count", json!(count))
            .with_components(self.task_list(tasks)?))
    }

    /// Retry the tasks up to `count` times on error.
    pub fn retry(&self, count: i64, tasks: Vec<Task>) -> Result<Composition, ComposeError> {
        Ok(Composition::new("retry")
            .with_value("count", json!(count))
            .with_components(self.task_list(tasks)?))
    }

    /// Produce a constant value.
    pub fn value(&self, value: Value) -> Result<Composition, ComposeError> {
        if expr::is_function_payload(&value) {
            return Err(invalid("value", "argument must not be a function"));
        }
        Ok(Composition::new("value").with_value("value", value))
    }

    /// Alias of `value`.
    pub fn literal(&self, value: Value) -> Result<Composition, ComposeError> {
        if expr::is_function_payload(&value) {
            return Err(invalid("literal", "argument must not be a function"));
        }
        Ok(Composition::new("literal").with_value("value", value))
    }

    // ============ serialization ============

    /// Rebuild a composition from its JSON document, visiting named
    /// composition slots and components per the registry. Idempotent on
    /// round-tripped trees.
    pub fn deserialize(&self, value: &Value) -> Result<Composition, ComposeError> {
        let map = value
            .as_object()
            .ok_or_else(|| invalid("deserialize", "composition must be an object"))?;
        let kind = map
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("deserialize", "composition must carry a type tag"))?;
        let descriptor = self
            .registry
            .get(kind)
            .ok_or_else(|| ComposeError::UndefinedCombinator(kind.to_string()))?
            .clone();

        let mut node = Composition::new(kind);
        let mut consumed: Vec<&str> = vec!["type", "path", "components"];

        for spec in &descriptor.args {
            consumed.push(spec.name.as_str());
            let field = match map.get(&spec.name) {
                Some(field) => field,
                None if spec.optional => continue,
                None if spec.kind == ArgKind::Value => {
                    node = node.with_value(spec.name.as_str(), json!({}));
                    continue;
                }
                None => {
                    return Err(invalid(kind, format!("missing argument '{}'", spec.name)))
                }
            };
            match spec.kind {
                ArgKind::Composition => {
                    node = node.with_child(spec.name.as_str(), self.deserialize(field)?)
                }
                ArgKind::Value => {
                    if expr::is_function_payload(field) {
                        return Err(invalid(
                            kind,
                            format!("argument '{}' must not be a function", spec.name),
                        ));
                    }
                    node = node.with_value(spec.name.as_str(), field.clone());
                }
                ArgKind::Object => {
                    if !field.is_object() {
                        return Err(invalid(
                            kind,
                            format!("argument '{}' must be an object", spec.name),
                        ));
                    }
                    node = node.with_value(spec.name.as_str(), field.clone());
                }
                ArgKind::String => {
                    if !field.is_string() {
                        return Err(invalid(
                            kind,
                            format!("argument '{}' must be a string", spec.name),
                        ));
                    }
                    node = node.with_value(spec.name.as_str(), field.clone());
                }
                ArgKind::Number => {
                    if !field.is_number() {
                        return Err(invalid(
                            kind,
                            format!("argument '{}' must be a number", spec.name),
                        ));
                    }
                    node = node.with_value(spec.name.as_str(), field.clone());
                }
            }
        }

        if descriptor.components {
            let components = match map.get("components") {
                Some(Value::Array(items)) => items
                    .iter()
                    .map(|item| self.deserialize(item))
                    .collect::<Result<Vec<_>, _>>()?,
                Some(_) => {
                    return Err(invalid(kind, "components must be an array"));
                }
                None => Vec::new(),
            };
            node = node.with_components(components);
        }

        // carry through extra metadata such as exec and async
        for (name, field) in map {
            if consumed.iter().any(|c| *c == name.as_str()) || node.value(name).is_some() {
                continue;
            }
            node = node.with_value(name, field.clone());
        }

        if let Some(path) = map.get("path").and_then(Value::as_str) {
            node.set_path(path);
        }
        Ok(node)
    }

    // ============ lowering front ============

    /// Assign path labels over the whole tree.
    pub fn label(&self, tree: &mut Composition) {
        lower::label(tree);
    }

    /// Rewrite enhanced combinators down to the target set.
    pub fn lower(
        &self,
        tree: Composition,
        target: &LowerTarget,
    ) -> Result<Composition, ComposeError> {
        lower::lower_tree(&self.registry, &self.rewrites, tree, target)
    }
}

impl Default for Composer {
    fn default() -> Self {
        Self::new()
    }
}

fn check_native(source: &str) -> Result<(), ComposeError> {
    if source.contains(NATIVE_CODE_MARKER) {
        return Err(invalid("function", "cannot capture native code"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extra_positional_arguments_are_rejected() {
        let composer = Composer::new();
        let err = composer.build("empty", vec![json!(null)]).unwrap_err();
        assert!(matches!(err, ComposeError::TooManyArguments(name) if name == "empty"));

        let err = composer
            .build(
                "if",
                vec![json!(null), json!(null), json!(null), json!(null)],
            )
            .unwrap_err();
        assert!(matches!(err, ComposeError::TooManyArguments(_)));
    }

    #[test]
    fn test_missing_required_argument_is_invalid() {
        let composer = Composer::new();
        let err = composer.build("try", vec![json!("foo")]).unwrap_err();
        assert!(matches!(err, ComposeError::InvalidArgument { .. }));
    }

    #[test]
    fn test_argument_type_violations_are_invalid() {
        let composer = Composer::new();
        let err = composer.build("repeat", vec![json!("three")]).unwrap_err();
        assert!(matches!(err, ComposeError::InvalidArgument { .. }));

        let err = composer
            .build("let", vec![json!([1, 2])])
            .unwrap_err();
        assert!(matches!(err, ComposeError::InvalidArgument { .. }));
    }

    #[test]
    fn test_undefined_combinator_is_rejected() {
        let composer = Composer::new();
        let err = composer.build("warp", vec![]).unwrap_err();
        assert!(matches!(err, ComposeError::UndefinedCombinator(name) if name == "warp"));
    }

    #[test]
    fn test_task_coercion_table() {
        let composer = Composer::new();

        assert_eq!(composer.task(json!(null)).unwrap().kind(), "empty");

        let existing = composer.empty().to_json();
        assert_eq!(composer.task(existing.clone()).unwrap().to_json(), existing);

        let function = composer.task(json!(["+", ["param", "n"], 1])).unwrap();
        assert_eq!(function.kind(), "function");
        assert_eq!(
            function.value("function"),
            Some(&json!({"exec": {"kind": EXEC_KIND_EXPR, "code": ["+", ["param", "n"], 1]}}))
        );

        let action = composer.task(json!("foo")).unwrap();
        assert_eq!(action.kind(), "action");
        assert_eq!(action.string_value("name"), Some("/_/foo"));

        assert!(matches!(
            composer.task(json!(42)),
            Err(ComposeError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_value_combinator_rejects_function_payloads_and_defaults_to_empty_object() {
        let composer = Composer::new();
        let err = composer
            .build(
                "value",
                vec![json!({"exec": {"kind": EXEC_KIND_EXPR, "code": ["params"]}})],
            )
            .unwrap_err();
        assert!(matches!(err, ComposeError::InvalidArgument { .. }));

        let node = composer.build("value", vec![]).unwrap();
        assert_eq!(node.value("value"), Some(&json!({})));
    }

    #[test]
    fn test_function_rejects_native_code_markers() {
        let composer = Composer::new();
        let err = composer
            .function(json!("function main() { [native code] }"))
            .unwrap_err();
        assert!(matches!(err, ComposeError::InvalidArgument { .. }));
    }

    #[test]
    fn test_function_rejects_expressions_that_do_not_compile() {
        let composer = Composer::new();
        let err = composer.function(json!(["frobnicate", 1])).unwrap_err();
        assert!(matches!(err, ComposeError::Expr(_)));
    }

    #[test]
    fn test_action_options_propagate_async_and_native_sequences() {
        let composer = Composer::new();
        let node = composer
            .action(
                "pipeline",
                Some(&json!({"async": true, "sequence": ["step1", "pkg/step2"]})),
            )
            .unwrap();
        assert!(node.bool_value("async"));
        assert_eq!(
            node.value("exec"),
            Some(&json!({"kind": "sequence", "components": ["/_/step1", "/_/pkg/step2"]}))
        );
    }

    #[test]
    fn test_deserialize_round_trips_built_trees() {
        let composer = Composer::new();
        let tree = composer
            .try_(
                Task::Composition(
                    composer
                        .sequence(vec![Task::from("act/one"), Task::expr(json!(["params"]))])
                        .unwrap(),
                ),
                Task::expr(json!({"handled": ["param", "error"]})),
            )
            .unwrap();

        let document = tree.to_json();
        let rebuilt = composer.deserialize(&document).unwrap();
        assert_eq!(rebuilt, tree);
        assert_eq!(rebuilt.to_json(), document);
    }

    #[test]
    fn test_deserialize_rejects_unknown_types() {
        let composer = Composer::new();
        let err = composer.deserialize(&json!({"type": "warp"})).unwrap_err();
        assert!(matches!(err, ComposeError::UndefinedCombinator(_)));
    }

    #[test]
    fn test_composition_combinator_qualifies_name_and_wraps_body() {
        let composer = Composer::new();
        let node = composer
            .composition("demo", Task::from("act/step"), Some(&json!({"async": true})))
            .unwrap();
        assert_eq!(node.string_value("name"), Some("/_/demo"));
        assert!(node.bool_value("async"));
        assert_eq!(node.child("composition").map(Composition::kind), Some("action"));
    }
}
