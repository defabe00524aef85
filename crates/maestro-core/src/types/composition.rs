//! Composition tree node.
//!
//! A `Composition` is one node of the combinator AST. Every node is tagged
//! with its combinator kind and carries whatever the combinator declares:
//! named child compositions (`test`, `body`, `handler`, ...), scalar argument
//! values (`name`, `count`, `declarations`, ...), and, for variadic
//! combinators, an ordered `components` list.

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One node of the composition AST.
///
/// The JSON form is `{"type": <kind>, ...fields}`. Serialization lives on the
/// node; deserialization goes through the combinator registry because field
/// interpretation depends on the descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Composition {
    kind: String,
    path: Option<String>,
    components: Option<Vec<Composition>>,
    children: BTreeMap<String, Composition>,
    values: Map<String, Value>,
}

impl Composition {
    /// Create a bare node for the given combinator kind.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            path: None,
            components: None,
            children: BTreeMap::new(),
            values: Map::new(),
        }
    }

    /// Combinator kind tag.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Label assigned by `label`, if any.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Assign the node label.
    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = Some(path.into());
    }

    /// Attach an ordered component list (variadic combinators).
    pub fn with_components(mut self, components: Vec<Composition>) -> Self {
        self.components = Some(components);
        self
    }

    /// Attach a named child composition.
    pub fn with_child(mut self, name: impl Into<String>, child: Composition) -> Self {
        self.children.insert(name.into(), child);
        self
    }

    /// Attach a scalar argument value.
    pub fn with_value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    /// Ordered components, if this node is variadic.
    pub fn components(&self) -> Option<&[Composition]> {
        self.components.as_deref()
    }

    /// Remove and return the component list.
    pub fn take_components(&mut self) -> Option<Vec<Composition>> {
        self.components.take()
    }

    /// Replace the component list.
    pub fn set_components(&mut self, components: Vec<Composition>) {
        self.components = Some(components);
    }

    /// Named child composition.
    pub fn child(&self, name: &str) -> Option<&Composition> {
        self.children.get(name)
    }

    /// Names of all child compositions, in field order.
    pub fn child_names(&self) -> Vec<String> {
        self.children.keys().cloned().collect()
    }

    /// Remove and return a named child composition.
    pub fn take_child(&mut self, name: &str) -> Option<Composition> {
        self.children.remove(name)
    }

    /// Insert a named child composition.
    pub fn insert_child(&mut self, name: impl Into<String>, child: Composition) {
        self.children.insert(name.into(), child);
    }

    /// Iterate named child compositions.
    pub fn children(&self) -> impl Iterator<Item = (&String, &Composition)> {
        self.children.iter()
    }

    /// Scalar argument value.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Scalar argument value as a string.
    pub fn string_value(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(Value::as_str)
    }

    /// Scalar argument value as a boolean, absent meaning false.
    pub fn bool_value(&self, name: &str) -> bool {
        self.values
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Serialize to the canonical `{"type": kind, ...fields}` JSON form.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("type".to_string(), Value::String(self.kind.clone()));
        if let Some(path) = &self.path {
            map.insert("path".to_string(), Value::String(path.clone()));
        }
        for (name, value) in &self.values {
            map.insert(name.clone(), value.clone());
        }
        for (name, child) in &self.children {
            map.insert(name.clone(), child.to_json());
        }
        if let Some(components) = &self.components {
            map.insert(
                "components".to_string(),
                Value::Array(components.iter().map(Composition::to_json).collect()),
            );
        }
        Value::Object(map)
    }
}

impl Serialize for Composition {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_json().serialize(serializer)
    }
}
