//! Combinator descriptors and the registry.
//!
//! The registry is the canonical table of combinator shapes: whether a
//! combinator is variadic, its named argument slots, and the minimum version
//! it appeared in (used by version-targeted lowering).

use std::collections::BTreeMap;

/// Argument slot type for a combinator descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// A child composition, coerced through `task`.
    Composition,
    /// A plain string (e.g. an action name).
    String,
    /// A JSON number.
    Number,
    /// A non-null, non-array JSON mapping.
    Object,
    /// Any JSON value except a function payload.
    Value,
}

/// One named argument slot.
#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub name: String,
    pub kind: ArgKind,
    pub optional: bool,
}

impl ArgSpec {
    /// Declare a required argument slot.
    pub fn required(name: impl Into<String>, kind: ArgKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: false,
        }
    }

    /// Declare an optional argument slot.
    pub fn optional(name: impl Into<String>, kind: ArgKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: true,
        }
    }
}

/// Shape of one combinator.
#[derive(Debug, Clone)]
pub struct CombinatorDescriptor {
    /// Combinator name (the `type` tag).
    pub name: String,
    /// Whether trailing positional arguments collect into `components`.
    pub components: bool,
    /// Ordered named argument slots.
    pub args: Vec<ArgSpec>,
    /// Minimum version this combinator appeared in.
    pub since: String,
}

impl CombinatorDescriptor {
    /// Create a descriptor with no arguments.
    pub fn new(name: impl Into<String>, since: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            components: false,
            args: Vec::new(),
            since: since.into(),
        }
    }

    /// Mark the combinator variadic.
    pub fn variadic(mut self) -> Self {
        self.components = true;
        self
    }

    /// Append an argument slot.
    pub fn with_arg(mut self, arg: ArgSpec) -> Self {
        self.args.push(arg);
        self
    }
}

/// Canonical table of combinator shapes.
#[derive(Debug, Clone)]
pub struct CombinatorRegistry {
    entries: BTreeMap<String, CombinatorDescriptor>,
}

impl CombinatorRegistry {
    /// The built-in combinator table: the primitive set plus the enhanced
    /// combinators the lowerer knows how to rewrite.
    pub fn builtin() -> Self {
        use ArgKind::*;

        let mut registry = Self {
            entries: BTreeMap::new(),
        };
        let mut add = |d: CombinatorDescriptor| {
            registry.entries.insert(d.name.clone(), d);
        };

        add(CombinatorDescriptor::new("empty", "0.1.0"));
        add(CombinatorDescriptor::new("sequence", "0.1.0").variadic());
        add(CombinatorDescriptor::new("seq", "0.1.0").variadic());
        for name in ["if", "if_nosave"] {
            add(
                CombinatorDescriptor::new(name, if name == "if" { "0.4.0" } else { "0.1.0" })
                    .with_arg(ArgSpec::required("test", Composition))
                    .with_arg(ArgSpec::required("consequent", Composition))
                    .with_arg(ArgSpec::optional("alternate", Composition)),
            );
        }
        for name in ["while", "while_nosave"] {
            add(
                CombinatorDescriptor::new(name, if name == "while" { "0.4.0" } else { "0.1.0" })
                    .with_arg(ArgSpec::required("test", Composition))
                    .with_arg(ArgSpec::required("body", Composition)),
            );
        }
        for name in ["dowhile", "dowhile_nosave"] {
            add(
                CombinatorDescriptor::new(name, if name == "dowhile" { "0.4.0" } else { "0.1.0" })
                    .with_arg(ArgSpec::required("body", Composition))
                    .with_arg(ArgSpec::required("test", Composition)),
            );
        }
        add(CombinatorDescriptor::new("try", "0.1.0")
            .with_arg(ArgSpec::required("body", Composition))
            .with_arg(ArgSpec::required("handler", Composition)));
        add(CombinatorDescriptor::new("finally", "0.1.0")
            .with_arg(ArgSpec::required("body", Composition))
            .with_arg(ArgSpec::required("finalizer", Composition)));
        add(CombinatorDescriptor::new("let", "0.1.0")
            .variadic()
            .with_arg(ArgSpec::required("declarations", Object)));
        add(CombinatorDescriptor::new("mask", "0.1.0").variadic());
        add(CombinatorDescriptor::new("action", "0.1.0")
            .with_arg(ArgSpec::required("name", String))
            .with_arg(ArgSpec::optional("options", Object)));
        add(CombinatorDescriptor::new("function", "0.1.0")
            .with_arg(ArgSpec::required("function", Object)));
        add(CombinatorDescriptor::new("composition", "0.4.0")
            .with_arg(ArgSpec::required("name", String))
            .with_arg(ArgSpec::required("composition", Composition))
            .with_arg(ArgSpec::optional("options", Object)));
        add(CombinatorDescriptor::new("retain", "0.4.0").variadic());
        add(CombinatorDescriptor::new("retain_catch", "0.5.0").variadic());
        add(CombinatorDescriptor::new("repeat", "0.5.0")
            .variadic()
            .with_arg(ArgSpec::required("count", Number)));
        add(CombinatorDescriptor::new("retry", "0.5.0")
            .variadic()
            .with_arg(ArgSpec::required("count", Number)));
        add(CombinatorDescriptor::new("value", "0.4.0")
            .with_arg(ArgSpec::required("value", Value)));
        add(CombinatorDescriptor::new("literal", "0.4.0")
            .with_arg(ArgSpec::required("value", Value)));

        registry
    }

    /// Look up a descriptor by combinator name.
    pub fn get(&self, name: &str) -> Option<&CombinatorDescriptor> {
        self.entries.get(name)
    }

    /// Whether the registry knows the combinator.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Insert a descriptor. Returns false when the name is already taken;
    /// existing entries are never overridden.
    pub fn insert(&mut self, descriptor: CombinatorDescriptor) -> bool {
        if self.entries.contains_key(&descriptor.name) {
            return false;
        }
        self.entries.insert(descriptor.name.clone(), descriptor);
        true
    }

    /// All registered combinator names.
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

/// Compare two dotted version strings segment by segment.
///
/// Missing segments count as zero, so "0.4" == "0.4.0".
pub fn version_at_most(version: &str, bound: &str) -> bool {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|seg| seg.trim().parse::<u64>().unwrap_or(0))
            .collect()
    };
    let a = parse(version);
    let b = parse(bound);
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        if x != y {
            return x < y;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_covers_primitives_and_enhanced() {
        let registry = CombinatorRegistry::builtin();
        for name in [
            "empty", "sequence", "seq", "if", "if_nosave", "while", "while_nosave", "dowhile",
            "dowhile_nosave", "try", "finally", "let", "mask", "action", "function",
            "composition", "retain", "retain_catch", "repeat", "retry", "value", "literal",
        ] {
            assert!(registry.contains(name), "missing combinator '{}'", name);
        }
    }

    #[test]
    fn test_insert_does_not_override_existing_entries() {
        let mut registry = CombinatorRegistry::builtin();
        assert!(!registry.insert(CombinatorDescriptor::new("action", "9.9.9")));
        assert_eq!(registry.get("action").map(|d| d.since.as_str()), Some("0.1.0"));
        assert!(registry.insert(CombinatorDescriptor::new("parallel", "0.6.0").variadic()));
    }

    #[test]
    fn test_version_at_most_compares_numeric_segments() {
        assert!(version_at_most("0.4.0", "0.4.0"));
        assert!(version_at_most("0.4", "0.4.0"));
        assert!(version_at_most("0.1.0", "0.4.0"));
        assert!(!version_at_most("0.5.0", "0.4.0"));
        assert!(!version_at_most("0.10.0", "0.9.9"));
    }
}
