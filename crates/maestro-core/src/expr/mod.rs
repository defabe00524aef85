//! Inline expression evaluation.
//!
//! Function states carry their code as a JSON expression tree. This module
//! compiles a tree into a typed [`Expr`] once, so evaluation is a direct
//! match over enum variants with no string dispatch in the hot loop.
//!
//! Shape of the language:
//! - scalars are literals
//! - objects are field-wise templates (each field value is an expression)
//! - arrays whose head is a string are operator applications `[op, args...]`
//! - arrays with a non-string head are literal arrays
//!
//! Evaluation distinguishes `undefined` from `null`: reading an absent params
//! path yields undefined (`None`), and a function whose body evaluates to
//! undefined leaves the parameter object unchanged.

use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Exec dialect identifier for inline expression payloads.
pub const EXEC_KIND_EXPR: &str = "expr/v1";

/// Exec dialect identifier for opaque host-language source carried for
/// deployment. The conductor cannot evaluate this dialect.
pub const EXEC_KIND_NODEJS: &str = "nodejs:default";

/// Marker that identifies stringified native code, which must not travel.
pub const NATIVE_CODE_MARKER: &str = "[native code]";

/// Expression compilation / evaluation errors.
#[derive(Debug, Error)]
pub enum ExprError {
    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("operator '{op}' expects {expected} argument(s), got {got}")]
    Arity {
        op: &'static str,
        expected: &'static str,
        got: usize,
    },

    #[error("operator '{op}' expects a {expected} argument")]
    BadOperand {
        op: &'static str,
        expected: &'static str,
    },

    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),

    #[error("division by zero")]
    DivisionByZero,
}

/// Compiled expression. Every operator is a direct enum variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Array constructor with evaluated elements.
    List(Vec<Expr>),
    /// Object template with evaluated field values; undefined fields are
    /// omitted from the result.
    Object(Vec<(String, Expr)>),

    /// The whole current parameter object.
    Params,
    /// Dotted path into the current parameter object; absent yields undefined.
    Param(String),
    /// Innermost visible let-bound variable.
    Var(String),
    /// Assign a let-bound variable; evaluates to undefined.
    Set(String, Box<Expr>),
    /// True when the operand is not undefined.
    Defined(Box<Expr>),

    Do(Vec<Expr>),
    If(Box<Expr>, Box<Expr>, Option<Box<Expr>>),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),

    Eq(Box<Expr>, Box<Expr>),
    Neq(Box<Expr>, Box<Expr>),
    Lt(Box<Expr>, Box<Expr>),
    Lte(Box<Expr>, Box<Expr>),
    Gt(Box<Expr>, Box<Expr>),
    Gte(Box<Expr>, Box<Expr>),

    Add(Vec<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Vec<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Mod(Box<Expr>, Box<Expr>),

    Len(Box<Expr>),
    Get(Box<Expr>, Box<Expr>),
    Concat(Vec<Expr>),
}

/// Whether a JSON value is an operator application, i.e. "callable".
pub fn is_expression(value: &Value) -> bool {
    matches!(value, Value::Array(items) if items.first().map_or(false, Value::is_string))
}

/// Whether a JSON value is a function payload (`{"exec": {...}}`).
pub fn is_function_payload(value: &Value) -> bool {
    value
        .as_object()
        .and_then(|map| map.get("exec"))
        .map_or(false, Value::is_object)
}

/// Compile a JSON expression tree into a typed [`Expr`].
pub fn compile(value: &Value) -> Result<Expr, ExprError> {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            Ok(Expr::Literal(value.clone()))
        }
        Value::Array(items) => match items.first() {
            Some(Value::String(op)) => compile_op(op, &items[1..]),
            // not an operator, keep as a literal array
            _ => Ok(Expr::Literal(value.clone())),
        },
        Value::Object(map) => {
            let mut fields = Vec::with_capacity(map.len());
            for (name, field) in map {
                fields.push((name.clone(), compile(field)?));
            }
            Ok(Expr::Object(fields))
        }
    }
}

fn compile_op(op: &str, args: &[Value]) -> Result<Expr, ExprError> {
    let all = |args: &[Value]| -> Result<Vec<Expr>, ExprError> {
        args.iter().map(compile).collect()
    };
    let unary = |op: &'static str, args: &[Value]| -> Result<Box<Expr>, ExprError> {
        match args {
            [arg] => Ok(Box::new(compile(arg)?)),
            _ => Err(ExprError::Arity {
                op,
                expected: "1",
                got: args.len(),
            }),
        }
    };
    let binary = |op: &'static str, args: &[Value]| -> Result<(Box<Expr>, Box<Expr>), ExprError> {
        match args {
            [a, b] => Ok((Box::new(compile(a)?), Box::new(compile(b)?))),
            _ => Err(ExprError::Arity {
                op,
                expected: "2",
                got: args.len(),
            }),
        }
    };

    match op {
        "lit" => match args {
            [value] => Ok(Expr::Literal(value.clone())),
            _ => Err(ExprError::Arity {
                op: "lit",
                expected: "1",
                got: args.len(),
            }),
        },
        "list" => Ok(Expr::List(all(args)?)),

        "params" => Ok(Expr::Params),
        "param" => match args {
            [] => Ok(Expr::Params),
            [Value::String(path)] => Ok(Expr::Param(path.clone())),
            _ => Err(ExprError::BadOperand {
                op: "param",
                expected: "string path",
            }),
        },
        "var" => match args {
            [Value::String(name)] => Ok(Expr::Var(name.clone())),
            _ => Err(ExprError::BadOperand {
                op: "var",
                expected: "string name",
            }),
        },
        "set" => match args {
            [Value::String(name), value] => {
                Ok(Expr::Set(name.clone(), Box::new(compile(value)?)))
            }
            _ => Err(ExprError::BadOperand {
                op: "set",
                expected: "string name and value",
            }),
        },
        "defined" => Ok(Expr::Defined(unary("defined", args)?)),

        "do" => Ok(Expr::Do(all(args)?)),
        "if" => match args {
            [test, consequent] => Ok(Expr::If(
                Box::new(compile(test)?),
                Box::new(compile(consequent)?),
                None,
            )),
            [test, consequent, alternate] => Ok(Expr::If(
                Box::new(compile(test)?),
                Box::new(compile(consequent)?),
                Some(Box::new(compile(alternate)?)),
            )),
            _ => Err(ExprError::Arity {
                op: "if",
                expected: "2 or 3",
                got: args.len(),
            }),
        },
        "not" | "!" => Ok(Expr::Not(unary("not", args)?)),
        "and" | "&&" => Ok(Expr::And(all(args)?)),
        "or" | "||" => Ok(Expr::Or(all(args)?)),

        "==" | "eq" => binary("==", args).map(|(a, b)| Expr::Eq(a, b)),
        "!=" | "ne" => binary("!=", args).map(|(a, b)| Expr::Neq(a, b)),
        "<" => binary("<", args).map(|(a, b)| Expr::Lt(a, b)),
        "<=" => binary("<=", args).map(|(a, b)| Expr::Lte(a, b)),
        ">" => binary(">", args).map(|(a, b)| Expr::Gt(a, b)),
        ">=" => binary(">=", args).map(|(a, b)| Expr::Gte(a, b)),

        "+" => Ok(Expr::Add(all(args)?)),
        "-" => binary("-", args).map(|(a, b)| Expr::Sub(a, b)),
        "*" => Ok(Expr::Mul(all(args)?)),
        "/" => binary("/", args).map(|(a, b)| Expr::Div(a, b)),
        "%" | "mod" => binary("%", args).map(|(a, b)| Expr::Mod(a, b)),

        "len" => Ok(Expr::Len(unary("len", args)?)),
        "get" => binary("get", args).map(|(a, b)| Expr::Get(a, b)),
        "concat" => Ok(Expr::Concat(all(args)?)),

        unknown => Err(ExprError::UnknownOperator(unknown.to_string())),
    }
}

/// Evaluation scope: the current parameter object plus the collapsed visible
/// let-environment, mutable so `set` takes effect.
pub struct Scope<'a> {
    pub params: &'a Value,
    pub vars: &'a mut BTreeMap<String, Value>,
}

/// Evaluate a compiled expression. `Ok(None)` is the undefined result.
pub fn eval(expr: &Expr, scope: &mut Scope<'_>) -> Result<Option<Value>, ExprError> {
    match expr {
        Expr::Literal(value) => Ok(Some(value.clone())),
        Expr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, scope)?.unwrap_or(Value::Null));
            }
            Ok(Some(Value::Array(out)))
        }
        Expr::Object(fields) => {
            let mut out = Map::new();
            for (name, field) in fields {
                if let Some(value) = eval(field, scope)? {
                    out.insert(name.clone(), value);
                }
            }
            Ok(Some(Value::Object(out)))
        }

        Expr::Params => Ok(Some(scope.params.clone())),
        Expr::Param(path) => Ok(lookup_path(scope.params, path).cloned()),
        Expr::Var(name) => match scope.vars.get(name) {
            Some(value) => Ok(Some(value.clone())),
            None => Err(ExprError::UndefinedVariable(name.clone())),
        },
        Expr::Set(name, value) => {
            let value = eval(value, scope)?.unwrap_or(Value::Null);
            if !scope.vars.contains_key(name) {
                return Err(ExprError::UndefinedVariable(name.clone()));
            }
            scope.vars.insert(name.clone(), value);
            Ok(None)
        }
        Expr::Defined(inner) => Ok(Some(Value::Bool(eval(inner, scope)?.is_some()))),

        Expr::Do(items) => {
            let mut last = None;
            for item in items {
                last = eval(item, scope)?;
            }
            Ok(last)
        }
        Expr::If(test, consequent, alternate) => {
            let flag = eval(test, scope)?;
            if truthy(flag.as_ref()) {
                eval(consequent, scope)
            } else if let Some(alternate) = alternate {
                eval(alternate, scope)
            } else {
                Ok(None)
            }
        }
        Expr::Not(inner) => {
            let value = eval(inner, scope)?;
            Ok(Some(Value::Bool(!truthy(value.as_ref()))))
        }
        Expr::And(items) => {
            // evaluates to the deciding value, short-circuiting on falsy
            let mut last = Some(Value::Bool(true));
            for item in items {
                last = eval(item, scope)?;
                if !truthy(last.as_ref()) {
                    return Ok(last);
                }
            }
            Ok(last)
        }
        Expr::Or(items) => {
            let mut last = Some(Value::Bool(false));
            for item in items {
                last = eval(item, scope)?;
                if truthy(last.as_ref()) {
                    return Ok(last);
                }
            }
            Ok(last)
        }

        Expr::Eq(a, b) => {
            let a = eval(a, scope)?;
            let b = eval(b, scope)?;
            Ok(Some(Value::Bool(loose_eq(a.as_ref(), b.as_ref()))))
        }
        Expr::Neq(a, b) => {
            let a = eval(a, scope)?;
            let b = eval(b, scope)?;
            Ok(Some(Value::Bool(!loose_eq(a.as_ref(), b.as_ref()))))
        }
        Expr::Lt(a, b) => ordered(eval(a, scope)?, eval(b, scope)?, |o| o.is_lt()),
        Expr::Lte(a, b) => ordered(eval(a, scope)?, eval(b, scope)?, |o| o.is_le()),
        Expr::Gt(a, b) => ordered(eval(a, scope)?, eval(b, scope)?, |o| o.is_gt()),
        Expr::Gte(a, b) => ordered(eval(a, scope)?, eval(b, scope)?, |o| o.is_ge()),

        Expr::Add(items) => fold_numeric(items, scope, 0, 0.0, i64::wrapping_add, |a, b| a + b),
        Expr::Mul(items) => fold_numeric(items, scope, 1, 1.0, i64::wrapping_mul, |a, b| a * b),
        Expr::Sub(a, b) => {
            let a = eval(a, scope)?;
            let b = eval(b, scope)?;
            match (exact_i64(a.as_ref()), exact_i64(b.as_ref())) {
                (Some(x), Some(y)) => Ok(Some(Value::Number(Number::from(x.wrapping_sub(y))))),
                _ => Ok(Some(float_value(
                    coerce_f64(a.as_ref()) - coerce_f64(b.as_ref()),
                ))),
            }
        }
        Expr::Div(a, b) => {
            let a = eval(a, scope)?;
            let b = eval(b, scope)?;
            if let (Some(x), Some(y)) = (exact_i64(a.as_ref()), exact_i64(b.as_ref())) {
                if y == 0 {
                    return Err(ExprError::DivisionByZero);
                }
                if x % y == 0 {
                    return Ok(Some(Value::Number(Number::from(x / y))));
                }
            }
            let divisor = coerce_f64(b.as_ref());
            if divisor == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            Ok(Some(float_value(coerce_f64(a.as_ref()) / divisor)))
        }
        Expr::Mod(a, b) => {
            let a = eval(a, scope)?;
            let b = eval(b, scope)?;
            match (exact_i64(a.as_ref()), exact_i64(b.as_ref())) {
                (Some(x), Some(y)) => {
                    if y == 0 {
                        return Err(ExprError::DivisionByZero);
                    }
                    Ok(Some(Value::Number(Number::from(x.rem_euclid(y)))))
                }
                _ => {
                    let divisor = coerce_f64(b.as_ref());
                    if divisor == 0.0 {
                        return Err(ExprError::DivisionByZero);
                    }
                    Ok(Some(float_value(coerce_f64(a.as_ref()) % divisor)))
                }
            }
        }

        Expr::Len(inner) => {
            let value = eval(inner, scope)?;
            let len = match value.as_ref() {
                Some(Value::String(s)) => s.chars().count(),
                Some(Value::Array(a)) => a.len(),
                Some(Value::Object(o)) => o.len(),
                _ => {
                    return Err(ExprError::BadOperand {
                        op: "len",
                        expected: "string, array, or object",
                    })
                }
            };
            Ok(Some(Value::Number(Number::from(len as u64))))
        }
        Expr::Get(container, key) => {
            let container = eval(container, scope)?;
            let key = eval(key, scope)?;
            let found = match (container.as_ref(), key.as_ref()) {
                (Some(Value::Object(map)), Some(Value::String(name))) => map.get(name).cloned(),
                (Some(Value::Array(items)), Some(Value::Number(n))) => n
                    .as_u64()
                    .and_then(|i| items.get(i as usize))
                    .cloned(),
                _ => None,
            };
            Ok(found)
        }
        Expr::Concat(items) => {
            let mut out = String::new();
            for item in items {
                if let Some(value) = eval(item, scope)? {
                    out.push_str(&display_string(&value));
                }
            }
            Ok(Some(Value::String(out)))
        }
    }
}

/// JSON truthiness, with undefined counting as false.
pub(crate) fn truthy(value: Option<&Value>) -> bool {
    match value {
        None => false,
        Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn loose_eq(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (None, None) => true,
        (None, _) | (_, None) => false,
        (Some(x), Some(y)) => match (numeric(x), numeric(y)) {
            (Some(fx), Some(fy)) => fx == fy,
            _ => x == y,
        },
    }
}

fn ordered(
    a: Option<Value>,
    b: Option<Value>,
    pick: fn(std::cmp::Ordering) -> bool,
) -> Result<Option<Value>, ExprError> {
    let decided = match (a, b) {
        (Some(x), Some(y)) => compare_values(&x, &y).map(pick).unwrap_or(false),
        _ => false,
    };
    Ok(Some(Value::Bool(decided)))
}

/// Numeric comparison when both sides coerce, string comparison otherwise.
fn compare_values(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (coercible_f64(a), coercible_f64(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => Some(display_string(a).cmp(&display_string(b))),
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn coercible_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Loose numeric coercion for arithmetic; undefined and null coerce to zero.
fn coerce_f64(value: Option<&Value>) -> f64 {
    value.and_then(coercible_f64).unwrap_or(0.0)
}

fn exact_i64(value: Option<&Value>) -> Option<i64> {
    match value {
        Some(Value::Number(n)) => n.as_i64(),
        None | Some(Value::Null) => Some(0),
        _ => None,
    }
}

fn float_value(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn fold_numeric(
    items: &[Expr],
    scope: &mut Scope<'_>,
    int_unit: i64,
    float_unit: f64,
    int_op: fn(i64, i64) -> i64,
    float_op: fn(f64, f64) -> f64,
) -> Result<Option<Value>, ExprError> {
    let mut total_i = int_unit;
    let mut total_f = float_unit;
    let mut all_int = true;
    for item in items {
        let value = eval(item, scope)?;
        match exact_i64(value.as_ref()) {
            Some(n) if all_int => {
                total_i = int_op(total_i, n);
                total_f = float_op(total_f, n as f64);
            }
            _ => {
                all_int = false;
                total_f = float_op(total_f, coerce_f64(value.as_ref()));
            }
        }
    }
    Ok(Some(if all_int {
        Value::Number(Number::from(total_i))
    } else {
        float_value(total_f)
    }))
}

fn display_string(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval_with(
        code: Value,
        params: Value,
        vars: &mut BTreeMap<String, Value>,
    ) -> Result<Option<Value>, ExprError> {
        let compiled = compile(&code).expect("compile");
        let mut scope = Scope {
            params: &params,
            vars,
        };
        eval(&compiled, &mut scope)
    }

    #[test]
    fn test_compile_rejects_unknown_operator() {
        let err = compile(&json!(["frobnicate", 1])).unwrap_err();
        assert!(matches!(err, ExprError::UnknownOperator(op) if op == "frobnicate"));
    }

    #[test]
    fn test_scalars_and_non_operator_arrays_are_literals() {
        let mut vars = BTreeMap::new();
        assert_eq!(
            eval_with(json!(7), json!({}), &mut vars).unwrap(),
            Some(json!(7))
        );
        assert_eq!(
            eval_with(json!([1, 2, 3]), json!({}), &mut vars).unwrap(),
            Some(json!([1, 2, 3]))
        );
    }

    #[test]
    fn test_param_path_yields_undefined_when_absent() {
        let mut vars = BTreeMap::new();
        assert_eq!(
            eval_with(json!(["param", "a.b"]), json!({"a": {"b": 2}}), &mut vars).unwrap(),
            Some(json!(2))
        );
        assert_eq!(
            eval_with(json!(["param", "a.c"]), json!({"a": {"b": 2}}), &mut vars).unwrap(),
            None
        );
        assert_eq!(
            eval_with(
                json!(["defined", ["param", "a.c"]]),
                json!({"a": {"b": 2}}),
                &mut vars
            )
            .unwrap(),
            Some(json!(false))
        );
    }

    #[test]
    fn test_arithmetic_prefers_integers_and_coerces_undefined_to_zero() {
        let mut vars = BTreeMap::new();
        assert_eq!(
            eval_with(json!(["+", ["param", "n"], 1]), json!({"n": 2}), &mut vars).unwrap(),
            Some(json!(3))
        );
        assert_eq!(
            eval_with(json!(["+", ["param", "n"], 1]), json!({}), &mut vars).unwrap(),
            Some(json!(1))
        );
        assert_eq!(
            eval_with(json!(["*", 2, 2.5]), json!({}), &mut vars).unwrap(),
            Some(json!(5.0))
        );
    }

    #[test]
    fn test_set_updates_bound_variable_and_evaluates_to_undefined() {
        let mut vars = BTreeMap::from([("count".to_string(), json!(2))]);
        let result = eval_with(
            json!(["do", ["set", "count", ["-", ["var", "count"], 1]], [">=", ["var", "count"], 0]]),
            json!({}),
            &mut vars,
        )
        .unwrap();
        assert_eq!(result, Some(json!(true)));
        assert_eq!(vars.get("count"), Some(&json!(1)));

        let bare_set = eval_with(json!(["set", "count", 9]), json!({}), &mut vars).unwrap();
        assert_eq!(bare_set, None);
        assert_eq!(vars.get("count"), Some(&json!(9)));
    }

    #[test]
    fn test_unbound_variable_is_an_error() {
        let mut vars = BTreeMap::new();
        let err = eval_with(json!(["var", "ghost"]), json!({}), &mut vars).unwrap_err();
        assert!(matches!(err, ExprError::UndefinedVariable(name) if name == "ghost"));
        let err = eval_with(json!(["set", "ghost", 1]), json!({}), &mut vars).unwrap_err();
        assert!(matches!(err, ExprError::UndefinedVariable(_)));
    }

    #[test]
    fn test_object_template_compiles_fields_and_omits_undefined() {
        let mut vars = BTreeMap::new();
        let result = eval_with(
            json!({"n": ["+", ["param", "n"], 1], "missing": ["param", "nope"]}),
            json!({"n": 2}),
            &mut vars,
        )
        .unwrap();
        assert_eq!(result, Some(json!({"n": 3})));
    }

    #[test]
    fn test_and_short_circuits_on_falsy() {
        let mut vars = BTreeMap::from([("count".to_string(), json!(5))]);
        // the falsy head must stop evaluation before the decrement runs
        let result = eval_with(
            json!(["and", false, ["set", "count", 0]]),
            json!({}),
            &mut vars,
        )
        .unwrap();
        assert_eq!(result, Some(json!(false)));
        assert_eq!(vars.get("count"), Some(&json!(5)));
    }

    #[test]
    fn test_comparisons_are_numeric_across_int_and_float() {
        let mut vars = BTreeMap::new();
        assert_eq!(
            eval_with(json!(["==", 1, 1.0]), json!({}), &mut vars).unwrap(),
            Some(json!(true))
        );
        assert_eq!(
            eval_with(json!(["<", ["param", "n"], 3]), json!({"n": 1}), &mut vars).unwrap(),
            Some(json!(true))
        );
        // undefined never orders below anything
        assert_eq!(
            eval_with(json!(["<", ["param", "n"], 3]), json!({}), &mut vars).unwrap(),
            Some(json!(false))
        );
    }

    #[test]
    fn test_function_payload_detection() {
        assert!(is_function_payload(
            &json!({"exec": {"kind": EXEC_KIND_EXPR, "code": ["params"]}})
        ));
        assert!(!is_function_payload(&json!({"exec": "not an object"})));
        assert!(!is_function_payload(&json!({"value": 1})));
    }
}
