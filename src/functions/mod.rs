use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::context::{Context, Value};
use crate::errors::{RenderError, Result};

/// Named arguments handed to a `Function` invocation.
pub type Bindings = BTreeMap<String, Value>;

/// Trait for pluggable functions exposed to templates through the context.
pub trait Function: Send + Sync {
    fn name(&self) -> &'static str;

    /// Declared parameter names in call order. `None` means the function is
    /// opaque to introspection; the adapter then leaves it unmodified.
    fn params(&self) -> Option<&[&'static str]> {
        None
    }

    fn call(&self, args: &Bindings) -> Result<Value>;
}

/// A context value wrapping a `Function` together with its pre-bound
/// arguments. Partial application is this explicit record: `bound` holds
/// what the adapter injected, and call-site arguments fill the remaining
/// declared parameters.
#[derive(Clone)]
pub struct Callable {
    func: Arc<dyn Function>,
    bound: Bindings,
}

impl Callable {
    pub fn new<F: Function + 'static>(func: F) -> Self {
        Self::from_arc(Arc::new(func))
    }

    pub fn from_arc(func: Arc<dyn Function>) -> Self {
        Self {
            func,
            bound: Bindings::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.func.name()
    }

    pub fn params(&self) -> Option<&[&'static str]> {
        self.func.params()
    }

    /// Arguments injected by the adapter.
    pub fn bound(&self) -> &Bindings {
        &self.bound
    }

    pub(crate) fn func_arc(&self) -> &Arc<dyn Function> {
        &self.func
    }

    fn with_bound(mut self, extra: Bindings) -> Self {
        self.bound.extend(extra);
        self
    }

    /// Invoke with positional and keyword arguments.
    ///
    /// Positional values fill the unbound declared parameters in order, so
    /// they never collide with what the adapter injected. Keyword arguments
    /// are applied last and take precedence over pre-bound values. Functions
    /// without declared parameters receive positional arguments under their
    /// index (`"0"`, `"1"`, ...).
    pub fn invoke(&self, positional: &[Value], named: Bindings) -> Result<Value> {
        let mut args = self.bound.clone();
        match self.func.params() {
            Some(params) => {
                let unbound: Vec<&'static str> = params
                    .iter()
                    .copied()
                    .filter(|p| !self.bound.contains_key(*p))
                    .collect();
                if positional.len() > unbound.len() {
                    return Err(RenderError::Function {
                        name: self.name().to_string(),
                        message: format!(
                            "expected at most {} positional arguments, got {}",
                            unbound.len(),
                            positional.len()
                        ),
                    });
                }
                for (param, value) in unbound.into_iter().zip(positional) {
                    args.insert(param.to_string(), value.clone());
                }
            }
            None => {
                for (i, value) in positional.iter().enumerate() {
                    args.insert(i.to_string(), value.clone());
                }
            }
        }
        args.extend(named);
        self.func.call(&args)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("name", &self.name())
            .field("bound", &self.bound.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Pre-bind injectable parameters from the context.
///
/// The bound set is the intersection of the callable's declared parameters,
/// `injectable`, and the keys present in `context`. An empty intersection,
/// or a callable without introspectable parameters, passes through
/// unchanged. The underlying function is never mutated.
pub fn adapt(callable: Callable, context: &Context, injectable: &BTreeSet<String>) -> Callable {
    let Some(params) = callable.params() else {
        return callable;
    };
    let mut inject = Bindings::new();
    for param in params {
        if injectable.contains(*param) && !callable.bound().contains_key(*param) {
            if let Some(value) = context.get(*param) {
                inject.insert((*param).to_string(), value.clone());
            }
        }
    }
    if inject.is_empty() {
        callable
    } else {
        trace!(
            name = callable.name(),
            bound = ?inject.keys().collect::<Vec<_>>(),
            "pre-bound injectable parameters"
        );
        callable.with_bound(inject)
    }
}

/// Thread-safe function registry; copy-on-write, so registration never
/// mutates a registry another render holds.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<HashMap<&'static str, Arc<dyn Function>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut map: HashMap<&'static str, Arc<dyn Function>> = HashMap::new();
        map.insert("env_var", Arc::new(builtins::EnvVar));
        map.insert("env_switch", Arc::new(builtins::EnvSwitch));
        map.insert("previous_date", Arc::new(builtins::PreviousDate));
        map.insert("previous_hour", Arc::new(builtins::PreviousHour));
        Self {
            inner: Arc::new(map),
        }
    }

    pub fn register<F: Function + 'static>(&mut self, f: F) {
        let map = Arc::make_mut(&mut self.inner);
        map.insert(f.name(), Arc::new(f));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Function>> {
        self.inner.get(name).cloned()
    }

    /// The lowest context layer: every registered function as a callable.
    pub fn context(&self) -> Context {
        self.inner
            .iter()
            .map(|(name, func)| {
                (
                    name.to_string(),
                    Value::Callable(Callable::from_arc(func.clone())),
                )
            })
            .collect()
    }
}

pub mod builtins {
    use super::*;
    use chrono::{Duration, Local};

    fn required_str(args: &Bindings, param: &str, fname: &'static str) -> Result<String> {
        match args.get(param) {
            Some(Value::String(s)) => Ok(s.clone()),
            _ => Err(RenderError::Function {
                name: fname.to_string(),
                message: format!("`{param}` must be a string"),
            }),
        }
    }

    /// `env_var(name, default?)`: environment lookup with optional fallback.
    pub struct EnvVar;
    impl Function for EnvVar {
        fn name(&self) -> &'static str {
            "env_var"
        }
        fn params(&self) -> Option<&[&'static str]> {
            Some(&["name", "default"])
        }
        fn call(&self, args: &Bindings) -> Result<Value> {
            let name = required_str(args, "name", self.name())?;
            match std::env::var(&name) {
                Ok(value) => Ok(Value::String(value)),
                Err(_) => Ok(args.get("default").cloned().unwrap_or(Value::Null)),
            }
        }
    }

    /// `env_switch(name, cases, default?)`: pick a value keyed by the
    /// current value of an environment variable.
    pub struct EnvSwitch;
    impl Function for EnvSwitch {
        fn name(&self) -> &'static str {
            "env_switch"
        }
        fn params(&self) -> Option<&[&'static str]> {
            Some(&["name", "cases", "default"])
        }
        fn call(&self, args: &Bindings) -> Result<Value> {
            let name = required_str(args, "name", self.name())?;
            let cases = match args.get("cases") {
                Some(Value::Mapping(m)) => m,
                _ => {
                    return Err(RenderError::Function {
                        name: self.name().to_string(),
                        message: "`cases` must be a mapping".to_string(),
                    })
                }
            };
            let current = std::env::var(&name).ok();
            let picked = current.as_deref().and_then(|value| cases.get(value));
            Ok(picked
                .or_else(|| args.get("default"))
                .cloned()
                .unwrap_or(Value::Null))
        }
    }

    /// `previous_date()`: yesterday, `YYYY-MM-DD`.
    pub struct PreviousDate;
    impl Function for PreviousDate {
        fn name(&self) -> &'static str {
            "previous_date"
        }
        fn params(&self) -> Option<&[&'static str]> {
            Some(&[])
        }
        fn call(&self, _args: &Bindings) -> Result<Value> {
            let date = Local::now() - Duration::days(1);
            Ok(Value::String(date.format("%Y-%m-%d").to_string()))
        }
    }

    /// `previous_hour()`: one hour back, truncated to the hour.
    pub struct PreviousHour;
    impl Function for PreviousHour {
        fn name(&self) -> &'static str {
            "previous_hour"
        }
        fn params(&self) -> Option<&[&'static str]> {
            Some(&[])
        }
        fn call(&self, _args: &Bindings) -> Result<Value> {
            let stamp = Local::now() - Duration::hours(1);
            Ok(Value::String(stamp.format("%Y-%m-%d %H:00:00").to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct TableExists;
    impl Function for TableExists {
        fn name(&self) -> &'static str {
            "table_exists"
        }
        fn params(&self) -> Option<&[&'static str]> {
            Some(&["table", "engine"])
        }
        fn call(&self, args: &Bindings) -> Result<Value> {
            let table = args.get("table").and_then(Value::as_str).unwrap_or("");
            let engine = args.get("engine").and_then(Value::as_str).unwrap_or("");
            Ok(Value::String(format!("{table}@{engine}")))
        }
    }

    struct Opaque;
    impl Function for Opaque {
        fn name(&self) -> &'static str {
            "opaque"
        }
        fn call(&self, args: &Bindings) -> Result<Value> {
            Ok(args.get("0").cloned().unwrap_or(Value::Null))
        }
    }

    fn injectable() -> BTreeSet<String> {
        ["engine".to_string()].into_iter().collect()
    }

    #[test]
    fn adapt_binds_the_engine_parameter() {
        let context = crate::context::from_json(json!({"engine": "postgres://prod"}));
        let adapted = adapt(Callable::new(TableExists), &context, &injectable());
        // Invoked without `engine`, behaves as if it had been passed.
        let out = adapted
            .invoke(&[Value::from("orders")], Bindings::new())
            .unwrap();
        assert_eq!(out, Value::from("orders@postgres://prod"));
    }

    #[test]
    fn adapt_skips_when_nothing_intersects() {
        let context = crate::context::from_json(json!({"schema": "public"}));
        let adapted = adapt(Callable::new(TableExists), &context, &injectable());
        assert!(adapted.bound().is_empty());
    }

    #[test]
    fn adapt_skips_opaque_functions() {
        let context = crate::context::from_json(json!({"engine": "postgres://prod"}));
        let adapted = adapt(Callable::new(Opaque), &context, &injectable());
        assert!(adapted.bound().is_empty());
        let out = adapted
            .invoke(&[Value::from("passthrough")], Bindings::new())
            .unwrap();
        assert_eq!(out, Value::from("passthrough"));
    }

    #[test]
    fn keyword_arguments_override_pre_bound_values() {
        let context = crate::context::from_json(json!({"engine": "postgres://prod"}));
        let adapted = adapt(Callable::new(TableExists), &context, &injectable());
        let mut named = Bindings::new();
        named.insert("engine".to_string(), Value::from("sqlite://test"));
        let out = adapted.invoke(&[Value::from("orders")], named).unwrap();
        assert_eq!(out, Value::from("orders@sqlite://test"));
    }

    #[test]
    fn too_many_positional_arguments_fail() {
        let err = Callable::new(TableExists)
            .invoke(
                &[Value::from("a"), Value::from("b"), Value::from("c")],
                Bindings::new(),
            )
            .unwrap_err();
        assert!(matches!(err, RenderError::Function { .. }));
    }

    #[test]
    fn registry_exposes_builtins_as_context() {
        let context = Registry::with_builtins().context();
        for name in ["env_var", "env_switch", "previous_date", "previous_hour"] {
            assert!(
                matches!(context.get(name), Some(Value::Callable(_))),
                "missing builtin {name}"
            );
        }
    }

    #[test]
    fn env_var_reads_and_falls_back() {
        std::env::set_var("SQLWEAVE_TEST_ENV_VAR", "present");
        let out = Callable::new(builtins::EnvVar)
            .invoke(&[Value::from("SQLWEAVE_TEST_ENV_VAR")], Bindings::new())
            .unwrap();
        assert_eq!(out, Value::from("present"));

        let out = Callable::new(builtins::EnvVar)
            .invoke(
                &[Value::from("SQLWEAVE_TEST_ENV_VAR_ABSENT"), Value::from("fallback")],
                Bindings::new(),
            )
            .unwrap();
        assert_eq!(out, Value::from("fallback"));
    }

    #[test]
    fn env_switch_picks_the_matching_case() {
        std::env::set_var("SQLWEAVE_TEST_ENV_SWITCH", "prod");
        let cases = crate::context::from_json(json!({"prod": "orders", "dev": "orders_dev"}));
        let out = Callable::new(builtins::EnvSwitch)
            .invoke(
                &[
                    Value::from("SQLWEAVE_TEST_ENV_SWITCH"),
                    Value::Mapping(cases),
                    Value::from("orders_default"),
                ],
                Bindings::new(),
            )
            .unwrap();
        assert_eq!(out, Value::from("orders"));
    }
}
