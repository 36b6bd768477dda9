use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use minijinja::value::{Kwargs, Rest, Value as EngineValue};
use minijinja::{Environment, UndefinedBehavior};
use tracing::trace;

use crate::context::{Context, Value};
use crate::errors::{RenderError, Result};
use crate::functions::{Bindings, Callable};
use crate::text::dedent;

/// Names minijinja resolves on its own; shadowing them with placeholders
/// would break calls like `range(...)`.
const ENGINE_GLOBALS: &[&str] = &["range", "dict", "debug", "namespace"];

// A failing context callable stores its error here so it surfaces unwrapped
// instead of re-encoded inside the engine's error chain.
type FailureSlot = Arc<Mutex<Option<RenderError>>>;

/// Render `text` as an expression template against `vars`.
///
/// Any reference to a top-level name absent from `vars` is preserved
/// verbatim in the output: the name is pre-bound to its own `{{ name }}`
/// placeholder before rendering. Output is doc-style dedented.
pub fn render_expression(text: &str, vars: &Context) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Lenient);
    env.set_auto_escape_callback(|_| minijinja::AutoEscape::None);

    let template = env
        .template_from_str(text)
        .map_err(|e| RenderError::TemplateSyntax(e.to_string()))?;

    let failure: FailureSlot = Arc::new(Mutex::new(None));
    let mut ctx: BTreeMap<String, EngineValue> = vars
        .iter()
        .map(|(key, value)| (key.clone(), to_engine_value(value, &failure)))
        .collect();
    for name in template.undeclared_variables(false) {
        if !vars.contains_key(&name) && !ENGINE_GLOBALS.contains(&name.as_str()) {
            trace!(name = %name, "leaving unresolved reference in place");
            ctx.insert(name.clone(), EngineValue::from(format!("{{{{ {name} }}}}")));
        }
    }

    match template.render(ctx) {
        Ok(rendered) => Ok(dedent(&rendered)),
        Err(err) => {
            if let Some(failure) = failure.lock().ok().and_then(|mut slot| slot.take()) {
                return Err(failure);
            }
            Err(RenderError::TemplateSyntax(err.to_string()))
        }
    }
}

fn to_engine_value(value: &Value, failure: &FailureSlot) -> EngineValue {
    match value {
        Value::Null => EngineValue::from(()),
        Value::Bool(b) => EngineValue::from(*b),
        Value::Number(n) => EngineValue::from_serialize(n),
        Value::String(s) => EngineValue::from(s.clone()),
        Value::Sequence(items) => EngineValue::from(
            items
                .iter()
                .map(|item| to_engine_value(item, failure))
                .collect::<Vec<_>>(),
        ),
        Value::Mapping(entries) => EngineValue::from(
            entries
                .iter()
                .map(|(key, item)| (key.clone(), to_engine_value(item, failure)))
                .collect::<BTreeMap<_, _>>(),
        ),
        Value::Callable(callable) => callable_value(callable.clone(), failure.clone()),
    }
}

// Bridge a context callable into an engine function. Positional arguments
// fill the unbound declared parameters; keyword arguments pass through and
// may override pre-bound values.
fn callable_value(callable: Callable, failure: FailureSlot) -> EngineValue {
    EngineValue::from_function(
        move |args: Rest<EngineValue>,
              kwargs: Kwargs|
              -> std::result::Result<EngineValue, minijinja::Error> {
            let positional: Vec<Value> = args.iter().map(from_engine_value).collect();
            let mut named = Bindings::new();
            for key in kwargs.args() {
                let value: EngineValue = kwargs.get(key)?;
                named.insert(key.to_string(), from_engine_value(&value));
            }
            match callable.invoke(&positional, named) {
                Ok(value) => Ok(to_engine_value(&value, &failure)),
                Err(err) => {
                    let message = err.to_string();
                    if let Ok(mut slot) = failure.lock() {
                        slot.get_or_insert(err);
                    }
                    Err(minijinja::Error::new(
                        minijinja::ErrorKind::InvalidOperation,
                        message,
                    ))
                }
            }
        },
    )
}

fn from_engine_value(value: &EngineValue) -> Value {
    serde_json::to_value(value)
        .map(Value::from)
        .unwrap_or(Value::Null)
}
