//! Templated SQL rendering with layered contexts.
//!
//! A template body plus a layered context (builtins < runner context <
//! call-site context < file frontmatter) renders to finished text in one of
//! two modes: expression templating, or exact token replacement. Callables
//! in the context are partially bound to context values (the `engine`
//! parameter by default) before templates can call them.

pub mod context;
pub mod engine;
pub mod errors;
pub mod files;
pub mod functions;
pub mod pretty;
pub mod text;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use context::Value;

/// Re-export the most-used types for users who work with the runner
/// directly.
pub use context::Context;
pub use errors::{RenderError, Result};
pub use files::{FrontmatterLoader, Loader, ParsedFile};
pub use functions::Registry;
pub use pretty::{PrettyPrinter, SqlHighlighter};

/// How the template body (and templated context values) are rendered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RenderMode {
    /// Full expression templating; unresolved references stay verbatim.
    #[default]
    Expression,
    /// Exact token substitution after marker canonicalization.
    Literal,
}

/// Parameter names pre-bound into context callables by default.
pub const DEFAULT_INJECTABLE: &[&str] = &["engine"];

pub fn default_injectable() -> BTreeSet<String> {
    DEFAULT_INJECTABLE.iter().map(|s| s.to_string()).collect()
}

/// The main entry point: resolves the effective context and dispatches to
/// file or inline-text rendering.
pub struct Runner {
    registry: Registry,
    context: Context,
    loader: Arc<dyn Loader>,
    mode: RenderMode,
    injectable: BTreeSet<String>,
    file_context_from: Option<String>,
    pretty: Option<Arc<dyn PrettyPrinter>>,
}

impl Runner {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            context: Context::new(),
            loader: Arc::new(FrontmatterLoader),
            mode: RenderMode::default(),
            injectable: default_injectable(),
            file_context_from: None,
            pretty: None,
        }
    }

    /// Context merged over the builtins for every render from this runner.
    pub fn with_context(mut self, context: Context) -> Self {
        self.context.extend(context);
        self
    }

    pub fn with_loader<L: Loader + 'static>(mut self, loader: L) -> Self {
        self.loader = Arc::new(loader);
        self
    }

    pub fn with_mode(mut self, mode: RenderMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_injectable_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.injectable = params.into_iter().map(Into::into).collect();
        self
    }

    /// Re-root the file frontmatter at a named sub-key: when set and present
    /// as a mapping, that sub-mapping replaces the whole file layer.
    pub fn with_file_context_from<S: Into<String>>(mut self, key: S) -> Self {
        self.file_context_from = Some(key.into());
        self
    }

    pub fn with_pretty_printer<P: PrettyPrinter + 'static>(mut self, printer: P) -> Self {
        self.pretty = Some(Arc::new(printer));
        self
    }

    /// Render inline text or a file, decided by whether the input ends with
    /// one of the loader's accepted extensions.
    pub fn render(&self, text_or_path: &str, extra: &Context) -> Result<String> {
        if self.looks_like_path(text_or_path) {
            self.render_file(Path::new(text_or_path), extra)
        } else {
            self.render_text(text_or_path, extra)
        }
    }

    pub fn render_text(&self, body: &str, extra: &Context) -> Result<String> {
        let resolved = context::resolve(
            &self.registry.context(),
            &merged(&self.context, extra),
            &Context::new(),
            None,
            &self.injectable,
            self.mode,
        )?;
        self.finish(render_body(body, &resolved, self.mode)?)
    }

    pub fn render_file(&self, path: &Path, extra: &Context) -> Result<String> {
        let parsed = self.loader.parse(path)?;
        debug!(path = %path.display(), frontmatter = parsed.frontmatter.len(), "rendering file");
        let resolved = context::resolve(
            &self.registry.context(),
            &merged(&self.context, extra),
            &parsed.frontmatter,
            self.file_context_from.as_deref(),
            &self.injectable,
            self.mode,
        )?;
        self.finish(render_body(&parsed.body, &resolved, self.mode)?)
    }

    fn looks_like_path(&self, input: &str) -> bool {
        self.loader
            .accepted_extensions()
            .iter()
            .any(|ext| input.ends_with(&format!(".{ext}")))
    }

    fn finish(&self, rendered: String) -> Result<String> {
        Ok(match &self.pretty {
            Some(printer) => printer.highlight(&rendered),
            None => rendered,
        })
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new(Registry::with_builtins())
    }
}

/// Render `text` in the given mode after pre-binding injectable parameters
/// on top-level callables. Unlike `Runner`, this performs no recursive
/// context resolution: `vars` is used as given.
pub fn render_text(
    body: &str,
    mode: RenderMode,
    injectable: &BTreeSet<String>,
    vars: &Context,
) -> Result<String> {
    let snapshot = vars.clone();
    let mut vars = vars.clone();
    for value in vars.values_mut() {
        if let Value::Callable(callable) = value {
            *callable = functions::adapt(callable.clone(), &snapshot, injectable);
        }
    }
    render_body(body, &vars, mode)
}

/// Expose the context resolver directly: merge the layers, adapt callables,
/// and re-render templated context values (expression mode).
pub fn render_context(
    builtins: &Context,
    extra: &Context,
    file_context: &Context,
    injectable: &BTreeSet<String>,
) -> Result<Context> {
    context::resolve(
        builtins,
        extra,
        file_context,
        None,
        injectable,
        RenderMode::Expression,
    )
}

pub(crate) fn render_body(body: &str, vars: &Context, mode: RenderMode) -> Result<String> {
    match mode {
        RenderMode::Expression => engine::render_expression(body, vars),
        RenderMode::Literal => text::render_literal(body, vars),
    }
}

fn merged(base: &Context, extra: &Context) -> Context {
    let mut out = base.clone();
    out.extend(extra.clone());
    out
}
