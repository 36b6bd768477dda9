use thiserror::Error;

// Unresolved template references are deliberately not represented here:
// expression mode leaves them verbatim in the output, and a callable that
// cannot be introspected is exposed unadapted instead of failing the render.
#[derive(Debug, Error)]
pub enum RenderError {
    /// Malformed expression-mode template syntax.
    #[error("template syntax error: {0}")]
    TemplateSyntax(String),

    /// A context value referenced from a literal-mode template has no
    /// textual form (callables cannot be spliced into text).
    #[error("cannot stringify context value `{key}`")]
    Stringify { key: String },

    /// Context nesting exceeded the resolver's depth cap.
    #[error("context nesting exceeds depth limit at `{key}`")]
    RecursionLimit { key: String },

    /// A context callable failed; the message is the callable's own.
    #[error("function `{name}` failed: {message}")]
    Function { name: String, message: String },

    /// The loader could not parse the template file.
    #[error("loader error: {0}")]
    Loader(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// Type alias for results that use `RenderError` as the error type
pub type Result<T> = std::result::Result<T, RenderError>;
