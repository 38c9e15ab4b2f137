//! Error types for the visual response engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving, rendering or converting a visual response
#[derive(Error, Debug)]
pub enum Error {
    /// Neither a tenant override nor a default template exists
    #[error("Template not found: {template_id} (tenant {tenant_id})")]
    TemplateNotFound {
        tenant_id: String,
        template_id: String,
    },

    /// Template source is syntactically invalid
    #[error("Template parse failed: {0}")]
    TemplateParse(String),

    /// Template parsed but failed while executing against the data
    #[error("Template execution failed: {0}")]
    TemplateRender(String),

    /// No context became available and the overflow budget is spent
    #[error("Browser pool exhausted")]
    PoolExhausted,

    /// Waiting for a pooled context exceeded the render deadline
    #[error("Timed out acquiring a rendering context after {0}ms")]
    AcquireTimeout(u64),

    /// The pool has been closed
    #[error("Browser pool is closed")]
    PoolClosed,

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Rendering exceeded its deadline after a context was acquired
    #[error("Render timed out after {0}ms")]
    RenderTimeout(u64),

    /// Failed to render content
    #[error("Rendering failed: {0}")]
    RenderError(String),

    /// Decoding the captured bitmap or encoding the output failed
    #[error("Format conversion failed: {0}")]
    FormatConversion(String),

    /// Failed to initialize the engine or one of its contexts
    #[error("Engine initialization failed: {0}")]
    InitializationError(String),

    /// Template/config storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Malformed render request or identifier
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<minijinja::Error> for Error {
    fn from(err: minijinja::Error) -> Self {
        match err.kind() {
            minijinja::ErrorKind::SyntaxError | minijinja::ErrorKind::BadEscape => {
                Error::TemplateParse(err.to_string())
            }
            _ => Error::TemplateRender(err.to_string()),
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::FormatConversion(err.to_string())
    }
}

impl Error {
    /// Whether a caller-level retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::PoolExhausted | Error::AcquireTimeout(_) | Error::RenderTimeout(_)
        )
    }
}
