use std::fmt;

/// Run-level error types.
///
/// Provider failures never surface here: they are classified into
/// `ProviderStatus` and folded into the waterfall decision. Only errors that
/// concern the run itself (configuration, the lead store, registry wiring)
/// use this enum.
#[derive(Debug, Clone)]
pub enum EnrichError {
    /// Invalid or incomplete configuration (empty chain, unknown provider id).
    Config(String),
    /// Lead store read/write failure. Writes are logged, never fatal to a run.
    Store(String),
    /// Scoring call failed in a way the scorer could not classify.
    Scoring(String),
    /// Provider registry construction failure.
    Provider(String),
    /// Filesystem error (waterfall config file).
    Io(String),
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<EnrichError>,
        /// Additional context message.
        context: String,
    },
}

impl fmt::Display for EnrichError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnrichError::Config(msg) => write!(f, "Configuration error: {}", msg),
            EnrichError::Store(msg) => write!(f, "Lead store error: {}", msg),
            EnrichError::Scoring(msg) => write!(f, "Scoring error: {}", msg),
            EnrichError::Provider(msg) => write!(f, "Provider error: {}", msg),
            EnrichError::Io(msg) => write!(f, "I/O error: {}", msg),
            EnrichError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl std::error::Error for EnrichError {}

impl From<reqwest::Error> for EnrichError {
    fn from(err: reqwest::Error) -> Self {
        EnrichError::Store(err.to_string())
    }
}

impl From<std::io::Error> for EnrichError {
    fn from(err: std::io::Error) -> Self {
        EnrichError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for EnrichError {
    fn from(err: serde_json::Error) -> Self {
        EnrichError::Config(format!("JSON parse error: {}", err))
    }
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `EnrichError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T, EnrichError>;

    /// Add context lazily (only evaluated on error).
    #[allow(dead_code)]
    fn with_context<F>(self, f: F) -> Result<T, EnrichError>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T, EnrichError> {
    fn context(self, context: impl Into<String>) -> Result<T, EnrichError> {
        self.map_err(|e| EnrichError::WithContext {
            source: Box::new(e),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, EnrichError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| EnrichError::WithContext {
            source: Box::new(e),
            context: f(),
        })
    }
}
