use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No page or execution context could be established.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The protocol answered with an error, timed out, or the transport went away.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The page does not expose the test runner entry points the harness needs.
    #[error("Missing capability: {0}")]
    MissingCapability(String),

    /// An evaluated script threw. `details` is the protocol's `exceptionDetails`
    /// object, kept verbatim.
    #[error("Script evaluation failed during {context}: {details}")]
    ScriptEvaluation { context: String, details: Value },

    /// A remote call answered with a value of the wrong shape.
    #[error("Unexpected result from {context}: {value}")]
    UnexpectedResult { context: String, value: Value },

    #[error("Snapshot parse error: {0}")]
    SnapshotParse(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Text of the page-side exception, when this error carries one.
    pub fn exception_text(&self) -> Option<String> {
        let Error::ScriptEvaluation { details, .. } = self else {
            return None;
        };
        let description = details
            .get("exception")
            .and_then(|e| e.get("description"))
            .and_then(|v| v.as_str());
        let text = details.get("text").and_then(|v| v.as_str());
        description.or(text).map(|s| s.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
