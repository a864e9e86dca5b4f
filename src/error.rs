//! Error handling for hts-multistream
//!
//! This module defines the error taxonomy used by the coordination engine
//! and a Result alias for use throughout the crate.
//!
//! Every variant here is fatal when it reaches the run loop, except
//! [`StreamError::Trigger`], which ends the loop with a coordinated stop.
//! Other soft failures (a toggle that did not take, a unit that would not
//! stop in time) are reported as outcome values by the components that
//! produce them.

use std::time::Duration;
use thiserror::Error;

/// Main error type for hts-multistream operations
#[derive(Error, Debug)]
pub enum StreamError {
    /// Bad placement map, duplicate trigger option, invalid hostname, no sites
    #[error("Configuration error: {0}")]
    Config(String),

    /// A unit could not be reached over the control network
    #[error("Connection failed {unit}: {message}")]
    Connectivity { unit: String, message: String },

    /// The remote device does not recognise the requested key
    #[error("Unknown key {key} on {unit}")]
    UnknownKey { unit: String, key: String },

    /// The capture plan does not fit in host memory, or is self-contradictory
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// A physical link stayed down after bounded repair
    #[error("Link down {unit}:{port} -> afhba.{link}: {reason}")]
    LinkDown {
        unit: String,
        port: String,
        link: u32,
        reason: String,
    },

    /// A data-mover process failed to start or to die
    #[error("Stream afhba.{link}: {message}")]
    Process { link: u32, message: String },

    /// The external trigger device could not be reached
    #[error("Trigger error: {0}")]
    Trigger(String),

    /// Host-side link driver read failure
    #[error("Link registry error: {0}")]
    Registry(String),

    /// A data-mover never showed a PID
    #[error("Timeout after {elapsed:?}: {message}")]
    Timeout { message: String, elapsed: Duration },

    /// A panic or unexpected failure caught inside the run loop
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<StreamError>,
    },
}

impl StreamError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        StreamError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a connectivity error for a unit
    pub fn connectivity(unit: impl Into<String>, message: impl Into<String>) -> Self {
        StreamError::Connectivity {
            unit: unit.into(),
            message: message.into(),
        }
    }

    /// Strip any context wrappers and return the underlying error
    pub fn root(&self) -> &StreamError {
        match self {
            StreamError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// True when the root cause is an unrecognised key
    pub fn is_unknown_key(&self) -> bool {
        matches!(self.root(), StreamError::UnknownKey { .. })
    }

    /// True for configuration errors raised before any hardware is touched
    pub fn is_config(&self) -> bool {
        matches!(self.root(), StreamError::Config(_))
    }
}

/// Result type alias for hts-multistream operations
pub type Result<T> = std::result::Result<T, StreamError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| StreamError::Io(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| StreamError::Io(e).with_context(f()))
    }
}
