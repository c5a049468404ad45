use thiserror::Error;

/// Errors surfaced by the controller layer.
///
/// None of these stop a running loop; they are returned to direct callers
/// and logged when they occur inside a cycle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControllerError {
    /// No factory is registered under the requested name.
    #[error("no {kind} registered under `{name}`")]
    UnknownBehavior {
        /// `algorithm` or `platform`.
        kind: &'static str,
        /// Requested name.
        name: String,
    },
    /// A factory rejected its arguments or failed to build.
    #[error("failed to construct {kind} `{name}`: {reason}")]
    Construction {
        /// `algorithm`, `platform` or `accent`.
        kind: &'static str,
        /// Requested name.
        name: String,
        /// Factory-provided reason.
        reason: String,
    },
    /// An empty behavior name was supplied where one is required.
    #[error("{0} name is empty")]
    EmptyName(&'static str),
    /// Run timing parameters cannot be represented.
    #[error("invalid run timing: {0}")]
    InvalidTiming(String),
    /// Configuration rejected during validation.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ControllerError {
    /// Shorthand for a construction failure.
    #[must_use]
    pub fn construction(kind: &'static str, name: &str, reason: impl Into<String>) -> Self {
        Self::Construction {
            kind,
            name: name.to_owned(),
            reason: reason.into(),
        }
    }
}
