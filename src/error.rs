//! Custom error types for the calibration driver.
//!
//! Every failure the core can produce is a typed variant here; malformed
//! device responses must surface as a [`DecodeError`], never as a panic.
//! The umbrella [`CalError`] consolidates the per-layer enums so callers
//! that do not care which layer failed can use `?` with a single type.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, CalError>;

/// Failures while decoding device response frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("fewer than four byte fields in register payload: {0:?}")]
    InsufficientFields(String),

    #[error("field {index} ({name}) is not a number: {value:?}")]
    BadNumericField {
        index: usize,
        name: &'static str,
        value: String,
    },
}

/// Failures at the serial transport layer.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no response from port '{0}' before timeout")]
    NoResponse(String),

    #[error("port '{0}' is not open")]
    PortUnavailable(String),

    #[error("failed to open port '{port}': {source}")]
    OpenFailed {
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error("write to port '{port}' failed: {source}")]
    WriteFailed {
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serial support not enabled; rebuild with --features instrument_serial")]
    FeatureDisabled,

    #[error("serial I/O task panicked")]
    TaskPanicked,
}

/// Failures validating calibration steps and run preconditions.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("unknown step kind '{0}' (expected as-found, as-left or final)")]
    UnknownStepKind(String),

    #[error("step {step}: {channel} evaluation enabled but no tolerance given")]
    MissingTolerance { step: usize, channel: &'static str },

    #[error("step {step}: unparseable soak duration '{text}'")]
    BadSoakDuration { step: usize, text: String },

    #[error("no probes selected for the run")]
    NoProbesSelected,

    #[error("no reference instrument selected for the run")]
    NoMirrorSelected,

    #[error("automatic setpoint mode is not implemented")]
    AutoModeUnsupported,
}

/// Failures in the coefficient solver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SolverError {
    #[error("insufficient data: {got} usable points, need at least {need}")]
    InsufficientData { got: usize, need: usize },

    #[error("singular fit: design matrix has no stable pivot")]
    SingularFit,
}

/// Application-level error consolidating all layers.
#[derive(Error, Debug)]
pub enum CalError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("solver error: {0}")]
    Solver(#[from] SolverError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
