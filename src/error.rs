use thiserror::Error;

/// Errors surfaced by the public entry points of the crate.
///
/// Neural sub-modules return [`candle::Result`]; everything that validates
/// caller input or configuration reports one of the named variants below.
#[derive(Debug, Error)]
pub enum KpnError {
    #[error(transparent)]
    Candle(#[from] candle::Error),

    #[error("{input}: expected {expected}, got shape {actual:?}")]
    Shape {
        input: &'static str,
        expected: String,
        actual: Vec<usize>,
    },

    #[error("{input}: {axis} is {actual}, configured maximum is {max}")]
    TooLong {
        input: &'static str,
        axis: &'static str,
        max: usize,
        actual: usize,
    },

    #[error("context has {actual} turns, at least {min} are required")]
    TooFewTurns { actual: usize, min: usize },

    #[error("embedding table has width {actual}, model expects {expected}")]
    Embedding { expected: usize, actual: usize },

    #[error("invalid model configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown device {0:?}")]
    UnknownDevice(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, KpnError>;
