use thiserror::Error;

/// Errors surfaced by model construction and sampling.
///
/// Numeric pathologies inside the samplers are handled by rejection and
/// never reach this type; only setup-time mistakes and kernel-level
/// overflow that survives the stabilized code path do.
#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("partition function overflowed on both evaluation paths")]
    NumericOverflow,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SamplerError>;
