use thiserror::Error;

/// Failures surfaced by the map-construction core.
///
/// Geometric degeneracies found while matching edge pairs are handled
/// locally (the pair is skipped) and never reach this type; only malformed
/// input and internal invariant breaches abort a run.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The input graph references ids that were never declared, or is
    /// structurally unusable.
    #[error("malformed input: {0}")]
    InputMalformed(String),

    /// An edge whose geometry has no extent (coincident endpoints on
    /// input). Dropped by the parser with a warning; only fatal when a
    /// caller insists on keeping it.
    #[error("degenerate geometry: {0}")]
    GeometryDegenerate(String),

    /// An internal consistency check failed. Always a bug, never bad input.
    #[error("invariant violated in phase '{phase}': {detail}")]
    InvariantViolation { phase: &'static str, detail: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BuildError>;
