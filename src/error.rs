use thiserror::Error;

/// Errors raised while building or fitting an EBMF model.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EbmfError {
    /// The caller handed over something the engine cannot work with (non-positive standard
    /// errors, non-finite seeds, unfitted priors where fitted ones are needed, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("dimension mismatch in {what}: expected {expected:?}, got {got:?}")]
    DimensionMismatch {
        what: &'static str,
        expected: (usize, usize),
        got: (usize, usize),
    },

    /// The objective or the noise model stopped being finite.
    #[error("numeric degeneracy: {0}")]
    NumericDegeneracy(String),

    /// Failure inside an EBNM solver.
    #[error("EBNM solver failed: {0}")]
    Solver(String),
}

pub type Result<T> = std::result::Result<T, EbmfError>;
