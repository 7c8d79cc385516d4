use thiserror::Error;

/// Errors raised by the clustering core and its collaborators.
///
/// Per-event variants fail only the event being processed; the shared constant
/// tables are never touched on an error path.
#[derive(Debug, Error)]
pub enum CaloError {
    #[error("size mismatch in {what}: expected {expected}, got {got}")]
    SizeMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("event has {got} cells but the geometry has {expected}")]
    CellCountMismatch { expected: usize, got: usize },

    #[error("missing input: {0}")]
    MissingInput(&'static str),

    #[error("constant data has not been initialized")]
    MissingConstants,

    #[error("constant data could not be loaded: {0}")]
    ConstantLoad(String),

    #[error("cell id {id} is out of range (number of cells: {n_cells})")]
    InvalidCell { id: usize, n_cells: usize },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CaloError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let e = CaloError::CellCountMismatch { expected: 10, got: 7 };
        assert_eq!(e.to_string(), "event has 7 cells but the geometry has 10");

        let e = CaloError::SizeMismatch { what: "noise", expected: 3, got: 2 };
        assert!(e.to_string().contains("noise"));
    }

    #[test]
    fn test_json_error_converts() {
        let err = serde_json::from_str::<u32>("not a number").unwrap_err();
        let e: CaloError = err.into();
        assert!(matches!(e, CaloError::Json(_)));
    }
}
