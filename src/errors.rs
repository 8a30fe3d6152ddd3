#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("file rejected: {0}")]
    FileRejected(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate id: {0}")]
    DuplicateId(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage corruption: {0}")]
    Corruption(String),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// One-line reason string shown in the overlay error state.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}
