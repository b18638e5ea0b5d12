use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("space hierarchy is disabled")]
    Disabled,

    #[error("unknown department: {0}")]
    UnknownDepartment(String),

    #[error(transparent)]
    Matrix(#[from] deskbridge_matrix::Error),

    #[error(transparent)]
    Store(#[from] deskbridge_sessions::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
