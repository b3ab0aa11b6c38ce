use thiserror::Error;

/// Conditions that abort a run. Everything else is either retried or recorded per product.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Catalog rejected the query ({code}): {message}")]
    Catalog { code: String, message: String },

    #[error("No product matches the criteria")]
    EmptyResult,

    #[error("Download returned a text payload instead of a product (check credentials): {0}")]
    Authentication(String),

    #[error("Tile identifier '{0}' should look like 'T31TCJ' or '31TCJ'")]
    TileFormat(String),

    #[error("Destination {0} is locked by another run")]
    DestinationLocked(String),
}

impl RunError {
    pub fn exit_code(self: &Self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::Catalog { .. } => 3,
            Self::EmptyResult => 4,
            Self::Authentication(_) => 5,
            Self::TileFormat(_) => 6,
            Self::DestinationLocked(_) => 7,
        }
    }
}

/// Exit status for any error escaping a run. Errors that are not a `RunError` exit with 1.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<RunError>()
        .map(RunError::exit_code)
        .unwrap_or(1)
}
