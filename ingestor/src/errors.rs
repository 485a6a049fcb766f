use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("State conflict: {0}")]
    Conflict(String),

    #[error("Pairing code {0} was already issued")]
    PairingCodeTaken(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Queue closed")]
    QueueClosed,
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(db_err) => crate::db::is_transient_error(db_err),
            Error::Unavailable(_) => true,

            Error::Validation(_)
            | Error::NotFound(_)
            | Error::Conflict(_)
            | Error::PairingCodeTaken(_)
            | Error::Mqtt(_)
            | Error::Json(_)
            | Error::Io(_)
            | Error::Migration(_)
            | Error::QueueClosed => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Unavailable("down".to_string()).is_transient());
        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!Error::Database(sqlx::Error::RowNotFound).is_transient());
        assert!(!Error::Validation("bad".to_string()).is_transient());
        assert!(!Error::NotFound("device 7".to_string()).is_transient());
        assert!(!Error::Conflict("mac".to_string()).is_transient());
    }
}
