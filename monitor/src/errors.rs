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

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// Request that the device's current status forbids.
    #[error("{0}")]
    InvalidState(String),

    #[error("Invalid stored value: {0}")]
    Decode(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Channel send error")]
    ChannelSend,
}

impl Error {
    pub fn device_not_found(device_id: i64) -> Self {
        Self::NotFound(format!("Device with ID {} not found", device_id))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
