use thiserror::Error;

/// Reasons a single device line could not be turned into a sample
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Malformed record: {0}")]
    MalformedSyntax(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Value out of range for {field}: {value}")]
    OutOfRangeValue { field: &'static str, value: f64 },
}

/// Key-value store failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Golf IMU error types
#[derive(Error, Debug)]
pub enum GolfImuError {
    #[error("No device connected")]
    TransportUnavailable,

    #[error("No active session")]
    NoActiveSession,

    #[error("Ingestion already running")]
    AlreadyRunning,

    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("Invalid swing: {0}")]
    InvalidSwing(String),

    #[error("Storage failure: {0}")]
    Storage(#[from] StoreError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Transport reader thread panicked")]
    ReaderPanicked,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ImuResult<T> = Result<T, GolfImuError>;

impl GolfImuError {
    /// Precondition failures leave the pipeline usable and are not retried
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            GolfImuError::TransportUnavailable
                | GolfImuError::NoActiveSession
                | GolfImuError::AlreadyRunning
                | GolfImuError::ConfigurationInvalid(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = GolfImuError::ConfigurationInvalid("threshold 200 outside 5..100".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid configuration: threshold 200 outside 5..100"
        );

        let err: GolfImuError = DecodeError::MissingField("ax".to_string()).into();
        assert_eq!(err.to_string(), "Decode error: Missing required field: ax");

        assert_eq!(
            GolfImuError::ReaderPanicked.to_string(),
            "Transport reader thread panicked"
        );
    }

    #[test]
    fn test_precondition_classification() {
        assert!(GolfImuError::TransportUnavailable.is_precondition());
        assert!(GolfImuError::NoActiveSession.is_precondition());
        assert!(!GolfImuError::Storage(StoreError::Backend("down".into())).is_precondition());
        assert!(!GolfImuError::ReaderPanicked.is_precondition());
    }
}
