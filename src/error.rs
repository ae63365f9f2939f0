// Host-facing error taxonomy. Internal helpers use anyhow; these codes reach the host error sink.

use thiserror::Error;

pub const CODE_SUCCESS: i32 = 0;
pub const CODE_UNKNOWN: i32 = -1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("connection failed: {0}")]
    ConnectIo(String),
    #[error("connection timed out")]
    ConnectTimeout,
    #[error("no connection available")]
    NullConnection,
    #[error("cached data failed verification")]
    DataVerifyFail,
    #[error("failed to create cache directory: {0}")]
    MakeDir(String),
    #[error("failed to write cache file: {0}")]
    WriteFile(String),
    #[error("failed to split html into template and data")]
    SplitHtml,
    #[error("failed to compute data diff")]
    MergeDiff,
    #[error("malformed server data: {0}")]
    ServerDataException(String),
    #[error("failed to build html from template and data")]
    BuildHtml,
}

impl SessionError {
    /// Stable numeric code reported through `SessionRuntime::notify_error`.
    pub fn code(&self) -> i32 {
        match self {
            SessionError::ConnectIo(_) => -901,
            SessionError::ConnectTimeout => -902,
            SessionError::NullConnection => -903,
            SessionError::DataVerifyFail => -1001,
            SessionError::MakeDir(_) => -1003,
            SessionError::WriteFile(_) => -1004,
            SessionError::SplitHtml => -1005,
            SessionError::MergeDiff => -1006,
            SessionError::ServerDataException(_) => -1007,
            SessionError::BuildHtml => -1008,
        }
    }

    /// Map a transport failure onto the connectivity codes.
    pub fn from_transport(err: &anyhow::Error) -> Self {
        let msg = err.to_string();
        if msg.contains("timed out") || msg.contains("timeout") {
            SessionError::ConnectTimeout
        } else {
            SessionError::ConnectIo(msg)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(SessionError::ConnectIo("reset".into()).code(), -901);
        assert_eq!(SessionError::ConnectTimeout.code(), -902);
        assert_eq!(SessionError::DataVerifyFail.code(), -1001);
        assert_eq!(SessionError::WriteFile("disk full".into()).code(), -1004);
        assert_eq!(SessionError::BuildHtml.code(), -1008);
    }

    #[test]
    fn test_from_transport() {
        let timeout = anyhow::anyhow!("operation timed out");
        assert_eq!(SessionError::from_transport(&timeout), SessionError::ConnectTimeout);
        let refused = anyhow::anyhow!("connection refused");
        assert_eq!(SessionError::from_transport(&refused).code(), -901);
    }
}
