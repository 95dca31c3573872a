/*!
Tests for error handling and error types.
*/

#[cfg(test)]
mod tests {
    use crate::error::{BackupError, CryptoFailure};
    use backvault_retry::{permanent_error, transient_error, RetryError, RetryableError};
    use std::io;

    #[test]
    fn test_backup_error_display() {
        let error = BackupError::validation("test validation error");
        assert_eq!(error.to_string(), "Validation error: test validation error");

        let error = BackupError::compression("test compression error");
        assert_eq!(error.to_string(), "Compression error: test compression error");

        let error = BackupError::state_store("database is locked");
        assert_eq!(error.to_string(), "State store error: database is locked");
    }

    #[test]
    fn test_client_error_display_includes_status() {
        let error = BackupError::client(Some(404), "file not found");
        assert_eq!(error.to_string(), "Client error (HTTP 404): file not found");

        let error = BackupError::client(None, "bad request body");
        assert_eq!(error.to_string(), "Client error: bad request body");
    }

    #[test]
    fn test_local_io_error_keeps_path_and_source() {
        let error = BackupError::io(
            "/data/report.txt",
            io::Error::new(io::ErrorKind::PermissionDenied, "Access denied"),
        );

        assert!(error.to_string().contains("/data/report.txt"));
        match error {
            BackupError::LocalIo { ref source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected LocalIo error"),
        }
    }

    #[test]
    fn test_backup_error_from_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let backup_error = BackupError::from(json_error);

        match backup_error {
            BackupError::Json(_) => {} // Expected
            _ => panic!("Expected Json error variant"),
        }
    }

    #[test]
    fn test_crypto_failure_conversion() {
        let error: BackupError = CryptoFailure::AuthenticationFailed { chunk: 0 }.into();
        assert!(error.is_authentication_failure());
        assert!(error.to_string().contains("chunk 0"));

        let error: BackupError = CryptoFailure::Truncated.into();
        assert!(!error.is_authentication_failure());
    }

    #[test]
    fn test_checksum_mismatch_error() {
        let error = BackupError::ChecksumMismatch {
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };

        assert!(error.to_string().contains("abc123"));
        assert!(error.to_string().contains("def456"));
    }

    #[test]
    fn test_only_network_errors_are_transient() {
        assert!(BackupError::transient("upload", "connection reset").is_transient());
        assert!(BackupError::client(Some(400), "bad request").is_permanent());
        assert!(BackupError::state_store("locked").is_permanent());
    }

    #[test]
    fn test_retry_error_unwraps_backup_error() {
        let retry = permanent_error!("download", BackupError::client(Some(403), "forbidden"));
        match BackupError::from(retry) {
            BackupError::PermanentClient { status, .. } => assert_eq!(status, Some(403)),
            other => panic!("Expected PermanentClient, got {other:?}"),
        }

        let retry = transient_error!("upload", BackupError::transient("upload", "timed out"));
        assert!(matches!(
            BackupError::from(retry),
            BackupError::TransientNetwork { .. }
        ));
    }

    #[test]
    fn test_exhausted_retries_become_transient_network() {
        let retry = RetryError::MaxRetriesExceeded {
            operation: "upload",
            attempts: 4,
            source: Box::new(BackupError::transient("upload", "503 Service Unavailable")),
        };

        let error = BackupError::from(retry);
        assert!(error.to_string().contains("4 attempts"));
        assert!(matches!(
            error,
            BackupError::TransientNetwork {
                operation: "upload",
                ..
            }
        ));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<BackupError>();
        assert_sync::<BackupError>();
    }

    #[test]
    fn test_error_result_type() {
        fn returns_error() -> crate::Result<()> {
            Err(BackupError::validation("test error"))
        }

        let result = returns_error();
        assert!(result.is_err());
    }
}
