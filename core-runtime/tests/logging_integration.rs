//! Integration tests for logging system

use bridge_traits::time::LogLevel;
use core_runtime::logging::{redact_if_sensitive, strip_path, LogFormat, LoggingConfig};

#[test]
fn test_logging_initialization_config() {
    // Logging can only be initialized once per process, so only the builder is exercised here.
    let config = LoggingConfig::default()
        .with_format(LogFormat::Json)
        .with_level(LogLevel::Debug)
        .with_pii_redaction(true)
        .with_spans(true);

    assert_eq!(config.format, LogFormat::Json);
    assert_eq!(config.level, LogLevel::Debug);
    assert!(config.redact_pii);
    assert!(config.enable_spans);
}

#[test]
fn test_redaction_of_credentials() {
    assert_eq!(redact_if_sensitive("access_token", "abc"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("refresh_token", "def"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("api_key", "k"), "[REDACTED]");
}

#[test]
fn test_redaction_of_record_payloads() {
    assert_eq!(redact_if_sensitive("song_content", "{title}"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("snapshot_json", "{}"), "[REDACTED]");
}

#[test]
fn test_redaction_of_emails() {
    let redacted = redact_if_sensitive("user", "band.leader@example.com");

    assert!(redacted.starts_with('b'));
    assert!(redacted.contains("[REDACTED]"));
    assert!(!redacted.contains("example.com"));
}

#[test]
fn test_identifiers_pass_through() {
    assert_eq!(redact_if_sensitive("record_id", "song-42"), "song-42");
    assert_eq!(redact_if_sensitive("device_id", "ipad-1"), "ipad-1");
    assert_eq!(redact_if_sensitive("stage", "remote_sync"), "remote_sync");
}

#[test]
fn test_path_stripping() {
    assert_eq!(strip_path("/data/setlist-sync/backups/b1.bak"), "b1.bak");
    assert_eq!(strip_path("D:\\data\\prefetch\\song.json"), "song.json");
    assert_eq!(strip_path("filename.txt"), "filename.txt");
    assert_eq!(strip_path(""), "");
}

#[test]
fn test_config_chaining() {
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Warn)
        .with_pii_redaction(false)
        .with_spans(false)
        .with_target(false)
        .with_thread_info(true);

    assert_eq!(config.format, LogFormat::Compact);
    assert_eq!(config.level, LogLevel::Warn);
    assert!(!config.redact_pii);
    assert!(!config.enable_spans);
    assert!(!config.display_target);
    assert!(config.display_thread_info);
}
