//! Connection and audit configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Schema key used when a datasource URL carries no `schema` parameter
pub const DEFAULT_SCHEMA: &str = "default";

/// Placeholder written in place of sensitive field values
pub const REDACTED: &str = "[REDACTED]";

/// Connection settings for one tenant's data store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Datasource URL (e.g. `postgresql://host/db?schema=tenant_a`)
    pub datasource_url: String,

    /// Upper bound on connection creation, in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            datasource_url: String::new(),
            connect_timeout_ms: 10_000,
        }
    }
}

impl ConnectionConfig {
    /// Create a config for a datasource URL with the default timeout
    pub fn new(datasource_url: impl Into<String>) -> Self {
        Self {
            datasource_url: datasource_url.into(),
            ..Default::default()
        }
    }

    /// Set the connection creation timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Identity of this configuration for cache comparison
    ///
    /// Two configs with the same datasource URL address the same store,
    /// so the URL alone decides whether a cached connection is reusable.
    pub fn fingerprint(&self) -> &str {
        &self.datasource_url
    }

    /// Schema key extracted from the `schema` query parameter
    pub fn schema_key(&self) -> String {
        url::Url::parse(&self.datasource_url)
            .ok()
            .and_then(|url| {
                url.query_pairs()
                    .find(|(k, _)| k == "schema")
                    .map(|(_, v)| v.into_owned())
            })
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SCHEMA.to_string())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Audit file rotation strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationStrategy {
    /// One file per UTC day
    #[default]
    Daily,
    /// Numbered files per day, rolled at `max_file_size_mb`
    Size,
}

/// Audit pipeline and interception settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Root directory for audit files; each schema gets a subdirectory
    pub log_directory: PathBuf,

    /// File name prefix for audit files
    pub file_prefix: String,

    pub rotation_strategy: RotationStrategy,

    /// Size threshold for `RotationStrategy::Size`
    pub max_file_size_mb: u64,

    /// Buffer size that triggers an immediate flush
    pub buffer_size: usize,

    /// Period of the background flush timer
    pub flush_interval_ms: u64,

    /// Models without a deletion marker (exempt from soft-delete filtering)
    pub excluded_models: Vec<String>,

    /// Models whose mutations are never audited
    pub audit_excluded_models: Vec<String>,

    /// Field names redacted in audit snapshots (case-insensitive)
    pub sensitive_fields: Vec<String>,

    /// Deletion marker field name
    pub soft_delete_field: String,

    /// Read the matching row before update/upsert/delete to record `before`
    pub snapshot_before: bool,

    pub save_to_file: bool,
    pub save_to_database: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_directory: PathBuf::from("./logs/audit"),
            file_prefix: "tenant-audit".to_string(),
            rotation_strategy: RotationStrategy::Daily,
            max_file_size_mb: 100,
            buffer_size: 100,
            flush_interval_ms: 5000,
            excluded_models: vec!["tb_user_profile".to_string()],
            audit_excluded_models: vec!["_prisma_migrations".to_string(), "tb_activity".to_string()],
            sensitive_fields: ["password", "secret", "token", "api_key", "hash"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            soft_delete_field: "deleted_at".to_string(),
            snapshot_before: true,
            save_to_file: false,
            save_to_database: true,
        }
    }
}

impl AuditConfig {
    /// Defaults overridden by `AUDIT_LOG_DIR` when set
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("AUDIT_LOG_DIR") {
            if !dir.is_empty() {
                config.log_directory = PathBuf::from(dir);
            }
        }
        config
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Directory holding audit files for one schema
    pub fn schema_directory(&self, schema_key: &str) -> PathBuf {
        self.log_directory.join(schema_key)
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn is_sensitive(&self, field: &str) -> bool {
        self.sensitive_fields
            .iter()
            .any(|s| s.eq_ignore_ascii_case(field))
    }

    pub fn is_audit_excluded(&self, model: &str) -> bool {
        self.audit_excluded_models.iter().any(|m| m == model)
    }
}
