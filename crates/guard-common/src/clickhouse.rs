//! ClickHouse client wrapper for the trading guard event journal.
//!
//! Provides schema management and batch inserts of committed status events.

use std::time::Duration;

use clickhouse::Client;
use thiserror::Error;

use crate::StatusEventRow;

/// Errors that can occur during ClickHouse operations.
#[derive(Debug, Error)]
pub enum ClickHouseError {
    #[error("ClickHouse client error: {0}")]
    Client(#[from] clickhouse::error::Error),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Schema creation failed: {0}")]
    Schema(String),
}

/// Configuration for the ClickHouse client.
#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    /// Whether the journal is written at all.
    pub enabled: bool,
    /// ClickHouse HTTP URL (e.g., "http://localhost:8123").
    pub url: String,
    /// Database name.
    pub database: String,
    /// Username (optional).
    pub user: Option<String>,
    /// Password (optional).
    pub password: Option<String>,
    /// Maximum events per insert batch.
    pub batch_size: usize,
    /// Flush period for partially filled batches.
    pub flush_period: Duration,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://localhost:8123".to_string(),
            database: "trading_guard".to_string(),
            user: None,
            password: None,
            batch_size: 500,
            flush_period: Duration::from_secs(2),
        }
    }
}

/// ClickHouse client wrapper.
#[derive(Clone)]
pub struct ClickHouseClient {
    client: Client,
    config: ClickHouseConfig,
}

impl ClickHouseClient {
    /// Creates a new ClickHouse client with the given configuration.
    pub fn new(config: ClickHouseConfig) -> Self {
        let mut client = Client::default()
            .with_url(&config.url)
            .with_database(&config.database);

        if let Some(ref user) = config.user {
            client = client.with_user(user);
        }
        if let Some(ref password) = config.password {
            client = client.with_password(password);
        }

        Self { client, config }
    }

    /// Returns the configuration this client was built with.
    pub fn config(&self) -> &ClickHouseConfig {
        &self.config
    }

    /// Tests the connection by running a simple query.
    pub async fn ping(&self) -> Result<(), ClickHouseError> {
        self.client
            .query("SELECT 1")
            .fetch_one::<u8>()
            .await
            .map_err(|e| ClickHouseError::Connection(e.to_string()))?;
        Ok(())
    }

    /// Creates all required tables using the embedded schema.
    pub async fn create_tables(&self) -> Result<(), ClickHouseError> {
        for statement in schema_statements(include_str!("schema.sql")) {
            self.client
                .query(&statement)
                .execute()
                .await
                .map_err(|e| ClickHouseError::Schema(format!("{}: {}", e, statement)))?;
        }
        Ok(())
    }

    /// Performs a single batch insert of status events.
    pub async fn insert_status_events(
        &self,
        events: &[StatusEventRow],
    ) -> Result<(), ClickHouseError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut insert = self.client.insert("status_events")?;
        for event in events {
            insert.write(event).await?;
        }
        insert.end().await?;
        Ok(())
    }
}

/// Splits an SQL script into executable statements, skipping comment-only blocks.
fn schema_statements(schema: &str) -> Vec<String> {
    schema
        .split(';')
        .filter_map(|statement| {
            let body: Vec<&str> = statement
                .lines()
                .filter(|line| !line.trim().starts_with("--") && !line.trim().is_empty())
                .collect();
            if body.is_empty() {
                None
            } else {
                Some(body.join("\n"))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClickHouseConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.url, "http://localhost:8123");
        assert_eq!(config.database, "trading_guard");
        assert!(config.user.is_none());
        assert_eq!(config.batch_size, 500);
    }

    #[test]
    fn test_client_creation() {
        let config = ClickHouseConfig {
            url: "http://clickhouse:8123".to_string(),
            database: "test".to_string(),
            user: Some("admin".to_string()),
            password: Some("secret".to_string()),
            ..Default::default()
        };
        let client = ClickHouseClient::new(config);
        assert_eq!(client.config().database, "test");
    }

    #[test]
    fn test_embedded_schema_has_one_statement() {
        let statements = schema_statements(include_str!("schema.sql"));
        assert_eq!(statements.len(), 1);
        assert!(statements[0].contains("CREATE TABLE IF NOT EXISTS status_events"));
    }

    #[test]
    fn test_schema_statements_skip_comments() {
        let statements = schema_statements("-- only a comment\n;\nSELECT 1;\n-- trailing\n");
        assert_eq!(statements, vec!["SELECT 1".to_string()]);
    }
}
