use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;

use crate::shared::ValidationError;

/// Default schema that mirrored tables live in.
const DEFAULT_SCHEMA: &str = "odata";

/// Connection configuration for the target Postgres instance.
///
/// This intentionally does not implement `Serialize` to avoid accidentally
/// leaking the password into serialized forms.
#[derive(Clone, Debug, Deserialize)]
pub struct PgConnectionConfig {
    /// Hostname or IP address of the Postgres server.
    pub host: String,
    /// Port of the Postgres server.
    pub port: u16,
    /// Name of the database to mirror into.
    pub name: String,
    /// Username for authentication.
    pub username: String,
    /// Optional password; `~/.pgpass` applies when absent.
    pub password: Option<SecretString>,
    /// Schema the mirrored tables live in.
    #[serde(default = "default_schema")]
    pub schema: String,
}

impl PgConnectionConfig {
    /// Validates the connection configuration.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.host.is_empty() {
            return Err(ValidationError::EmptyConnectionField("host"));
        }
        if self.name.is_empty() {
            return Err(ValidationError::EmptyConnectionField("name"));
        }
        if self.username.is_empty() {
            return Err(ValidationError::EmptyConnectionField("username"));
        }
        if self.schema.is_empty() {
            return Err(ValidationError::EmptyConnectionField("schema"));
        }

        Ok(())
    }

    /// Builds sqlx connect options from this configuration.
    pub fn with_db(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.username);

        match &self.password {
            Some(password) => options.password(password.expose_secret()),
            None => options,
        }
    }
}

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}
