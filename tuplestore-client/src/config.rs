//! Client configuration types and builder.

use std::time::Duration;

use tuplestore_core::{Result, TupleStoreError};

use crate::schema::{FieldType, Spaces};

/// Default server host.
const DEFAULT_HOST: &str = "127.0.0.1";
/// Default server port.
const DEFAULT_PORT: u16 = 3301;
/// Default timeout for a single connect attempt.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default number of initial connect attempts.
const DEFAULT_CONNECT_ATTEMPTS: u32 = 1;

/// Credentials for the authentication handshake.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// User name.
    pub username: String,
    /// Plain-text password; only its scramble crosses the wire.
    pub password: String,
}

/// Configuration for a [`TupleStoreClient`](crate::TupleStoreClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    host: String,
    port: u16,
    credentials: Option<Credentials>,
    spaces: Option<Spaces>,
    reconnect_period: Option<Duration>,
    reconnect_always: bool,
    connect_timeout: Duration,
    connect_attempts: u32,
    request_timeout: Option<Duration>,
    max_pending: Option<usize>,
    default_field_type: FieldType,
}

impl ClientConfig {
    /// Creates a new builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Returns the server host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the server port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the `host:port` connect string.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns the configured credentials, if any.
    ///
    /// Absence of credentials skips the authentication step entirely.
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Returns the pre-built schema, if one was supplied.
    ///
    /// A pre-built schema bypasses discovery against the metadata spaces.
    pub fn spaces(&self) -> Option<&Spaces> {
        self.spaces.as_ref()
    }

    /// Returns the delay between reconnect attempts, or `None` when
    /// reconnection is disabled.
    pub fn reconnect_period(&self) -> Option<Duration> {
        self.reconnect_period
    }

    /// Returns `true` if reconnection should be attempted even before the
    /// first successful connect.
    pub fn reconnect_always(&self) -> bool {
        self.reconnect_always
    }

    /// Returns the timeout for a single connect attempt.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Returns the number of initial connect attempts.
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    /// Returns the default per-request deadline, if configured.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    /// Returns the cap on concurrently pending requests, if configured.
    pub fn max_pending(&self) -> Option<usize> {
        self.max_pending
    }

    /// Returns the field type applied past a space's declared field prefix.
    pub fn default_field_type(&self) -> FieldType {
        self.default_field_type
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfigBuilder::new().build().expect("default config is valid")
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    host: Option<String>,
    port: Option<u16>,
    credentials: Option<Credentials>,
    spaces: Option<Spaces>,
    reconnect_period: Option<Duration>,
    reconnect_always: bool,
    connect_timeout: Option<Duration>,
    connect_attempts: Option<u32>,
    request_timeout: Option<Duration>,
    max_pending: Option<usize>,
    default_field_type: Option<FieldType>,
}

impl ClientConfigBuilder {
    /// Creates a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the server host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the server port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets user name and password for the authentication handshake.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Supplies a pre-built schema, bypassing discovery.
    pub fn spaces(mut self, spaces: Spaces) -> Self {
        self.spaces = Some(spaces);
        self
    }

    /// Sets the delay between reconnect attempts. Zero disables reconnection.
    pub fn reconnect_period(mut self, period: Duration) -> Self {
        self.reconnect_period = if period.is_zero() { None } else { Some(period) };
        self
    }

    /// Attempt reconnection even when the initial connect fails.
    ///
    /// Has no effect unless a reconnect period is set.
    pub fn reconnect_always(mut self, always: bool) -> Self {
        self.reconnect_always = always;
        self
    }

    /// Sets the timeout for a single connect attempt.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets the number of initial connect attempts.
    pub fn connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = Some(attempts);
        self
    }

    /// Sets the default per-request deadline.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Caps the number of concurrently pending requests.
    ///
    /// New sends fail with a pending-limit error once the cap is reached.
    pub fn max_pending(mut self, max: usize) -> Self {
        self.max_pending = Some(max);
        self
    }

    /// Sets the field type applied past a space's declared field prefix.
    pub fn default_field_type(mut self, field_type: FieldType) -> Self {
        self.default_field_type = Some(field_type);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `connect_attempts` is zero, the host
    /// is empty, or `max_pending` is zero.
    pub fn build(self) -> Result<ClientConfig> {
        let host = self.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
        if host.is_empty() {
            return Err(TupleStoreError::Configuration(
                "host must not be empty".to_string(),
            ));
        }

        let connect_attempts = self.connect_attempts.unwrap_or(DEFAULT_CONNECT_ATTEMPTS);
        if connect_attempts == 0 {
            return Err(TupleStoreError::Configuration(
                "connect_attempts must be at least 1".to_string(),
            ));
        }

        if self.max_pending == Some(0) {
            return Err(TupleStoreError::Configuration(
                "max_pending must be at least 1".to_string(),
            ));
        }

        Ok(ClientConfig {
            host,
            port: self.port.unwrap_or(DEFAULT_PORT),
            credentials: self.credentials,
            spaces: self.spaces,
            reconnect_period: self.reconnect_period,
            reconnect_always: self.reconnect_always,
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            connect_attempts,
            request_timeout: self.request_timeout,
            max_pending: self.max_pending,
            default_field_type: self.default_field_type.unwrap_or(FieldType::Str),
        })
    }
}
