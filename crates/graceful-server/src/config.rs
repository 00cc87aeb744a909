//! Server configuration types.
//!
//! # Example
//!
//! ```rust
//! use graceful_server::ServerConfig;
//! use std::time::Duration;
//!
//! let config = ServerConfig::builder()
//!     .http_addr("127.0.0.1:8080")
//!     .shutdown_timeout(Duration::from_secs(10))
//!     .build();
//!
//! assert_eq!(config.http_addr(), "127.0.0.1:8080");
//! assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use graceful_config::{HijackMode, ServerSection};

use crate::conn::HijackPolicy;

/// Default HTTP bind address.
pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";

/// Default grace period in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Server configuration.
///
/// A zero `shutdown_timeout` means shutdown waits for every connection
/// to finish on its own, however long that takes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    http_addr: String,
    shutdown_timeout: Duration,
    keep_alive: bool,
    handle_os_signals: bool,
    hijack_policy: HijackPolicy,
}

impl ServerConfig {
    /// Creates a new server configuration builder.
    #[must_use]
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Returns the HTTP bind address.
    #[must_use]
    pub fn http_addr(&self) -> &str {
        &self.http_addr
    }

    /// Parses and returns the HTTP address as a `SocketAddr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.http_addr.parse()
    }

    /// Returns the default grace period.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Returns whether connections should be kept alive between requests.
    #[must_use]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Returns whether SIGINT/SIGTERM start a graceful shutdown.
    #[must_use]
    pub fn handle_os_signals(&self) -> bool {
        self.handle_os_signals
    }

    /// Returns how hijacked connections are counted.
    #[must_use]
    pub fn hijack_policy(&self) -> HijackPolicy {
        self.hijack_policy
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl From<&ServerSection> for ServerConfig {
    fn from(section: &ServerSection) -> Self {
        let hijack_policy = match section.hijack_policy {
            HijackMode::Release => HijackPolicy::Release,
            HijackMode::Retain => HijackPolicy::Retain,
        };

        Self::builder()
            .http_addr(section.http_addr.clone())
            .shutdown_timeout(Duration::from_millis(section.shutdown_timeout_ms))
            .keep_alive(section.keep_alive)
            .handle_os_signals(section.handle_os_signals)
            .hijack_policy(hijack_policy)
            .build()
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct ServerConfigBuilder {
    http_addr: String,
    shutdown_timeout: Duration,
    keep_alive: bool,
    handle_os_signals: bool,
    hijack_policy: HijackPolicy,
}

impl ServerConfigBuilder {
    /// Creates a new builder with default values.
    ///
    /// OS signal handling is off by default so that embedding a server in
    /// tests or larger programs never installs process-wide handlers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            keep_alive: true,
            handle_os_signals: false,
            hijack_policy: HijackPolicy::default(),
        }
    }

    /// Sets the HTTP bind address.
    #[must_use]
    pub fn http_addr(mut self, addr: impl Into<String>) -> Self {
        self.http_addr = addr.into();
        self
    }

    /// Sets the default grace period. Zero waits indefinitely.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Enables or disables keep-alives.
    #[must_use]
    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = enabled;
        self
    }

    /// Enables or disables OS signal handling.
    #[must_use]
    pub fn handle_os_signals(mut self, enabled: bool) -> Self {
        self.handle_os_signals = enabled;
        self
    }

    /// Sets the hijack policy.
    #[must_use]
    pub fn hijack_policy(mut self, policy: HijackPolicy) -> Self {
        self.hijack_policy = policy;
        self
    }

    /// Builds the [`ServerConfig`].
    #[must_use]
    pub fn build(self) -> ServerConfig {
        ServerConfig {
            http_addr: self.http_addr,
            shutdown_timeout: self.shutdown_timeout,
            keep_alive: self.keep_alive,
            handle_os_signals: self.handle_os_signals,
            hijack_policy: self.hijack_policy,
        }
    }
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr(), DEFAULT_HTTP_ADDR);
        assert_eq!(
            config.shutdown_timeout(),
            Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS)
        );
        assert!(config.keep_alive());
        assert!(!config.handle_os_signals());
        assert_eq!(config.hijack_policy(), HijackPolicy::Release);
    }

    #[test]
    fn test_builder_overrides() {
        let config = ServerConfig::builder()
            .http_addr("127.0.0.1:3000")
            .shutdown_timeout(Duration::ZERO)
            .keep_alive(false)
            .handle_os_signals(true)
            .hijack_policy(HijackPolicy::Retain)
            .build();

        assert_eq!(config.http_addr(), "127.0.0.1:3000");
        assert!(config.shutdown_timeout().is_zero());
        assert!(!config.keep_alive());
        assert!(config.handle_os_signals());
        assert_eq!(config.hijack_policy(), HijackPolicy::Retain);
    }

    #[test]
    fn test_socket_addr() {
        let config = ServerConfig::builder().http_addr("127.0.0.1:8080").build();
        assert_eq!(config.socket_addr().unwrap().port(), 8080);

        let config = ServerConfig::builder().http_addr("not an address").build();
        assert!(config.socket_addr().is_err());
    }

    #[test]
    fn test_from_server_section() {
        let section = ServerSection {
            http_addr: "127.0.0.1:9000".to_string(),
            shutdown_timeout_ms: 1500,
            keep_alive: false,
            handle_os_signals: true,
            hijack_policy: HijackMode::Retain,
        };

        let config = ServerConfig::from(&section);
        assert_eq!(config.http_addr(), "127.0.0.1:9000");
        assert_eq!(config.shutdown_timeout(), Duration::from_millis(1500));
        assert!(!config.keep_alive());
        assert!(config.handle_os_signals());
        assert_eq!(config.hijack_policy(), HijackPolicy::Retain);
    }
}
