//! Aether Core Library
//!
//! Client-side session state for the Aether messenger: typing presence,
//! read receipts, the call state machine, and a typed client for the
//! REST API.

pub mod calls;
pub mod error;
pub mod models;
pub mod network;
pub mod presence;
pub mod receipts;
pub mod session;

use serde::{Deserialize, Serialize};

pub use calls::*;
pub use error::*;
pub use models::*;
pub use network::*;
pub use presence::*;
pub use receipts::*;
pub use session::*;

/// Timing knobs for a [`SessionCoordinator`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    pub presence: PresenceConfig,
    pub calls: CallConfig,
}

/// Where the API server lives
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    pub use_tls: bool,
}

impl ClientConfig {
    pub fn new(host: &str, port: u16, use_tls: bool) -> Self {
        Self {
            server_host: host.to_string(),
            server_port: port,
            use_tls,
        }
    }

    pub fn http_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.server_host, self.server_port)
    }

    pub fn api_url(&self) -> String {
        format!("{}/api/v1", self.http_url())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("localhost", 3001, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_urls() {
        let config = ClientConfig::new("chat.example.com", 443, true);
        assert_eq!(config.http_url(), "https://chat.example.com:443");
        assert_eq!(config.api_url(), "https://chat.example.com:443/api/v1");
        assert_eq!(ClientConfig::default().api_url(), "http://localhost:3001/api/v1");
    }
}
