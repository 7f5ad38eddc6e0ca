//! Endpoint resolution: hosting origin + path → transport URL.

use std::fmt;

use crate::error::RealtimeError;

/// The origin the hosting application is served from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageOrigin {
    /// Served over TLS; selects `wss` over `ws`.
    pub secure: bool,
    /// Host with optional port, e.g. `photos.example.com:8443`.
    pub host: String,
}

impl PageOrigin {
    /// Parse an `http://` / `https://` origin. Any path after the host is
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::InvalidOrigin`] for other schemes or an
    /// empty host.
    pub fn parse(origin: &str) -> Result<Self, RealtimeError> {
        let trimmed = origin.trim();
        let (secure, rest) = if let Some(rest) = trimmed.strip_prefix("https://") {
            (true, rest)
        } else if let Some(rest) = trimmed.strip_prefix("http://") {
            (false, rest)
        } else {
            return Err(RealtimeError::InvalidOrigin(origin.to_owned()));
        };

        let host = rest.split('/').next().unwrap_or_default();
        if host.is_empty() {
            return Err(RealtimeError::InvalidOrigin(origin.to_owned()));
        }

        Ok(Self { secure, host: host.to_owned() })
    }

    /// Transport scheme matching the page's own security.
    #[must_use]
    pub fn scheme(&self) -> &'static str {
        if self.secure { "wss" } else { "ws" }
    }

    /// Resolve `path` against this origin.
    ///
    /// Paths that already carry a `ws://` or `wss://` scheme are returned
    /// unchanged.
    #[must_use]
    pub fn resolve(&self, path: &str) -> String {
        if path.starts_with("ws://") || path.starts_with("wss://") {
            return path.to_owned();
        }
        let scheme = self.scheme();
        let host = &self.host;
        if path.starts_with('/') {
            format!("{scheme}://{host}{path}")
        } else {
            format!("{scheme}://{host}/{path}")
        }
    }
}

impl fmt::Display for PageOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "https" } else { "http" };
        write!(f, "{scheme}://{}", self.host)
    }
}
