//! Connection URL building.

use std::collections::BTreeMap;
use url::{Host, Url};

use crate::error::ClientError;

/// Extra query parameters appended to the connection URL.
pub type Query = BTreeMap<String, String>;

/// Resource path used when the target URL has none.
pub const DEFAULT_PATH: &str = "/socket.io/";

/// The server a client connects to, normalized for WebSocket use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    secure: bool,
    host: String,
    port: u16,
    path: String,
}

impl Endpoint {
    /// Parse a target URL. `http`/`ws` map to `ws`, `https`/`wss` to `wss`.
    ///
    /// `default_path` replaces an empty or `/` path.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidUrl`] for unparseable URLs, unsupported
    /// schemes, or URLs without a host.
    pub fn parse(uri: &str, default_path: &str) -> Result<Self, ClientError> {
        let url = Url::parse(uri).map_err(|e| ClientError::InvalidUrl(format!("{uri}: {e}")))?;

        let secure = match url.scheme() {
            "http" | "ws" => false,
            "https" | "wss" => true,
            other => {
                return Err(ClientError::InvalidUrl(format!(
                    "{uri}: unsupported scheme {other}"
                )))
            }
        };

        let host = match url.host() {
            Some(Host::Ipv6(addr)) => format!("[{addr}]"),
            Some(host) => host.to_string(),
            None => return Err(ClientError::InvalidUrl(format!("{uri}: missing host"))),
        };

        let port = url.port().unwrap_or(if secure { 443 } else { 80 });

        let path = match url.path() {
            "" | "/" => default_path.to_string(),
            path => path.to_string(),
        };

        Ok(Self {
            secure,
            host,
            port,
            path,
        })
    }

    #[must_use]
    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "wss"
        } else {
            "ws"
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Build the URL for one connection attempt.
    #[must_use]
    pub fn connection_url(
        &self,
        revision: u8,
        session_id: Option<&str>,
        timestamp: u64,
        query: &Query,
    ) -> String {
        let mut url = format!(
            "{}://{}:{}{}?EIO={}&transport=websocket",
            self.scheme(),
            self.host,
            self.port,
            self.path,
            revision
        );
        if let Some(sid) = session_id {
            url.push_str(&format!("&sid={sid}"));
        }
        url.push_str(&format!("&t={timestamp}"));
        for (key, value) in query {
            url.push_str(&format!("&{key}={}", percent_encode(value)));
        }
        url
    }
}

/// Percent-encode a query value. ASCII alphanumerics pass through; every
/// other byte becomes `%XX` with uppercase hex digits.
#[must_use]
pub fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        if byte.is_ascii_alphanumeric() {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_encode() {
        assert_eq!(percent_encode("a b&c"), "a%20b%26c");
        assert_eq!(percent_encode("AZaz09"), "AZaz09");
        assert_eq!(percent_encode("-_.~"), "%2D%5F%2E%7E");
        assert_eq!(percent_encode("é"), "%C3%A9");
    }

    #[test]
    fn test_scheme_mapping() {
        let plain = Endpoint::parse("http://example.com", DEFAULT_PATH).unwrap();
        assert_eq!(plain.scheme(), "ws");
        assert_eq!(plain.port(), 80);
        assert_eq!(plain.path(), "/socket.io/");

        let secure = Endpoint::parse("https://example.com:8443/rt/", DEFAULT_PATH).unwrap();
        assert_eq!(secure.scheme(), "wss");
        assert_eq!(secure.port(), 8443);
        assert_eq!(secure.path(), "/rt/");

        assert_eq!(
            Endpoint::parse("wss://example.com", DEFAULT_PATH)
                .unwrap()
                .port(),
            443
        );
    }

    #[test]
    fn test_ipv6_host_is_bracketed() {
        let endpoint = Endpoint::parse("http://[::1]:3000", DEFAULT_PATH).unwrap();
        assert_eq!(endpoint.host(), "[::1]");
        assert!(endpoint
            .connection_url(4, None, 0, &Query::new())
            .starts_with("ws://[::1]:3000/socket.io/?"));
    }

    #[test]
    fn test_rejects_bad_urls() {
        assert!(matches!(
            Endpoint::parse("ftp://example.com", DEFAULT_PATH),
            Err(ClientError::InvalidUrl(_))
        ));
        assert!(Endpoint::parse("not a url", DEFAULT_PATH).is_err());
    }

    #[test]
    fn test_connection_url() {
        let endpoint = Endpoint::parse("http://localhost:3000", DEFAULT_PATH).unwrap();
        let mut query = Query::new();
        query.insert("token".into(), "a b&c".into());

        assert_eq!(
            endpoint.connection_url(4, None, 1_700_000_000, &query),
            "ws://localhost:3000/socket.io/?EIO=4&transport=websocket&t=1700000000&token=a%20b%26c"
        );
        assert_eq!(
            endpoint.connection_url(3, Some("abc"), 5, &Query::new()),
            "ws://localhost:3000/socket.io/?EIO=3&transport=websocket&sid=abc&t=5"
        );
    }
}
