//! Gateway wire protocol
//!
//! Opcodes, payload shapes, close-code policy, frame decoding and log
//! redaction. Nothing in here touches a socket.

pub mod close_code;
pub mod inflate;
pub mod payload;
pub mod redact;

pub use close_code::{classify, ClosePolicy};
pub use payload::{
    Activity, GatewayPayload, Hello, Identify, IdentifyProperties, OpCode, OutgoingPayload,
    PresenceUpdate, ReadySession, Resume,
};

use url::Url;

/// Default gateway endpoint used when no resume URL is known
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";

/// Default gateway API version
pub const DEFAULT_API_VERSION: u8 = 10;

/// Pin the API version and JSON encoding onto a gateway base URL.
///
/// Any query the base already carries is replaced.
pub fn versioned_url(base: &str, version: u8) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(base)?;
    url.query_pairs_mut()
        .clear()
        .append_pair("v", &version.to_string())
        .append_pair("encoding", "json");
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pins_version_on_bare_host() {
        let url = versioned_url("wss://gateway.discord.gg", 10).unwrap();
        assert_eq!(url.as_str(), "wss://gateway.discord.gg/?v=10&encoding=json");
    }

    #[test]
    fn replaces_existing_query() {
        let url = versioned_url("wss://resume.example/?v=6&encoding=etf", 10).unwrap();
        assert_eq!(url.query(), Some("v=10&encoding=json"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(versioned_url("not a url", 10).is_err());
    }
}
