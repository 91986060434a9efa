//! Inbound event decoding.
//!
//! The pipeline is triggered by one message per invocation. The body of that
//! message is accepted in three shapes:
//!
//! | Shape | Example | Payload |
//! |-------|---------|---------|
//! | Pub/Sub push envelope | `{"message": {"data": "aHR0cHM6Ly8uLi4=", ..}}` | base64-decoded `data` |
//! | Structured CloudEvent | `{"specversion": "1.0", "data": {"message": {..}}}` | as above |
//! | Plain text | `https://a.example/x https://b.example/y` | the text itself |
//!
//! When an envelope carries no `data`, the `url` attribute is used instead.
//! The payload is a whitespace separated list of URL tokens.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// Attribute carrying a single URL when the message has no data.
pub const URL_ATTRIBUTE: &str = "url";

/// Malformed event or URL.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid event envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("event data is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("event payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("invalid url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("url {url:?} has no host")]
    MissingHost { url: String },
}

#[derive(Debug, Deserialize)]
struct PushEnvelope {
    message: PubsubMessage,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PubsubMessage {
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
    #[serde(default)]
    message_id: Option<String>,
}

/// One inbound message, decoded to its text payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundEvent {
    /// Whitespace separated URL list.
    pub payload: String,
    /// Message attributes, empty for plain text events.
    pub attributes: BTreeMap<String, String>,
    pub message_id: Option<String>,
}

impl InboundEvent {
    /// Event whose payload is already text.
    pub fn from_payload(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Decode a raw message body.
    ///
    /// JSON objects with a `message` member, or a `data.message` member, are
    /// treated as Pub/Sub envelopes. Any other body is taken as UTF-8 text.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, ParseError> {
        if let Ok(serde_json::Value::Object(mut doc)) = serde_json::from_slice(raw) {
            let envelope = if doc.contains_key("message") {
                Some(serde_json::Value::Object(doc))
            } else {
                match doc.remove("data") {
                    Some(data @ serde_json::Value::Object(_))
                        if data.get("message").is_some() =>
                    {
                        Some(data)
                    }
                    _ => None,
                }
            };

            if let Some(envelope) = envelope {
                let envelope: PushEnvelope =
                    serde_json::from_value(envelope).map_err(ParseError::Envelope)?;
                return Self::from_message(envelope.message);
            }
        }

        let payload = String::from_utf8(raw.to_vec())?;
        Ok(Self::from_payload(payload))
    }

    fn from_message(message: PubsubMessage) -> Result<Self, ParseError> {
        let data = match message.data.as_deref() {
            Some(encoded) if !encoded.trim().is_empty() => {
                String::from_utf8(STANDARD.decode(encoded.trim())?)?
            }
            _ => String::new(),
        };

        let payload = if data.trim().is_empty() {
            let fallback = message
                .attributes
                .get(URL_ATTRIBUTE)
                .cloned()
                .unwrap_or_default();
            debug!(
                has_url_attribute = !fallback.is_empty(),
                "Message carries no data; using url attribute"
            );
            fallback
        } else {
            data
        };

        Ok(Self {
            payload,
            attributes: message.attributes,
            message_id: message.message_id,
        })
    }

    /// URL tokens of the payload in order.
    ///
    /// Surrounding whitespace is trimmed, line breaks count as separators and
    /// empty tokens are dropped.
    pub fn url_tokens(&self) -> Vec<&str> {
        self.payload.split_whitespace().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(s: &str) -> String {
        STANDARD.encode(s)
    }

    #[test]
    fn test_plain_text_single_url() {
        let event = InboundEvent::from_bytes(b"https://api.example.com/users/x").unwrap();
        assert_eq!(event.url_tokens(), vec!["https://api.example.com/users/x"]);
        assert!(event.attributes.is_empty());
    }

    #[test]
    fn test_tokens_multiline_payload() {
        let event = InboundEvent::from_payload(
            "\nhttps://api.github.com/users/github\r\n  https://api.github.com/users/github/followers\n\n",
        );
        assert_eq!(
            event.url_tokens(),
            vec![
                "https://api.github.com/users/github",
                "https://api.github.com/users/github/followers",
            ]
        );
    }

    #[test]
    fn test_tokens_blank_payload() {
        assert!(InboundEvent::from_payload("  \n\t \n").url_tokens().is_empty());
        assert!(InboundEvent::from_payload("").url_tokens().is_empty());
    }

    #[test]
    fn test_pubsub_envelope() {
        let body = format!(
            r#"{{"message": {{"data": "{}", "attributes": {{"source": "cron"}}, "messageId": "42"}}, "subscription": "projects/p/subscriptions/s"}}"#,
            b64("https://good.example/a\nhttps://good.example/b")
        );
        let event = InboundEvent::from_bytes(body.as_bytes()).unwrap();
        assert_eq!(
            event.url_tokens(),
            vec!["https://good.example/a", "https://good.example/b"]
        );
        assert_eq!(event.message_id.as_deref(), Some("42"));
        assert_eq!(event.attributes.get("source").map(String::as_str), Some("cron"));
    }

    #[test]
    fn test_cloudevent_envelope() {
        let body = format!(
            r#"{{"specversion": "1.0", "type": "google.cloud.pubsub.topic.v1.messagePublished", "data": {{"message": {{"data": "{}"}}}}}}"#,
            b64("https://api.example.com/users/x")
        );
        let event = InboundEvent::from_bytes(body.as_bytes()).unwrap();
        assert_eq!(event.url_tokens(), vec!["https://api.example.com/users/x"]);
    }

    #[test]
    fn test_url_attribute_fallback() {
        let body = r#"{"message": {"attributes": {"url": "https://api.example.com/users/x"}}}"#;
        let event = InboundEvent::from_bytes(body.as_bytes()).unwrap();
        assert_eq!(event.payload, "https://api.example.com/users/x");
    }

    #[test]
    fn test_envelope_without_urls_is_empty() {
        let event = InboundEvent::from_bytes(br#"{"message": {}}"#).unwrap();
        assert!(event.url_tokens().is_empty());
    }

    #[test]
    fn test_bad_base64() {
        let body = r#"{"message": {"data": "%%%not-base64%%%"}}"#;
        assert!(matches!(
            InboundEvent::from_bytes(body.as_bytes()),
            Err(ParseError::Base64(_))
        ));
    }

    #[test]
    fn test_malformed_envelope() {
        let body = r#"{"message": {"data": 17}}"#;
        assert!(matches!(
            InboundEvent::from_bytes(body.as_bytes()),
            Err(ParseError::Envelope(_))
        ));
    }

    #[test]
    fn test_non_utf8_body() {
        assert!(matches!(
            InboundEvent::from_bytes(&[0x68, 0x74, 0xff, 0xfe]),
            Err(ParseError::Utf8(_))
        ));
    }

    #[test]
    fn test_other_json_is_plain_text() {
        let event = InboundEvent::from_bytes(br#"{"urls": "x"}"#).unwrap();
        assert_eq!(event.payload, r#"{"urls": "x"}"#);
    }
}
