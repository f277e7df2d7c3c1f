// ABOUTME: Wire model for the bridge streams and the engine reply envelope.
// ABOUTME: Defines InboundEntry (request), OutboundEntry (delivery), and EngineReply parsing.

use std::collections::HashMap;

use anyhow::{bail, Result};
use serde::Deserialize;

/// Stream the gateway appends bridged requests to.
pub const INBOUND_STREAM: &str = "bridge:inbound";

/// Stream the engine appends unsolicited deliveries to.
pub const OUTBOUND_STREAM: &str = "bridge:outbound";

/// Prefix of the single-use rendezvous list key carrying one engine response.
pub const RESPONSE_KEY_PREFIX: &str = "bridge:response:";

/// Wire protocol version stamped on every inbound entry.
pub const PROTOCOL_VERSION: &str = "1";

/// Rendezvous key for a given correlation id.
pub fn response_key(correlation_id: &str) -> String {
    format!("{}{}", RESPONSE_KEY_PREFIX, correlation_id)
}

/// A request forwarded to the engine over the inbound stream.
///
/// Every field is serialized as a string; the mandatory set is always present
/// and the sender/transcript fields are included only when the gateway
/// supplied them.
#[derive(Debug, Clone)]
pub struct InboundEntry {
    /// v4 UUID identifying the rendezvous key for this request
    pub correlation_id: String,
    /// The user's command body
    pub message: String,
    /// Originating user identity
    pub from: String,
    /// Bridged agent id
    pub agent: String,
    /// Chat channel the request arrived on
    pub channel: String,
    /// Gateway account the request arrived through
    pub account_id: String,
    pub sender_name: Option<String>,
    pub sender_username: Option<String>,
    pub sender_id: Option<String>,
    pub transcript: Option<String>,
    /// Stable conversation identity, `<channel>:<accountId>:<from>` by default
    pub session_key: String,
    /// Milliseconds since epoch
    pub timestamp_ms: i64,
}

impl InboundEntry {
    /// Default session key when the gateway does not supply one.
    pub fn default_session_key(channel: &str, account_id: &str, from: &str) -> String {
        format!("{}:{}:{}", channel, account_id, from)
    }

    /// Flatten into the field/value pairs appended to the inbound stream.
    pub fn fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("correlationId".to_string(), self.correlation_id.clone()),
            ("message".to_string(), self.message.clone()),
            ("from".to_string(), self.from.clone()),
            ("agent".to_string(), self.agent.clone()),
            ("channel".to_string(), self.channel.clone()),
            ("accountId".to_string(), self.account_id.clone()),
            ("sessionKey".to_string(), self.session_key.clone()),
            ("timestamp".to_string(), self.timestamp_ms.to_string()),
            (
                "protocolVersion".to_string(),
                PROTOCOL_VERSION.to_string(),
            ),
        ];
        if let Some(name) = &self.sender_name {
            fields.push(("senderName".to_string(), name.clone()));
        }
        if let Some(username) = &self.sender_username {
            fields.push(("senderUsername".to_string(), username.clone()));
        }
        if let Some(id) = &self.sender_id {
            fields.push(("senderId".to_string(), id.clone()));
        }
        if let Some(transcript) = &self.transcript {
            fields.push(("transcript".to_string(), transcript.clone()));
        }
        fields
    }
}

/// A delivery request consumed from the outbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEntry {
    pub agent: String,
    pub channel: String,
    pub to: String,
    pub message: String,
    pub account_id: Option<String>,
}

impl OutboundEntry {
    /// Parse the flat field/value pairs of a stream entry.
    ///
    /// `message`, `to`, and `channel` are required; an entry missing any of
    /// them is malformed and must be acknowledged and discarded by the caller.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            match fields.get(key) {
                Some(value) if !value.is_empty() => Ok(value.clone()),
                _ => bail!("missing required field '{}'", key),
            }
        };

        Ok(Self {
            message: required("message")?,
            to: required("to")?,
            channel: required("channel")?,
            agent: fields.get("agent").cloned().unwrap_or_default(),
            account_id: fields.get("accountId").cloned().filter(|s| !s.is_empty()),
        })
    }
}

/// Envelope the engine pushes onto the rendezvous key.
#[derive(Debug, Deserialize)]
struct ReplyEnvelope {
    text: Option<String>,
    error: Option<String>,
}

/// Parsed engine response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineReply {
    Text(String),
    Error(String),
}

impl EngineReply {
    /// Parse a raw rendezvous value.
    ///
    /// A JSON object `{"text": ..., "error"?: ...}` is preferred; anything
    /// that does not parse as that envelope is treated as bare reply text.
    pub fn parse(raw: &str) -> Self {
        match serde_json::from_str::<ReplyEnvelope>(raw) {
            Ok(envelope) => {
                if let Some(error) = envelope.error.filter(|e| !e.is_empty()) {
                    EngineReply::Error(error)
                } else {
                    EngineReply::Text(envelope.text.unwrap_or_default())
                }
            }
            Err(_) => EngineReply::Text(raw.to_string()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> InboundEntry {
        InboundEntry {
            correlation_id: "11111111-2222-3333-4444-555555555555".to_string(),
            message: "Bonjour".to_string(),
            from: "user-1".to_string(),
            agent: "eng-1".to_string(),
            channel: "telegram".to_string(),
            account_id: "acct-9".to_string(),
            sender_name: None,
            sender_username: None,
            sender_id: None,
            transcript: None,
            session_key: InboundEntry::default_session_key("telegram", "acct-9", "user-1"),
            timestamp_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_inbound_fields_mandatory_set() {
        let fields = sample_entry().fields();
        let keys: Vec<&str> = fields.iter().map(|(k, _)| k.as_str()).collect();
        for key in [
            "correlationId",
            "message",
            "from",
            "agent",
            "channel",
            "accountId",
            "sessionKey",
            "timestamp",
            "protocolVersion",
        ] {
            assert!(keys.contains(&key), "missing mandatory field {}", key);
        }
        // Optional fields are absent when not supplied
        assert!(!keys.contains(&"senderName"));
        assert!(!keys.contains(&"transcript"));
    }

    #[test]
    fn test_inbound_fields_optional_set() {
        let mut entry = sample_entry();
        entry.sender_name = Some("Harper".to_string());
        entry.transcript = Some("[earlier messages]".to_string());
        let fields = entry.fields();
        let lookup = |key: &str| {
            fields
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(lookup("senderName"), Some("Harper"));
        assert_eq!(lookup("transcript"), Some("[earlier messages]"));
        assert_eq!(lookup("protocolVersion"), Some("1"));
        assert_eq!(lookup("timestamp"), Some("1700000000000"));
    }

    #[test]
    fn test_default_session_key_shape() {
        assert_eq!(
            InboundEntry::default_session_key("telegram", "acct", "user"),
            "telegram:acct:user"
        );
    }

    #[test]
    fn test_response_key_prefix() {
        assert_eq!(response_key("abc"), "bridge:response:abc");
    }

    #[test]
    fn test_outbound_from_fields_complete() {
        let mut fields = HashMap::new();
        fields.insert("agent".to_string(), "eng-1".to_string());
        fields.insert("channel".to_string(), "telegram".to_string());
        fields.insert("to".to_string(), "12345".to_string());
        fields.insert("message".to_string(), "hello".to_string());
        fields.insert("accountId".to_string(), "acct".to_string());

        let entry = OutboundEntry::from_fields(&fields).unwrap();
        assert_eq!(entry.channel, "telegram");
        assert_eq!(entry.to, "12345");
        assert_eq!(entry.message, "hello");
        assert_eq!(entry.account_id.as_deref(), Some("acct"));
    }

    #[test]
    fn test_outbound_from_fields_missing_message() {
        let mut fields = HashMap::new();
        fields.insert("channel".to_string(), "telegram".to_string());
        fields.insert("to".to_string(), "12345".to_string());

        let err = OutboundEntry::from_fields(&fields).unwrap_err();
        assert!(err.to_string().contains("message"));
    }

    #[test]
    fn test_outbound_from_fields_empty_account_is_none() {
        let mut fields = HashMap::new();
        fields.insert("channel".to_string(), "telegram".to_string());
        fields.insert("to".to_string(), "12345".to_string());
        fields.insert("message".to_string(), "hello".to_string());
        fields.insert("accountId".to_string(), "".to_string());

        let entry = OutboundEntry::from_fields(&fields).unwrap();
        assert!(entry.account_id.is_none());
    }

    #[test]
    fn test_engine_reply_json_text() {
        assert_eq!(
            EngineReply::parse(r#"{"text":"Salut"}"#),
            EngineReply::Text("Salut".to_string())
        );
    }

    #[test]
    fn test_engine_reply_json_error() {
        assert_eq!(
            EngineReply::parse(r#"{"text":"","error":"session crashed"}"#),
            EngineReply::Error("session crashed".to_string())
        );
    }

    #[test]
    fn test_engine_reply_raw_string() {
        assert_eq!(
            EngineReply::parse("plain engine output"),
            EngineReply::Text("plain engine output".to_string())
        );
    }

    #[test]
    fn test_engine_reply_empty_error_is_text() {
        assert_eq!(
            EngineReply::parse(r#"{"text":"ok","error":""}"#),
            EngineReply::Text("ok".to_string())
        );
    }
}
