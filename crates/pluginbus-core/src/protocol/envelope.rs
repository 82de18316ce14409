//! Envelope and registration record shapes.

use serde::{Deserialize, Serialize};

/// Whether an envelope asks for work or carries its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
}

/// First frame a plugin writes after dialing the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub name: String,
    pub version: String,
}

impl Registration {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// A routed message between two plugins.
///
/// `id` is allocated by the requester and echoed by the responder. Responses
/// also echo `method`, but correlation only ever looks at `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub method: String,
    /// Base64 on the wire; `null` or absent decodes as empty.
    #[serde(default, with = "payload_base64")]
    pub payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    /// Build a request envelope.
    pub fn request(
        id: u64,
        from: impl Into<String>,
        to: impl Into<String>,
        method: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id,
            from: from.into(),
            to: to.into(),
            kind: MessageKind::Request,
            method: method.into(),
            payload,
            error: None,
        }
    }

    /// Build an empty response addressed back to the sender of `self`.
    pub fn response_to(&self) -> Self {
        Self {
            id: self.id,
            from: self.to.clone(),
            to: self.from.clone(),
            kind: MessageKind::Response,
            method: self.method.clone(),
            payload: Vec::new(),
            error: None,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn is_request(&self) -> bool {
        self.kind == MessageKind::Request
    }

    /// The error carried by a response, treating `Some("")` as success.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.is_empty())
    }
}

mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
