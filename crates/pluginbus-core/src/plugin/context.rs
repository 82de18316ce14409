//! Request/response context handed to method handlers.

use super::client::Plugin;
use crate::error::{BusError, Result};
use crate::protocol::Envelope;
use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// One inbound request and the response being built for it.
///
/// A handler reads the request through [`request_data`](Self::request_data)
/// or [`bind`](Self::bind) and answers with [`reply`](Self::reply),
/// [`reply_data`](Self::reply_data) or [`set_error`](Self::set_error). If an
/// error is set, the response carries only the error.
pub struct RequestContext {
    request: Envelope,
    plugin: Plugin,
    reply: BytesMut,
    error: Option<String>,
}

impl RequestContext {
    pub(crate) fn new(request: Envelope, plugin: Plugin) -> Self {
        Self {
            request,
            plugin,
            reply: BytesMut::new(),
            error: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.request.id
    }

    /// Name of the calling plugin.
    pub fn from(&self) -> &str {
        &self.request.from
    }

    pub fn method(&self) -> &str {
        &self.request.method
    }

    /// Raw request payload.
    pub fn request_data(&self) -> &[u8] {
        &self.request.payload
    }

    /// Decode the request payload as JSON.
    ///
    /// A decode failure is returned to the handler; it does not set the
    /// response error on its own.
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.request.payload).map_err(|e| BusError::Json {
            message: format!("Failed to bind request for {}: {}", self.request.method, e),
            source: Some(e),
        })
    }

    /// Append raw bytes to the response payload.
    pub fn reply_data(&mut self, data: &[u8]) {
        self.reply.put_slice(data);
    }

    /// Encode `value` as JSON into the response payload.
    ///
    /// An encoding failure becomes the response error.
    pub fn reply<T: Serialize>(&mut self, value: &T) {
        match serde_json::to_vec(value) {
            Ok(data) => self.reply_data(&data),
            Err(e) => self.set_error(e),
        }
    }

    pub fn set_error(&mut self, err: impl std::fmt::Display) {
        self.error = Some(err.to_string());
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// The plugin that received this request, for making nested calls.
    pub fn plugin(&self) -> &Plugin {
        &self.plugin
    }

    /// Build the response envelope from the handler's outcome.
    pub(crate) fn into_response(self) -> Envelope {
        let response = self.request.response_to();
        match self.error {
            Some(error) => response.with_error(error),
            None => response.with_payload(self.reply.to_vec()),
        }
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.request.id)
            .field("from", &self.request.from)
            .field("method", &self.request.method)
            .field("reply_len", &self.reply.len())
            .field("error", &self.error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct AddRequest {
        a: i64,
        b: i64,
    }

    fn context(payload: &[u8]) -> RequestContext {
        let request = Envelope::request(3, "A", "B", "add", payload.to_vec());
        RequestContext::new(request, Plugin::new("B", "1.0.0"))
    }

    #[test]
    fn test_bind_and_reply() {
        let mut ctx = context(br#"{"a":1,"b":1}"#);
        let req: AddRequest = ctx.bind().unwrap();
        ctx.reply(&serde_json::json!({"result": req.a + req.b}));

        let response = ctx.into_response();
        assert_eq!(response.kind, MessageKind::Response);
        assert_eq!(response.id, 3);
        assert_eq!((response.from.as_str(), response.to.as_str()), ("B", "A"));
        assert_eq!(response.payload, br#"{"result":2}"#.to_vec());
        assert!(response.error.is_none());
    }

    #[test]
    fn test_bind_failure_is_local() {
        let ctx = context(b"not json");
        let result: Result<AddRequest> = ctx.bind();
        assert!(matches!(result, Err(BusError::Json { .. })));
        assert!(ctx.error().is_none());
    }

    #[test]
    fn test_error_replaces_payload() {
        let mut ctx = context(b"");
        ctx.reply_data(b"partial");
        ctx.set_error("division by zero");

        let response = ctx.into_response();
        assert_eq!(response.error.as_deref(), Some("division by zero"));
        assert!(response.payload.is_empty());
    }

    #[test]
    fn test_reply_data_appends() {
        let mut ctx = context(b"ping");
        assert_eq!(ctx.request_data(), b"ping");
        ctx.reply_data(b"po");
        ctx.reply_data(b"ng");
        assert_eq!(ctx.into_response().payload, b"pong".to_vec());
    }
}
