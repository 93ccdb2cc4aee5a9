// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod wire;

use bytes::Bytes;
use thiserror::Error;

/// Errors produced by the message codec behind [`QueryMessage`] and
/// [`ResponseMessage`].
///
/// The engine does not interpret DNS records itself; whatever codec the
/// caller plugs in reports its failures through this type and they are
/// surfaced verbatim.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("rendered message is {0} bytes, larger than the DNS maximum")]
    TooLong(usize),
    #[error("failed to render message: {0}")]
    Render(String),
    #[error("failed to parse message: {0}")]
    Parse(String),
    #[error("TSIG processing failed: {0}")]
    Tsig(String),
}

/// A shared TSIG key, opaque to the engine.
///
/// The engine only threads the key between the query codec and the response
/// codec; signing and verification happen inside the codec implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsigKey {
    name: String,
    algorithm: String,
    secret: Vec<u8>,
}

impl TsigKey {
    pub fn new(
        name: impl Into<String>,
        algorithm: impl Into<String>,
        secret: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            name: name.into(),
            algorithm: algorithm.into(),
            secret: secret.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }
}

/// Knobs honored while rendering a query.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderOptions {
    /// Use case-sensitive name compression.
    pub case_sensitive: bool,
}

/// Knobs honored while parsing a response.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// Keep record order exactly as received instead of regrouping by
    /// section ownership.
    pub preserve_order: bool,
}

/// A structured DNS message the engine can send with
/// [`crate::engine::RequestEngine::create_via`].
///
/// Rendering may be attempted twice for the same message: once for UDP and,
/// if the result exceeds the UDP payload limit, once more for TCP after
/// [`QueryMessage::reset`].
pub trait QueryMessage: Send {
    /// Overwrite the message id. Called after the dispatch assigns one.
    fn set_id(&mut self, id: u16);

    /// Attach (or clear) the TSIG key the message will be signed with.
    fn set_tsig_key(&mut self, key: Option<&TsigKey>) -> Result<(), MessageError>;

    /// Render the message to wire format, Question, Answer, Authority and
    /// Additional sections in that order. The result must not exceed
    /// [`wire::MAX_MESSAGE_LEN`].
    fn render(&mut self, options: RenderOptions) -> Result<Bytes, MessageError>;

    /// Hand over the TSIG bytes of the rendered query, if it was signed.
    /// The engine saves them for response verification.
    fn take_query_tsig(&mut self) -> Option<Bytes>;

    /// Discard any partially rendered state so [`QueryMessage::render`] can
    /// run again.
    fn reset(&mut self);
}

/// A DNS message a received answer can be parsed into with
/// [`crate::engine::Request::get_response`].
pub trait ResponseMessage {
    /// Install the TSIG bytes saved from the query, if any.
    fn set_query_tsig(&mut self, tsig: Option<&Bytes>) -> Result<(), MessageError>;

    /// Install the key the response must verify against.
    fn set_tsig_key(&mut self, key: Option<&TsigKey>) -> Result<(), MessageError>;

    /// Parse the wire-format answer into this message.
    fn parse(&mut self, wire: &[u8], options: ParseOptions) -> Result<(), MessageError>;

    /// Verify the response TSIG. Only invoked when the request carried a
    /// key.
    fn verify_tsig(&mut self, wire: &[u8]) -> Result<(), MessageError>;
}
