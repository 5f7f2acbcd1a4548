//! The message protocol spoken over an invocation's private channel pair.
//!
//! Every message crosses the channel as a JSON envelope discriminated by a
//! `type` tag. Equivalent tag families exist per (node-kind × phase)
//! combination, each following the identical shape, so the host can route
//! traffic for HTTP and WebSocket nodes in both phases without ambiguity.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::{
    GlobalSnapshot, MutationKind, NodeKind, ScriptContext, ScriptPhase, StorageMutation,
    StorageScope,
};

/// Errors that can occur while encoding or decoding channel envelopes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The envelope's `type` tag is not part of this channel's family.
    #[error("Unknown message tag: {0}")]
    UnknownTag(String),

    /// The envelope payload failed to (de)serialize.
    #[error("Envelope payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Identifies which of the four tag families a channel speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelFamily {
    /// The node kind half of the family.
    pub node_kind: NodeKind,
    /// The phase half of the family.
    pub phase: ScriptPhase,
}

impl ChannelFamily {
    /// Builds the family for a context's node kind and phase.
    pub fn for_context(context: &ScriptContext) -> Self {
        Self { node_kind: context.node_kind, phase: context.phase }
    }

    /// The wire prefix shared by every tag in this family.
    pub fn prefix(&self) -> &'static str {
        match (self.node_kind, self.phase) {
            (NodeKind::Http, ScriptPhase::Pre) => "http-pre",
            (NodeKind::Http, ScriptPhase::After) => "http-after",
            (NodeKind::WebSocket, ScriptPhase::Pre) => "ws-pre",
            (NodeKind::WebSocket, ScriptPhase::After) => "ws-after",
        }
    }

    fn tag(&self, suffix: &str) -> String {
        format!("{}-{}", self.prefix(), suffix)
    }

    /// Strips this family's prefix from a wire tag, if it matches.
    fn suffix_of<'t>(&self, tag: &'t str) -> Option<&'t str> {
        tag.strip_prefix(self.prefix()).and_then(|rest| rest.strip_prefix('-'))
    }
}

/// A message envelope as it crosses the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Discriminating wire tag, e.g. `http-pre-eval-success`.
    #[serde(rename = "type")]
    pub tag: String,

    /// Message payload; shape depends on the tag.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

/// Host-to-unit messages.
#[derive(Debug, Clone, PartialEq)]
pub enum HostMessage {
    /// Carries the invocation's context; the unit builds the curated global
    /// object from it and answers with `InitAck`.
    InitData(Box<ScriptContext>),
    /// Carries the script source to compile and run.
    Eval(String),
}

/// Unit-to-host messages. Delivered in send order on a per-invocation channel.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitMessage {
    /// The curated global object is ready.
    InitAck,
    /// The script ran to completion; carries the final global snapshot.
    EvalSuccess(Box<GlobalSnapshot>),
    /// The script failed to compile or threw during execution.
    EvalError {
        /// True when the source failed to compile before any execution.
        syntax: bool,
        /// Failure message.
        message: String,
        /// Script position information, when available.
        stack: Option<String>,
    },
    /// An already-committed storage side effect.
    StorageMutation(StorageMutation),
}

impl HostMessage {
    /// Encodes this message as an envelope in the given family.
    pub fn to_envelope(&self, family: ChannelFamily) -> Result<Envelope, ProtocolError> {
        let envelope = match self {
            Self::InitData(context) => Envelope {
                tag: family.tag("init-data"),
                payload: serde_json::to_value(context)?,
            },
            Self::Eval(source) => {
                Envelope { tag: family.tag("eval"), payload: Value::String(source.clone()) }
            }
        };
        Ok(envelope)
    }

    /// Decodes an envelope in the given family.
    pub fn from_envelope(family: ChannelFamily, envelope: Envelope) -> Result<Self, ProtocolError> {
        match family.suffix_of(&envelope.tag) {
            Some("init-data") => {
                Ok(Self::InitData(Box::new(serde_json::from_value(envelope.payload)?)))
            }
            Some("eval") => Ok(Self::Eval(serde_json::from_value(envelope.payload)?)),
            _ => Err(ProtocolError::UnknownTag(envelope.tag)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EvalErrorPayload {
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stack: Option<String>,
    #[serde(default)]
    syntax: bool,
}

impl UnitMessage {
    fn storage_tag(family: ChannelFamily, mutation: &StorageMutation) -> String {
        let suffix = match (mutation.kind, mutation.scope) {
            (MutationKind::Set, StorageScope::Session) => "set-session-storage",
            (MutationKind::Delete, StorageScope::Session) => "delete-session-storage",
            (MutationKind::Set, StorageScope::Local) => "set-local-storage",
            (MutationKind::Delete, StorageScope::Local) => "delete-local-storage",
        };
        family.tag(suffix)
    }

    /// Encodes this message as an envelope in the given family.
    pub fn to_envelope(&self, family: ChannelFamily) -> Result<Envelope, ProtocolError> {
        let envelope = match self {
            Self::InitAck => Envelope { tag: family.tag("init-success"), payload: Value::Null },
            Self::EvalSuccess(snapshot) => Envelope {
                tag: family.tag("eval-success"),
                payload: serde_json::to_value(snapshot)?,
            },
            Self::EvalError { syntax, message, stack } => Envelope {
                tag: family.tag("eval-error"),
                payload: serde_json::to_value(EvalErrorPayload {
                    message: message.clone(),
                    stack: stack.clone(),
                    syntax: *syntax,
                })?,
            },
            Self::StorageMutation(mutation) => Envelope {
                tag: Self::storage_tag(family, mutation),
                payload: serde_json::to_value(&mutation.snapshot)?,
            },
        };
        Ok(envelope)
    }

    /// Decodes an envelope in the given family.
    pub fn from_envelope(family: ChannelFamily, envelope: Envelope) -> Result<Self, ProtocolError> {
        let mutation = |scope, kind, payload| -> Result<Self, ProtocolError> {
            Ok(Self::StorageMutation(StorageMutation {
                scope,
                kind,
                snapshot: serde_json::from_value(payload)?,
            }))
        };

        match family.suffix_of(&envelope.tag) {
            Some("init-success") => Ok(Self::InitAck),
            Some("eval-success") => {
                Ok(Self::EvalSuccess(Box::new(serde_json::from_value(envelope.payload)?)))
            }
            Some("eval-error") => {
                let payload: EvalErrorPayload = serde_json::from_value(envelope.payload)?;
                Ok(Self::EvalError {
                    syntax: payload.syntax,
                    message: payload.message,
                    stack: payload.stack,
                })
            }
            Some("set-session-storage") => {
                mutation(StorageScope::Session, MutationKind::Set, envelope.payload)
            }
            Some("delete-session-storage") => {
                mutation(StorageScope::Session, MutationKind::Delete, envelope.payload)
            }
            Some("set-local-storage") => {
                mutation(StorageScope::Local, MutationKind::Set, envelope.payload)
            }
            Some("delete-local-storage") => {
                mutation(StorageScope::Local, MutationKind::Delete, envelope.payload)
            }
            _ => Err(ProtocolError::UnknownTag(envelope.tag)),
        }
    }
}
