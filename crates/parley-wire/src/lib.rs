#![deny(unsafe_code)]

//! Wire-level building blocks for the parley RPC runtime.
//!
//! This crate defines:
//! - The single wire record ([`Message`]) and its type tag ([`MessageType`])
//! - The payload value model with timestamp annotation ([`Value`])
//! - Keyed message signing and verification ([`sign`], [`verify`])
//! - The process-wide conversation id generator

mod message;
mod sign;
mod value;

pub use message::{
    next_conversation_id, AnomalyPayload, ConversationIdGenerator, ErrorPayload, Message,
    MessageType, END_PAYLOAD,
};
pub use sign::{sign, verify, SignatureError, NONCE_LEN};
pub use value::{from_value, to_value, Value};
