//! Unified cross-chain message model.
//!
//! A [`Message`] correlates the origination leg ([`Source`]) and the
//! execution leg ([`Destination`]) of one logical transfer or call, whatever
//! protocol carried it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tiny_keccak::{Hasher, Keccak};

use crate::error::ValidationError;
use crate::event::{keys, RawEvent};

// ─── Enums ────────────────────────────────────────────────────────────────────

/// Lifecycle status. Only `Pending → Executed` and `Pending → Failed` exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Executed,
    Failed,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executed => "executed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TokenTransfer,
    Message,
    ContractCall,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TokenTransfer => "token_transfer",
            Self::Message => "message",
            Self::ContractCall => "contract_call",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "token_transfer" => Some(Self::TokenTransfer),
            "message" => Some(Self::Message),
            "contract_call" => Some(Self::ContractCall),
            _ => None,
        }
    }

    /// Infer the type of an origination event.
    ///
    /// An explicit `message_type` field wins. Otherwise: token + amount is a
    /// transfer, non-empty call data is a contract call, anything else is a
    /// generic message.
    pub fn infer(event: &RawEvent) -> Self {
        if let Some(t) = event.field(keys::MESSAGE_TYPE).and_then(Self::parse) {
            return t;
        }
        let has_token = event.field(keys::TOKEN).is_some();
        let has_amount = event.field(keys::AMOUNT).is_some();
        let has_data = event
            .field(keys::DATA)
            .map(|d| d != "0x")
            .unwrap_or(false);
        if has_token && has_amount {
            Self::TokenTransfer
        } else if has_data {
            Self::ContractCall
        } else {
            Self::Message
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Legs ─────────────────────────────────────────────────────────────────────

/// Origination leg. Set once, when the message is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub chain_id: u64,
    pub tx_hash: String,
    pub block_number: u64,
    pub timestamp: i64,
    pub sender: String,
    pub log_index: u32,
}

impl Source {
    pub fn from_event(event: &RawEvent) -> Self {
        Self {
            chain_id: event.chain_id,
            tx_hash: event.tx_hash.to_ascii_lowercase(),
            block_number: event.block_number,
            timestamp: event.timestamp,
            sender: event.field(keys::SENDER).unwrap_or_default().to_string(),
            log_index: event.log_index,
        }
    }
}

/// Execution leg. Present once the destination-side event has been observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub chain_id: u64,
    pub tx_hash: String,
    pub block_number: u64,
    pub timestamp: i64,
    pub receiver: String,
    pub log_index: u32,
}

impl Destination {
    pub fn from_event(event: &RawEvent) -> Self {
        Self {
            chain_id: event.chain_id,
            tx_hash: event.tx_hash.to_ascii_lowercase(),
            block_number: event.block_number,
            timestamp: event.timestamp,
            receiver: event.field(keys::RECEIVER).unwrap_or_default().to_string(),
            log_index: event.log_index,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Decimal string; never a float.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Protocol sequence number; absent when the event has none or it does
    /// not fit in 64 bits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
}

impl Payload {
    /// Collect payload fields from an origination event. `None` when the
    /// event carries none of them.
    pub fn from_event(event: &RawEvent) -> Option<Self> {
        let owned = |k| event.field(k).map(str::to_string);
        let payload = Self {
            token: owned(keys::TOKEN),
            amount: owned(keys::AMOUNT),
            data: owned(keys::DATA),
            nonce: event.field(keys::NONCE).and_then(|n| n.parse().ok()),
        };
        (payload != Self::default()).then_some(payload)
    }
}

/// Execution metadata. Populated only when the message reaches a terminal state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relayer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<u64>,
    pub latency_seconds: i64,
}

// ─── Message ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub protocol: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub status: MessageStatus,
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Destination>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Why [`Message::execute`] refused a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionRejected {
    /// The message is already terminal with this exact destination.
    Replay,
    /// The message is already terminal with a different destination.
    Conflict { existing: Destination },
}

impl Message {
    /// Build a new `Pending` message from its origination event.
    pub fn new_pending(message_id: String, event: &RawEvent, now: DateTime<Utc>) -> Self {
        Self {
            message_id,
            protocol: event.protocol.clone(),
            message_type: MessageType::infer(event),
            status: MessageStatus::Pending,
            source: Source::from_event(event),
            destination: None,
            payload: Payload::from_event(event),
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply the destination leg.
    ///
    /// Moves a `Pending` message to `Executed` or `Failed`, sets the
    /// destination and execution metadata, and bumps `updated_at`.
    pub fn execute(
        &mut self,
        event: &RawEvent,
        success: bool,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionRejected> {
        let destination = Destination::from_event(event);
        if self.status.is_terminal() {
            return match &self.destination {
                Some(existing) if *existing == destination => Err(TransitionRejected::Replay),
                Some(existing) => Err(TransitionRejected::Conflict {
                    existing: existing.clone(),
                }),
                // A terminal message always has a destination; treat a
                // hand-edited record like a conflict.
                None => Err(TransitionRejected::Conflict {
                    existing: destination,
                }),
            };
        }

        let latency = (destination.timestamp - self.source.timestamp).max(0);
        self.metadata = Some(Metadata {
            fee: event.field(keys::FEE).map(str::to_string),
            relayer: event.field(keys::RELAYER).map(str::to_string),
            gas_used: event.field(keys::GAS_USED).and_then(|g| g.parse().ok()),
            latency_seconds: latency,
        });
        self.destination = Some(destination);
        self.status = if success {
            MessageStatus::Executed
        } else {
            MessageStatus::Failed
        };
        self.updated_at = now;
        Ok(())
    }

    /// Structural checks that must hold for every stored record.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.message_id.is_empty() {
            return Err(ValidationError::EmptyField("message_id"));
        }
        if self.protocol.is_empty() {
            return Err(ValidationError::EmptyField("protocol"));
        }
        if self.source.tx_hash.is_empty() {
            return Err(ValidationError::EmptyField("source.tx_hash"));
        }
        if self.updated_at < self.created_at {
            return Err(ValidationError::UpdatedBeforeCreated);
        }
        match (self.status.is_terminal(), self.destination.is_some()) {
            (true, false) => Err(ValidationError::MissingDestination {
                status: self.status,
            }),
            (false, true) => Err(ValidationError::UnexpectedDestination),
            _ => Ok(()),
        }
    }
}

/// Deterministic message ID for protocols that do not carry one.
///
/// keccak-256 of `"{protocol}:{chain_id}:{tx_hash}:{log_index}"` with the tx
/// hash lowercased, rendered as `0x`-prefixed hex.
pub fn derive_message_id(protocol: &str, chain_id: u64, tx_hash: &str, log_index: u32) -> String {
    let preimage = format!(
        "{protocol}:{chain_id}:{}:{log_index}",
        tx_hash.to_ascii_lowercase()
    );
    let mut hasher = Keccak::v256();
    hasher.update(preimage.as_bytes());
    let mut out = [0u8; 32];
    hasher.finalize(&mut out);
    format!("0x{}", hex::encode(out))
}

/// Message ID of an event: the `message_id` payload field, else derived.
pub fn message_id_of(event: &RawEvent) -> String {
    match event.field(keys::MESSAGE_ID) {
        Some(id) => id.to_string(),
        None => derive_message_id(&event.protocol, event.chain_id, &event.tx_hash, event.log_index),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
