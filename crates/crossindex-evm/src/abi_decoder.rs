//! `AbiEventDecoder`: a declaratively configured [`Decoder`] for EVM protocols.
//!
//! A [`ProtocolDefinition`] names the protocol, its contracts per chain, and
//! the Solidity event signatures it emits. Each event maps to a lifecycle tag
//! (`sent`, `executed`, `failed`, or any protocol-internal tag) and renames
//! ABI parameters to the payload keys the normalizer understands.
//!
//! ```yaml
//! name: bridge_x
//! deployments:
//!   - chain_id: 1
//!     addresses: ["0x00000000000000000000000000000000000000aa"]
//! events:
//!   - signature: "MessageSent(bytes32 indexed id, address indexed from, address to, uint256 amount)"
//!     tag: sent
//!     fields: { id: message_id, from: sender, to: receiver }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use alloy_dyn_abi::{DynSolType, DynSolValue};
use alloy_json_abi::Event;
use serde::{Deserialize, Serialize};

use crossindex_core::{ChainLog, DecodeError, Decoder, RawEvent};

// ─── Definition ───────────────────────────────────────────────────────────────

/// Declarative description of one protocol's on-chain footprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolDefinition {
    pub name: String,
    #[serde(default)]
    pub deployments: Vec<Deployment>,
    pub events: Vec<EventDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub chain_id: u64,
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDefinition {
    /// Human-readable Solidity signature, with or without the `event` keyword.
    pub signature: String,
    /// Event type tag placed on every decoded [`RawEvent`].
    pub tag: String,
    /// ABI parameter name → payload key. Unmapped parameters keep their name.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Constant payload entries, e.g. `message_type: token_transfer`.
    #[serde(default)]
    pub constants: BTreeMap<String, String>,
}

impl ProtocolDefinition {
    pub fn from_yaml(src: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(src)
    }

    pub fn from_file(path: &Path) -> Result<Self, DefinitionError> {
        let src = std::fs::read_to_string(path).map_err(|source| DefinitionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&src).map_err(|source| DefinitionError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }
}

// ─── Compiled events ──────────────────────────────────────────────────────────

struct Param {
    key: String,
    ty: DynSolType,
    indexed: bool,
}

struct CompiledEvent {
    name: String,
    tag: String,
    params: Vec<Param>,
    constants: BTreeMap<String, String>,
}

impl CompiledEvent {
    fn indexed(&self) -> impl Iterator<Item = &Param> {
        self.params.iter().filter(|p| p.indexed)
    }

    fn body(&self) -> impl Iterator<Item = &Param> {
        self.params.iter().filter(|p| !p.indexed)
    }
}

/// Errors while loading or compiling a [`ProtocolDefinition`].
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("Cannot read protocol file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid protocol file {}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Protocol name is empty")]
    EmptyName,

    #[error("Invalid event signature '{signature}': {reason}")]
    InvalidSignature { signature: String, reason: String },

    #[error("Event '{name}' is declared twice")]
    DuplicateEvent { name: String },
}

// ─── Decoder ──────────────────────────────────────────────────────────────────

/// Generic ABI-driven decoder. Cheap to share behind an `Arc`.
pub struct AbiEventDecoder {
    protocol: String,
    /// chain id → lowercase addresses
    contracts: HashMap<u64, Vec<String>>,
    /// lowercase topic0 → event
    events: HashMap<String, CompiledEvent>,
}

impl AbiEventDecoder {
    pub fn new(def: &ProtocolDefinition) -> Result<Self, DefinitionError> {
        if def.name.trim().is_empty() {
            return Err(DefinitionError::EmptyName);
        }

        let mut contracts: HashMap<u64, Vec<String>> = HashMap::new();
        for d in &def.deployments {
            contracts
                .entry(d.chain_id)
                .or_default()
                .extend(d.addresses.iter().map(|a| a.to_ascii_lowercase()));
        }

        let mut events = HashMap::new();
        for ev in &def.events {
            let (topic0, compiled) = compile(ev)?;
            if events.contains_key(&topic0) {
                return Err(DefinitionError::DuplicateEvent { name: compiled.name });
            }
            events.insert(topic0, compiled);
        }

        Ok(Self {
            protocol: def.name.clone(),
            contracts,
            events,
        })
    }

    fn is_known_address(&self, chain_id: u64, address: &str) -> bool {
        self.contracts
            .get(&chain_id)
            .map(|addrs| addrs.iter().any(|a| a.eq_ignore_ascii_case(address)))
            .unwrap_or(false)
    }
}

fn compile(ev: &EventDefinition) -> Result<(String, CompiledEvent), DefinitionError> {
    let invalid = |reason: String| DefinitionError::InvalidSignature {
        signature: ev.signature.clone(),
        reason,
    };

    let sig = ev.signature.trim();
    let sig = if sig.starts_with("event ") {
        sig.to_string()
    } else {
        format!("event {sig}")
    };
    let event = Event::parse(&sig).map_err(|e| invalid(e.to_string()))?;

    let mut params = Vec::with_capacity(event.inputs.len());
    for (i, input) in event.inputs.iter().enumerate() {
        let ty = DynSolType::parse(&input.selector_type()).map_err(|e| invalid(e.to_string()))?;
        let name = if input.name.is_empty() {
            format!("arg{i}")
        } else {
            input.name.clone()
        };
        let key = ev.fields.get(&name).cloned().unwrap_or(name);
        params.push(Param {
            key,
            ty,
            indexed: input.indexed,
        });
    }

    let topic0 = format!("0x{}", hex::encode(event.selector()));
    Ok((
        topic0,
        CompiledEvent {
            name: event.name.clone(),
            tag: ev.tag.clone(),
            params,
            constants: ev.constants.clone(),
        },
    ))
}

impl Decoder for AbiEventDecoder {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn contract_addresses(&self, chain_id: u64) -> Vec<String> {
        self.contracts.get(&chain_id).cloned().unwrap_or_default()
    }

    fn event_topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.events.keys().cloned().collect();
        topics.sort();
        topics
    }

    fn decode(&self, log: &ChainLog, chain_id: u64) -> Result<RawEvent, DecodeError> {
        let topic0 = log.topic0().unwrap_or_default().to_ascii_lowercase();
        let unrecognized = || DecodeError::UnrecognizedLog {
            address: log.address.clone(),
            topic0: topic0.clone(),
        };

        if !self.is_known_address(chain_id, &log.address) {
            return Err(unrecognized());
        }
        let event = self.events.get(&topic0).ok_or_else(unrecognized)?;

        let indexed_count = event.indexed().count();
        if log.topics.len() != indexed_count + 1 {
            return Err(DecodeError::MalformedPayload {
                reason: format!(
                    "{} expects {} indexed topics, log has {}",
                    event.name,
                    indexed_count,
                    log.topics.len().saturating_sub(1)
                ),
            });
        }

        let mut data = event.constants.clone();

        for (param, topic) in event.indexed().zip(&log.topics[1..]) {
            data.insert(param.key.clone(), decode_topic(topic, &param.ty)?);
        }

        let body_types: Vec<DynSolType> = event.body().map(|p| p.ty.clone()).collect();
        if !body_types.is_empty() {
            let decoded = DynSolType::Tuple(body_types)
                .abi_decode_params(&log.data)
                .map_err(|e| DecodeError::MalformedPayload {
                    reason: format!("{} data: {e}", event.name),
                })?;
            let values = match decoded {
                DynSolValue::Tuple(vals) => vals,
                other => vec![other],
            };
            for (param, val) in event.body().zip(values) {
                data.insert(param.key.clone(), stringify(&val));
            }
        }

        Ok(RawEvent {
            protocol: self.protocol.clone(),
            chain_id,
            block_number: log.block_number,
            tx_hash: log.tx_hash.to_ascii_lowercase(),
            log_index: log.log_index,
            timestamp: log.block_timestamp,
            event_type: event.tag.clone(),
            data,
        })
    }
}

/// Decode one indexed topic.
///
/// Reference types (string, bytes, arrays, tuples) are stored as the keccak256
/// of their encoding, so the original value is unrecoverable; the raw 32-byte
/// hash is returned instead.
fn decode_topic(topic: &str, ty: &DynSolType) -> Result<String, DecodeError> {
    let hex_str = topic.strip_prefix("0x").unwrap_or(topic);
    let bytes = hex::decode(hex_str).map_err(|e| DecodeError::MalformedPayload {
        reason: format!("invalid topic hex: {e}"),
    })?;
    if bytes.len() != 32 {
        return Err(DecodeError::MalformedPayload {
            reason: format!("topic is {} bytes, expected 32", bytes.len()),
        });
    }

    match ty {
        DynSolType::String
        | DynSolType::Bytes
        | DynSolType::Array(_)
        | DynSolType::FixedArray(..)
        | DynSolType::Tuple(_) => Ok(format!("0x{}", hex::encode(&bytes))),
        _ => ty
            .abi_decode(&bytes)
            .map(|v| stringify(&v))
            .map_err(|e| DecodeError::MalformedPayload {
                reason: format!("topic decode: {e}"),
            }),
    }
}

/// String-encode a decoded ABI value.
///
/// Addresses are lowercase hex, integers decimal, booleans `true`/`false`,
/// bytes `0x`-hex, strings verbatim, and composites a JSON array of their
/// encoded members.
pub fn stringify(val: &DynSolValue) -> String {
    match val {
        DynSolValue::Bool(b) => b.to_string(),
        DynSolValue::Int(i, _) => i.to_string(),
        DynSolValue::Uint(u, _) => u.to_string(),
        DynSolValue::Address(a) => format!("{a:#x}").to_ascii_lowercase(),
        DynSolValue::FixedBytes(word, size) => format!("0x{}", hex::encode(&word[..*size])),
        DynSolValue::Bytes(b) => format!("0x{}", hex::encode(b)),
        DynSolValue::String(s) => s.clone(),
        DynSolValue::Array(vals) | DynSolValue::FixedArray(vals) | DynSolValue::Tuple(vals) => {
            let items: Vec<String> = vals.iter().map(stringify).collect();
            serde_json::to_string(&items).unwrap_or_default()
        }
        other => format!("{other:?}"),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, B256, U256};
    use pretty_assertions::assert_eq;

    const BRIDGE: &str = "0x00000000000000000000000000000000000000aa";

    fn definition() -> ProtocolDefinition {
        ProtocolDefinition::from_yaml(
            r#"
name: bridge_x
deployments:
  - chain_id: 1
    addresses: ["0x00000000000000000000000000000000000000AA"]
events:
  - signature: "MessageSent(bytes32 indexed id, address indexed from, address to, uint256 amount, bytes data)"
    tag: sent
    fields: { id: message_id, from: sender, to: receiver }
  - signature: "event MessageExecuted(bytes32 indexed id, bool ok)"
    tag: executed
    fields: { id: message_id, ok: success }
"#,
        )
        .unwrap()
    }

    fn word(b: u8) -> B256 {
        B256::repeat_byte(b)
    }

    fn sent_log() -> ChainLog {
        let decoder = AbiEventDecoder::new(&definition()).unwrap();
        let topic0 = decoder
            .event_topics()
            .into_iter()
            .find(|t| {
                decoder.events[t].name == "MessageSent"
            })
            .unwrap();
        let from = Address::repeat_byte(0x11);
        let to = Address::repeat_byte(0x22);
        let body = DynSolValue::Tuple(vec![
            DynSolValue::Address(to),
            DynSolValue::Uint(U256::from(1_000u64), 256),
            DynSolValue::Bytes(vec![0xde, 0xad]),
        ])
        .abi_encode_params();
        ChainLog {
            address: BRIDGE.into(),
            topics: vec![
                topic0,
                format!("0x{}", hex::encode(word(0x01))),
                format!("0x{}", hex::encode(from.into_word())),
            ],
            data: body,
            block_number: 100,
            block_hash: "0xbb".into(),
            tx_hash: "0xAB".into(),
            log_index: 4,
            block_timestamp: 1_700_000_000,
            removed: false,
        }
    }

    #[test]
    fn selector_matches_canonical_signature() {
        let decoder = AbiEventDecoder::new(&definition()).unwrap();
        let topics = decoder.event_topics();
        assert_eq!(topics.len(), 2);
        let expected = {
            use alloy_primitives::keccak256;
            format!("0x{}", hex::encode(keccak256("MessageExecuted(bytes32,bool)")))
        };
        assert!(topics.contains(&expected));
    }

    #[test]
    fn decodes_indexed_and_body_params() {
        let decoder = AbiEventDecoder::new(&definition()).unwrap();
        let ev = decoder.decode(&sent_log(), 1).unwrap();
        assert_eq!(ev.protocol, "bridge_x");
        assert_eq!(ev.event_type, "sent");
        assert_eq!(ev.tx_hash, "0xab");
        assert_eq!(ev.timestamp, 1_700_000_000);
        assert_eq!(ev.field("message_id"), Some(format!("0x{}", hex::encode(word(0x01)))).as_deref());
        assert_eq!(ev.field("sender"), Some("0x1111111111111111111111111111111111111111"));
        assert_eq!(ev.field("receiver"), Some("0x2222222222222222222222222222222222222222"));
        assert_eq!(ev.field("amount"), Some("1000"));
        assert_eq!(ev.field("data"), Some("0xdead"));
    }

    #[test]
    fn decoding_is_pure() {
        let decoder = AbiEventDecoder::new(&definition()).unwrap();
        let log = sent_log();
        assert_eq!(decoder.decode(&log, 1), decoder.decode(&log, 1));
    }

    #[test]
    fn wrong_chain_or_address_is_unrecognized() {
        let decoder = AbiEventDecoder::new(&definition()).unwrap();
        let log = sent_log();
        assert!(matches!(
            decoder.decode(&log, 10),
            Err(DecodeError::UnrecognizedLog { .. })
        ));
        let mut other = log.clone();
        other.address = "0x00000000000000000000000000000000000000cc".into();
        assert!(matches!(
            decoder.decode(&other, 1),
            Err(DecodeError::UnrecognizedLog { .. })
        ));
    }

    #[test]
    fn truncated_data_is_malformed() {
        let decoder = AbiEventDecoder::new(&definition()).unwrap();
        let mut log = sent_log();
        log.data.truncate(40);
        assert!(matches!(
            decoder.decode(&log, 1),
            Err(DecodeError::MalformedPayload { .. })
        ));

        let mut log = sent_log();
        log.topics.pop();
        assert!(matches!(
            decoder.decode(&log, 1),
            Err(DecodeError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn addresses_are_case_insensitive() {
        let decoder = AbiEventDecoder::new(&definition()).unwrap();
        assert_eq!(decoder.contract_addresses(1), vec![BRIDGE.to_string()]);
        assert!(decoder.contract_addresses(10).is_empty());
        let mut log = sent_log();
        log.address = BRIDGE.to_ascii_uppercase().replace("0X", "0x");
        assert!(decoder.decode(&log, 1).is_ok());
    }

    #[test]
    fn invalid_signature_is_rejected() {
        let mut def = definition();
        def.events[0].signature = "MessageSent(uint999 x".into();
        assert!(matches!(
            AbiEventDecoder::new(&def),
            Err(DefinitionError::InvalidSignature { .. })
        ));
    }

    #[test]
    fn stringify_scalars() {
        assert_eq!(stringify(&DynSolValue::Bool(false)), "false");
        assert_eq!(stringify(&DynSolValue::Uint(U256::from(7u64), 8)), "7");
        assert_eq!(stringify(&DynSolValue::String("hi".into())), "hi");
        assert_eq!(
            stringify(&DynSolValue::Array(vec![DynSolValue::Uint(U256::from(1u64), 256)])),
            "[\"1\"]"
        );
    }

    #[test]
    fn protocol_file_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.yaml");
        let err = ProtocolDefinition::from_file(&missing).unwrap_err();
        assert!(matches!(&err, DefinitionError::Io { path, .. } if path == &missing));

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "name: [unterminated").unwrap();
        let err = ProtocolDefinition::from_file(&bad).unwrap_err();
        assert!(matches!(err, DefinitionError::Yaml { .. }));
        assert!(err.to_string().contains("bad.yaml"), "{err}");
    }
}
