//! crossindex-evm — EVM chain access for the cross-chain indexer.
//!
//! - [`HttpRpcClient`]: JSON-RPC over HTTP (`eth_blockNumber`, `eth_getLogs`,
//!   `eth_getBlockByNumber`)
//! - [`EvmFetcher`]: rate limiting, timeouts, timestamp enrichment
//! - [`AbiEventDecoder`]: protocol decoders declared from Solidity signatures
//! - [`ChainWatcher`]: the per-chain scan loop

pub mod abi_decoder;
pub mod builder;
pub mod fetcher;
pub mod rpc;
pub mod watcher;

pub use abi_decoder::{AbiEventDecoder, DefinitionError, ProtocolDefinition};
pub use builder::ChainWatcherBuilder;
pub use fetcher::{EvmFetcher, EvmRpcClient, LogFilter, MalformedLog, RawLog};
pub use rpc::{HttpRpcClient, RpcError};
pub use watcher::{ChainWatcher, EventBatch};
