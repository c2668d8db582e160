//! Protocol decoder registry.
//!
//! One [`Decoder`] per protocol name, behind a single `RwLock`. Registration
//! happens at start-up; after that the registry is read-only and lookups
//! never serialize behind each other.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::decoder::Decoder;
use crate::error::RegistryError;

/// Thread-safe, cloneable decoder registry.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn Decoder>>>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<dyn Decoder>>> {
        // A panic while holding the lock cannot leave the map half-written.
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<dyn Decoder>>> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Register a decoder under its protocol name.
    ///
    /// Fails with [`RegistryError::DuplicateProtocol`] if the name is taken;
    /// the existing decoder is kept.
    pub fn register(&self, decoder: Arc<dyn Decoder>) -> Result<(), RegistryError> {
        let protocol = decoder.protocol().to_string();
        let mut map = self.write();
        if map.contains_key(&protocol) {
            return Err(RegistryError::DuplicateProtocol { protocol });
        }
        tracing::debug!(protocol = %protocol, "decoder registered");
        map.insert(protocol, decoder);
        Ok(())
    }

    pub fn get(&self, protocol: &str) -> Option<Arc<dyn Decoder>> {
        self.read().get(protocol).cloned()
    }

    /// Snapshot of every registered decoder, ordered by protocol name.
    pub fn all(&self) -> Vec<Arc<dyn Decoder>> {
        let mut decoders: Vec<_> = self.read().values().cloned().collect();
        decoders.sort_by(|a, b| a.protocol().cmp(b.protocol()));
        decoders
    }

    /// Registered protocol names, sorted.
    pub fn protocols(&self) -> Vec<String> {
        let mut names: Vec<_> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Decoders with at least one contract deployed on `chain_id`.
    pub fn for_chain(&self, chain_id: u64) -> Vec<Arc<dyn Decoder>> {
        self.all()
            .into_iter()
            .filter(|d| d.is_deployed_on(chain_id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderRegistry")
            .field("protocols", &self.protocols())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;
    use crate::event::{ChainLog, RawEvent};

    struct Fixed {
        name: &'static str,
        chains: Vec<u64>,
        marker: &'static str,
    }

    impl Decoder for Fixed {
        fn protocol(&self) -> &str {
            self.name
        }
        fn contract_addresses(&self, chain_id: u64) -> Vec<String> {
            if self.chains.contains(&chain_id) {
                vec![self.marker.to_string()]
            } else {
                vec![]
            }
        }
        fn event_topics(&self) -> Vec<String> {
            vec![]
        }
        fn decode(&self, log: &ChainLog, _chain_id: u64) -> Result<RawEvent, DecodeError> {
            Err(DecodeError::UnrecognizedLog {
                address: log.address.clone(),
                topic0: String::new(),
            })
        }
    }

    fn fixed(name: &'static str, chains: &[u64], marker: &'static str) -> Arc<dyn Decoder> {
        Arc::new(Fixed {
            name,
            chains: chains.to_vec(),
            marker,
        })
    }

    #[test]
    fn duplicate_protocol_keeps_first() {
        let reg = DecoderRegistry::new();
        reg.register(fixed("bridge_x", &[1], "first")).unwrap();
        let err = reg.register(fixed("bridge_x", &[1], "second")).unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateProtocol {
                protocol: "bridge_x".into()
            }
        );
        assert_eq!(reg.len(), 1);
        let kept = reg.get("bridge_x").unwrap();
        assert_eq!(kept.contract_addresses(1), vec!["first".to_string()]);
    }

    #[test]
    fn snapshots_are_sorted() {
        let reg = DecoderRegistry::new();
        reg.register(fixed("zeta", &[1], "z")).unwrap();
        reg.register(fixed("alpha", &[2], "a")).unwrap();
        assert_eq!(reg.protocols(), vec!["alpha", "zeta"]);
        let names: Vec<_> = reg.all().iter().map(|d| d.protocol().to_string()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn for_chain_filters_undeployed() {
        let reg = DecoderRegistry::new();
        reg.register(fixed("a", &[1, 10], "x")).unwrap();
        reg.register(fixed("b", &[10], "y")).unwrap();
        assert_eq!(reg.for_chain(1).len(), 1);
        assert_eq!(reg.for_chain(10).len(), 2);
        assert!(reg.for_chain(56).is_empty());
        assert!(reg.get("missing").is_none());
    }

    #[test]
    fn concurrent_readers() {
        let reg = DecoderRegistry::new();
        reg.register(fixed("a", &[1], "x")).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                std::thread::spawn(move || reg.get("a").is_some())
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }
}
