//! # Protocol Registry
//!
//! Protocols are mounted declaratively at network construction. Each
//! [`Protocol`] names the Req/Resp entries it serves, provides initializers
//! for per-peer and per-network state, and receives connect/disconnect
//! hooks.
//!
//! At registration every protocol is assigned a process-wide dense integer
//! index. Per-peer state lives in a parallel vector on each [`Peer`] and
//! per-network state in a parallel vector on the network actor, so state
//! access is an array index, not a map lookup.
//!
//! Mount-time violations (duplicate names, two protocols claiming the same
//! Req/Resp entry) are programming errors and panic during setup.
//!
//! [`Peer`]: crate::peer::Peer

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::identity::PeerId;
use crate::messages::{HandlerError, Request, ResponseItem, SupportedProtocol};
use crate::network::Network;

/// Dense index assigned to a protocol at registration.
pub type ProtocolIndex = usize;

/// A mounted protocol: Req/Resp handlers plus lifecycle hooks.
///
/// `on_peer_connected` runs for every protocol before the peer's state flips
/// to Connected; a failure aborts the handshake and disconnects the peer.
/// `on_peer_disconnected` runs exactly once after the last physical
/// connection closes.
#[async_trait]
pub trait Protocol: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Req/Resp entries this protocol serves inbound.
    fn rpc_protocols(&self) -> &'static [SupportedProtocol] {
        &[]
    }

    /// Initial per-peer state, stored in the peer's slot for this
    /// protocol. Protocols mutate through interior mutability; the slot
    /// itself is fixed for the peer's lifetime.
    fn init_peer_state(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        None
    }

    /// Initial per-network state, stored in the network's slot.
    fn init_network_state(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        None
    }

    async fn on_peer_connected(&self, _network: &Network, _peer: PeerId) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_peer_disconnected(&self, _network: &Network, _peer: PeerId) {}

    /// Serve one inbound request. Only called for protocols listed in
    /// `rpc_protocols`; `rpc` tells versioned protocols which wire form to
    /// answer with.
    async fn handle_request(
        &self,
        _network: &Network,
        _peer: PeerId,
        _rpc: SupportedProtocol,
        _request: Request,
    ) -> Result<Vec<ResponseItem>, HandlerError> {
        Err(HandlerError::Internal(anyhow::anyhow!(
            "protocol serves no requests"
        )))
    }
}

/// Immutable after mount: the protocol list in index order plus the
/// Req/Resp dispatch table.
pub struct ProtocolRegistry {
    protocols: Vec<Arc<dyn Protocol>>,
    dispatch: HashMap<SupportedProtocol, ProtocolIndex>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self {
            protocols: Vec::new(),
            dispatch: HashMap::new(),
        }
    }

    /// Mount a protocol, assigning the next dense index.
    ///
    /// Panics on duplicate names or Req/Resp entries already claimed; both
    /// are setup bugs, not runtime conditions.
    pub fn register(&mut self, protocol: Arc<dyn Protocol>) -> ProtocolIndex {
        let index = self.protocols.len();
        assert!(
            !self.protocols.iter().any(|p| p.name() == protocol.name()),
            "protocol {:?} mounted twice",
            protocol.name()
        );
        for rpc in protocol.rpc_protocols() {
            let previous = self.dispatch.insert(*rpc, index);
            assert!(
                previous.is_none(),
                "req/resp protocol {:?} claimed by two handlers",
                rpc.protocol_id()
            );
        }
        self.protocols.push(protocol);
        index
    }

    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }

    pub fn get(&self, index: ProtocolIndex) -> Option<&Arc<dyn Protocol>> {
        self.protocols.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProtocolIndex, &Arc<dyn Protocol>)> {
        self.protocols.iter().enumerate()
    }

    /// Dense index assigned to a protocol name at mount time.
    pub fn index_of(&self, name: &str) -> Option<ProtocolIndex> {
        self.protocols.iter().position(|p| p.name() == name)
    }

    /// Resolve the handler for an inbound Req/Resp stream.
    pub fn handler_for(
        &self,
        rpc: SupportedProtocol,
    ) -> Option<(ProtocolIndex, &Arc<dyn Protocol>)> {
        let index = *self.dispatch.get(&rpc)?;
        Some((index, &self.protocols[index]))
    }

    /// Fresh per-peer state slots, one per mounted protocol.
    pub fn init_peer_states(&self) -> Vec<Option<Arc<dyn Any + Send + Sync>>> {
        self.protocols.iter().map(|p| p.init_peer_state()).collect()
    }

    /// Fresh per-network state slots, one per mounted protocol.
    pub fn init_network_states(&self) -> NetworkProtocolStates {
        NetworkProtocolStates {
            slots: self
                .protocols
                .iter()
                .map(|p| p.init_network_state())
                .collect(),
        }
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-network protocol state, indexed by protocol index. Slots are fixed
/// after mount; state mutation happens through each slot's own interior
/// mutability.
pub struct NetworkProtocolStates {
    slots: Vec<Option<Arc<dyn Any + Send + Sync>>>,
}

impl NetworkProtocolStates {
    pub fn get<T: Send + Sync + 'static>(&self, index: ProtocolIndex) -> Option<Arc<T>> {
        let slot = self.slots.get(index)?.clone()?;
        slot.downcast::<T>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestProtocol {
        name: &'static str,
        rpcs: &'static [SupportedProtocol],
        peer_counter: u32,
    }

    #[async_trait]
    impl Protocol for TestProtocol {
        fn name(&self) -> &'static str {
            self.name
        }

        fn rpc_protocols(&self) -> &'static [SupportedProtocol] {
            self.rpcs
        }

        fn init_peer_state(&self) -> Option<Arc<dyn Any + Send + Sync>> {
            Some(Arc::new(self.peer_counter))
        }

        fn init_network_state(&self) -> Option<Arc<dyn Any + Send + Sync>> {
            Some(Arc::new(std::sync::Mutex::new(format!("{}-state", self.name))))
        }
    }

    #[test]
    fn indices_are_dense_and_ordered() {
        let mut registry = ProtocolRegistry::new();
        let a = registry.register(Arc::new(TestProtocol {
            name: "alpha",
            rpcs: &[SupportedProtocol::PingV1],
            peer_counter: 1,
        }));
        let b = registry.register(Arc::new(TestProtocol {
            name: "beta",
            rpcs: &[SupportedProtocol::StatusV1],
            peer_counter: 2,
        }));
        assert_eq!((a, b), (0, 1));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(0).unwrap().name(), "alpha");
    }

    #[test]
    fn dispatch_resolves_to_owning_protocol() {
        let mut registry = ProtocolRegistry::new();
        registry.register(Arc::new(TestProtocol {
            name: "blocks",
            rpcs: &[
                SupportedProtocol::BlocksByRangeV2,
                SupportedProtocol::BlocksByRootV2,
            ],
            peer_counter: 0,
        }));

        let (index, protocol) = registry
            .handler_for(SupportedProtocol::BlocksByRootV2)
            .expect("registered");
        assert_eq!(index, 0);
        assert_eq!(protocol.name(), "blocks");
        assert!(registry.handler_for(SupportedProtocol::PingV1).is_none());
    }

    #[test]
    #[should_panic(expected = "mounted twice")]
    fn duplicate_name_panics() {
        let mut registry = ProtocolRegistry::new();
        registry.register(Arc::new(TestProtocol {
            name: "dup",
            rpcs: &[],
            peer_counter: 0,
        }));
        registry.register(Arc::new(TestProtocol {
            name: "dup",
            rpcs: &[],
            peer_counter: 0,
        }));
    }

    #[test]
    #[should_panic(expected = "claimed by two handlers")]
    fn duplicate_rpc_claim_panics() {
        let mut registry = ProtocolRegistry::new();
        registry.register(Arc::new(TestProtocol {
            name: "one",
            rpcs: &[SupportedProtocol::PingV1],
            peer_counter: 0,
        }));
        registry.register(Arc::new(TestProtocol {
            name: "two",
            rpcs: &[SupportedProtocol::PingV1],
            peer_counter: 0,
        }));
    }

    #[test]
    fn state_slots_align_with_indices() {
        let mut registry = ProtocolRegistry::new();
        registry.register(Arc::new(TestProtocol {
            name: "alpha",
            rpcs: &[],
            peer_counter: 10,
        }));
        registry.register(Arc::new(TestProtocol {
            name: "beta",
            rpcs: &[],
            peer_counter: 20,
        }));

        assert_eq!(registry.index_of("alpha"), Some(0));
        assert_eq!(registry.index_of("beta"), Some(1));
        assert_eq!(registry.index_of("gamma"), None);

        let peer_states = registry.init_peer_states();
        assert_eq!(peer_states.len(), 2);
        assert_eq!(
            peer_states[1]
                .as_ref()
                .unwrap()
                .downcast_ref::<u32>(),
            Some(&20)
        );

        let network_states = registry.init_network_states();
        let alpha = network_states
            .get::<std::sync::Mutex<String>>(0)
            .expect("slot populated");
        assert_eq!(*alpha.lock().unwrap(), "alpha-state");

        // Mutation through interior mutability sticks.
        let beta = network_states
            .get::<std::sync::Mutex<String>>(1)
            .expect("slot populated");
        beta.lock().unwrap().push('!');
        let beta_again = network_states
            .get::<std::sync::Mutex<String>>(1)
            .expect("slot populated");
        assert_eq!(*beta_again.lock().unwrap(), "beta-state!");

        // Wrong type downcasts to None.
        assert!(network_states.get::<u64>(0).is_none());
    }
}
