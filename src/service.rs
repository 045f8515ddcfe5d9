//! Peer-service orchestration: startup, listen-port selection, local
//! node-address maintenance and self-lookup scheduling (§4/§5). Grounded
//! on `original_source/theseus/peer.py`'s `PeerService`.

use crate::bencode::Value;
use crate::config::Config;
use crate::constants::{
    BLACKLIST_SIZE, DEFAULT_NUM_NODES, LOOKUP_NUM_PATHS, LOOKUP_PATH_WIDTH, LOOKUP_START_RETRY_MAX, TIMEOUT_WINDOW,
};
use crate::contact::ContactInfo;
use crate::datastore::DataStore;
use crate::error::{DhtError, ProtocolError, SchedulingError, TransportError};
use crate::hasher::{HashPriority, Hasher};
use crate::krpc::{KrpcHandle, RemotePeer};
use crate::lookup::{next_start_retry_delay, AddrLookup, Querier};
use crate::noise::NoiseChannel;
use crate::nodeaddr::NodeAddress;
use crate::peertracker::{Dialer, PeerState, PeerTracker};
use crate::plugins::{InfoProvider, PeerSource, SourceTrust};
use crate::protocol::{self, Protocol};
use crate::routing::RoutingTable;
use crate::stats::StatsTracker;
use async_std::net::{TcpListener, TcpStream};
use async_std::task;
use async_trait::async_trait;
use log::{info, warn};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::convert::TryInto;
use std::net::Ipv4Addr;
use std::sync::Arc;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Everything a running peer needs, built once at startup and shared
/// (via `Arc`) across the accept loop, query handlers and lookup tasks.
pub struct PeerService {
    pub config: Config,
    pub hasher: Arc<Hasher>,
    pub node_addrs: Mutex<Vec<NodeAddress>>,
    pub static_secret: StaticSecret,
    pub static_public: [u8; 32],
    pub routing: Arc<Mutex<RoutingTable>>,
    /// One store per entry in `node_addrs`, kept in lockstep with it across
    /// rotations (§4.9) -- `Protocol` routes a `put` to whichever is
    /// closest and merges a `get` across all of them.
    pub datastores: Mutex<Vec<Arc<DataStore>>>,
    pub peers: Arc<PeerTracker>,
    pub stats: Arc<StatsTracker>,
    pub blacklist: Arc<Mutex<VecDeque<Ipv4Addr>>>,
    pub listen_port: Mutex<Option<u16>>,
}

fn datastores_for(node_addrs: &[NodeAddress]) -> Vec<Arc<DataStore>> {
    node_addrs.iter().map(|n| Arc::new(DataStore::new(Some(n.addr)))).collect()
}

impl PeerService {
    pub async fn new(config: Config, hasher: Arc<Hasher>) -> Arc<PeerService> {
        let mut node_addrs = Vec::with_capacity(DEFAULT_NUM_NODES);
        for _ in 0..DEFAULT_NUM_NODES {
            node_addrs.push(NodeAddress::new(&hasher, Ipv4Addr::UNSPECIFIED, HashPriority::Medium).await);
        }
        let datastores = datastores_for(&node_addrs);

        let static_secret = StaticSecret::new(&mut rand::rngs::OsRng);
        let static_public = PublicKey::from(&static_secret).to_bytes();

        Arc::new(PeerService {
            config,
            hasher,
            node_addrs: Mutex::new(node_addrs),
            static_secret,
            static_public,
            routing: Arc::new(Mutex::new(RoutingTable::new())),
            datastores: Mutex::new(datastores),
            peers: Arc::new(PeerTracker::new()),
            stats: Arc::new(StatsTracker::new()),
            blacklist: Arc::new(Mutex::new(VecDeque::with_capacity(BLACKLIST_SIZE))),
            listen_port: Mutex::new(None),
        })
    }

    fn own_contact(&self) -> ContactInfo {
        let port = self.listen_port.lock().unwrap_or(0);
        ContactInfo::new(Ipv4Addr::UNSPECIFIED, port, self.static_public)
    }

    /// Picks a listen port inside the configured range, skipping
    /// well-known ports to avoid and retrying on bind failure, then spawns
    /// the accept loop. Mirrors `PeerService.startListening`'s randrange-
    /// and-retry loop.
    pub async fn start(self: &Arc<Self>, info_providers: Vec<Arc<dyn InfoProvider>>) -> Result<u16, TransportError> {
        let (low, high) = self.config.listen_port_range();
        let avoid = self.config.ports_to_avoid();

        let listener = loop {
            let port = rand::thread_rng().gen_range(low, high);
            if avoid.contains(&port) {
                continue;
            }
            info!("attempting to listen on port {}...", port);
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(l) => break (l, port),
                Err(_) => continue,
            }
        };
        let (listener, port) = listener;
        *self.listen_port.lock() = Some(port);
        info!("now listening on port {} with key {:02x?}", port, &self.static_public[..4]);

        let protocol = Arc::new(Protocol {
            routing: self.routing.clone(),
            datastores: self.datastores.lock().clone(),
            listen_port: port,
            peer_key: self.static_public,
            max_version: 1,
            local_addrs: self.node_addrs.lock().clone(),
            info_providers,
            hasher: self.hasher.clone(),
            peers: self.peers.clone(),
            blacklist: self.blacklist.clone(),
        });

        let this = self.clone();
        task::spawn(async move {
            this.accept_loop(listener, protocol).await;
        });

        Ok(port)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, protocol: Arc<Protocol>) {
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };

            if self.is_blacklisted(peer_addr.ip()) {
                debug_log_blacklisted(peer_addr.ip());
                continue;
            }

            let remote_host = match peer_addr.ip() {
                std::net::IpAddr::V4(v4) => v4,
                std::net::IpAddr::V6(_) => {
                    warn!("rejecting IPv6 peer {}, this crate is IPv4-only", peer_addr);
                    continue;
                }
            };
            let remote = RemotePeer {
                host: remote_host,
                port: peer_addr.port(),
            };

            let mut static_secret = self.static_secret.to_bytes();
            let protocol = protocol.clone();
            task::spawn(async move {
                let channel = NoiseChannel::accept_responder(stream, static_secret);
                static_secret.zeroize();
                let handlers = protocol.build_handlers();
                let _handle = KrpcHandle::spawn(channel, handlers, remote)
                    .expect("the built-in handler set is a fixed, valid set of method names");
                // The handle is kept alive by the dispatch task it spawned
                // internally; nothing further to drive from here.
            });
        }
    }

    fn is_blacklisted(&self, ip: std::net::IpAddr) -> bool {
        match ip {
            std::net::IpAddr::V4(v4) => self.blacklist.lock().contains(&v4),
            std::net::IpAddr::V6(_) => false,
        }
    }

    pub fn blacklist_host(&self, host: Ipv4Addr) {
        protocol::blacklist_host(&self.blacklist, host);
    }

    /// Collects seed entries for `target` from the routing table, retrying
    /// with a capped backoff (§4.7: start 0, step 5 s, max 30 s) while it
    /// holds too few entries, and finally failing `RetriesExceeded` once
    /// the backoff is exhausted instead of looping forever on a routing
    /// table that may never fill.
    async fn seed_for_lookup(&self, target: &[u8; crate::constants::L_BYTES]) -> Result<Vec<crate::contact::RoutingEntry>, SchedulingError> {
        let required = LOOKUP_NUM_PATHS * LOOKUP_PATH_WIDTH;
        let mut attempt = 0;
        loop {
            let delay = next_start_retry_delay(attempt);
            if delay.as_secs() > 0 {
                task::sleep(delay).await;
            }
            let seeds = self.routing.lock().query(target, None);
            if seeds.len() >= required {
                return Ok(seeds);
            }
            if delay.as_secs() >= LOOKUP_START_RETRY_MAX {
                return Err(SchedulingError::RetriesExceeded);
            }
            attempt += 1;
        }
    }

    /// Runs a self-lookup for every current local node address and feeds
    /// the result into the stats tracker. Shared by the rotation loop and
    /// by an initial warm-up call right after startup.
    async fn run_self_lookups(self: &Arc<Self>) {
        let targets: Vec<_> = self.node_addrs.lock().iter().map(|n| n.addr).collect();
        for target in targets {
            let seeds = match self.seed_for_lookup(&target).await {
                Ok(seeds) => seeds,
                Err(e) => {
                    warn!("self-lookup for {:02x?} gave up waiting for routing-table seeds: {}", target, e);
                    continue;
                }
            };
            let querier = PeerQuerier { service: self.clone() };
            let lookup = AddrLookup::new(target);
            match lookup.start(&querier, seeds).await {
                Ok(results) => {
                    self.stats
                        .register_lookup(&target, &results.iter().map(|e| e.node_addr.addr).collect::<Vec<_>>());
                }
                Err(e) => warn!("self-lookup failed: {}", e),
            }
        }
    }

    /// Spawns the node-address rotation loop (§4.8): every
    /// [`TIMEOUT_WINDOW`], regenerates the local node-address set, rebuilds
    /// each address's data store, reloads the routing table against the
    /// new local addresses, then runs a self-lookup per fresh address.
    pub fn spawn_node_rotation(self: &Arc<Self>) {
        let this = self.clone();
        task::spawn(async move {
            loop {
                task::sleep(TIMEOUT_WINDOW).await;

                let mut fresh = Vec::with_capacity(DEFAULT_NUM_NODES);
                for _ in 0..DEFAULT_NUM_NODES {
                    fresh.push(NodeAddress::new(&this.hasher, Ipv4Addr::UNSPECIFIED, HashPriority::Medium).await);
                }
                let new_datastores = datastores_for(&fresh);
                let local_addrs: Vec<_> = fresh.iter().map(|n| n.addr).collect();

                *this.node_addrs.lock() = fresh;
                *this.datastores.lock() = new_datastores;
                this.routing.lock().reload(&local_addrs);

                info!("rotated local node addresses, relooking up around each");
                this.run_self_lookups().await;
            }
        });
    }

    pub fn peer_state(self: &Arc<Self>, contact: ContactInfo) -> Result<Arc<PeerState>, DhtError> {
        Ok(self.peers.register_contact(contact)?)
    }

    /// Startup step 4 of §4.8: for every compiled-in peer-source plugin,
    /// pull an initial contact list, query each for its `info` to validate
    /// and register it (also establishing the connection), then advertise
    /// this peer's own contact back to the source.
    pub async fn bootstrap(self: &Arc<Self>, sources: Vec<Arc<dyn PeerSource>>, trust: SourceTrust) {
        for source in sources {
            let contacts = source.get(trust).await;
            for contact in contacts {
                let state = match self.peers.register_contact(contact) {
                    Ok(state) => state,
                    Err(e) => {
                        warn!("bootstrap contact {:?} rejected: {}", contact, e);
                        continue;
                    }
                };
                let reply = state
                    .query_default(self.as_ref(), b"info", Value::Dict(Default::default()))
                    .await;
                match reply {
                    Ok(info) => {
                        if let Err(e) = self.learn_peer_info(contact, &info).await {
                            warn!("bootstrap contact {:?} sent bad info: {}", contact, e);
                            self.blacklist_host(contact.host);
                        }
                    }
                    Err(e) => warn!("bootstrap query to {:?} failed: {}", contact, e),
                }
            }
            source.put(self.own_contact(), trust).await;
        }
    }

    /// Validates and registers a peer's `info` response against the
    /// already-known `contact` it was fetched from (§4.8's info-policy
    /// table): the advertised `peer_key` must match the key we dialed with,
    /// `listen_port` must be in range, and each advertised address's
    /// embedded IP must match the host we're talking to before its hash is
    /// re-verified at `HashPriority::Low` and inserted into the routing
    /// table.
    async fn learn_peer_info(self: &Arc<Self>, contact: ContactInfo, info: &Value) -> Result<(), DhtError> {
        let dict = info.as_dict().ok_or(ProtocolError::InvalidDhtMessage)?;

        let listen_port = dict
            .get(b"listen_port".as_slice())
            .and_then(Value::as_int)
            .ok_or(ProtocolError::InvalidDhtMessage)?;
        protocol::validate_listen_port(listen_port)?;

        let peer_key: [u8; 32] = dict
            .get(b"peer_key".as_slice())
            .and_then(Value::as_bytes)
            .and_then(|b| b.try_into().ok())
            .ok_or(ProtocolError::InvalidDhtMessage)?;
        if peer_key != contact.key {
            return Err(ProtocolError::InvalidDhtMessage.into());
        }

        if let Some(addrs) = dict.get(b"addrs".as_slice()).and_then(Value::as_list) {
            let local_addrs: Vec<_> = self.node_addrs.lock().iter().map(|n| n.addr).collect();
            protocol::learn_advertised_addrs(&self.hasher, &self.routing, &self.blacklist, contact, addrs, &local_addrs)
                .await;
        }
        Ok(())
    }
}

fn debug_log_blacklisted(ip: std::net::IpAddr) {
    log::debug!("rejected connection from blacklisted host {}", ip);
}

#[async_trait]
impl Dialer for PeerService {
    async fn dial(&self, contact: &ContactInfo) -> Result<KrpcHandle, TransportError> {
        let stream = TcpStream::connect((contact.host, contact.port))
            .await
            .map_err(TransportError::Io)?;
        let mut local_static = self.static_secret.to_bytes();
        let channel = NoiseChannel::connect_initiator(stream, local_static, contact.key);
        local_static.zeroize();
        let protocol = Arc::new(Protocol {
            routing: self.routing.clone(),
            datastores: self.datastores.lock().clone(),
            listen_port: self.listen_port.lock().unwrap_or(0),
            peer_key: self.static_public,
            max_version: 1,
            local_addrs: self.node_addrs.lock().clone(),
            info_providers: Vec::new(),
            hasher: self.hasher.clone(),
            peers: self.peers.clone(),
            blacklist: self.blacklist.clone(),
        });
        let remote = RemotePeer {
            host: contact.host,
            port: contact.port,
        };
        Ok(KrpcHandle::spawn(channel, protocol.build_handlers(), remote)
            .expect("the built-in handler set is a fixed, valid set of method names"))
    }
}

/// Adapts [`PeerTracker`]/[`Dialer`] into `lookup.rs`'s [`Querier`]: sends
/// a `find` query to a candidate contact and decodes the 68-byte entries
/// it returns.
struct PeerQuerier {
    service: Arc<PeerService>,
}

#[async_trait]
impl Querier for PeerQuerier {
    async fn find(
        &self,
        peer: &ContactInfo,
        target: &[u8; crate::constants::L_BYTES],
    ) -> Result<Vec<crate::contact::RoutingEntry>, DhtError> {
        let state = self.service.peers.register_contact(*peer)?;
        let mut args = std::collections::BTreeMap::new();
        args.insert(b"addr".to_vec(), crate::bencode::Value::bytes(target.to_vec()));
        let result = state
            .query_default(self.service.as_ref(), b"find", crate::bencode::Value::Dict(args))
            .await?;
        decode_find_response(&result)
    }
}

fn decode_find_response(value: &crate::bencode::Value) -> Result<Vec<crate::contact::RoutingEntry>, DhtError> {
    use crate::bencode::Value;
    use crate::contact::{port_and_key_from_bytes, ContactInfo, RoutingEntry};
    use crate::error::ProtocolError;
    use crate::nodeaddr::NodeAddress;

    let dict = value.as_dict().ok_or(ProtocolError::InvalidDhtMessage)?;
    let nodes = dict
        .get(b"nodes".as_slice())
        .and_then(Value::as_list)
        .ok_or(ProtocolError::InvalidDhtMessage)?;

    let mut entries = Vec::with_capacity(nodes.len());
    for node in nodes {
        let bytes = node.as_bytes().ok_or(ProtocolError::InvalidDhtMessage)?;
        if bytes.len() != 68 {
            continue;
        }
        let (preimage, addr) = match NodeAddress::from_bytes(&bytes[0..34]) {
            Ok(pair) => pair,
            Err(_) => continue,
        };
        let (port, key) = match port_and_key_from_bytes(&bytes[34..68]) {
            Some(pair) => pair,
            None => continue,
        };
        // The host a node was reached under isn't part of the wire entry;
        // it's carried separately by whoever relayed it. Left unspecified
        // here since this module has no independent way to learn it.
        let contact = ContactInfo::new(Ipv4Addr::UNSPECIFIED, port, key);
        let node_addr = NodeAddress {
            addr,
            preimage,
            verified: false,
        };
        entries.push(RoutingEntry::new(contact, node_addr));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blacklist_is_bounded() {
        let blacklist: Mutex<VecDeque<Ipv4Addr>> = Mutex::new(VecDeque::with_capacity(2));
        let mut guard = blacklist.lock();
        for i in 0..5u8 {
            if guard.len() == 2 {
                guard.pop_front();
            }
            guard.push_back(Ipv4Addr::new(10, 0, 0, i));
        }
        assert_eq!(guard.len(), 2);
    }
}
