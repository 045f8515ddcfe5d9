//! DHT query handlers: `find`, `get`, `put`, `info` (§4.5, §4.8). Grounded
//! on `original_source/theseus/protocol.py`'s `DHTProtocol` query methods,
//! wired into `krpc.rs`'s [`QueryHandler`] registry instead of Twisted's
//! `remote_*` dispatch.

use crate::bencode::Value;
use crate::constants::{BLACKLIST_SIZE, L_BYTES, LISTEN_PORT_RANGE};
use crate::contact::{ContactInfo, RoutingEntry};
use crate::datastore::{DataStore, GetResult};
use crate::error::ProtocolError;
use crate::hasher::{HashPriority, Hasher};
use crate::krpc::{QueryHandler, RemotePeer};
use crate::nodeaddr::NodeAddress;
use crate::peertracker::PeerTracker;
use crate::plugins::InfoProvider;
use crate::routing::RoutingTable;
use log::warn;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::convert::TryInto;
use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::Arc;

type Addr = [u8; L_BYTES];

/// Everything a query handler needs to answer: the routing table to read
/// and feed from `find`, the per-local-node-address data stores `get`/`put`
/// operate on, and the local peer's own advertised `info`.
pub struct Protocol {
    pub routing: Arc<Mutex<RoutingTable>>,
    /// One store per local node address (§4.9): a `put` is routed to
    /// whichever is closest by XOR distance to the target, and a `get`
    /// checks every store and merges the results, since the caller has no
    /// way to know in advance which local address a value landed under.
    pub datastores: Vec<Arc<DataStore>>,
    pub listen_port: u16,
    pub peer_key: [u8; 32],
    pub max_version: u32,
    /// This peer's own node addresses, advertised wire-encoded under the
    /// `addrs` info key so other peers can learn and verify them (§4.8).
    pub local_addrs: Vec<NodeAddress>,
    pub info_providers: Vec<Arc<dyn InfoProvider>>,
    /// Shared with `service.rs`'s `PeerService`, so an inbound `info`'s
    /// advertised addresses get the same Argon2id re-verification an
    /// outbound `learn_peer_info` call gives them.
    pub hasher: Arc<Hasher>,
    pub peers: Arc<PeerTracker>,
    pub blacklist: Arc<Mutex<VecDeque<Ipv4Addr>>>,
}

impl Protocol {
    /// The local store closest (by XOR distance) to `addr`, i.e. the one
    /// an inbound `put` for `addr` is routed to.
    fn closest_store(&self, addr: &Addr) -> &Arc<DataStore> {
        self.datastores
            .iter()
            .min_by_key(|store| store.distance_to(addr))
            .expect("a peer always has at least one local node address")
    }
}

impl Protocol {
    /// Builds the method-name -> handler entries `krpc.rs::KrpcHandle::spawn`
    /// validates and dispatches incoming queries through.
    pub fn build_handlers(self: Arc<Self>) -> Vec<(Vec<u8>, QueryHandler)> {
        let mut handlers: Vec<(Vec<u8>, QueryHandler)> = Vec::new();

        let p = self.clone();
        handlers.push((
            b"find".to_vec(),
            wrap(move |args, remote| {
                let p = p.clone();
                async move { p.handle_find(args, remote) }
            }),
        ));

        let p = self.clone();
        handlers.push((
            b"get".to_vec(),
            wrap(move |args, remote| {
                let p = p.clone();
                async move { p.handle_get(args, remote) }
            }),
        ));

        let p = self.clone();
        handlers.push((
            b"put".to_vec(),
            wrap(move |args, remote| {
                let p = p.clone();
                async move { p.handle_put(args, remote) }
            }),
        ));

        let p = self.clone();
        handlers.push((
            b"info".to_vec(),
            wrap(move |args, remote| {
                let p = p.clone();
                async move { p.handle_info(args, remote).await }
            }),
        ));

        handlers
    }

    /// `find {addr: 20 bytes} -> {nodes: [68-byte entry, ...]}`.
    /// Closest-known entries to `addr`, per `routing.rs::query`.
    fn handle_find(&self, args: BTreeMap<Vec<u8>, Value>, _remote: RemotePeer) -> Result<Value, ProtocolError> {
        let addr: Addr = args
            .get(b"addr".as_slice())
            .and_then(Value::as_bytes)
            .and_then(|b| b.try_into().ok())
            .ok_or(ProtocolError::InvalidDhtMessage)?;

        let entries = self.routing.lock().query(&addr, None);
        let nodes = entries
            .iter()
            .map(|e: &RoutingEntry| Value::bytes(e.to_bytes().to_vec()))
            .collect();
        Ok(dict(vec![(b"nodes", Value::List(nodes))]))
    }

    /// `get {addr: 20 bytes, tags?: dict} -> {data: [{data, tags}, ...]}` if
    /// the local store has something for `(addr, tags)`; otherwise behaves
    /// as `find`, returning `{nodes: [...]}` for the same `addr`. An absent
    /// `addr` is a caller-protocol violation (`SPEC_FULL.md` §4.6), not an
    /// empty result. Checks every local store (the caller has no way to
    /// know which local address a value landed under) and merges, since a
    /// single `put` only ever lands in one.
    fn handle_get(&self, args: BTreeMap<Vec<u8>, Value>, _remote: RemotePeer) -> Result<Value, ProtocolError> {
        let addr: Addr = args
            .get(b"addr".as_slice())
            .and_then(Value::as_bytes)
            .and_then(|b| b.try_into().ok())
            .ok_or(ProtocolError::InvalidDhtMessage)?;

        let tags = args.get(b"tags".as_slice()).and_then(Value::as_dict).map(value_dict_to_tags);

        let mut values = Vec::new();
        for store in &self.datastores {
            match store.get(Some(&addr), tags.as_ref()) {
                GetResult::List(list) => values.extend(list),
                GetResult::Map(_) => unreachable!("get() with Some(addr) never returns Map"),
            }
        }

        if values.is_empty() {
            let entries = self.routing.lock().query(&addr, None);
            let nodes = entries
                .iter()
                .map(|e: &RoutingEntry| Value::bytes(e.to_bytes().to_vec()))
                .collect();
            return Ok(dict(vec![(b"nodes", Value::List(nodes))]));
        }

        let encoded = values
            .into_iter()
            .map(|datum| {
                dict(vec![
                    (b"data", Value::bytes(datum.value)),
                    (b"tags", Value::Dict(datum.tags.into_iter().map(|(k, v)| (k, Value::bytes(v))).collect())),
                ])
            })
            .collect();
        Ok(dict(vec![(b"data", Value::List(encoded))]))
    }

    /// `put {addr: 20 bytes, data: bytes, tags?: dict, t?: int} -> {d: int,
    /// tags?: dict}`. Tag *values* in the request are ignored: the server
    /// stamps its own observation for each requested tag *name* instead
    /// (`ip` -> the remote host's octets, `port` -> the remote port,
    /// anything else -> empty bytes), so a peer behind NAT can learn how it
    /// is actually being seen.
    fn handle_put(&self, args: BTreeMap<Vec<u8>, Value>, remote: RemotePeer) -> Result<Value, ProtocolError> {
        let addr: Addr = args
            .get(b"addr".as_slice())
            .and_then(Value::as_bytes)
            .and_then(|b| b.try_into().ok())
            .ok_or(ProtocolError::InvalidDhtMessage)?;
        let data = args
            .get(b"data".as_slice())
            .and_then(Value::as_bytes)
            .ok_or(ProtocolError::InvalidDhtMessage)?
            .to_vec();
        let synthesized: BTreeMap<Vec<u8>, Vec<u8>> = args
            .get(b"tags".as_slice())
            .and_then(Value::as_dict)
            .map(|requested| requested.keys().map(|name| (name.clone(), synthesize_tag_value(name, remote))).collect())
            .unwrap_or_default();
        let suggested = args
            .get(b"t".as_slice())
            .and_then(Value::as_int)
            .filter(|d| *d >= 0)
            .map(|d| std::time::Duration::from_secs(d as u64))
            .unwrap_or(crate::constants::DATASTORE_DEFAULT_DURATION);

        let granted = self.closest_store(&addr).put(addr, data, synthesized.clone(), suggested);

        let mut out = vec![(b"d".as_slice(), Value::Int(granted.as_secs() as i64))];
        if !synthesized.is_empty() {
            out.push((
                b"tags".as_slice(),
                Value::Dict(synthesized.into_iter().map(|(k, v)| (k, Value::bytes(v))).collect()),
            ));
        }
        Ok(dict(out))
    }

    /// `info {keys?: [bytes, ...], info?: dict} -> {info: {<key>: bytes, ...}}`.
    /// A peer's own incoming `info` sub-dict is validated and applied
    /// (§4.8's info policy) *before* the reply is built, mirroring the
    /// original's `self.onInfo(args)` running unconditionally ahead of
    /// `info`'s own return -- this is the only way an inbound (not
    /// bootstrap-dialed) connection ever learns who it's talking to, since
    /// Noise NK never authenticates the initiator to the responder. With no
    /// `keys` filter, answers every key this peer can: the built-in
    /// `listen_port`/`peer_key`/`max_version`/`addrs` plus anything a
    /// registered [`InfoProvider`] serves.
    async fn handle_info(&self, args: BTreeMap<Vec<u8>, Value>, remote: RemotePeer) -> Result<Value, ProtocolError> {
        self.apply_info_policy(&args, remote).await;

        let requested: Option<Vec<Vec<u8>>> = args
            .get(b"keys".as_slice())
            .and_then(Value::as_list)
            .map(|l| l.iter().filter_map(|v| v.as_bytes().map(|b| b.to_vec())).collect());

        let mut out = BTreeMap::new();
        let wants = |key: &[u8]| requested.as_ref().map_or(true, |k| k.iter().any(|r| r == key));

        if wants(b"listen_port") {
            out.insert(b"listen_port".to_vec(), Value::Int(self.listen_port as i64));
        }
        if wants(b"peer_key") {
            out.insert(b"peer_key".to_vec(), Value::bytes(self.peer_key.to_vec()));
        }
        if wants(b"max_version") {
            out.insert(b"max_version".to_vec(), Value::Int(self.max_version as i64));
        }
        if wants(b"addrs") {
            let addrs = self
                .local_addrs
                .iter()
                .map(|n| Value::bytes(n.as_bytes().to_vec()))
                .collect();
            out.insert(b"addrs".to_vec(), Value::List(addrs));
        }
        for provider in &self.info_providers {
            for key in provider.provided() {
                if wants(key) {
                    if let Some(value) = provider.get(key) {
                        out.insert(key.clone(), Value::bytes(value));
                    }
                }
            }
        }
        Ok(dict(vec![(b"info", Value::Dict(out))]))
    }

    /// Validates and registers an incoming `info` advertisement against
    /// `remote` (§4.8): a missing or out-of-range `listen_port`, or a
    /// malformed `peer_key`, leaves the peer unregistered and the call is a
    /// no-op. A registration conflict (same host+port, different key
    /// already known) blacklists the host. Otherwise, any advertised
    /// `addrs` are handed to [`learn_advertised_addrs`], same as an
    /// outbound `learn_peer_info` call.
    async fn apply_info_policy(&self, args: &BTreeMap<Vec<u8>, Value>, remote: RemotePeer) {
        let info = match args.get(b"info".as_slice()).and_then(Value::as_dict) {
            Some(d) => d,
            None => return,
        };

        let listen_port = match info
            .get(b"listen_port".as_slice())
            .and_then(Value::as_int)
            .and_then(|p| validate_listen_port(p).ok())
        {
            Some(p) => p,
            None => return,
        };
        let peer_key: [u8; 32] = match info
            .get(b"peer_key".as_slice())
            .and_then(Value::as_bytes)
            .and_then(|b| b.try_into().ok())
        {
            Some(k) => k,
            None => return,
        };

        let contact = ContactInfo::new(remote.host, listen_port, peer_key);
        if let Err(e) = self.peers.register_contact(contact) {
            warn!("{:?} advertised a conflicting identity, blacklisting: {}", contact, e);
            blacklist_host(&self.blacklist, remote.host);
            return;
        }

        if let Some(addrs) = info.get(b"addrs".as_slice()).and_then(Value::as_list) {
            let local_addrs: Vec<_> = self.local_addrs.iter().map(|n| n.addr).collect();
            learn_advertised_addrs(&self.hasher, &self.routing, &self.blacklist, contact, addrs, &local_addrs).await;
        }
    }
}

/// Validates a peer-advertised `listen_port`, per §4.8's admission check:
/// outside the allowed range is a malformed advertisement, not silently
/// clamped.
pub fn validate_listen_port(port: i64) -> Result<u16, ProtocolError> {
    if port < LISTEN_PORT_RANGE.0 as i64 || port > LISTEN_PORT_RANGE.1 as i64 {
        return Err(ProtocolError::InvalidDhtMessage);
    }
    Ok(port as u16)
}

/// Appends `host` to the shared blacklist ring, evicting the oldest entry
/// once full. Shared between the inbound `info` path here and
/// `service.rs`'s outbound `learn_peer_info`/bootstrap paths, which all
/// react to the same bad-advertisement conditions.
pub fn blacklist_host(list: &Mutex<VecDeque<Ipv4Addr>>, host: Ipv4Addr) {
    let mut guard = list.lock();
    if guard.len() == BLACKLIST_SIZE {
        guard.pop_front();
    }
    guard.push_back(host);
}

/// Verifies and inserts each wire-encoded address `contact` advertised
/// under an `addrs` info key: rejects (and blacklists) an entry whose
/// embedded IP doesn't match `contact.host`, then re-verifies the Argon2id
/// hash at [`HashPriority::Low`] before inserting into the routing table.
/// Shared by the inbound `info` handler (`Protocol::apply_info_policy`) and
/// the outbound bootstrap/dial path (`service.rs::learn_peer_info`).
pub async fn learn_advertised_addrs(
    hasher: &Hasher,
    routing: &Mutex<RoutingTable>,
    blacklist: &Mutex<VecDeque<Ipv4Addr>>,
    contact: ContactInfo,
    addrs: &[Value],
    local_addrs: &[Addr],
) {
    for entry in addrs {
        let bytes = match entry.as_bytes() {
            Some(b) => b,
            None => continue,
        };
        let (preimage, addr) = match NodeAddress::from_bytes(bytes) {
            Ok(pair) => pair,
            Err(_) => continue,
        };
        if preimage.ip != contact.host {
            warn!("{:?} advertised an address claiming a different host, blacklisting", contact);
            blacklist_host(blacklist, contact.host);
            continue;
        }
        match NodeAddress::from_preimage(hasher, addr, preimage, false, HashPriority::Low).await {
            Ok(node_addr) => {
                routing.lock().insert(contact, node_addr, local_addrs);
            }
            Err(e) => {
                warn!("{:?} advertised an address that failed verification: {}", contact, e);
                blacklist_host(blacklist, contact.host);
            }
        }
    }
}

/// Server-synthesized value for a `put` tag name, per §4.6's table: `ip`
/// and `port` report what this connection actually looks like from the
/// server's side, regardless of what the client claimed; any other name
/// carries no information back.
fn synthesize_tag_value(tag_name: &[u8], remote: RemotePeer) -> Vec<u8> {
    match tag_name {
        b"ip" => remote.host.octets().to_vec(),
        b"port" => remote.port.to_be_bytes().to_vec(),
        _ => Vec::new(),
    }
}

/// Wraps a closure returning a plain `Result` into the `Pin<Box<dyn
/// Future...>>`-returning shape [`QueryHandler`] requires.
fn wrap<F, Fut>(f: F) -> QueryHandler
where
    F: Fn(BTreeMap<Vec<u8>, Value>, RemotePeer) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ProtocolError>> + Send + 'static,
{
    Arc::new(move |args, remote| {
        let fut = f(args, remote);
        Box::pin(fut) as Pin<Box<dyn Future<Output = Result<Value, ProtocolError>> + Send>>
    })
}

/// Converts a decoded bencode dict into the plain `Vec<u8>`-valued tag set
/// `datastore.rs` stores under. Non-bytestring values are dropped rather
/// than rejecting the whole query -- a malformed tag value shouldn't fail
/// an otherwise-valid `put`/`get`.
fn value_dict_to_tags(dict: &BTreeMap<Vec<u8>, Value>) -> BTreeMap<Vec<u8>, Vec<u8>> {
    dict.iter()
        .filter_map(|(k, v)| v.as_bytes().map(|b| (k.clone(), b.to_vec())))
        .collect()
}

fn dict(pairs: Vec<(&[u8], Value)>) -> Value {
    let mut m = BTreeMap::new();
    for (k, v) in pairs {
        m.insert(k.to_vec(), v);
    }
    Value::Dict(m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodeaddr::Preimage;
    use std::net::Ipv4Addr;

    fn remote() -> RemotePeer {
        RemotePeer {
            host: Ipv4Addr::new(127, 0, 0, 1),
            port: 9999,
        }
    }

    fn protocol() -> Protocol {
        Protocol {
            routing: Arc::new(Mutex::new(RoutingTable::new())),
            datastores: vec![Arc::new(DataStore::new(None))],
            listen_port: 9000,
            peer_key: [7u8; 32],
            max_version: 1,
            local_addrs: Vec::new(),
            info_providers: Vec::new(),
            hasher: Arc::new(Hasher::new()),
            peers: Arc::new(PeerTracker::new()),
            blacklist: Arc::new(Mutex::new(VecDeque::with_capacity(BLACKLIST_SIZE))),
        }
    }

    #[test]
    fn find_with_missing_addr_is_rejected() {
        let p = protocol();
        let err = p.handle_find(BTreeMap::new(), remote()).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidDhtMessage);
    }

    #[test]
    fn find_returns_routing_table_contents() {
        let p = protocol();
        let contact = ContactInfo::new(Ipv4Addr::new(10, 0, 0, 1), 1000, [1u8; 32]);
        let node_addr = NodeAddress {
            addr: [1u8; 20],
            preimage: Preimage::new(0, Ipv4Addr::new(10, 0, 0, 1), [0u8; 6]),
            verified: true,
        };
        p.routing.lock().insert(contact, node_addr, &[]);

        let mut args = BTreeMap::new();
        args.insert(b"addr".to_vec(), Value::bytes(vec![0u8; 20]));
        let result = p.handle_find(args, remote()).unwrap();
        let dict = result.as_dict().unwrap();
        assert_eq!(dict.get(b"nodes".as_slice()).unwrap().as_list().unwrap().len(), 1);
    }

    #[test]
    fn get_without_addr_is_rejected() {
        let p = protocol();
        let err = p.handle_get(BTreeMap::new(), remote()).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidDhtMessage);
    }

    #[test]
    fn get_falls_back_to_routing_table_when_nothing_stored() {
        let p = protocol();
        let contact = ContactInfo::new(Ipv4Addr::new(10, 0, 0, 1), 1000, [1u8; 32]);
        let node_addr = NodeAddress {
            addr: [9u8; 20],
            preimage: Preimage::new(0, Ipv4Addr::new(10, 0, 0, 1), [0u8; 6]),
            verified: true,
        };
        p.routing.lock().insert(contact, node_addr, &[]);

        let mut args = BTreeMap::new();
        args.insert(b"addr".to_vec(), Value::bytes(vec![9u8; 20]));
        let result = p.handle_get(args, remote()).unwrap();
        let dict = result.as_dict().unwrap();
        assert!(dict.contains_key(b"nodes".as_slice()));
        assert!(!dict.contains_key(b"data".as_slice()));
    }

    #[test]
    fn put_then_get_round_trips() {
        let p = protocol();
        let mut put_args = BTreeMap::new();
        put_args.insert(b"addr".to_vec(), Value::bytes(vec![3u8; 20]));
        put_args.insert(b"data".to_vec(), Value::bytes(b"hello".to_vec()));
        let put_result = p.handle_put(put_args, remote()).unwrap();
        let granted = put_result.as_dict().unwrap().get(b"d".as_slice()).unwrap().as_int().unwrap();
        assert!(granted > 0);

        let mut get_args = BTreeMap::new();
        get_args.insert(b"addr".to_vec(), Value::bytes(vec![3u8; 20]));
        let get_result = p.handle_get(get_args, remote()).unwrap();
        let values = get_result.as_dict().unwrap().get(b"data".as_slice()).unwrap().as_list().unwrap();
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn put_synthesizes_ip_and_port_tags_from_the_remote_peer() {
        let p = protocol();
        let mut put_args = BTreeMap::new();
        put_args.insert(b"addr".to_vec(), Value::bytes(vec![4u8; 20]));
        put_args.insert(b"data".to_vec(), Value::bytes(b"hi".to_vec()));
        let mut requested_tags = BTreeMap::new();
        requested_tags.insert(b"ip".to_vec(), Value::bytes(b"claimed-but-ignored".to_vec()));
        requested_tags.insert(b"port".to_vec(), Value::bytes(Vec::new()));
        requested_tags.insert(b"nickname".to_vec(), Value::bytes(b"also-ignored".to_vec()));
        put_args.insert(b"tags".to_vec(), Value::Dict(requested_tags));

        let result = p.handle_put(put_args, remote()).unwrap();
        let tags = result.as_dict().unwrap().get(b"tags".as_slice()).unwrap().as_dict().unwrap();
        assert_eq!(tags.get(b"ip".as_slice()).unwrap().as_bytes().unwrap(), &[127, 0, 0, 1]);
        assert_eq!(tags.get(b"port".as_slice()).unwrap().as_bytes().unwrap(), &9999u16.to_be_bytes());
        assert_eq!(tags.get(b"nickname".as_slice()).unwrap().as_bytes().unwrap(), &[] as &[u8]);
    }

    #[async_std::test]
    async fn info_without_keys_returns_builtins_nested_under_info() {
        let p = protocol();
        let result = p.handle_info(BTreeMap::new(), remote()).await.unwrap();
        let outer = result.as_dict().unwrap();
        let dict = outer.get(b"info".as_slice()).unwrap().as_dict().unwrap();
        assert!(dict.contains_key(b"listen_port".as_slice()));
        assert!(dict.contains_key(b"peer_key".as_slice()));
        assert!(dict.contains_key(b"max_version".as_slice()));
        assert!(dict.contains_key(b"addrs".as_slice()));
    }

    #[async_std::test]
    async fn info_advertises_every_local_node_address() {
        let mut p = protocol();
        p.local_addrs = vec![
            NodeAddress {
                addr: [1u8; 20],
                preimage: Preimage::new(0, Ipv4Addr::new(10, 0, 0, 1), [0u8; 6]),
                verified: true,
            },
            NodeAddress {
                addr: [2u8; 20],
                preimage: Preimage::new(0, Ipv4Addr::new(10, 0, 0, 1), [0u8; 6]),
                verified: true,
            },
        ];
        let result = p.handle_info(BTreeMap::new(), remote()).await.unwrap();
        let outer = result.as_dict().unwrap();
        let dict = outer.get(b"info".as_slice()).unwrap().as_dict().unwrap();
        assert_eq!(dict.get(b"addrs".as_slice()).unwrap().as_list().unwrap().len(), 2);
    }

    #[async_std::test]
    async fn inbound_info_registers_the_advertising_peer() {
        let p = protocol();
        let mut info = BTreeMap::new();
        info.insert(b"listen_port".to_vec(), Value::Int(9001));
        info.insert(b"peer_key".to_vec(), Value::bytes(vec![2u8; 32]));
        let mut args = BTreeMap::new();
        args.insert(b"info".to_vec(), Value::Dict(info));

        p.handle_info(args, remote()).await.unwrap();

        let contact = ContactInfo::new(remote().host, 9001, [2u8; 32]);
        assert!(p.peers.get(&contact).is_some());
    }

    #[async_std::test]
    async fn inbound_info_ignores_advertisement_with_bad_listen_port() {
        let p = protocol();
        let mut info = BTreeMap::new();
        info.insert(b"listen_port".to_vec(), Value::Int(1));
        info.insert(b"peer_key".to_vec(), Value::bytes(vec![3u8; 32]));
        let mut args = BTreeMap::new();
        args.insert(b"info".to_vec(), Value::Dict(info));

        p.handle_info(args, remote()).await.unwrap();

        assert_eq!(p.peers.len(), 0);
    }

    #[test]
    fn put_routes_to_the_store_closest_to_the_target_address() {
        let mut p = protocol();
        p.datastores = vec![
            Arc::new(DataStore::new(Some([0xffu8; 20]))),
            Arc::new(DataStore::new(Some([0u8; 20]))),
        ];

        let mut put_args = BTreeMap::new();
        put_args.insert(b"addr".to_vec(), Value::bytes(vec![1u8; 20]));
        put_args.insert(b"data".to_vec(), Value::bytes(b"hi".to_vec()));
        p.handle_put(put_args, remote()).unwrap();

        // [1u8; 20] is far closer to the all-zero local address than to
        // the all-ones one, so it should have landed in datastores[1].
        match p.datastores[1].get(Some(&[1u8; 20]), None) {
            GetResult::List(list) => assert_eq!(list.len(), 1),
            GetResult::Map(_) => panic!("expected list"),
        }
        match p.datastores[0].get(Some(&[1u8; 20]), None) {
            GetResult::List(list) => assert!(list.is_empty()),
            GetResult::Map(_) => panic!("expected list"),
        }
    }

    #[test]
    fn get_merges_results_across_every_local_store() {
        let mut p = protocol();
        let a = Arc::new(DataStore::new(Some([0u8; 20])));
        let b = Arc::new(DataStore::new(Some([0xffu8; 20])));
        a.put([5u8; 20], b"from-a".to_vec(), BTreeMap::new(), std::time::Duration::from_secs(60));
        b.put([5u8; 20], b"from-b".to_vec(), BTreeMap::new(), std::time::Duration::from_secs(60));
        p.datastores = vec![a, b];

        let mut get_args = BTreeMap::new();
        get_args.insert(b"addr".to_vec(), Value::bytes(vec![5u8; 20]));
        let result = p.handle_get(get_args, remote()).unwrap();
        let values = result.as_dict().unwrap().get(b"data".as_slice()).unwrap().as_list().unwrap();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn validate_listen_port_rejects_out_of_range() {
        assert!(validate_listen_port(80).is_err());
        assert!(validate_listen_port(9000).is_ok());
    }
}
