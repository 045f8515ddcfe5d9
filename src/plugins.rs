//! Plugin surfaces for peer discovery and extra advertised info keys
//! (§4.11). Grounded on `original_source/theseus/plugins.py`'s
//! `IPeerSource`/`IInfoProvider` zope interfaces, re-expressed as object-safe
//! Rust traits. `paranoid: bool` becomes [`SourceTrust`], a two-variant enum
//! rather than a bare bool, per the design note in `SPEC_FULL.md` §9: the
//! call sites read as `SourceTrust::Paranoid` instead of an unlabelled
//! `true`, and there's nowhere to accidentally pass the flag backwards.

use crate::contact::ContactInfo;
use async_trait::async_trait;

/// Whether the caller should assume active network-level interference.
/// `Paranoid` sources must skip anything that isn't secure against a
/// man-in-the-middle (e.g. plain HTTP); `Open` sources may use anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTrust {
    Open,
    Paranoid,
}

/// A source of additional peers to seed the routing table from, or to
/// report the local contact to (a bootstrap list, a rendezvous server, a
/// DNS seed list, ...).
#[async_trait]
pub trait PeerSource: Send + Sync {
    async fn get(&self, trust: SourceTrust) -> Vec<ContactInfo>;
    async fn put(&self, contact: ContactInfo, trust: SourceTrust);
}

/// A provider of additional `info` advertisement keys beyond the built-in
/// `listen_port`/`peer_key`/`max_version` set.
pub trait InfoProvider: Send + Sync {
    /// The keys this provider answers for.
    fn provided(&self) -> &[Vec<u8>];
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Empty;

    #[async_trait]
    impl PeerSource for Empty {
        async fn get(&self, _trust: SourceTrust) -> Vec<ContactInfo> {
            Vec::new()
        }
        async fn put(&self, _contact: ContactInfo, _trust: SourceTrust) {}
    }

    #[async_std::test]
    async fn empty_source_returns_nothing() {
        let source: Box<dyn PeerSource> = Box::new(Empty);
        assert!(source.get(SourceTrust::Paranoid).await.is_empty());
    }
}
