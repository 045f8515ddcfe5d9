// Copyright 2021 Parity Technologies (UK) Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! A Kademlia-style DHT peer with memory-hard node identities and a
//! Noise-encrypted wire protocol.
//!
//! Node addresses are derived with Argon2id rather than a plain hash, so
//! minting a large number of addresses to bias a region of the keyspace
//! costs real memory and CPU per address (`nodeaddr`, `hasher`). Wire
//! traffic runs over Noise_NK_25519_ChaChaPoly_BLAKE2b
//! (`noise`), framing KRPC request/response envelopes (`krpc`, `bencode`)
//! that drive the DHT's `find`/`get`/`put`/`info` operations (`protocol`).
//! `routing`, `datastore`, `peertracker`, `lookup` and `stats` implement
//! the Kademlia mechanics proper; `service` is the composition root.

pub mod bencode;
pub mod config;
pub mod constants;
pub mod contact;
pub mod datastore;
pub mod error;
pub mod hasher;
pub mod krpc;
pub mod lookup;
pub mod noise;
pub mod nodeaddr;
pub mod peertracker;
pub mod plugins;
pub mod protocol;
pub mod routing;
pub mod service;
pub mod stats;
