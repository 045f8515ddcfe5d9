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

//! Standalone DHT peer binary. Grounded on
//! `original_source/theseus/app.py`'s minimal `Application`/`PeerService`
//! wiring, re-expressed as a `structopt` CLI over an `async-std` runtime
//! instead of a Twisted `Application`.

use argonet::config::Config;
use argonet::hasher::Hasher;
use argonet::plugins::SourceTrust;
use argonet::service::PeerService;
use log::info;
use std::sync::Arc;
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "argonet", about = "A Kademlia-style DHT peer with memory-hard identities")]
struct Opt {
    /// Overrides the config/data directory (defaults to $THESEUSHOME or ~/.theseus).
    #[structopt(long)]
    home: Option<String>,
}

#[async_std::main]
async fn main() {
    env_logger::init();
    let opt = Opt::from_args();
    if let Some(home) = opt.home {
        std::env::set_var("THESEUSHOME", home);
    }

    let config = Config::load();
    info!("loaded config from {:?}", config.path());

    let hasher = Arc::new(Hasher::new());
    let service = PeerService::new(config, hasher).await;

    let port = match service.start(Vec::new()).await {
        Ok(port) => port,
        Err(e) => {
            eprintln!("failed to start listening: {}", e);
            std::process::exit(1);
        }
    };
    info!("peer listening on port {}", port);
    // No peer-source plugins are compiled into this binary; a deployment
    // that bundles one (a bootstrap list, a rendezvous client, ...) would
    // pass it here instead of an empty vec.
    service.bootstrap(Vec::new(), SourceTrust::Open).await;
    service.spawn_node_rotation();

    wait_for_shutdown_signal().await;
    info!("shutting down");
}

/// Blocks until SIGINT/SIGTERM (or Ctrl-C on platforms without the
/// latter), bridging `ctrlc`'s synchronous callback into the async
/// runtime with a one-shot channel.
async fn wait_for_shutdown_signal() {
    let (tx, rx) = async_std::channel::bounded::<()>(1);
    let result = ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    });
    if result.is_err() {
        std::future::pending::<()>().await;
        return;
    }
    let _ = rx.recv().await;
}
