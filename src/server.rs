//! TCP listener for wasp client connections.
//!
//! The node owns the ledger backend; every accepted connection gets its own
//! adapter instance, since adapters carry per-connection event handler
//! slots.

use crate::connector::WaspConnector;
use crate::ledger::{EmulatorLedger, Ledger, TangleLedger, TangleSource};
use crate::utxodb::confirm::ConfirmEmulator;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct BridgeNode {
    make_ledger: Box<dyn Fn() -> Arc<dyn Ledger> + Send + Sync>,
}

impl BridgeNode {
    /// Bridge backed by the in-memory UTXO emulator.
    pub fn with_emulator(emulator: Arc<ConfirmEmulator>) -> Self {
        BridgeNode {
            make_ledger: Box::new(move || Arc::new(EmulatorLedger::new(emulator.clone()))),
        }
    }

    /// Bridge backed by an external value tangle.
    pub fn with_tangle(source: Arc<dyn TangleSource>) -> Self {
        BridgeNode {
            make_ledger: Box::new(move || Arc::new(TangleLedger::new(source.clone()))),
        }
    }

    /// A fresh adapter bound to the backend.
    pub fn connect_ledger(&self) -> Arc<dyn Ledger> {
        (self.make_ledger)()
    }
}

pub struct BridgeServer {
    listener: TcpListener,
    node: Arc<BridgeNode>,
}

impl BridgeServer {
    pub async fn bind(addr: &str, node: Arc<BridgeNode>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(BridgeServer { listener, node })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop: one connection engine per incoming client. Cancelling
    /// the token closes the listener and tears down every connection.
    pub async fn run(self, token: CancellationToken) {
        match self.listener.local_addr() {
            Ok(addr) => info!("listening for wasp connections on {}", addr),
            Err(_) => info!("listening for wasp connections"),
        }
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("accepted connection from {}", peer);
                        WaspConnector::start(
                            stream,
                            peer,
                            self.node.connect_ledger(),
                            token.clone(),
                        );
                    }
                    Err(e) => warn!("accept failed: {}", e),
                },
            }
        }
        info!("wasp listener stopped");
    }
}
