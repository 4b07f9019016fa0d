//! Per-connection engine for one attached wasp client.
//!
//! Each accepted connection runs two cooperating tasks: a read loop pulling
//! framed messages off the socket and an event dispatch loop draining the
//! inbound ledger-event queue. The engine filters ledger events down to the
//! addresses the client subscribed to and answers its queries through the
//! ledger adapter. Teardown is driven by one cancellation token: peer close,
//! read errors and host shutdown all funnel into it.

mod inbound;
mod outbound;

use crate::chopper::Chopper;
use crate::ledger::{Ledger, LedgerEvent};
use crate::transaction::Transaction;
use crate::types::Address;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the inbound ledger-event queue. When a stalled client lets
/// the queue fill up, events are dropped with a log line; ledger callbacks
/// are never blocked.
const EVENT_QUEUE_CAPACITY: usize = 256;

pub struct WaspConnector {
    id: Mutex<Option<String>>,
    remote: SocketAddr,
    writer: tokio::sync::Mutex<BufWriter<OwnedWriteHalf>>,
    subscriptions: RwLock<HashSet<Address>>,
    chopper: Chopper,
    ledger: Arc<dyn Ledger>,
    events_tx: mpsc::Sender<LedgerEvent>,
    token: CancellationToken,
}

impl WaspConnector {
    /// Attach the engine to an accepted connection and spawn its tasks.
    /// The returned handle resolves once the connection is torn down.
    pub fn start(
        stream: TcpStream,
        remote: SocketAddr,
        ledger: Arc<dyn Ledger>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let (read_half, write_half) = stream.into_split();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let token = shutdown.child_token();

        let conn = Arc::new(WaspConnector {
            id: Mutex::new(None),
            remote,
            writer: tokio::sync::Mutex::new(BufWriter::new(write_half)),
            subscriptions: RwLock::new(HashSet::new()),
            chopper: Chopper::new(),
            ledger,
            events_tx,
            token: token.clone(),
        });

        conn.attach_ledger_hooks();
        let gc_task = conn.chopper.spawn_gc(token.clone());

        let read_task = tokio::spawn({
            let conn = conn.clone();
            async move { conn.read_loop(BufReader::new(read_half)).await }
        });
        let event_task = tokio::spawn({
            let conn = conn.clone();
            async move { conn.event_loop(events_rx).await }
        });

        tokio::spawn(async move {
            token.cancelled().await;
            conn.detach().await;
            let _ = read_task.await;
            let _ = event_task.await;
            gc_task.abort();
            info!("{}: connection closed", conn.id());
        })
    }

    /// Connection id for logging: the client's chosen name, or
    /// `wasp_<peer-addr>` until a `SetId` message arrives.
    pub fn id(&self) -> String {
        self.id
            .lock()
            .clone()
            .unwrap_or_else(|| format!("wasp_{}", self.remote))
    }

    fn set_id(&self, id: String) {
        info!("connection id set to '{}' for {}", id, self.remote);
        *self.id.lock() = Some(id);
    }

    fn subscribe(&self, addr: &Address) {
        if self.subscriptions.write().insert(*addr) {
            debug!("{}: subscribed to address {}", self.id(), addr);
        }
    }

    fn is_subscribed(&self, addr: &Address) -> bool {
        self.subscriptions.read().contains(addr)
    }

    /// Output addresses of `tx` the client subscribed to.
    fn subscribed_output_addresses(&self, tx: &Transaction) -> Vec<Address> {
        let subscriptions = self.subscriptions.read();
        tx.output_addresses()
            .filter(|addr| subscriptions.contains(addr))
            .copied()
            .collect()
    }

    /// Register the three adapter hooks. Each enqueues a tagged event
    /// without ever blocking the emitting side.
    fn attach_ledger_hooks(&self) {
        let label = self.id();

        let tx_queue = self.events_tx.clone();
        let tag = label.clone();
        self.ledger.on_transaction_confirmed(Box::new(move |tx| {
            enqueue(&tx_queue, &tag, LedgerEvent::Confirmed(tx));
        }));

        let tx_queue = self.events_tx.clone();
        let tag = label.clone();
        self.ledger
            .on_transaction_booked(Box::new(move |tx, decision_pending| {
                enqueue(&tx_queue, &tag, LedgerEvent::Booked(tx, decision_pending));
            }));

        let tx_queue = self.events_tx.clone();
        self.ledger.on_transaction_rejected(Box::new(move |tx| {
            enqueue(&tx_queue, &label, LedgerEvent::Rejected(tx));
        }));
    }

    async fn read_loop(self: Arc<Self>, mut reader: BufReader<OwnedReadHalf>) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                frame = crate::wire::framing::read_frame(&mut reader) => match frame {
                    Ok(Some(data)) => self.process_msg_data(data).await,
                    // EOF and closed connections are the peer's business
                    Ok(None) => break,
                    Err(e) => {
                        if !is_closed_connection(&e) {
                            warn!("{}: read error: {}", self.id(), e);
                        }
                        break;
                    }
                },
            }
        }
        self.token.cancel();
    }

    async fn event_loop(self: Arc<Self>, mut events_rx: mpsc::Receiver<LedgerEvent>) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                event = events_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
    }

    /// Unhook from the adapter and close the socket. Idempotent.
    async fn detach(&self) {
        self.ledger.detach();
        let _ = self.writer.lock().await.shutdown().await;
        debug!("{}: detached", self.id());
    }
}

fn enqueue(queue: &mpsc::Sender<LedgerEvent>, label: &str, event: LedgerEvent) {
    match queue.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("{}: inbound event queue full, dropping ledger event", label);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

fn is_closed_connection(err: &crate::wire::WireError) -> bool {
    matches!(
        err,
        crate::wire::WireError::Io(e)
            if e.kind() == std::io::ErrorKind::ConnectionReset
                || e.kind() == std::io::ErrorKind::ConnectionAborted
                || e.kind() == std::io::ErrorKind::NotConnected
    )
}
