//! waspconnd, the bridge node between a DAG-based value ledger and wasp
//! smart-contract clients.
//!
//! Wasp clients connect over TCP, subscribe to the addresses they care
//! about and receive a filtered live feed of ledger events; in the other
//! direction they submit transactions and poll for backlog, balances and
//! inclusion state. The ledger side is served either by an in-memory UTXO
//! emulator or by an external value tangle behind the
//! [`ledger::TangleSource`] seam.

pub mod chopper;
pub mod config;
pub mod connector;
pub mod error;
pub mod ledger;
pub mod server;
pub mod shutdown;
pub mod transaction;
pub mod types;
pub mod utxodb;
pub mod webapi;
pub mod wire;
