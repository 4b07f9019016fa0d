//! Administrative HTTP endpoints: thin JSON handlers over the ledger
//! adapter, served over raw TCP.
//!
//! Routes:
//! - `GET /utxodb/outputs/:address`: confirmed outputs of an address
//! - `GET /utxodb/confirmed/:txid`: confirmation flag of a transaction
//! - `POST /utxodb/tx`: submit a base58-encoded transaction
//! - `GET /utxodb/requestfunds/:address`: drive the faucet
//! - `GET /adm/shutdown`: trigger graceful shutdown

use crate::ledger::Ledger;
use crate::transaction::Transaction;
use crate::types::{Address, TxId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct GetAddressOutputsResponse {
    pub address: String,
    pub outputs: HashMap<String, Vec<OutputBalance>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct OutputBalance {
    pub value: i64,
    pub color: String,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct IsConfirmedResponse {
    pub confirmed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct PostTransactionRequest {
    pub tx: String,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct PostTransactionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct RequestFundsResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

pub struct WebApiServer {
    listener: TcpListener,
    ledger: Arc<dyn Ledger>,
    shutdown: CancellationToken,
}

impl WebApiServer {
    pub async fn bind(
        addr: &str,
        ledger: Arc<dyn Ledger>,
        shutdown: CancellationToken,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(WebApiServer {
            listener,
            ledger,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) {
        match self.listener.local_addr() {
            Ok(addr) => info!("web API listening on {}", addr),
            Err(_) => info!("web API listening"),
        }
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, _)) => {
                        let ledger = self.ledger.clone();
                        let shutdown = self.shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(socket, ledger, shutdown).await {
                                debug!("web API error: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("web API accept failed: {}", e),
                },
            }
        }
        info!("web API stopped");
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    ledger: Arc<dyn Ledger>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let mut buffer = vec![0u8; 64 * 1024];
    let bytes_read = socket.read(&mut buffer).await?;
    if bytes_read == 0 {
        return Ok(());
    }

    let Some(request) = parse_request(&buffer[..bytes_read]) else {
        let body = PostTransactionResponse {
            err: Some("malformed request".to_string()),
        };
        return respond(&mut socket, 400, &body).await;
    };

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", path) if path.starts_with("/utxodb/outputs/") => {
            handle_get_address_outputs(&mut socket, &ledger, last_segment(path)).await
        }
        ("GET", path) if path.starts_with("/utxodb/confirmed/") => {
            handle_is_confirmed(&mut socket, &ledger, last_segment(path)).await
        }
        ("POST", "/utxodb/tx") => handle_post_transaction(&mut socket, &ledger, &request.body).await,
        ("GET", path) if path.starts_with("/utxodb/requestfunds/") => {
            handle_request_funds(&mut socket, &ledger, last_segment(path)).await
        }
        ("GET", "/adm/shutdown") => {
            info!("shutdown requested from web API");
            shutdown.cancel();
            respond(&mut socket, 200, &RequestFundsResponse::default()).await
        }
        _ => {
            let body = PostTransactionResponse {
                err: Some("no such endpoint".to_string()),
            };
            respond(&mut socket, 404, &body).await
        }
    }
}

async fn handle_get_address_outputs(
    socket: &mut TcpStream,
    ledger: &Arc<dyn Ledger>,
    param: &str,
) -> std::io::Result<()> {
    debug!("handle_get_address_outputs: {}", param);
    let addr: Address = match param.parse() {
        Ok(addr) => addr,
        Err(e) => {
            let body = GetAddressOutputsResponse {
                err: Some(e),
                ..Default::default()
            };
            return respond(socket, 400, &body).await;
        }
    };
    match ledger.get_confirmed_address_outputs(&addr) {
        Ok(outputs) => {
            let mut out = HashMap::new();
            for (output_id, balances) in outputs {
                let entry = balances
                    .iter()
                    .map(|b| OutputBalance {
                        value: b.value,
                        color: b.color.to_string(),
                    })
                    .collect();
                out.insert(output_id.to_string(), entry);
            }
            let body = GetAddressOutputsResponse {
                address: param.to_string(),
                outputs: out,
                err: None,
            };
            respond(socket, 200, &body).await
        }
        Err(e) => {
            let body = GetAddressOutputsResponse {
                err: Some(e.to_string()),
                ..Default::default()
            };
            respond(socket, 500, &body).await
        }
    }
}

async fn handle_is_confirmed(
    socket: &mut TcpStream,
    ledger: &Arc<dyn Ledger>,
    param: &str,
) -> std::io::Result<()> {
    let txid: TxId = match param.parse() {
        Ok(txid) => txid,
        Err(e) => {
            let body = IsConfirmedResponse {
                err: Some(e),
                ..Default::default()
            };
            return respond(socket, 400, &body).await;
        }
    };
    match ledger.is_confirmed(&txid) {
        Ok(confirmed) => {
            debug!("handle_is_confirmed: {} confirmed = {}", txid, confirmed);
            let body = IsConfirmedResponse {
                confirmed,
                err: None,
            };
            respond(socket, 200, &body).await
        }
        Err(e) => {
            let body = IsConfirmedResponse {
                err: Some(e.to_string()),
                ..Default::default()
            };
            respond(socket, 500, &body).await
        }
    }
}

async fn handle_post_transaction(
    socket: &mut TcpStream,
    ledger: &Arc<dyn Ledger>,
    body: &str,
) -> std::io::Result<()> {
    let request: PostTransactionRequest = match serde_json::from_str(body.trim_end_matches('\0')) {
        Ok(request) => request,
        Err(e) => {
            let body = PostTransactionResponse {
                err: Some(format!("parse error: {}", e)),
            };
            return respond(socket, 400, &body).await;
        }
    };
    let tx_bytes = match bs58::decode(&request.tx).into_vec() {
        Ok(bytes) => bytes,
        Err(e) => {
            let body = PostTransactionResponse {
                err: Some(e.to_string()),
            };
            return respond(socket, 400, &body).await;
        }
    };
    let tx = match Transaction::from_bytes(&tx_bytes) {
        Ok(tx) => tx,
        Err(e) => {
            let body = PostTransactionResponse {
                err: Some(e.to_string()),
            };
            return respond(socket, 400, &body).await;
        }
    };

    debug!("handle_post_transaction: {}", tx.id());
    match ledger.post_transaction(tx) {
        Ok(()) => respond(socket, 200, &PostTransactionResponse::default()).await,
        Err(e) => {
            let body = PostTransactionResponse {
                err: Some(e.to_string()),
            };
            respond(socket, 409, &body).await
        }
    }
}

async fn handle_request_funds(
    socket: &mut TcpStream,
    ledger: &Arc<dyn Ledger>,
    param: &str,
) -> std::io::Result<()> {
    let addr: Address = match param.parse() {
        Ok(addr) => addr,
        Err(e) => {
            let body = RequestFundsResponse { err: Some(e) };
            return respond(socket, 400, &body).await;
        }
    };
    match ledger.request_funds(&addr) {
        Ok(()) => respond(socket, 200, &RequestFundsResponse::default()).await,
        Err(e) => {
            let body = RequestFundsResponse {
                err: Some(e.to_string()),
            };
            respond(socket, 500, &body).await
        }
    }
}

struct HttpRequest {
    method: String,
    path: String,
    body: String,
}

fn parse_request(raw: &[u8]) -> Option<HttpRequest> {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text.lines();
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let body = if let Some(idx) = text.find("\r\n\r\n") {
        text[idx + 4..].to_string()
    } else if let Some(idx) = text.find("\n\n") {
        text[idx + 2..].to_string()
    } else {
        String::new()
    };

    Some(HttpRequest { method, path, body })
}

fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

async fn respond<T: Serialize>(
    socket: &mut TcpStream,
    status: u16,
    body: &T,
) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        409 => "Conflict",
        _ => "Internal Server Error",
    };
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    let response = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        reason,
        json.len(),
        json
    );
    socket.write_all(response.as_bytes()).await?;
    socket.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get_request() {
        let raw = b"GET /utxodb/outputs/abc123 HTTP/1.1\r\nHost: x\r\n\r\n";
        let request = parse_request(raw).unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/utxodb/outputs/abc123");
        assert_eq!(last_segment(&request.path), "abc123");
        assert!(request.body.is_empty());
    }

    #[test]
    fn test_parse_post_request_with_body() {
        let raw = b"POST /utxodb/tx HTTP/1.1\r\nContent-Length: 12\r\n\r\n{\"tx\":\"abc\"}";
        let request = parse_request(raw).unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/utxodb/tx");
        assert_eq!(request.body, "{\"tx\":\"abc\"}");
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(parse_request(b"").is_none());
    }

    #[test]
    fn test_error_field_omitted_when_none() {
        let body = IsConfirmedResponse {
            confirmed: true,
            err: None,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(json, "{\"confirmed\":true}");
    }
}
