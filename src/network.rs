//! Peer listener
//!
//! A small TCP protocol over newline-delimited JSON frames. The listener
//! greets every connection, answers current-block queries from the chain, and
//! reports malformed frames back to the peer. It never mutates chain state.

use crate::chain::Chain;
use crate::error::{ChainError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

pub const CMD_WELCOME: u8 = 0x01;
pub const CMD_ERROR: u8 = 0x02;
pub const CMD_CURRENT_BLOCK: u8 = 0x03;

pub const ERR_JSON_PARSING: u8 = 0x01;
pub const ERR_UNKNOWN_COMMAND: u8 = 0x02;

/// One protocol frame; a single JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "c")]
    pub command: u8,
    #[serde(rename = "ec", default)]
    pub error_code: u8,
    #[serde(rename = "em", default)]
    pub error_msg: String,
    #[serde(rename = "d", default)]
    pub data: Vec<u8>,
}

impl Frame {
    pub fn command(command: u8, data: Vec<u8>) -> Self {
        Frame {
            command,
            error_code: 0,
            error_msg: String::new(),
            data,
        }
    }

    pub fn error(error_code: u8, error_msg: impl Into<String>) -> Self {
        Frame {
            command: CMD_ERROR,
            error_code,
            error_msg: error_msg.into(),
            data: Vec::new(),
        }
    }
}

pub struct PeerListener {
    chain: Arc<Chain>,
}

impl PeerListener {
    pub fn new(chain: Arc<Chain>) -> Self {
        PeerListener { chain }
    }

    /// Binds and serves forever.
    pub async fn run(&self, port: u16) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| ChainError::Network(format!("cannot listen on port {}: {}", port, e)))?;
        info!("Node server listening on port {}", port);
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    info!("New connection {}", addr);
                    let chain = self.chain.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(chain, socket).await {
                            warn!("Peer {} dropped: {}", addr, e);
                        }
                    });
                }
                Err(e) => warn!("New connection error: {}", e),
            }
        }
    }
}

async fn handle_client(chain: Arc<Chain>, socket: TcpStream) -> Result<()> {
    let peer = socket
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let (read_half, mut write_half) = socket.into_split();

    send_frame(
        &mut write_half,
        &Frame::command(CMD_WELCOME, b"Welcome!".to_vec()),
    )
    .await?;

    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| ChainError::Network(e.to_string()))?
    {
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Frame>(&line) {
            Ok(frame) => match frame.command {
                CMD_CURRENT_BLOCK => {
                    let data = match chain.current_block() {
                        Ok(Some(block)) => serde_json::to_vec(&block)?,
                        Ok(None) => Vec::new(),
                        Err(e) => {
                            warn!("Cannot answer {} with the current block: {}", peer, e);
                            Vec::new()
                        }
                    };
                    send_frame(&mut write_half, &Frame::command(CMD_CURRENT_BLOCK, data)).await?;
                }
                other => {
                    send_frame(
                        &mut write_half,
                        &Frame::error(
                            ERR_UNKNOWN_COMMAND,
                            format!("Unknown command {:#04x}", other),
                        ),
                    )
                    .await?;
                }
            },
            Err(e) => {
                warn!("Error from {}: {}", peer, e);
                send_frame(
                    &mut write_half,
                    &Frame::error(ERR_JSON_PARSING, "Error parsing json data"),
                )
                .await?;
            }
        }
    }

    info!("{} disconnected.", peer);
    Ok(())
}

async fn send_frame(writer: &mut OwnedWriteHalf, frame: &Frame) -> Result<()> {
    let mut bytes = serde_json::to_vec(frame)?;
    bytes.push(b'\n');
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| ChainError::Network(e.to_string()))
}
