//! src/transport/serial.rs
//!
//! The radio transport: a half-duplex line channel over a serial port,
//! typically a LoRa modem. Framing is one datagram per line, base64-encoded
//! and newline-terminated. Malformed lines are skipped. There is no source
//! address on this bearer.

use crate::error::{Error, Result};
use crate::transport::{Frame, Transport};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Default ceiling on one framed line. The radio's line buffer is small;
/// frames that would not fit are refused at `send` rather than truncated.
pub const DEFAULT_MAX_FRAME: usize = 8 * 1024;

const INBOUND_BUFFER: usize = 64;

pub struct SerialTransport {
    port_name: String,
    baud: u32,
    max_frame: usize,
    state: Mutex<Option<SerialState>>,
}

struct SerialState {
    writer: WriteHalf<SerialStream>,
    inbound_rx: mpsc::Receiver<Vec<u8>>,
    reader: JoinHandle<()>,
}

impl SerialTransport {
    pub fn new(port_name: String, baud: u32) -> Self {
        Self {
            port_name,
            baud,
            max_frame: DEFAULT_MAX_FRAME,
            state: Mutex::new(None),
        }
    }

    /// Wires a freshly opened stream into the transport: spawns the reader
    /// task that decodes incoming lines onto an internal channel.
    fn attach(stream: SerialStream) -> SerialState {
        let (read_half, writer) = tokio::io::split(stream);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let reader = tokio::spawn(read_lines(read_half, inbound_tx));
        SerialState {
            writer,
            inbound_rx,
            reader,
        }
    }
}

async fn read_lines(read_half: ReadHalf<SerialStream>, inbound_tx: mpsc::Sender<Vec<u8>>) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match decode_line(&line) {
                Some(data) => {
                    if inbound_tx.send(data).await.is_err() {
                        break;
                    }
                }
                None => tracing::debug!(len = line.len(), "Skipping malformed serial line"),
            },
            Ok(None) => {
                tracing::warn!("Serial line closed");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Serial read failed");
                break;
            }
        }
    }
}

/// One outbound datagram as a framed line, terminator included.
fn encode_line(data: &[u8]) -> String {
    let mut line = B64.encode(data);
    line.push('\n');
    line
}

/// Decodes one received line; `None` when it is not valid base64.
fn decode_line(line: &str) -> Option<Vec<u8>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    B64.decode(trimmed).ok()
}

#[async_trait]
impl Transport for SerialTransport {
    fn name(&self) -> &'static str {
        "serial"
    }

    async fn start(&self) -> Result<()> {
        let stream = tokio_serial::new(&self.port_name, self.baud).open_native_async()?;
        tracing::info!(port = %self.port_name, baud = self.baud, "Serial transport opened");
        *self.state.lock().await = Some(Self::attach(stream));
        Ok(())
    }

    async fn send(&self, data: &[u8], _dest: Option<&str>) -> Result<()> {
        let line = encode_line(data);
        if line.len() > self.max_frame {
            return Err(Error::Transport(format!(
                "frame of {} bytes exceeds radio line buffer",
                line.len()
            )));
        }

        let mut state = self.state.lock().await;
        let state = state
            .as_mut()
            .ok_or_else(|| Error::Transport("serial transport not started".into()))?;
        state
            .writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Transport(format!("serial write: {e}")))?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Frame>> {
        let mut state = self.state.lock().await;
        let state = state
            .as_mut()
            .ok_or_else(|| Error::Transport("serial transport not started".into()))?;
        match state.inbound_rx.try_recv() {
            Ok(data) => Ok(Some(Frame { data, source: None })),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Ok(None),
        }
    }

    async fn stop(&self) {
        if let Some(state) = self.state.lock().await.take() {
            state.reader.abort();
        }
    }
}

// --- Unit Tests ---
