//! Broker client adapter
//!
//! `BrokerClient`/`BrokerConnector` are the seam to the broker client library.
//! `BrokerConn` wraps one client as a pooled `Resource`, and
//! `BrokerConnFactory` opens new ones against a broker list.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use crate::pool::{Resource, ResourceFactory};

const RESPONSE_LEN: usize = 13;
const STATUS_OK: u8 = 0;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("no brokers configured")]
    NoBrokers,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("broker rejected record with status {0}")]
    Rejected(u8),

    #[error("connection closed")]
    Closed,
}

/// A record to append to a topic
#[derive(Debug, Clone, Copy)]
pub struct ProduceRecord<'a> {
    pub topic: &'a str,
    pub key: Option<&'a [u8]>,
    pub value: &'a [u8],
}

/// Where the broker stored a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProduceAck {
    pub partition: i32,
    pub offset: i64,
}

/// One live connection to the broker cluster
#[async_trait]
pub trait BrokerClient: Send {
    async fn send(&mut self, record: &ProduceRecord<'_>) -> Result<ProduceAck, BrokerError>;

    fn is_open(&self) -> bool;

    fn close(&mut self);

    /// Address of the broker this client is talking to
    fn broker(&self) -> &str;
}

/// Opens broker clients against a broker list
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, brokers: &[String], attempt_timeout: Duration) -> Result<Box<dyn BrokerClient>, BrokerError>;
}

// ============================================================================
// Pooled adapter
// ============================================================================

/// A broker client owned by the connection pool
pub struct BrokerConn {
    id: u64,
    client: Box<dyn BrokerClient>,
}

impl BrokerConn {
    pub fn new(client: Box<dyn BrokerClient>) -> Self {
        Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::SeqCst) + 1,
            client,
        }
    }

    pub async fn send(&mut self, record: &ProduceRecord<'_>) -> Result<ProduceAck, BrokerError> {
        self.client.send(record).await
    }

    pub fn broker(&self) -> &str {
        self.client.broker()
    }
}

impl Resource for BrokerConn {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.client.is_open()
    }

    fn close(&mut self) {
        debug!(conn_id = self.id, broker = %self.client.broker(), "Closing broker connection");
        self.client.close();
    }
}

/// Pool factory that connects to a fixed broker list snapshot
pub struct BrokerConnFactory {
    brokers: Vec<String>,
    connector: Arc<dyn BrokerConnector>,
    connect_timeout: Duration,
}

impl BrokerConnFactory {
    pub fn new(brokers: Vec<String>, connector: Arc<dyn BrokerConnector>, connect_timeout: Duration) -> Self {
        Self { brokers, connector, connect_timeout }
    }

    pub fn brokers(&self) -> &[String] {
        &self.brokers
    }
}

#[async_trait]
impl ResourceFactory for BrokerConnFactory {
    type Resource = BrokerConn;
    type Error = BrokerError;

    async fn create(&self) -> Result<BrokerConn, BrokerError> {
        let started = Instant::now();
        match self.connector.connect(&self.brokers, self.connect_timeout).await {
            Ok(client) => {
                let conn = BrokerConn::new(client);
                debug!(
                    conn_id = conn.id,
                    broker = %conn.broker(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Broker connected"
                );
                Ok(conn)
            }
            Err(e) => {
                error!(
                    brokers = ?self.brokers,
                    error = %e,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Broker connect failed"
                );
                Err(e)
            }
        }
    }
}

// ============================================================================
// TCP client
// ============================================================================

/// Connects over TCP, trying each broker in order
#[derive(Debug, Clone)]
pub struct TcpConnector {
    request_timeout: Duration,
}

impl TcpConnector {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl BrokerConnector for TcpConnector {
    async fn connect(&self, brokers: &[String], attempt_timeout: Duration) -> Result<Box<dyn BrokerClient>, BrokerError> {
        let mut last_err = BrokerError::NoBrokers;

        for broker in brokers {
            match tokio::time::timeout(attempt_timeout, TcpStream::connect(broker.as_str())).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(Box::new(TcpBrokerClient {
                        broker: broker.clone(),
                        stream: Some(stream),
                        request_timeout: self.request_timeout,
                    }));
                }
                Ok(Err(e)) => {
                    warn!(broker = %broker, error = %e, "Failed to connect to broker");
                    last_err = BrokerError::Connect(format!("{}: {}", broker, e));
                }
                Err(_) => {
                    warn!(broker = %broker, timeout_ms = attempt_timeout.as_millis() as u64, "Broker connect timed out");
                    last_err = BrokerError::ConnectTimeout(attempt_timeout);
                }
            }
        }

        Err(last_err)
    }
}

/// Produce client speaking length-delimited frames.
///
/// Request: `u32 len | u16 topic_len | topic | i32 key_len (-1 = none) | key | value`.
/// Response: `u8 status | i32 partition | i64 offset`.
pub struct TcpBrokerClient {
    broker: String,
    stream: Option<TcpStream>,
    request_timeout: Duration,
}

impl TcpBrokerClient {
    async fn round_trip(stream: &mut TcpStream, frame: &[u8]) -> Result<[u8; RESPONSE_LEN], BrokerError> {
        stream.write_all(frame).await?;
        let mut resp = [0u8; RESPONSE_LEN];
        stream.read_exact(&mut resp).await?;
        Ok(resp)
    }
}

pub fn encode_produce_frame(record: &ProduceRecord<'_>) -> BytesMut {
    let key_len = record.key.map(|k| k.len()).unwrap_or(0);
    let body_len = 2 + record.topic.len() + 4 + key_len + record.value.len();

    let mut buf = BytesMut::with_capacity(4 + body_len);
    buf.put_u32(body_len as u32);
    buf.put_u16(record.topic.len() as u16);
    buf.put_slice(record.topic.as_bytes());
    match record.key {
        Some(key) => {
            buf.put_i32(key.len() as i32);
            buf.put_slice(key);
        }
        None => buf.put_i32(-1),
    }
    buf.put_slice(record.value);
    buf
}

pub fn decode_produce_response(mut resp: &[u8]) -> Result<ProduceAck, BrokerError> {
    let status = resp.get_u8();
    if status != STATUS_OK {
        return Err(BrokerError::Rejected(status));
    }
    Ok(ProduceAck {
        partition: resp.get_i32(),
        offset: resp.get_i64(),
    })
}

#[async_trait]
impl BrokerClient for TcpBrokerClient {
    async fn send(&mut self, record: &ProduceRecord<'_>) -> Result<ProduceAck, BrokerError> {
        if record.topic.len() > u16::MAX as usize {
            return Err(BrokerError::Rejected(u8::MAX));
        }
        let frame = encode_produce_frame(record);
        // Held outside `self` until the response is read, so a dropped send
        // leaves the client closed instead of mid-frame
        let mut stream = self.stream.take().ok_or(BrokerError::Closed)?;

        let result = match tokio::time::timeout(self.request_timeout, Self::round_trip(&mut stream, &frame)).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout(self.request_timeout)),
        };

        let resp = result?;
        self.stream = Some(stream);
        decode_produce_response(&resp)
    }

    fn is_open(&self) -> bool {
        let Some(stream) = self.stream.as_ref() else {
            return false;
        };
        let mut probe = [0u8; 1];
        match stream.try_read(&mut probe) {
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
            // EOF, unsolicited bytes or a socket error
            _ => false,
        }
    }

    fn close(&mut self) {
        self.stream = None;
    }

    fn broker(&self) -> &str {
        &self.broker
    }
}
