//! # rowtap-pipe
//!
//! Named-topic message transports. A [`Pipe`] hands out producer and
//! consumer endpoints for a topic; the pipeline never passes component
//! references around, reader and streamer meet only at topic names.
//!
//! Three transports: Kafka (partitioned, broker-side offsets), file
//! (directory per topic, rotating segments) and local (in-memory, for
//! single-process mode and tests).

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use rowtap_core::config::InitialOffset;
use rowtap_core::AppConfig;

pub mod file;
pub mod kafka;
pub mod local;

pub use file::FilePipe;
pub use kafka::KafkaPipe;
pub use local::LocalPipe;

#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error("cannot consume non delimited file")]
    NotDelimited,
    #[error("unknown pipe type: {0}")]
    UnknownKind(String),
    #[error("topic closed")]
    Closed,
    #[error("no message fetched")]
    NothingFetched,
    #[error("kafka: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, PipeError>;

/// One fetched message: payload plus optional partition key.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub payload: Vec<u8>,
    pub key: Option<String>,
}

/// A topic transport able to mint producers and consumers.
#[async_trait]
pub trait Pipe: Send + Sync {
    /// Registry key of this transport.
    fn kind(&self) -> &'static str;

    async fn new_producer(&self, topic: &str) -> Result<Box<dyn Producer>>;

    async fn new_consumer(&self, topic: &str) -> Result<Box<dyn Consumer>>;
}

/// Producing endpoint of one topic. Owned by exactly one component.
#[async_trait]
pub trait Producer: Send {
    /// Declare the payload format before the first push.
    fn set_format(&mut self, format: &str);

    async fn push(&mut self, payload: Vec<u8>) -> Result<()>;

    async fn push_keyed(&mut self, key: String, payload: Vec<u8>) -> Result<()>;

    async fn push_batch(&mut self, batch: Vec<(Option<String>, Vec<u8>)>) -> Result<()> {
        for (key, payload) in batch {
            match key {
                Some(k) => self.push_keyed(k, payload).await?,
                None => self.push(payload).await?,
            }
        }
        Ok(())
    }

    /// Emit schema bytes so a fresh consumer sees them before data.
    ///
    /// Kafka/local publish the schema as the next message; the file pipe
    /// embeds it in the next segment's header.
    async fn push_schema(&mut self, key: String, schema: Vec<u8>) -> Result<()>;

    /// Flush and finalize.
    async fn close(&mut self) -> Result<()>;
}

/// Consuming endpoint of one topic.
///
/// The fetch/pop split mirrors a cursor: `fetch_next` blocks (bounded
/// polls, shutdown-aware) until a message or a terminal error is ready and
/// returns `false` only on shutdown/close; `pop` then yields it.
#[async_trait]
pub trait Consumer: Send {
    async fn fetch_next(&mut self) -> bool;

    fn pop(&mut self) -> Result<Message>;

    /// Commit position and release.
    async fn close(&mut self) -> Result<()>;

    /// Release without committing position, for failure paths.
    async fn close_on_failure(&mut self) -> Result<()>;
}

/// Build-time registry of pipe constructors, keyed by kind.
type Constructor = fn(&AppConfig, CancellationToken) -> Box<dyn Pipe>;

static PIPES: &[(&str, Constructor)] = &[
    ("kafka", |cfg, ctx| Box::new(KafkaPipe::new(cfg, ctx))),
    ("file", |cfg, ctx| Box::new(FilePipe::new(cfg, ctx))),
    ("local", |cfg, ctx| Box::new(LocalPipe::new(cfg, ctx))),
];

/// Registered pipe kinds.
pub fn kinds() -> Vec<&'static str> {
    PIPES.iter().map(|(k, _)| *k).collect()
}

/// Construct a pipe of the given kind.
pub fn create(
    kind: &str,
    cfg: &AppConfig,
    shutdown: CancellationToken,
) -> Result<std::sync::Arc<dyn Pipe>> {
    for (key, ctor) in PIPES {
        if *key == kind {
            return Ok(std::sync::Arc::from(ctor(cfg, shutdown)));
        }
    }
    Err(PipeError::UnknownKind(kind.to_string()))
}

/// Poll cadence for blocking fetches against quiescent topics.
pub(crate) const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(50);

pub(crate) fn offset_is_oldest(cfg: &AppConfig) -> bool {
    cfg.initial_offset == InitialOffset::Oldest
}
