//! In-memory pipe for single-process mode and tests.
//!
//! Topic buffers live inside the pipe instance; producers append,
//! consumers keep a private cursor. Offset semantics match the other
//! transports: `newest` consumers start at the current end of the buffer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use rowtap_core::AppConfig;

use super::{offset_is_oldest, Consumer, Message, Pipe, PipeError, Producer, Result, POLL_INTERVAL};

#[derive(Default)]
struct TopicBuf {
    messages: Mutex<Vec<Message>>,
    notify: Notify,
}

pub struct LocalPipe {
    topics: Mutex<HashMap<String, Arc<TopicBuf>>>,
    start_oldest: bool,
    shutdown: CancellationToken,
}

impl LocalPipe {
    pub fn new(cfg: &AppConfig, shutdown: CancellationToken) -> Self {
        LocalPipe {
            topics: Mutex::new(HashMap::new()),
            start_oldest: offset_is_oldest(cfg),
            shutdown,
        }
    }

    fn topic(&self, name: &str) -> Arc<TopicBuf> {
        let mut topics = self.topics.lock().expect("local pipe poisoned");
        topics.entry(name.to_string()).or_default().clone()
    }
}

#[async_trait]
impl Pipe for LocalPipe {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn new_producer(&self, topic: &str) -> Result<Box<dyn Producer>> {
        Ok(Box::new(LocalProducer { topic: self.topic(topic) }))
    }

    async fn new_consumer(&self, topic: &str) -> Result<Box<dyn Consumer>> {
        let buf = self.topic(topic);
        let cursor = if self.start_oldest {
            0
        } else {
            buf.messages.lock().expect("local pipe poisoned").len()
        };
        Ok(Box::new(LocalConsumer {
            topic: buf,
            cursor,
            shutdown: self.shutdown.clone(),
            fetched: None,
        }))
    }
}

pub struct LocalProducer {
    topic: Arc<TopicBuf>,
}

impl LocalProducer {
    fn append(&self, key: Option<String>, payload: Vec<u8>) {
        self.topic
            .messages
            .lock()
            .expect("local pipe poisoned")
            .push(Message { payload, key });
        self.topic.notify.notify_waiters();
    }
}

#[async_trait]
impl Producer for LocalProducer {
    fn set_format(&mut self, _format: &str) {}

    async fn push(&mut self, payload: Vec<u8>) -> Result<()> {
        self.append(None, payload);
        Ok(())
    }

    async fn push_keyed(&mut self, key: String, payload: Vec<u8>) -> Result<()> {
        self.append(Some(key), payload);
        Ok(())
    }

    async fn push_schema(&mut self, key: String, schema: Vec<u8>) -> Result<()> {
        self.append(Some(key), schema);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct LocalConsumer {
    topic: Arc<TopicBuf>,
    cursor: usize,
    shutdown: CancellationToken,
    fetched: Option<Result<Message>>,
}

#[async_trait]
impl Consumer for LocalConsumer {
    async fn fetch_next(&mut self) -> bool {
        if self.fetched.is_some() {
            return true;
        }
        loop {
            let notified = self.topic.notify.notified();
            {
                let messages = self.topic.messages.lock().expect("local pipe poisoned");
                if self.cursor < messages.len() {
                    self.fetched = Some(Ok(messages[self.cursor].clone()));
                    self.cursor += 1;
                    return true;
                }
            }
            if self.shutdown.is_cancelled() {
                return false;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = notified => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    fn pop(&mut self) -> Result<Message> {
        self.fetched.take().unwrap_or(Err(PipeError::NothingFetched))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close_on_failure(&mut self) -> Result<()> {
        Ok(())
    }
}
