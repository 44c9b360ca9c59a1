//! File-backed pipe: one directory per topic, zero-padded segment files.
//!
//! Segment layout: one JSON header line, then framed messages. The header
//! carries the payload format, the delimited marker, an optional embedded
//! schema (base64) and the SHA256 of every data byte written after the
//! header. The digest field has fixed width, so it is patched in place
//! when the segment is finalized.
//!
//! Framing in delimited mode: text formats (`json`, `text`) terminate each
//! message with `\n`; anything else is binary and gets an unsigned LEB128
//! length prefix. Non-delimited segments are plain concatenation and can
//! be written but never consumed.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use rowtap_core::AppConfig;

use super::{offset_is_oldest, Consumer, Message, Pipe, PipeError, Producer, Result, POLL_INTERVAL};

/// Per-segment header line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHeader {
    #[serde(rename = "Format")]
    pub format: String,
    #[serde(rename = "Delimited", default, skip_serializing_if = "std::ops::Not::not")]
    pub delimited: bool,
    #[serde(
        rename = "Schema",
        default,
        skip_serializing_if = "Option::is_none",
        with = "schema_b64"
    )]
    pub schema: Option<Vec<u8>>,
    #[serde(rename = "SHA256")]
    pub sha256: String,
}

mod schema_b64 {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_str(&BASE64.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(d)?;
        match text {
            Some(t) => BASE64
                .decode(t.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

pub struct FilePipe {
    base_dir: PathBuf,
    max_file_size: u64,
    delimited: bool,
    start_oldest: bool,
    shutdown: CancellationToken,
}

impl FilePipe {
    pub fn new(cfg: &AppConfig, shutdown: CancellationToken) -> Self {
        FilePipe {
            base_dir: cfg.data_dir.clone(),
            max_file_size: cfg.max_file_size,
            delimited: cfg.delimited,
            start_oldest: offset_is_oldest(cfg),
            shutdown,
        }
    }

    fn topic_dir(&self, topic: &str) -> PathBuf {
        self.base_dir.join(topic)
    }

    /// Concrete consumer, used directly by tests that inspect headers.
    pub fn make_consumer(&self, topic: &str) -> Result<FileConsumer> {
        let dir = self.topic_dir(topic);
        std::fs::create_dir_all(&dir)?;
        let mut consumer = FileConsumer {
            dir,
            shutdown: self.shutdown.clone(),
            current: None,
            header: None,
            pending_schema: None,
            fetched: None,
        };
        if self.start_oldest {
            // Position at the very beginning of the oldest segment.
            if let Some(name) = segment_names(&consumer.dir)?.into_iter().next() {
                let _ = consumer.enter_segment(&name)?;
            }
        } else {
            // Seek to the end of the newest segment; only later writes are
            // visible. The segment's embedded schema precedes our start,
            // so it is not replayed.
            if let Some(name) = segment_names(&consumer.dir)?.into_iter().next_back() {
                let len = std::fs::metadata(consumer.dir.join(&name))?.len();
                let _ = consumer.enter_segment(&name)?;
                consumer.pending_schema = None;
                if let Some(cur) = consumer.current.as_mut() {
                    cur.offset = len;
                }
            }
        }
        Ok(consumer)
    }
}

#[async_trait]
impl Pipe for FilePipe {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn new_producer(&self, topic: &str) -> Result<Box<dyn Producer>> {
        let dir = self.topic_dir(topic);
        std::fs::create_dir_all(&dir)?;
        Ok(Box::new(FileProducer {
            dir,
            format: "json".into(),
            delimited: self.delimited,
            max_file_size: self.max_file_size,
            current: None,
            pending_schema: None,
        }))
    }

    async fn new_consumer(&self, topic: &str) -> Result<Box<dyn Consumer>> {
        Ok(Box::new(self.make_consumer(topic)?))
    }
}

struct OpenSegment {
    file: std::fs::File,
    hasher: Sha256,
    data_size: u64,
    hash_offset: u64,
}

pub struct FileProducer {
    dir: PathBuf,
    format: String,
    delimited: bool,
    max_file_size: u64,
    current: Option<OpenSegment>,
    pending_schema: Option<Vec<u8>>,
}

fn is_text_format(format: &str) -> bool {
    format == "json" || format == "text"
}

/// Unsigned LEB128.
fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, byte) in buf.iter().enumerate() {
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
        if shift > 63 {
            return None;
        }
    }
    None
}

/// Segment files are zero-padded counters so lexicographic order is
/// creation order.
fn segment_names(dir: &Path) -> Result<Vec<String>> {
    let mut names: Vec<String> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        .collect();
    names.sort();
    Ok(names)
}

fn empty_digest() -> String {
    hex::encode(Sha256::digest([]))
}

impl FileProducer {
    fn open_segment(&mut self) -> Result<()> {
        let next = match segment_names(&self.dir)?.last() {
            Some(last) => last.parse::<u64>().unwrap_or(0) + 1,
            None => 0,
        };
        let path = self.dir.join(format!("{next:020}"));

        let placeholder = empty_digest();
        let header = FileHeader {
            format: self.format.clone(),
            delimited: self.delimited,
            schema: self.pending_schema.take(),
            sha256: placeholder.clone(),
        };
        let mut line = serde_json::to_string(&header)
            .map_err(|e| PipeError::Other(format!("header encode: {e}")))?;
        line.push('\n');
        let hash_offset = line
            .rfind(&placeholder)
            .expect("header line always contains the digest field") as u64;

        let mut file = std::fs::OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        debug!(path = %path.display(), "opened segment");

        self.current = Some(OpenSegment {
            file,
            hasher: Sha256::new(),
            data_size: 0,
            hash_offset,
        });
        Ok(())
    }

    /// Patch the final digest into the header and close the segment.
    fn finalize_segment(&mut self) -> Result<()> {
        if let Some(mut seg) = self.current.take() {
            let digest = hex::encode(seg.hasher.finalize());
            seg.file.seek(SeekFrom::Start(seg.hash_offset))?;
            seg.file.write_all(digest.as_bytes())?;
            seg.file.flush()?;
        }
        Ok(())
    }

    fn frame(&self, payload: &[u8]) -> Vec<u8> {
        if !self.delimited {
            return payload.to_vec();
        }
        if is_text_format(&self.format) {
            let mut out = Vec::with_capacity(payload.len() + 1);
            out.extend_from_slice(payload);
            out.push(b'\n');
            out
        } else {
            let mut out = Vec::with_capacity(payload.len() + 4);
            write_varint(&mut out, payload.len() as u64);
            out.extend_from_slice(payload);
            out
        }
    }

    fn write_message(&mut self, payload: &[u8]) -> Result<()> {
        let frame = self.frame(payload);

        let rotate = match &self.current {
            Some(seg) => seg.data_size > 0 && seg.data_size + frame.len() as u64 > self.max_file_size,
            None => false,
        };
        if rotate {
            self.finalize_segment()?;
        }
        if self.current.is_none() {
            self.open_segment()?;
        }

        let seg = self.current.as_mut().expect("segment just opened");
        seg.file.write_all(&frame)?;
        seg.file.flush()?;
        seg.hasher.update(&frame);
        seg.data_size += frame.len() as u64;
        Ok(())
    }
}

#[async_trait]
impl Producer for FileProducer {
    fn set_format(&mut self, format: &str) {
        self.format = format.to_string();
    }

    async fn push(&mut self, payload: Vec<u8>) -> Result<()> {
        self.write_message(&payload)
    }

    async fn push_keyed(&mut self, _key: String, payload: Vec<u8>) -> Result<()> {
        // File segments are not partitioned; the key is irrelevant.
        self.write_message(&payload)
    }

    async fn push_schema(&mut self, _key: String, schema: Vec<u8>) -> Result<()> {
        // Header-encoded: finalize the running segment so the next one
        // starts with the schema embedded in its header.
        self.finalize_segment()?;
        self.pending_schema = Some(schema);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.finalize_segment()
    }
}

struct ConsumerPos {
    name: String,
    offset: u64,
}

pub struct FileConsumer {
    dir: PathBuf,
    shutdown: CancellationToken,
    current: Option<ConsumerPos>,
    header: Option<FileHeader>,
    pending_schema: Option<Vec<u8>>,
    fetched: Option<Result<Message>>,
}

impl FileConsumer {
    /// Header of the segment currently being read.
    pub fn header(&self) -> Option<&FileHeader> {
        self.header.as_ref()
    }

    /// Open a segment and position after its header line. `Ok(false)`
    /// when the header is not fully written yet; the caller retries.
    fn enter_segment(&mut self, name: &str) -> Result<bool> {
        let bytes = std::fs::read(self.dir.join(name))?;
        let Some(nl) = bytes.iter().position(|b| *b == b'\n') else {
            return Ok(false);
        };
        let header: FileHeader = serde_json::from_slice(&bytes[..nl])
            .map_err(|e| PipeError::Other(format!("bad segment header: {e}")))?;
        self.pending_schema = header.schema.clone();
        self.header = Some(header);
        self.current = Some(ConsumerPos { name: name.to_string(), offset: nl as u64 + 1 });
        Ok(true)
    }

    /// Try to extract one message at the current position. `Ok(None)`
    /// means no complete frame yet.
    fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(pos) = &self.current else { return Ok(None) };
        let header = self.header.as_ref().expect("header read with segment");

        if !header.delimited {
            return Err(PipeError::NotDelimited);
        }

        let mut file = std::fs::File::open(self.dir.join(&pos.name))?;
        file.seek(SeekFrom::Start(pos.offset))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        if buf.is_empty() {
            return Ok(None);
        }

        let parsed = if is_text_format(&header.format) {
            buf.iter()
                .position(|b| *b == b'\n')
                .map(|i| (buf[..i].to_vec(), i as u64 + 1))
        } else {
            read_varint(&buf).and_then(|(len, n)| {
                let end = n + len as usize;
                (buf.len() >= end).then(|| (buf[n..end].to_vec(), end as u64))
            })
        };

        match parsed {
            Some((payload, consumed)) => {
                self.current.as_mut().expect("checked above").offset += consumed;
                Ok(Some(payload))
            }
            None => Ok(None),
        }
    }

    /// Advance to the next segment if the current one is exhausted and a
    /// newer one exists. Returns true if the position moved.
    fn advance_segment(&mut self) -> Result<bool> {
        let names = segment_names(&self.dir)?;
        match &self.current {
            None => match names.first() {
                Some(first) => {
                    let first = first.clone();
                    self.enter_segment(&first)
                }
                None => Ok(false),
            },
            Some(pos) => {
                let next = names.iter().find(|n| **n > pos.name);
                if let Some(next) = next {
                    // A producer finalizes a segment before opening its
                    // successor, so an exhausted predecessor is final.
                    let len = std::fs::metadata(self.dir.join(&pos.name))?.len();
                    if pos.offset >= len {
                        let next = next.clone();
                        return self.enter_segment(&next);
                    }
                }
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl Consumer for FileConsumer {
    async fn fetch_next(&mut self) -> bool {
        if self.fetched.is_some() {
            return true;
        }
        loop {
            if let Some(schema) = self.pending_schema.take() {
                self.fetched = Some(Ok(Message { payload: schema, key: None }));
                return true;
            }
            match self.read_frame() {
                Ok(Some(payload)) => {
                    self.fetched = Some(Ok(Message { payload, key: None }));
                    return true;
                }
                Ok(None) => {}
                Err(e) => {
                    self.fetched = Some(Err(e));
                    return true;
                }
            }
            match self.advance_segment() {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    self.fetched = Some(Err(e));
                    return true;
                }
            }
            if self.shutdown.is_cancelled() {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn pop(&mut self) -> Result<Message> {
        self.fetched.take().unwrap_or(Err(PipeError::NothingFetched))
    }

    async fn close(&mut self) -> Result<()> {
        // Positions are per-consumer and in-memory; nothing to commit.
        Ok(())
    }

    async fn close_on_failure(&mut self) -> Result<()> {
        Ok(())
    }
}

impl FileHeader {
    /// Schema bytes as text, for inspection.
    pub fn schema_text(&self) -> String {
        self.schema
            .as_ref()
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trip() {
        for v in [0u64, 1, 127, 128, 300, 16383, 16384, u32::MAX as u64] {
            let mut buf = Vec::new();
            write_varint(&mut buf, v);
            assert_eq!(read_varint(&buf), Some((v, buf.len())));
        }
    }

    #[test]
    fn varint_incomplete_returns_none() {
        assert_eq!(read_varint(&[]), None);
        assert_eq!(read_varint(&[0x80]), None);
        assert_eq!(read_varint(&[0x80, 0x80]), None);
    }

    #[test]
    fn header_line_shapes() {
        let plain = FileHeader {
            format: "json".into(),
            delimited: false,
            schema: None,
            sha256: "abc".into(),
        };
        assert_eq!(
            serde_json::to_string(&plain).unwrap(),
            r#"{"Format":"json","SHA256":"abc"}"#
        );

        let with_schema = FileHeader {
            format: "json".into(),
            delimited: true,
            schema: Some(b"s1".to_vec()),
            sha256: "abc".into(),
        };
        let line = serde_json::to_string(&with_schema).unwrap();
        assert_eq!(line, r#"{"Format":"json","Delimited":true,"Schema":"czE=","SHA256":"abc"}"#);
        let back: FileHeader = serde_json::from_str(&line).unwrap();
        assert_eq!(back.schema.as_deref(), Some(b"s1".as_slice()));
        assert!(back.delimited);
    }

    #[test]
    fn segment_names_sort_lexicographically() {
        let dir = tempfile::tempdir().unwrap();
        for n in [3u64, 0, 12] {
            std::fs::write(dir.path().join(format!("{n:020}")), b"x").unwrap();
        }
        std::fs::write(dir.path().join("ignore.tmp"), b"x").unwrap();
        let names = segment_names(dir.path()).unwrap();
        assert_eq!(
            names,
            vec![
                "00000000000000000000".to_string(),
                "00000000000000000003".to_string(),
                "00000000000000000012".to_string(),
            ]
        );
    }
}
