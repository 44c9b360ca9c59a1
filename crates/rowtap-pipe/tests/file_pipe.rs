//! File pipe behavior: headers, framing, offsets, rotation.

use tokio_util::sync::CancellationToken;

use rowtap_core::config::InitialOffset;
use rowtap_core::AppConfig;
use rowtap_pipe::{Consumer, FilePipe, Pipe, PipeError, Producer};

fn test_cfg(dir: &std::path::Path) -> AppConfig {
    AppConfig {
        data_dir: dir.to_path_buf(),
        max_file_size: 1024,
        delimited: true,
        ..AppConfig::default()
    }
}

async fn consume_and_check(c: &mut Box<dyn Consumer>, want: &[u8]) {
    assert!(c.fetch_next().await, "expected a message");
    let got = c.pop().unwrap();
    assert_eq!(got.payload, want, "read back incorrect message");
}

#[tokio::test]
async fn header_carries_schema_and_digest() {
    let dir = tempfile::tempdir().unwrap();
    let pipe = FilePipe::new(&test_cfg(dir.path()), CancellationToken::new());

    let mut p = pipe.new_producer("header-test-topic").await.unwrap();
    let mut c = pipe.make_consumer("header-test-topic").unwrap();

    p.set_format("json");
    p.push_schema("key".into(), b"schema-to-test-header".to_vec()).await.unwrap();

    let msg = br#"{"Test" : "file data"}"#;
    p.push(msg.to_vec()).await.unwrap();
    p.close().await.unwrap();

    assert!(c.fetch_next().await, "there should be schema message");
    assert_eq!(c.pop().unwrap().payload, b"schema-to-test-header");

    assert!(c.fetch_next().await, "there should be exactly one data message");
    assert_eq!(c.pop().unwrap().payload, msg);

    let header = c.header().expect("segment header");
    assert_eq!(header.format, "json");
    assert_eq!(header.schema_text(), "schema-to-test-header");
    // Digest over the framed data bytes, patched at close.
    assert_eq!(
        header.sha256,
        "d814ab34da9e76c671066fa47d865c7afa7487f18225bf97ca849c080065536d"
    );

    c.close().await.unwrap();
}

#[tokio::test]
async fn binary_format_uses_length_prefixes() {
    let dir = tempfile::tempdir().unwrap();
    let pipe = FilePipe::new(&test_cfg(dir.path()), CancellationToken::new());

    let mut p = pipe.new_producer("binary-test-topic").await.unwrap();
    // Anything that is not json/text frames as binary.
    p.set_format("msgpack");

    let mut c = pipe.new_consumer("binary-test-topic").await.unwrap();

    p.push(b"first".to_vec()).await.unwrap();
    p.push(b"second".to_vec()).await.unwrap();
    p.close().await.unwrap();

    consume_and_check(&mut c, b"first").await;
    consume_and_check(&mut c, b"second").await;
    c.close().await.unwrap();
}

#[tokio::test]
async fn non_delimited_files_refuse_consumption() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = AppConfig { delimited: false, ..test_cfg(dir.path()) };
    let pipe = FilePipe::new(&cfg, CancellationToken::new());

    let mut p = pipe.new_producer("no-delimiter-test-topic").await.unwrap();
    p.set_format("json");
    p.push(b"first".to_vec()).await.unwrap();
    p.push(b"second".to_vec()).await.unwrap();
    p.close().await.unwrap();

    // A delimited consumer cannot frame the concatenated payloads.
    let delim_cfg = test_cfg(dir.path());
    let delim_pipe = FilePipe::new(&delim_cfg, CancellationToken::new());
    let mut c = delim_pipe.new_consumer("no-delimiter-test-topic").await.unwrap();
    assert!(c.fetch_next().await, "there should be a message with error set");
    let err = c.pop().unwrap_err();
    assert!(matches!(err, PipeError::NotDelimited));
    assert_eq!(err.to_string(), "cannot consume non delimited file");
    c.close().await.unwrap();

    // Exactly one segment, with header line and raw concatenation.
    let topic_dir = dir.path().join("no-delimiter-test-topic");
    let mut entries: Vec<_> = std::fs::read_dir(&topic_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    entries.sort();
    assert_eq!(entries.len(), 1, "expect exactly one file in the directory");

    let content = std::fs::read_to_string(topic_dir.join(&entries[0])).unwrap();
    assert_eq!(
        content,
        "{\"Format\":\"json\",\"SHA256\":\"da83f63e1a473003712c18f5afc5a79044221943d1083c7c5a7ac7236d85e8d2\"}\nfirstsecond"
    );
}

#[tokio::test]
async fn initial_offset_semantics() {
    let dir = tempfile::tempdir().unwrap();
    let pipe = FilePipe::new(&test_cfg(dir.path()), CancellationToken::new());

    let mut p = pipe.new_producer("file-offsets-test-topic").await.unwrap();
    p.set_format("json");

    // Default consumers see only messages produced after creation.
    let mut c1 = pipe.new_consumer("file-offsets-test-topic").await.unwrap();

    let msg1 = br#"{"Test" : "filedata1"}"#;
    p.push(msg1.to_vec()).await.unwrap();

    // This consumer will not see msg1.
    let mut c2 = pipe.new_consumer("file-offsets-test-topic").await.unwrap();

    // An oldest-offset consumer sees both messages.
    let oldest_cfg =
        AppConfig { initial_offset: InitialOffset::Oldest, ..test_cfg(dir.path()) };
    let oldest_pipe = FilePipe::new(&oldest_cfg, CancellationToken::new());
    let mut c3 = oldest_pipe.new_consumer("file-offsets-test-topic").await.unwrap();

    let msg2 = br#"{"Test" : "filedata2"}"#;
    p.push(msg2.to_vec()).await.unwrap();
    p.close().await.unwrap();

    consume_and_check(&mut c1, msg1).await;
    consume_and_check(&mut c1, msg2).await;

    consume_and_check(&mut c2, msg2).await;

    consume_and_check(&mut c3, msg1).await;
    consume_and_check(&mut c3, msg2).await;

    c1.close().await.unwrap();
    c2.close().await.unwrap();
    c3.close().await.unwrap();
}

#[tokio::test]
async fn rotation_by_size_keeps_order() {
    let dir = tempfile::tempdir().unwrap();
    // One message per segment.
    let cfg = AppConfig { max_file_size: 1, ..test_cfg(dir.path()) };
    let pipe = FilePipe::new(&cfg, CancellationToken::new());

    let mut p = pipe.new_producer("rotation-topic").await.unwrap();
    p.set_format("json");
    let messages: Vec<Vec<u8>> = (0..5).map(|i| format!("m{i}").into_bytes()).collect();
    for m in &messages {
        p.push(m.clone()).await.unwrap();
    }
    p.close().await.unwrap();

    let segments = std::fs::read_dir(dir.path().join("rotation-topic")).unwrap().count();
    assert_eq!(segments, 5);

    let oldest_cfg =
        AppConfig { initial_offset: InitialOffset::Oldest, max_file_size: 1, ..test_cfg(dir.path()) };
    let oldest = FilePipe::new(&oldest_cfg, CancellationToken::new());
    let mut c = oldest.new_consumer("rotation-topic").await.unwrap();
    for m in &messages {
        consume_and_check(&mut c, m).await;
    }
    c.close().await.unwrap();
}

#[tokio::test]
async fn delimited_round_trip_batch() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = AppConfig { initial_offset: InitialOffset::Oldest, ..test_cfg(dir.path()) };
    let pipe = FilePipe::new(&cfg, CancellationToken::new());

    let mut p = pipe.new_producer("batch-topic").await.unwrap();
    p.set_format("json");
    let batch: Vec<(Option<String>, Vec<u8>)> = (0..10)
        .map(|i| (Some(format!("k{i}")), format!("payload-{i}").into_bytes()))
        .collect();
    p.push_batch(batch.clone()).await.unwrap();
    p.close().await.unwrap();

    let mut c = pipe.new_consumer("batch-topic").await.unwrap();
    for (_, payload) in &batch {
        consume_and_check(&mut c, payload).await;
    }
    c.close().await.unwrap();
}

#[tokio::test]
async fn tail_blocks_until_new_data_or_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let shutdown = CancellationToken::new();
    let pipe =
        std::sync::Arc::new(FilePipe::new(&test_cfg(dir.path()), shutdown.clone()));

    let mut c = pipe.new_consumer("tail-topic").await.unwrap();
    let writer = pipe.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let mut p = writer.new_producer("tail-topic").await.unwrap();
        p.set_format("json");
        p.push(b"late-arrival".to_vec()).await.unwrap();
        p.close().await.unwrap();
    });

    consume_and_check(&mut c, b"late-arrival").await;

    // Quiescent topic: fetch_next returns false once shutdown fires.
    let stopper = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        stopper.cancel();
    });
    assert!(!c.fetch_next().await);
}
