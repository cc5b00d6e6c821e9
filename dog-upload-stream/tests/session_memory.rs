use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};

use dog_upload_stream::{
    AbortUploadRequest, BlobError, BlobResult, CompleteUploadRequest, CreatedUpload, Destination,
    MemoryStorageClient, StorageCall, StorageClient, UploadAdapter, UploadConfig, UploadError, UploadEvent,
    UploadEvents, UploadPartRequest, UploadReceipt, UploadedPart,
};

const KB: usize = 1024;

/// Test factory functions
fn create_test_destination() -> Destination {
    Destination::new("media", "uploads/track.flac").with_content_type("audio/flac")
}

fn create_adapter(store: &MemoryStorageClient) -> UploadAdapter {
    UploadAdapter::new(store.clone(), UploadConfig::default())
}

fn create_adapter_with_threshold(store: &MemoryStorageClient, bytes: u64) -> UploadAdapter {
    UploadAdapter::new(store.clone(), UploadConfig::new().with_min_part_size(bytes))
}

fn chunk(len: usize, fill: u8) -> Bytes {
    Bytes::from(vec![fill; len])
}

async fn receive_next_event(events: &mut UploadEvents) -> UploadEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("Timeout waiting for event")
        .expect("Event stream ended")
}

/// Collect every event until the session shuts its event stream
async fn collect_events(events: UploadEvents) -> Vec<UploadEvent> {
    tokio::time::timeout(Duration::from_secs(5), events.collect::<Vec<_>>())
        .await
        .expect("Timeout waiting for session to finish")
}

fn part_numbers(events: &[UploadEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|event| match event {
            UploadEvent::Part(part) => Some(part.part_number),
            _ => None,
        })
        .collect()
}

fn count_named(events: &[UploadEvent], name: &str) -> usize {
    events.iter().filter(|event| event.event_name() == name).count()
}

fn completed_part_numbers(store: &MemoryStorageClient) -> Option<Vec<u32>> {
    store.calls().into_iter().find_map(|call| match call {
        StorageCall::CompleteMultipartUpload { part_numbers, .. } => Some(part_numbers),
        _ => None,
    })
}

fn abort_calls(store: &MemoryStorageClient) -> usize {
    store
        .calls()
        .iter()
        .filter(|call| matches!(call, StorageCall::AbortMultipartUpload { .. }))
        .count()
}

fn single_error(events: Vec<UploadEvent>) -> UploadError {
    assert_eq!(count_named(&events, "error"), 1, "exactly one error event");
    assert!(events.last().map_or(false, UploadEvent::is_terminal));
    assert_eq!(count_named(&events, "uploaded"), 0, "no uploaded event after an error");
    events
        .into_iter()
        .find_map(|event| match event {
            UploadEvent::Error(err) => Some(err),
            _ => None,
        })
        .expect("error event")
}

/// S1. One 150KB write followed by end produces a single final part
#[tokio::test]
async fn test_single_write_uploads_one_part() {
    let store = MemoryStorageClient::new();
    let adapter = create_adapter(&store);

    let (session, events) = adapter.upload(create_test_destination()).unwrap();
    session.write(chunk(150 * KB, 1));
    session.end();

    let events = collect_events(events).await;
    assert_eq!(part_numbers(&events), vec![1]);
    assert_eq!(count_named(&events, "uploaded"), 1);
    assert!(matches!(events.last(), Some(UploadEvent::Uploaded(receipt)) if receipt.parts == 1));
    assert_eq!(events.iter().filter(|event| event.is_terminal()).count(), 1);

    assert_eq!(store.part_sizes(), vec![(1, 150 * KB)]);
    let object = store.object("media", "uploads/track.flac").unwrap();
    assert_eq!(object.body.len(), 150 * KB);
    assert_eq!(object.content_type.as_deref(), Some("audio/flac"));
}

/// S2. Three 60KB chunks: part 1 once the buffer passes 100KB, part 2 holds the rest
#[tokio::test]
async fn test_three_chunks_split_into_two_parts() {
    let store = MemoryStorageClient::new();
    let adapter = create_adapter(&store);

    // Arrange: two chunks land while initialization is outstanding
    let (session, events) = adapter.upload(create_test_destination()).unwrap();
    session.write(chunk(60 * KB, 1));
    session.write(chunk(60 * KB, 2));
    assert!(session.ready().await.is_some());

    // Act: the third chunk stays below the threshold until end
    session.write(chunk(60 * KB, 3));
    session.end();

    // Assert
    let events = collect_events(events).await;
    let mut sizes = store.part_sizes();
    sizes.sort();
    assert_eq!(sizes, vec![(1, 120 * KB), (2, 60 * KB)]);
    assert_eq!(count_named(&events, "part"), 2);
    assert_eq!(count_named(&events, "uploaded"), 1);
    assert_eq!(completed_part_numbers(&store), Some(vec![1, 2]));

    let object = store.object("media", "uploads/track.flac").unwrap();
    assert_eq!(object.body.len(), 180 * KB);
    assert_eq!(object.body[0], 1);
    assert_eq!(object.body[60 * KB], 2);
    assert_eq!(object.body[120 * KB], 3);
}

/// S3. A failing part 2 aborts the upload and reports the part failure alone
#[tokio::test]
async fn test_part_failure_aborts_upload() {
    let store = MemoryStorageClient::new();
    let adapter = create_adapter(&store);

    // Arrange: part 1 succeeds
    let (session, mut events) = adapter.upload(create_test_destination()).unwrap();
    session.write(chunk(10 * KB, 1));
    let session_id = session.ready().await.unwrap();
    let first = receive_next_event(&mut events).await;
    assert!(matches!(first, UploadEvent::Part(ref part) if part.part_number == 1));

    // Act: part 2 fails
    store.fail_part(2);
    session.write(chunk(110 * KB, 2));

    // Assert: abort with the session id, one plain error
    let err = single_error(collect_events(events).await);
    assert!(matches!(err, UploadError::PartUpload { part_number: 2, .. }));
    assert!(!err.abort_failed());
    assert!(store
        .calls()
        .contains(&StorageCall::AbortMultipartUpload { session_id }));
    assert_eq!(store.open_uploads(), 0);

    // The session is inert afterwards
    let calls_before = store.calls().len();
    session.write(chunk(200 * KB, 3));
    session.end();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(store.calls().len(), calls_before);
}

/// S4. A failed abort is appended to the original cause
#[tokio::test]
async fn test_abort_failure_is_reported_with_cause() {
    let store = MemoryStorageClient::new();
    store.fail_part(1);
    store.fail_abort();
    let adapter = create_adapter(&store);

    let (session, events) = adapter.upload(create_test_destination()).unwrap();
    session.write(chunk(10 * KB, 1));
    session.end();

    let err = single_error(collect_events(events).await);
    assert!(err.abort_failed());
    assert!(matches!(err.root_cause(), UploadError::PartUpload { part_number: 1, .. }));

    let message = err.to_string();
    assert!(message.starts_with("Failed to upload part 1"));
    assert!(message.contains("Additionally failed to abort the multipart upload"));
    assert_eq!(abort_calls(&store), 1);
}

/// S5. Initialization failure is reported directly without an abort call
#[tokio::test]
async fn test_initialization_failure_skips_abort() {
    let store = MemoryStorageClient::new();
    store.fail_create();
    let adapter = create_adapter(&store);

    let (session, events) = adapter.upload(create_test_destination()).unwrap();
    session.write(chunk(10 * KB, 1));
    session.write(chunk(10 * KB, 2));
    session.end();

    assert!(session.ready().await.is_none());
    let err = single_error(collect_events(events).await);
    assert!(matches!(err, UploadError::Initialization { .. }));
    assert_eq!(
        store.calls(),
        vec![StorageCall::CreateMultipartUpload {
            destination: create_test_destination()
        }]
    );
}

/// S6. Completion failure is compensated with an abort
#[tokio::test]
async fn test_completion_failure_aborts_upload() {
    let store = MemoryStorageClient::new();
    store.fail_complete();
    let adapter = create_adapter(&store);

    let (session, events) = adapter.upload(create_test_destination()).unwrap();
    session.write(chunk(10 * KB, 1));
    session.end();

    let events = collect_events(events).await;
    assert_eq!(part_numbers(&events), vec![1]);
    let err = single_error(events);
    assert!(matches!(err, UploadError::Completion { .. }));
    assert_eq!(abort_calls(&store), 1);
    assert!(store.object("media", "uploads/track.flac").is_none());
}

/// S7. Acknowledgments out of send order still complete in part order
#[tokio::test]
async fn test_out_of_order_acknowledgments() {
    let store = MemoryStorageClient::new();
    store.delay_part(1, Duration::from_millis(100));
    let adapter = create_adapter_with_threshold(&store, KB as u64);

    let (session, events) = adapter.upload(create_test_destination()).unwrap();
    session.write(chunk(10, 1));
    session.ready().await.unwrap();
    session.write(chunk(2 * KB, 2));
    session.write(chunk(2 * KB, 3));
    session.end();

    let events = collect_events(events).await;
    let acked = part_numbers(&events);
    assert_eq!(acked.len(), 3);
    assert_eq!(acked.last(), Some(&1), "delayed part 1 is acknowledged last");
    assert_eq!(completed_part_numbers(&store), Some(vec![1, 2, 3]));

    let object = store.object("media", "uploads/track.flac").unwrap();
    assert_eq!(object.body.len(), 10 + 4 * KB);
    assert_eq!(object.body[0], 1);
    assert_eq!(object.body[10], 2);
    assert_eq!(object.body[10 + 2 * KB], 3);
}

/// S8. Writes during a slow initialization never trigger a second create
#[tokio::test]
async fn test_slow_initialization_buffers_writes() {
    let store = MemoryStorageClient::new();
    store.delay_create(Duration::from_millis(50));
    let adapter = create_adapter(&store);

    let (session, events) = adapter.upload(create_test_destination()).unwrap();
    for fill in 0..5 {
        session.write(chunk(60 * KB, fill));
    }
    session.end();

    let events = collect_events(events).await;
    assert_eq!(count_named(&events, "uploaded"), 1);

    let creates = store
        .calls()
        .iter()
        .filter(|call| matches!(call, StorageCall::CreateMultipartUpload { .. }))
        .count();
    assert_eq!(creates, 1);
    assert_eq!(store.part_sizes(), vec![(1, 300 * KB)]);
}

/// S9. Ending without any data still produces an (empty) object
#[tokio::test]
async fn test_empty_upload_creates_empty_object() {
    let store = MemoryStorageClient::new();
    let adapter = create_adapter(&store);

    let (session, events) = adapter.upload(create_test_destination()).unwrap();
    session.end();

    let receipt = events.outcome().await.unwrap();
    assert_eq!(receipt.parts, 1);
    assert_eq!(store.part_sizes(), vec![(1, 0)]);
    assert!(store.object("media", "uploads/track.flac").unwrap().body.is_empty());
}

/// S10. Parts stay contiguous and above the threshold when many chunks stream in
#[tokio::test]
async fn test_upload_stream_assembles_object() {
    let store = MemoryStorageClient::new();
    let adapter = create_adapter_with_threshold(&store, 4 * KB as u64);

    // Arrange: a source that hands control back to the runtime before each
    // chunk, so chunks keep arriving after the session is ready
    let chunks: Vec<std::io::Result<Bytes>> = (0..40u8).map(|i| Ok(chunk(KB, i))).collect();
    let body = futures::stream::iter(chunks).then(|chunk| async move {
        tokio::time::sleep(Duration::from_millis(1)).await;
        chunk
    });

    // Act
    let receipt = adapter
        .upload_stream(create_test_destination(), Box::pin(body))
        .await
        .unwrap();

    // Assert
    let mut sizes = store.part_sizes();
    sizes.sort();
    assert!(sizes.len() > 2);
    let numbers: Vec<u32> = sizes.iter().map(|(n, _)| *n).collect();
    let expected: Vec<u32> = (1..=sizes.len() as u32).collect();
    assert_eq!(numbers, expected);
    assert_eq!(receipt.parts, sizes.len() as u32);

    // Only the ready flush and the final part may be small
    for (number, size) in &sizes[1..sizes.len() - 1] {
        assert!(*size > 4 * KB, "part {} has {} bytes", number, size);
    }

    let object = store.object("media", "uploads/track.flac").unwrap();
    assert_eq!(object.body.len(), 40 * KB);
    for i in 0..40usize {
        assert_eq!(object.body[i * KB], i as u8);
    }
}

/// S11. A failing source abandons the session and aborts the upload
#[tokio::test]
async fn test_upload_stream_source_failure_aborts() {
    let store = MemoryStorageClient::new();
    let adapter = create_adapter(&store);

    let chunks: Vec<std::io::Result<Bytes>> = vec![
        Ok(chunk(10 * KB, 1)),
        Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "disk went away")),
    ];
    let err = adapter
        .upload_stream(create_test_destination(), Box::pin(futures::stream::iter(chunks)))
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::Source { .. }));
    assert_eq!(abort_calls(&store), 1);
    assert_eq!(store.open_uploads(), 0);
    assert!(store.object("media", "uploads/track.flac").is_none());
}

/// S12. The session works as a futures Sink
#[tokio::test]
async fn test_session_as_sink() {
    let store = MemoryStorageClient::new();
    let adapter = create_adapter(&store);

    let (mut session, events) = adapter.upload(create_test_destination()).unwrap();
    assert_eq!(session.destination(), &create_test_destination());
    for fill in 0..3 {
        session.send(chunk(50 * KB, fill)).await.unwrap();
    }
    session.close().await.unwrap();

    let receipt = events.outcome().await.unwrap();
    assert_eq!(receipt.destination, create_test_destination());
    assert_eq!(store.object("media", "uploads/track.flac").unwrap().body.len(), 150 * KB);
}

/// S13. Dropping the handle before end aborts the backend upload
#[tokio::test]
async fn test_dropped_session_is_aborted() {
    let store = MemoryStorageClient::new();
    let adapter = create_adapter(&store);

    let (session, events) = adapter.upload(create_test_destination()).unwrap();
    session.write(chunk(10 * KB, 1));
    let session_id = session.ready().await.unwrap();
    drop(session);

    let err = events.outcome().await.unwrap_err();
    assert!(matches!(err, UploadError::Abandoned));
    assert!(store
        .calls()
        .contains(&StorageCall::AbortMultipartUpload { session_id }));
    assert_eq!(store.open_uploads(), 0);
}

/// S14. Invalid destinations are rejected before any call is made
#[tokio::test]
async fn test_invalid_destination_rejected() {
    let store = MemoryStorageClient::new();
    let adapter = create_adapter(&store);

    let result = adapter.upload(Destination::new("media", ""));
    assert!(matches!(result, Err(BlobError::Invalid { .. })));
    assert!(store.calls().is_empty());
}

/// S15. Opening a session outside a runtime is an error, not a panic
#[test]
fn test_upload_requires_runtime() {
    let store = MemoryStorageClient::new();
    let adapter = create_adapter(&store);

    let result = adapter.upload(create_test_destination());
    assert!(matches!(result, Err(BlobError::Invalid { .. })));
}

/// Storage client whose part uploads panic; everything else goes to memory
struct PanickingPartClient {
    inner: MemoryStorageClient,
}

#[async_trait]
impl StorageClient for PanickingPartClient {
    async fn create_multipart_upload(&self, destination: &Destination) -> BlobResult<CreatedUpload> {
        self.inner.create_multipart_upload(destination).await
    }

    async fn upload_part(&self, request: UploadPartRequest) -> BlobResult<UploadedPart> {
        panic!("part {} exploded", request.part_number);
    }

    async fn complete_multipart_upload(&self, request: CompleteUploadRequest) -> BlobResult<UploadReceipt> {
        self.inner.complete_multipart_upload(request).await
    }

    async fn abort_multipart_upload(&self, request: AbortUploadRequest) -> BlobResult<()> {
        self.inner.abort_multipart_upload(request).await
    }
}

/// S16. A storage call that panics fails the session instead of stalling it
#[tokio::test]
async fn test_panicking_storage_call_aborts_upload() {
    let store = MemoryStorageClient::new();
    let client: Arc<dyn StorageClient> = Arc::new(PanickingPartClient { inner: store.clone() });
    let adapter = UploadAdapter::from_shared(client, UploadConfig::default());

    let (session, events) = adapter.upload(create_test_destination()).unwrap();
    session.write(chunk(10, 1));
    session.end();

    let err = single_error(collect_events(events).await);
    assert!(matches!(err, UploadError::PartUpload { part_number: 1, .. }));
    assert!(!err.abort_failed());
    assert_eq!(abort_calls(&store), 1);
    assert_eq!(store.open_uploads(), 0);
}

/// S17. A rejected destination is reported as a rejected request, not a failed initialization
#[tokio::test]
async fn test_upload_stream_rejects_invalid_destination() {
    let store = MemoryStorageClient::new();
    let adapter = create_adapter(&store);

    let chunks: Vec<std::io::Result<Bytes>> = vec![Ok(chunk(KB, 1))];
    let err = adapter
        .upload_stream(Destination::new("", "uploads/track.flac"), Box::pin(futures::stream::iter(chunks)))
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::Invalid { source: BlobError::Invalid { .. } }));
    assert!(store.calls().is_empty());
}
