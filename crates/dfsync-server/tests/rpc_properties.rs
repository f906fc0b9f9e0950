//! Over-the-wire tests of lock arbitration, checksum short-circuiting,
//! round-trip fidelity, delete ownership and listing atomicity.

use std::sync::Arc;
use std::time::Duration;

use dfsync_server::{DfsServer, ServerConfig};
use dfsync_storage::{checksum_bytes, touch_mtime};
use dfsync_transport::{
    decode_reply, CallEvent, CallMetadata, Empty, FileAck, FileList, FileRequest, FileStatus,
    Opcode, RpcClient, StatusCode, TransportError,
};

struct Harness {
    _dir: tempfile::TempDir,
    server: Arc<DfsServer>,
    addr: String,
}

impl Harness {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            mount_path: dir.path().to_path_buf(),
            ..Default::default()
        };
        let server = Arc::new(DfsServer::start(config).await.unwrap());
        let addr = server.spawn_local().await.unwrap().to_string();
        Harness {
            _dir: dir,
            server,
            addr,
        }
    }

    fn path(&self, name: &str) -> std::path::PathBuf {
        self.server.config().mount_path.join(name)
    }

    async fn client(&self) -> RpcClient {
        RpcClient::connect(&self.addr).await.unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}

fn code_of(err: TransportError) -> StatusCode {
    match err {
        TransportError::Status(status) => status.code,
        other => panic!("expected remote status, got {:?}", other),
    }
}

async fn acquire(client: &RpcClient, client_id: &str, name: &str) -> Result<Empty, TransportError> {
    client
        .unary(
            Opcode::AcquireWriteLock,
            CallMetadata::for_client(client_id),
            &FileRequest { name: name.into() },
        )
        .await
}

async fn store(client: &RpcClient, client_id: &str, name: &str, data: &[u8], mtime: i64) -> Result<FileAck, TransportError> {
    let metadata = CallMetadata::for_client(client_id)
        .with_filename(name)
        .with_checksum(Some(checksum_bytes(data).value()))
        .with_mtime(Some(mtime))
        .with_timeout_ms(10_000);
    let mut call = client.start_call(Opcode::WriteFile, metadata, &Empty, false).await?;
    for chunk in data.chunks(4096) {
        call.send_data(chunk).await?;
    }
    call.finish_send().await?;
    loop {
        match call.recv().await? {
            CallEvent::Data(_) => continue,
            CallEvent::Reply(payload) => return decode_reply(&payload),
        }
    }
}

async fn fetch(client: &RpcClient, name: &str, checksum: Option<u32>) -> Result<(Vec<u8>, FileAck), TransportError> {
    let metadata = CallMetadata::for_client("reader").with_checksum(checksum);
    let mut call = client
        .start_call(Opcode::GetFile, metadata, &FileRequest { name: name.into() }, true)
        .await?;
    let mut bytes = Vec::new();
    loop {
        match call.recv().await? {
            CallEvent::Data(chunk) => bytes.extend_from_slice(&chunk),
            CallEvent::Reply(payload) => return Ok((bytes, decode_reply(&payload)?)),
        }
    }
}

async fn stat(client: &RpcClient, name: &str) -> Result<FileStatus, TransportError> {
    client
        .unary(
            Opcode::GetFileStatus,
            CallMetadata::default(),
            &FileRequest { name: name.into() },
        )
        .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_lock_is_exclusive_until_release() {
    let h = Harness::start().await;
    let alpha = h.client().await;
    let beta = h.client().await;

    acquire(&alpha, "alpha", "shared.txt").await.unwrap();
    let err = acquire(&beta, "beta", "shared.txt").await.unwrap_err();
    assert_eq!(code_of(err), StatusCode::ResourceExhausted);

    store(&alpha, "alpha", "shared.txt", b"from alpha", 1).await.unwrap();
    acquire(&beta, "beta", "shared.txt").await.unwrap();
}

#[tokio::test]
async fn test_reacquire_is_idempotent() {
    let h = Harness::start().await;
    let alpha = h.client().await;
    acquire(&alpha, "alpha", "a.txt").await.unwrap();
    acquire(&alpha, "alpha", "a.txt").await.unwrap();
    assert_eq!(h.server.service().locks().len(), 1);
}

#[tokio::test]
async fn test_acquire_without_client_id_is_internal() {
    let h = Harness::start().await;
    let client = h.client().await;
    let err = client
        .unary::<_, Empty>(
            Opcode::AcquireWriteLock,
            CallMetadata::default(),
            &FileRequest { name: "a.txt".into() },
        )
        .await
        .unwrap_err();
    assert_eq!(code_of(err), StatusCode::Internal);
}

#[tokio::test]
async fn test_identical_store_only_touches_mtime() {
    let h = Harness::start().await;
    std::fs::write(h.path("same.txt"), b"unchanged").unwrap();
    touch_mtime(&h.path("same.txt"), 1_000_000).await.unwrap();

    let alpha = h.client().await;
    acquire(&alpha, "alpha", "same.txt").await.unwrap();
    let err = store(&alpha, "alpha", "same.txt", b"unchanged", 2_000_000).await.unwrap_err();
    assert_eq!(code_of(err), StatusCode::AlreadyExists);

    assert_eq!(std::fs::read(h.path("same.txt")).unwrap(), b"unchanged");
    assert_eq!(stat(&alpha, "same.txt").await.unwrap().modified, 2_000_000);
    assert!(h.server.service().locks().holder("same.txt").is_none());
}

#[tokio::test]
async fn test_round_trip_including_empty_content() {
    let h = Harness::start().await;
    let alpha = h.client().await;
    let data: Vec<u8> = (0..20_000u32).map(|i| (i * 7 % 256) as u8).collect();

    for (name, content) in [("big.bin", &data[..]), ("empty.txt", &b""[..])] {
        acquire(&alpha, "alpha", name).await.unwrap();
        let ack = store(&alpha, "alpha", name, content, 1).await.unwrap();
        let (bytes, fetched) = fetch(&alpha, name, None).await.unwrap();
        assert_eq!(bytes, content);
        assert_eq!(fetched.modified, ack.modified);
        assert_eq!(stat(&alpha, name).await.unwrap().size, content.len() as u64);
    }
}

#[tokio::test]
async fn test_fetch_with_matching_checksum_is_already_synchronized() {
    let h = Harness::start().await;
    std::fs::write(h.path("f.txt"), b"payload").unwrap();
    let client = h.client().await;
    let err = fetch(&client, "f.txt", Some(checksum_bytes(b"payload").value()))
        .await
        .unwrap_err();
    assert_eq!(code_of(err), StatusCode::AlreadyExists);
    let (bytes, _) = fetch(&client, "f.txt", Some(0)).await.unwrap();
    assert_eq!(bytes, b"payload");
}

#[tokio::test]
async fn test_delete_requires_ownership() {
    let h = Harness::start().await;
    std::fs::write(h.path("d.txt"), b"doomed").unwrap();
    let alpha = h.client().await;
    let beta = h.client().await;

    acquire(&alpha, "alpha", "d.txt").await.unwrap();
    let err = beta
        .unary::<_, FileAck>(
            Opcode::DeleteFile,
            CallMetadata::for_client("beta"),
            &FileRequest { name: "d.txt".into() },
        )
        .await
        .unwrap_err();
    assert_eq!(code_of(err), StatusCode::Internal);
    assert_eq!(h.server.service().locks().holder("d.txt").as_deref(), Some("alpha"));

    let ack: FileAck = alpha
        .unary(
            Opcode::DeleteFile,
            CallMetadata::for_client("alpha"),
            &FileRequest { name: "d.txt".into() },
        )
        .await
        .unwrap();
    assert_eq!(ack.name, "d.txt");
    assert_eq!(code_of(stat(&alpha, "d.txt").await.unwrap_err()), StatusCode::NotFound);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_listing_waits_for_concurrent_store() {
    let h = Harness::start().await;
    let writer = h.client().await;
    let reader = h.client().await;
    let data = vec![42u8; 3 * 4096];

    acquire(&writer, "writer", "growing.bin").await.unwrap();
    let metadata = CallMetadata::for_client("writer")
        .with_filename("growing.bin")
        .with_checksum(Some(checksum_bytes(&data).value()))
        .with_mtime(Some(1));
    let mut call = writer
        .start_call(Opcode::WriteFile, metadata, &Empty, false)
        .await
        .unwrap();
    call.send_data(&data[..4096]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let listing = tokio::spawn(async move {
        reader
            .unary::<_, FileList>(Opcode::ListFiles, CallMetadata::default(), &Empty)
            .await
    });
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!listing.is_finished());

    call.send_data(&data[4096..]).await.unwrap();
    call.finish_send().await.unwrap();
    match call.recv().await.unwrap() {
        CallEvent::Reply(payload) => {
            decode_reply::<FileAck>(&payload).unwrap();
        }
        CallEvent::Data(_) => panic!("unexpected data"),
    }

    let listing = listing.await.unwrap().unwrap();
    assert_eq!(listing.files.len(), 1);
    assert_eq!(listing.files[0].size, data.len() as u64);
}

#[tokio::test]
async fn test_callback_list_returns_current_listing() {
    let h = Harness::start().await;
    std::fs::write(h.path("a.txt"), b"a").unwrap();
    let client = h.client().await;
    let listing: FileList = client
        .unary(
            Opcode::CallbackList,
            CallMetadata::for_client("alpha"),
            &FileRequest { name: String::new() },
        )
        .await
        .unwrap();
    assert_eq!(listing.files.len(), 1);
    assert_eq!(listing.files[0].name, "a.txt");
    assert!(h.server.pipeline().stats().processed >= 1);
}

#[tokio::test]
async fn test_existing_files_get_guards_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("pre.txt"), b"x").unwrap();
    let config = ServerConfig {
        mount_path: dir.path().to_path_buf(),
        ..Default::default()
    };
    let server = DfsServer::start(config).await.unwrap();
    assert_eq!(server.service().guards().len(), 1);
}
