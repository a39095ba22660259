//! Control-server integration: real Unix socket, framed messages,
//! defence wiring, and directive fan-out.

use std::sync::Arc;
use std::time::Duration;

use aegis_core::defence::{
    BehaviourSignal, BehaviourSignalType, DefenceModule, DefencePolicy, PolicyMode,
    ResponseAction,
};
use aegis_core::evidence::EvidenceBroker;
use aegis_core::ipc::{self, IpcMessage};
use aegis_core::uplink::SpoolWriter;
use aegis_daemon::ipc_server::ControlServer;
use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

struct Harness {
    root: TempDir,
    server: Arc<ControlServer>,
    broker: Arc<EvidenceBroker>,
    cancel: CancellationToken,
}

fn harness(policy: DefencePolicy) -> Harness {
    let root = TempDir::new().unwrap();
    let broker = Arc::new(EvidenceBroker::new(
        "tenant-1",
        "asset-1",
        root.path().join("evidence_packages"),
        SpoolWriter::new(root.path().join("uplink_queue")),
    ));
    let server = ControlServer::new(
        DefenceModule::new(policy),
        Arc::clone(&broker),
        root.path().join("control.sock"),
        root.path().join("captures"),
    );
    Harness {
        root,
        server,
        broker,
        cancel: CancellationToken::new(),
    }
}

async fn start_and_connect(harness: &Harness) -> UnixStream {
    let server = Arc::clone(&harness.server);
    let cancel = harness.cancel.clone();
    tokio::spawn(server.run(cancel));

    let socket_path = harness.root.path().join("control.sock");
    for _ in 0..100 {
        if let Ok(stream) = UnixStream::connect(&socket_path).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("control socket never came up");
}

fn sample_signal() -> BehaviourSignal {
    BehaviourSignal {
        signal_type: BehaviourSignalType::Process,
        name: "credential-dump".to_string(),
        rule_id: "rule-11".to_string(),
        process_id: "4242".to_string(),
        file_path: String::new(),
        command_line: "lsass-reader.exe".to_string(),
        confidence: 0.95,
        observed_at: String::new(),
        response_defined: true,
        requested_response: ResponseAction::KillProcess,
    }
}

#[tokio::test]
async fn behaviour_signal_becomes_sealed_evidence() {
    let harness = harness(DefencePolicy::default());
    let mut stream = start_and_connect(&harness).await;

    ipc::write_typed(
        &mut stream,
        &IpcMessage::Hello {
            worker: "sensor".to_string(),
            pid: 1,
        },
    )
    .await
    .unwrap();
    ipc::write_typed(&mut stream, &IpcMessage::Signal(sample_signal()))
        .await
        .unwrap();

    // The decision capture is sealed and queued asynchronously.
    let mut sealed = None;
    for _ in 0..100 {
        if let Some(item) = harness.broker.list().into_iter().find(|item| item.sealed) {
            sealed = Some(item);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let item = sealed.expect("signal decision was sealed as evidence");
    assert_eq!(item.source, "defence");
    assert_eq!(item.related_id, "DEF-credential-dump");
    assert_eq!(item.sha256_hex.len(), 64);

    // Package directory with metadata plus one spool envelope.
    let package_dir = harness
        .root
        .path()
        .join("evidence_packages")
        .join(&item.evidence_id);
    assert!(package_dir.join("metadata.txt").exists());

    let envelopes = std::fs::read_dir(harness.root.path().join("uplink_queue"))
        .unwrap()
        .count();
    assert_eq!(envelopes, 1);

    // Observe-mode policy records the downgrade in the capture.
    let capture = std::fs::read_to_string(&item.storage_path).unwrap();
    assert!(capture.contains("policy observe-only"));

    harness.cancel.cancel();
}

#[tokio::test]
async fn enforce_policy_decision_is_recorded_verbatim() {
    let policy = DefencePolicy {
        mode: PolicyMode::Enforce,
        min_confidence: 0.5,
        allow_kill_process: true,
        ..DefencePolicy::default()
    };
    let harness = harness(policy);
    let mut stream = start_and_connect(&harness).await;

    ipc::write_typed(&mut stream, &IpcMessage::Signal(sample_signal()))
        .await
        .unwrap();

    let mut capture = None;
    for _ in 0..100 {
        if let Some(item) = harness.broker.list().into_iter().find(|item| item.sealed) {
            capture = Some(std::fs::read_to_string(&item.storage_path).unwrap());
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let capture = capture.expect("decision captured");
    assert!(capture.contains("action permitted"));
    assert!(capture.contains("kill_process"));

    harness.cancel.cancel();
}

#[tokio::test]
async fn directives_fan_out_to_connected_workers() {
    let harness = harness(DefencePolicy::default());
    let mut stream = start_and_connect(&harness).await;

    ipc::write_typed(
        &mut stream,
        &IpcMessage::Hello {
            worker: "heartbeat".to_string(),
            pid: 7,
        },
    )
    .await
    .unwrap();
    // Give the connection task time to subscribe.
    tokio::time::sleep(Duration::from_millis(100)).await;

    harness.server.broadcast(IpcMessage::Reload);

    let received = tokio::time::timeout(Duration::from_secs(5), ipc::read_typed(&mut stream))
        .await
        .expect("directive within timeout")
        .unwrap()
        .expect("stream open");
    assert!(matches!(received, IpcMessage::Reload));

    harness.cancel.cancel();
}

#[tokio::test]
async fn oversized_frame_closes_connection_but_server_survives() {
    use tokio::io::AsyncWriteExt;

    let harness = harness(DefencePolicy::default());
    let mut stream = start_and_connect(&harness).await;

    // Declare a frame over the 16 MiB cap.
    let declared = (aegis_core::ipc::MAX_MESSAGE_SIZE as u32) + 1;
    stream.write_all(&declared.to_le_bytes()).await.unwrap();
    stream.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A fresh connection still works.
    let socket_path = harness.root.path().join("control.sock");
    let mut fresh = UnixStream::connect(&socket_path).await.unwrap();
    ipc::write_typed(&mut fresh, &IpcMessage::Signal(sample_signal()))
        .await
        .unwrap();

    let mut sealed = false;
    for _ in 0..100 {
        if harness.broker.list().iter().any(|item| item.sealed) {
            sealed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(sealed, "server kept serving after the bad frame");

    harness.cancel.cancel();
}
