//! End-to-end patch-job flow: poll, validate, execute, report, spool,
//! ship — against a scripted exchange.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aegis_core::command::{
    AckStatus, CommandChannel, PatchDescriptor, PatchJobCommand, PatchOutcome, RebootPolicy,
    canonical_signing_payload,
};
use aegis_core::config::Config;
use aegis_core::crypto::sign_payload;
use aegis_core::job::{ExecutionOutcome, Executor, JobRunner};
use aegis_core::transport::{
    HttpExchange, HttpRequest, HttpResponse, SignedTransport, TransportError,
};
use aegis_core::uplink::{Shipper, SpoolWriter};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const SHARED_KEY: &str = "integration-shared-key";

/// Records every request; answers 200 unless a response is scripted for
/// the URL suffix.
#[derive(Default)]
struct ScriptedExchange {
    requests: Mutex<Vec<HttpRequest>>,
    scripted: Mutex<Vec<(String, HttpResponse)>>,
}

impl ScriptedExchange {
    fn script(&self, url_suffix: &str, response: HttpResponse) {
        self.scripted
            .lock()
            .unwrap()
            .push((url_suffix.to_string(), response));
    }

    fn recorded(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpExchange for ScriptedExchange {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = request.url.clone();
        self.requests.lock().unwrap().push(request);

        let mut scripted = self.scripted.lock().unwrap();
        if let Some(position) = scripted.iter().position(|(suffix, _)| url.ends_with(suffix)) {
            return Ok(scripted.remove(position).1);
        }
        Ok(HttpResponse {
            status: 200,
            body: Vec::new(),
        })
    }
}

struct InstallingExecutor;

#[async_trait]
impl Executor for InstallingExecutor {
    async fn execute(&self, command: &PatchJobCommand) -> ExecutionOutcome {
        ExecutionOutcome {
            result: PatchOutcome::Installed,
            exit_code: 0,
            reboot_required: false,
            stdout_summary: format!("installed {}", command.patches.len()),
            stderr_summary: String::new(),
        }
    }
}

fn test_config() -> Arc<Config> {
    let mut ini = HashMap::new();
    for (key, value) in [
        ("tenant_id", "tenant-1"),
        ("asset_id", "asset-1"),
        ("identity_id", "identity-1"),
        ("shared_key", SHARED_KEY),
        ("transport_url", "https://cp.example:8443"),
    ] {
        ini.insert(key.to_string(), value.to_string());
    }
    Arc::new(Config::from_sources(&ini, |_| None).unwrap())
}

fn signed_job(nonce: &str) -> PatchJobCommand {
    let now = Utc::now();
    let mut command = PatchJobCommand {
        job_id: "j1".to_string(),
        asset_id: "asset-1".to_string(),
        scheduled_at: (now + chrono::Duration::seconds(2))
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        reboot_policy: RebootPolicy::None,
        issued_at_epoch: now.timestamp(),
        nonce: nonce.to_string(),
        signature: String::new(),
        patches: vec![PatchDescriptor {
            patch_id: "p1".to_string(),
            title: "Cumulative update".to_string(),
            vendor: "Vendor".to_string(),
            severity: "important".to_string(),
            kb: "KB5023456".to_string(),
        }],
    };
    let payload = canonical_signing_payload(&command);
    command.signature = sign_payload(
        SHARED_KEY,
        payload.as_bytes(),
        command.issued_at_epoch,
    )
    .unwrap();
    command
}

#[tokio::test(start_paused = true)]
async fn full_job_lifecycle_reaches_both_endpoints() {
    let root = TempDir::new().unwrap();
    let spool_dir = root.path().join("uplink_queue");
    let exchange = Arc::new(ScriptedExchange::default());
    let config = test_config();

    // Poll returns the signed job once, then 204.
    exchange.script(
        "/mtls/rmm/patch-jobs/next?asset_id=asset-1",
        HttpResponse {
            status: 200,
            body: serde_json::to_vec(&signed_job("nonce-e2e")).unwrap(),
        },
    );

    let channel = CommandChannel::new(SignedTransport::new(config.clone(), exchange.clone()));
    let cancel = CancellationToken::new();
    let runner = JobRunner::new(
        channel,
        SpoolWriter::new(&spool_dir),
        Duration::from_secs(60),
        cancel,
    );

    let command = runner
        .channel()
        .poll_next_patch_job()
        .await
        .unwrap()
        .expect("verified job");
    let result = runner.run(&command, &InstallingExecutor).await.unwrap();

    assert_eq!(result.status, AckStatus::Completed);
    assert_eq!(result.result, PatchOutcome::Installed);

    // Control plane saw the monotone ack prefix and the result.
    let ack_statuses: Vec<String> = exchange
        .recorded()
        .iter()
        .filter(|request| request.url.ends_with("/mtls/rmm/patch-jobs/ack"))
        .map(|request| {
            serde_json::from_slice::<serde_json::Value>(&request.body).unwrap()["status"]
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect();
    assert_eq!(ack_statuses, vec!["received", "scheduled", "running", "completed"]);
    assert!(exchange
        .recorded()
        .iter()
        .any(|request| request.url.ends_with("/mtls/rmm/patch-jobs/result")));

    // The PSA copy waits in the spool; shipping drains it.
    let shipper = Shipper::new(
        SignedTransport::new(config, exchange.clone()),
        &spool_dir,
    );
    let summary = shipper.run_once().await;
    assert_eq!(summary.succeeded, 1);
    assert!(exchange
        .recorded()
        .iter()
        .any(|request| request.url.ends_with("/patch-results")));
    assert_eq!(std::fs::read_dir(&spool_dir).unwrap().count(), 0);

    // Replayed delivery of the same nonce is rejected.
    exchange.script(
        "/mtls/rmm/patch-jobs/next?asset_id=asset-1",
        HttpResponse {
            status: 200,
            body: serde_json::to_vec(&signed_job("nonce-e2e")).unwrap(),
        },
    );
    assert!(runner.channel().poll_next_patch_job().await.unwrap().is_none());
    let last_ack = exchange
        .recorded()
        .into_iter()
        .filter(|request| request.url.ends_with("/mtls/rmm/patch-jobs/ack"))
        .next_back()
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&last_ack.body).unwrap();
    assert_eq!(body["status"], "rejected");
    assert_eq!(body["detail"], "replay");
}
