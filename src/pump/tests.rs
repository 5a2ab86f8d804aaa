// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::memory::InMemoryBroker;
use super::*;
use crate::clock::MockClock;
use crate::error::{FetchError, IssuerError, ProcessingError};
use crate::types::{BlobEndpoint, IssuedCredentials};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tempfile::TempDir;
use tokio::sync::Notify;
use url::Url;

const BASE: &str = "https://acct.blob.example/exports";

struct CountingIssuer {
    calls: AtomicU32,
    reject: bool,
}

impl CountingIssuer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            reject: false,
        })
    }

    fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            reject: true,
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialIssuer for CountingIssuer {
    async fn issue(&self) -> std::result::Result<IssuedCredentials, IssuerError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reject {
            return Err(IssuerError::Rejected {
                status: 403,
                hint: "",
            });
        }
        Ok(IssuedCredentials {
            connection_descriptor: "Endpoint=sb://bus.example/;SharedAccessKey=k;EntityPath=exports"
                .into(),
            subscription_name: "partner-sub".into(),
            blob_endpoints: vec![BlobEndpoint {
                base_url: BASE.into(),
                token_query: format!("sig={n}"),
            }],
        })
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

#[derive(Default)]
struct FakeBlobs {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<VecDeque<FetchError>>,
    requested: Mutex<Vec<Url>>,
    stall: AtomicBool,
    stalled: Notify,
}

impl FakeBlobs {
    fn put(&self, name: &str, body: &[u8]) -> String {
        let uri = format!("{BASE}/{name}");
        let path = Url::parse(&uri).unwrap().path().to_string();
        self.bodies.lock().unwrap().insert(path, body.to_vec());
        uri
    }

    fn fail_next(&self, error: FetchError) {
        self.failures.lock().unwrap().push_back(error);
    }

    fn requested(&self) -> Vec<Url> {
        self.requested.lock().unwrap().clone()
    }

    /// Hold downloads until their cancel token fires
    fn stall_downloads(&self, stall: bool) {
        self.stall.store(stall, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobTransport for FakeBlobs {
    async fn download_to(
        &self,
        url: &Url,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> std::result::Result<u64, FetchError> {
        self.requested.lock().unwrap().push(url.clone());
        if self.stall.load(Ordering::SeqCst) {
            self.stalled.notify_one();
            cancel.cancelled().await;
            return Err(FetchError::Cancelled);
        }
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let body = self
            .bodies
            .lock()
            .unwrap()
            .get(url.path())
            .cloned()
            .ok_or_else(|| FetchError::Http {
                status: 404,
                uri: url.path().to_string(),
            })?;
        std::fs::write(dest, &body).map_err(|source| FetchError::Io {
            path: dest.to_path_buf(),
            source,
        })?;
        Ok(body.len() as u64)
    }
}

struct Harness {
    pump: SubscriptionPump,
    broker: InMemoryBroker,
    issuer: Arc<CountingIssuer>,
    blobs: Arc<FakeBlobs>,
    clock: MockClock,
    output: TempDir,
    _work: TempDir,
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 6, 9, 0, 0).unwrap()
}

fn test_config(output: &Path, work: &Path) -> Config {
    let mut config = Config::default();
    config.issuer.url = "https://issuer.example.com".into();
    config.issuer.integration_name = "partner".into();
    config.storage.output_dir = output.to_path_buf();
    config.storage.temp_dir = work.to_path_buf();
    config.pump.poll_interval = std::time::Duration::from_millis(10);
    config
}

fn harness_with(issuer: Arc<CountingIssuer>) -> Harness {
    harness_configured(issuer, |_| {})
}

fn harness_configured(
    issuer: Arc<CountingIssuer>,
    configure: impl FnOnce(&mut Config),
) -> Harness {
    let output = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let broker = InMemoryBroker::new();
    let blobs = Arc::new(FakeBlobs::default());
    let clock = MockClock::new(t0());
    let mut config = test_config(output.path(), work.path());
    configure(&mut config);

    let pump = SubscriptionPump::new(
        config,
        Collaborators {
            issuer: issuer.clone(),
            connector: Arc::new(broker.clone()),
            blob_transport: blobs.clone(),
            clock: Arc::new(clock.clone()),
        },
    )
    .unwrap();

    Harness {
        pump,
        broker,
        issuer,
        blobs,
        clock,
        output,
        _work: work,
    }
}

async fn started() -> Harness {
    let mut h = harness_with(CountingIssuer::new());
    h.pump.start().await.unwrap();
    h
}

fn notification_body(uri: &str, blob_type: &str, content_type: &str) -> Vec<u8> {
    serde_json::json!({
        "blobType": blob_type,
        "correlationId": "6f1c2d9e-0000-4000-8000-000000000001",
        "contentType": content_type,
        "contentEncoding": "",
        "uri": uri,
        "properties": {}
    })
    .to_string()
    .into_bytes()
}

fn testdata_message(id: &str, uri: &str) -> InboundMessage {
    InboundMessage::new(
        id,
        notification_body(uri, "testdata", "application/x-jsonlines"),
    )
}

fn drain(events: &mut broadcast::Receiver<PumpEvent>) -> Vec<PumpEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test]
async fn test_start_connects_sequential_receiver() {
    let h = started().await;

    let connects = h.broker.connects();
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0].topic, "exports");
    assert_eq!(connects[0].subscription_name, "partner-sub");
    assert_eq!(connects[0].options, ReceiverOptions::sequential(10));
    assert_eq!(h.issuer.calls(), 1);
    assert_eq!(
        h.pump.credentials().current().await.unwrap().issued_at,
        t0()
    );
}

#[tokio::test]
async fn test_start_fails_without_credentials() {
    let mut h = harness_with(CountingIssuer::rejecting());
    let result = h.pump.start().await;
    assert!(matches!(result, Err(Error::Issuer(_))));
    assert!(h.broker.connects().is_empty());
    assert!(!h.pump.is_connected());
}

#[tokio::test]
async fn test_new_rejects_invalid_config() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), dir.path());
    config.issuer.integration_name.clear();
    let broker = InMemoryBroker::new();
    let result = SubscriptionPump::new(
        config,
        Collaborators {
            issuer: CountingIssuer::new(),
            connector: Arc::new(broker),
            blob_transport: Arc::new(FakeBlobs::default()),
            clock: Arc::new(MockClock::new(t0())),
        },
    );
    assert!(matches!(result, Err(Error::Config { .. })));
}

#[tokio::test]
async fn test_two_line_blob_is_processed_and_completed() {
    let mut h = started().await;
    let uri = h
        .blobs
        .put("blob", b"{\"id\":1,\"name\":\"a\"}\n{\"id\":2,\"name\":\"b\"}\n");
    let message = testdata_message("msg-1", &uri);
    h.broker.publish(message.clone());

    let outcome = h.pump.poll_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(outcome, Some(HandleOutcome::Completed { records: 2 }));
    assert_eq!(h.broker.completed(), vec!["msg-1".to_string()]);
    assert!(h.broker.abandoned().is_empty());

    let folder = h.output.path().join("msg-1");
    assert_eq!(
        std::fs::read_to_string(folder.join("0000000000.json")).unwrap(),
        r#"{"id":1,"name":"a"}"#
    );
    assert_eq!(
        std::fs::read_to_string(folder.join("0000000001.json")).unwrap(),
        r#"{"id":2,"name":"b"}"#
    );
    let metadata: BlobNotification =
        serde_json::from_str(&std::fs::read_to_string(folder.join("metadata.json")).unwrap())
            .unwrap();
    assert_eq!(metadata, BlobNotification::from_body(&message.body).unwrap());

    let requested = h.blobs.requested();
    assert_eq!(requested.len(), 1);
    assert_eq!(requested[0].query(), Some("sig=0"));
}

#[tokio::test]
async fn test_working_file_is_removed_after_handling() {
    let mut h = started().await;
    let uri = h.blobs.put("blob", b"{\"id\":1}\n");
    h.broker.publish(testdata_message("msg-1", &uri));

    h.pump.poll_once(&CancellationToken::new()).await.unwrap();

    let leftovers = std::fs::read_dir(h._work.path()).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_malformed_body_is_dropped_once() {
    let mut h = started().await;
    h.broker.publish(InboundMessage::new("bad", b"not json at all".to_vec()));
    let mut events = h.pump.subscribe();

    let outcome = h.pump.poll_once(&CancellationToken::new()).await.unwrap();

    assert!(matches!(outcome, Some(HandleOutcome::Dropped { .. })));
    assert_eq!(h.broker.completed(), vec!["bad".to_string()]);
    assert!(h.blobs.requested().is_empty());
    assert!(matches!(
        drain(&mut events).as_slice(),
        [PumpEvent::MessageDropped { message_id, .. }] if message_id == "bad"
    ));
    assert_eq!(h.pump.poll_once(&CancellationToken::new()).await.unwrap(), None);
}

#[tokio::test]
async fn test_unsupported_content_type_is_dropped_without_output() {
    let mut h = started().await;
    let uri = h.blobs.put("blob.csv", b"id,name\n1,a\n");
    h.broker.publish(InboundMessage::new(
        "csv",
        notification_body(&uri, "testdata", "text/csv"),
    ));

    let outcome = h.pump.poll_once(&CancellationToken::new()).await.unwrap();

    assert!(matches!(outcome, Some(HandleOutcome::Dropped { .. })));
    assert_eq!(h.broker.completed(), vec!["csv".to_string()]);
    assert!(!h.output.path().join("csv").exists());
    assert_eq!(h.pump.poll_once(&CancellationToken::new()).await.unwrap(), None);
}

#[tokio::test]
async fn test_malformed_record_line_is_left_for_redelivery() {
    let mut h = started().await;
    let uri = h.blobs.put("blob", b"{\"id\":1}\nnot a record\n");
    h.broker.publish(testdata_message("bad-line", &uri));

    let error = h
        .pump
        .poll_once(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        Error::Processing(ProcessingError::InvalidRecord { index: 1, .. })
    ));
    assert_eq!(error.classify(), ErrorClass::Unclassified);
    assert!(h.broker.completed().is_empty());
    assert_eq!(h.broker.abandoned(), vec!["bad-line".to_string()]);
    assert_eq!(h.broker.pending(), 1);
    assert!(!h.output.path().join("bad-line").join("metadata.json").exists());
}

#[tokio::test]
async fn test_other_blob_type_is_completed_without_download() {
    let mut h = started().await;
    h.broker.publish(InboundMessage::new(
        "orders",
        notification_body(&format!("{BASE}/orders"), "orders", "application/x-jsonlines"),
    ));

    let outcome = h.pump.poll_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(outcome, Some(HandleOutcome::Completed { records: 0 }));
    assert!(h.blobs.requested().is_empty());
    assert!(!h.output.path().join("orders").exists());
}

#[tokio::test]
async fn test_blob_unauthorized_refreshes_and_rebuilds_fetcher_only() {
    let mut h = started().await;
    let uri = h.blobs.put("blob", b"{\"id\":1}\n");
    h.broker.publish(testdata_message("msg-1", &uri));
    h.blobs.fail_next(FetchError::Unauthorized { status: 403 });
    h.clock.advance(Duration::minutes(6));
    let mut events = h.pump.subscribe();

    let error = h
        .pump
        .poll_once(&CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(
        error.classify(),
        ErrorClass::CredentialExpired(CredentialScope::Blob)
    );
    assert_eq!(h.broker.abandoned(), vec!["msg-1".to_string()]);
    assert!(h.broker.completed().is_empty());

    h.pump.handle_error(&error).await;

    assert_eq!(h.issuer.calls(), 2);
    assert_eq!(h.broker.connects().len(), 1, "subscription untouched");
    let events = drain(&mut events);
    assert!(events.contains(&PumpEvent::FetcherRebuilt));
    assert!(!events.contains(&PumpEvent::SubscriptionRebuilt));

    let outcome = h.pump.poll_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, Some(HandleOutcome::Completed { records: 1 }));
    assert_eq!(h.blobs.requested().last().unwrap().query(), Some("sig=1"));
}

#[tokio::test]
async fn test_subscription_unauthorized_refreshes_and_reconnects() {
    let mut h = started().await;
    h.broker
        .fail_next_receive(TransportError::Unauthorized("token expired".into()));
    h.clock.advance(Duration::minutes(5));
    let mut events = h.pump.subscribe();

    let error = h
        .pump
        .poll_once(&CancellationToken::new())
        .await
        .unwrap_err();
    h.pump.handle_error(&error).await;

    assert_eq!(h.issuer.calls(), 2);
    assert_eq!(h.broker.connects().len(), 2);
    assert_eq!(h.broker.closes(), 1);
    assert!(drain(&mut events).contains(&PumpEvent::SubscriptionRebuilt));
    assert_eq!(h.pump.state(), PumpState::Active);
}

#[tokio::test]
async fn test_rejected_reconnect_refreshes_once_interval_has_passed() {
    let mut h = started().await;
    h.broker
        .fail_next_receive(TransportError::Unauthorized("token expired".into()));
    h.broker
        .fail_next_connect(TransportError::Unauthorized("descriptor expired".into()));
    h.broker
        .fail_next_connect(TransportError::Unauthorized("descriptor expired".into()));

    // Too early to refresh: the stale descriptor is rejected and the subscription is lost
    h.clock.advance(Duration::minutes(1));
    let error = h
        .pump
        .poll_once(&CancellationToken::new())
        .await
        .unwrap_err();
    h.pump.handle_error(&error).await;
    assert_eq!(h.issuer.calls(), 1);
    assert!(!h.pump.is_connected());

    h.clock.advance(Duration::minutes(10));
    let mut events = h.pump.subscribe();
    let error = h
        .pump
        .poll_once(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        Error::Transport(TransportError::Disconnected(_))
    ));
    h.pump.handle_error(&error).await;

    assert_eq!(h.issuer.calls(), 2, "rejected reconnect refreshed the bundle");
    assert!(h.pump.is_connected());
    assert_eq!(h.broker.connects().len(), 2);
    assert!(drain(&mut events).contains(&PumpEvent::SubscriptionRebuilt));
}

#[tokio::test]
async fn test_denied_refresh_gates_messages_until_cooldown_ends() {
    let mut h = started().await;
    let uri = h.blobs.put("blob", b"{\"id\":1}\n");

    // Expired token one minute after issue: refresh is denied, cooldown armed
    h.clock.advance(Duration::minutes(1));
    h.broker.publish(testdata_message("first", &uri));
    h.blobs.fail_next(FetchError::Unauthorized { status: 401 });
    let error = h
        .pump
        .poll_once(&CancellationToken::new())
        .await
        .unwrap_err();
    h.pump.handle_error(&error).await;

    let resume_at = t0() + Duration::minutes(6);
    assert_eq!(h.issuer.calls(), 1, "refresh denied");
    assert_eq!(h.pump.state(), PumpState::CooldownPending { resume_at });
    let fetches_before = h.blobs.requested().len();

    // A message inside the cooldown is returned untouched
    h.clock.advance(Duration::minutes(1));
    let mut events = h.pump.subscribe();
    let outcome = h.pump.poll_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(outcome, Some(HandleOutcome::Deferred));
    assert_eq!(h.blobs.requested().len(), fetches_before);
    assert_eq!(
        h.broker.abandoned(),
        vec!["first".to_string(), "first".to_string()]
    );
    assert!(h.broker.completed().is_empty());
    let events = drain(&mut events);
    assert!(events.contains(&PumpEvent::CooldownStarted { resume_at }));
    assert!(events.contains(&PumpEvent::CooldownEnded));

    // The pump waited out the cooldown; the redelivery is handled normally
    assert!(h.clock.now() >= resume_at);
    assert_eq!(h.pump.state(), PumpState::Active);
    let outcome = h.pump.poll_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, Some(HandleOutcome::Completed { records: 1 }));
    assert_eq!(h.broker.completed(), vec!["first".to_string()]);
}

#[tokio::test]
async fn test_cancel_during_cooldown_leaves_message_unacknowledged() {
    let mut h = started().await;
    let uri = h.blobs.put("blob", b"{\"id\":1}\n");
    h.blobs.fail_next(FetchError::Unauthorized { status: 403 });
    h.broker.publish(testdata_message("m", &uri));
    let error = h
        .pump
        .poll_once(&CancellationToken::new())
        .await
        .unwrap_err();
    h.pump.handle_error(&error).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let message = testdata_message("m2", &uri);
    let result = h.pump.handle_message(message, &cancel).await;

    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(h.broker.completed().is_empty());
    assert!(h.broker.abandoned().contains(&"m2".to_string()));
}

#[tokio::test]
async fn test_no_matching_credential_is_configuration_fault() {
    let mut h = started().await;
    h.broker.publish(testdata_message(
        "foreign",
        "https://other-account.blob.example/exports/blob",
    ));
    let mut events = h.pump.subscribe();

    let error = h
        .pump
        .poll_once(&CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(error.classify(), ErrorClass::NoMatchingCredential);
    h.pump.handle_error(&error).await;

    assert_eq!(h.issuer.calls(), 1, "no refresh for a configuration fault");
    assert!(h.blobs.requested().is_empty());
    assert!(h.broker.completed().is_empty());
    assert!(
        drain(&mut events)
            .iter()
            .any(|e| matches!(e, PumpEvent::ConfigurationFault { .. }))
    );
}

#[tokio::test]
async fn test_storage_error_is_left_for_redelivery() {
    let mut h = started().await;
    h.broker
        .publish(testdata_message("missing", &format!("{BASE}/not-there")));

    let error = h
        .pump
        .poll_once(&CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(error.classify(), ErrorClass::Unclassified);
    h.pump.handle_error(&error).await;

    assert_eq!(h.broker.abandoned(), vec!["missing".to_string()]);
    assert_eq!(h.broker.pending(), 1);
    assert_eq!(h.issuer.calls(), 1);
}

#[tokio::test]
async fn test_run_until_cancelled() {
    let h = started().await;
    let uri = h.blobs.put("blob", b"{\"id\":7,\"name\":\"seven\"}\n");
    h.broker.publish(testdata_message("run-1", &uri));

    let Harness {
        mut pump,
        broker,
        output: _output,
        _work,
        ..
    } = h;
    let mut events = pump.subscribe();
    let cancel = CancellationToken::new();
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { pump.run(cancel).await })
    };

    loop {
        match events.recv().await.unwrap() {
            PumpEvent::MessageCompleted { message_id, records } => {
                assert_eq!(message_id, "run-1");
                assert_eq!(records, 1);
                break;
            }
            _ => continue,
        }
    }
    cancel.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(broker.completed(), vec!["run-1".to_string()]);
    assert_eq!(broker.closes(), 1);
    loop {
        if events.recv().await.unwrap() == PumpEvent::Stopped {
            break;
        }
    }
}

#[tokio::test]
async fn test_processing_deadline_abandons_and_allows_redelivery() {
    let mut h = harness_configured(CountingIssuer::new(), |config| {
        config.pump.lock_duration = std::time::Duration::from_secs(2);
        config.pump.lock_margin = std::time::Duration::from_secs(1);
    });
    h.pump.start().await.unwrap();
    let uri = h.blobs.put("blob", b"{\"id\":1}\n");
    h.blobs.stall_downloads(true);
    h.broker.publish(testdata_message("slow", &uri));

    let error = h
        .pump
        .poll_once(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(error, Error::DeadlineExceeded { seconds: 1 }));
    assert_eq!(error.classify(), ErrorClass::Unclassified);
    assert!(h.broker.completed().is_empty());
    assert_eq!(h.broker.abandoned(), vec!["slow".to_string()]);
    assert!(!h.output.path().join("slow").exists());
    assert_eq!(std::fs::read_dir(h._work.path()).unwrap().count(), 0);

    h.blobs.stall_downloads(false);
    let outcome = h.pump.poll_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, Some(HandleOutcome::Completed { records: 1 }));
    assert_eq!(h.broker.completed(), vec!["slow".to_string()]);
}

#[tokio::test]
async fn test_cancel_during_download_abandons_and_stops() {
    let h = started().await;
    let uri = h.blobs.put("blob", b"{\"id\":1}\n");
    h.blobs.stall_downloads(true);
    h.broker.publish(testdata_message("slow", &uri));

    let Harness {
        mut pump,
        broker,
        blobs,
        output,
        _work,
        ..
    } = h;
    let cancel = CancellationToken::new();
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { pump.run(cancel).await })
    };

    blobs.stalled.notified().await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    assert!(broker.completed().is_empty());
    assert_eq!(broker.abandoned(), vec!["slow".to_string()]);
    assert_eq!(broker.pending(), 1);
    assert_eq!(broker.closes(), 1);
    assert!(!output.path().join("slow").exists());
}
