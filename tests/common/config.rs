//! Test configuration helpers for pumps wired to local mock servers

use export_subscriber::pump::memory::InMemoryBroker;
use export_subscriber::{
    Clock, Collaborators, Config, HttpBlobTransport, HttpCredentialIssuer, SubscriptionPump,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A pump plus the pieces a test inspects afterwards
pub struct TestPump {
    /// Pump under test
    pub pump: SubscriptionPump,
    /// Broker behind the pump's subscription
    pub broker: InMemoryBroker,
    /// Root of the output folders
    pub output: TempDir,
    /// Folder for working files
    pub work: TempDir,
}

/// Configuration pointing at `issuer_url` with fast polling
pub fn test_config(issuer_url: &str, output: &TempDir, work: &TempDir) -> Config {
    let mut config = Config::default();
    config.issuer.url = issuer_url.to_string();
    config.issuer.integration_name = "partner-a".to_string();
    config.issuer.access_token = Some("test-token".to_string());
    config.storage.output_dir = output.path().to_path_buf();
    config.storage.temp_dir = work.path().to_path_buf();
    config.pump.poll_interval = Duration::from_millis(20);
    config.retry.max_attempts = 0;
    config
}

/// Pump using the HTTP issuer and HTTP blob transport against `issuer_url`
pub fn http_pump(issuer_url: &str, clock: Arc<dyn Clock>) -> TestPump {
    let output = TempDir::new().expect("output dir");
    let work = TempDir::new().expect("work dir");
    let broker = InMemoryBroker::new();
    let config = test_config(issuer_url, &output, &work);

    let collaborators = Collaborators {
        issuer: Arc::new(HttpCredentialIssuer::new(&config.issuer).expect("issuer client")),
        connector: Arc::new(broker.clone()),
        blob_transport: Arc::new(HttpBlobTransport::new()),
        clock,
    };
    let pump = SubscriptionPump::new(config, collaborators).expect("valid config");

    TestPump {
        pump,
        broker,
        output,
        work,
    }
}
