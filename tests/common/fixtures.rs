//! Notification and blob fixtures

use export_subscriber::InboundMessage;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::Write;

/// Issue path every test issuer is mounted on
pub const ISSUE_PATH: &str = "/api/external/integration/export/temporaryendpoints";

/// Two-record blob body
pub const TWO_LINE_BLOB: &str = "{\"id\":1,\"name\":\"a\"}\n{\"id\":2,\"name\":\"b\"}\n";

/// Issuer response authorizing `{server}/exports` with `sig`
pub fn issuer_response(server: &str, sig: &str) -> serde_json::Value {
    serde_json::json!({
        "serviceBusSubscriptionConnectionString":
            "Endpoint=sb://bus.example/;SharedAccessKeyName=listen;SharedAccessKey=k;EntityPath=exports",
        "serviceBusSubscriptionName": "partner-a",
        "blobBaseUrlsWithToken": [format!("{server}/exports?sv=2020-08-04&sig={sig}")]
    })
}

/// Notification body for a "testdata" blob
pub fn notification_json(uri: &str, content_encoding: &str) -> serde_json::Value {
    serde_json::json!({
        "blobType": "testdata",
        "correlationId": "0d9c8a52-3f1e-4a8e-9c55-2b1f4c7de001",
        "contentType": "application/x-jsonlines",
        "contentEncoding": content_encoding,
        "uri": uri,
        "properties": { "tenant": "t-1" }
    })
}

/// Inbound message carrying `notification`
pub fn message(id: &str, notification: &serde_json::Value) -> InboundMessage {
    InboundMessage::new(id, notification.to_string().into_bytes())
}

/// `count` JSON lines
pub fn json_lines(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| format!(r#"{{"id":{i},"name":"item-{i}","subitems":[{i}]}}"#))
        .collect()
}

/// Gzip `lines` joined by newlines
pub fn gzip_lines(lines: &[String]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(lines.join("\n").as_bytes())
        .expect("gzip write");
    encoder.finish().expect("gzip finish")
}
