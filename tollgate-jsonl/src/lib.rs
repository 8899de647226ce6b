//! JSONL sink for `tollgate` abuse reports. Writes one report per line.
//! Always appends; bring your own path (and your own rotation).

use serde_json::json;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use tollgate::telemetry::{AbuseReport, AbuseSink};

#[derive(Clone, Debug)]
pub struct JsonlAbuseSink {
    path: PathBuf,
}

impl JsonlAbuseSink {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl tower_service::Service<AbuseReport> for JsonlAbuseSink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, report: AbuseReport) -> Self::Future {
        let path = self.path.clone();
        let line = report_to_json(&report).to_string() + "\n";
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let mut file =
                tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            tracing::trace!(path = %path.display(), "abuse report appended");
            Ok(())
        })
    }
}

impl AbuseSink for JsonlAbuseSink {
    type SinkError = io::Error;
}

fn report_to_json(report: &AbuseReport) -> serde_json::Value {
    json!({
        "kind": "abuse",
        "client": report.client_key,
        "endpoint": report.endpoint_key,
        "reason": report.reason,
        "detail": report.detail,
        "at_ms": report.at_millis,
    })
}
