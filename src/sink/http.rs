use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::config::HttpExportConfig;
use crate::pipeline::error::SinkError;
use crate::pipeline::sample::EmittedRecord;

use super::{format_datetime, Sink};

/// JSON schema for HTTP export of one emitted record.
#[derive(Debug, Clone, Serialize)]
pub struct ReducedRecordJson<'a> {
    pub table: &'a str,
    pub time: String,
    pub node_id: &'a str,
    pub source: &'a str,
    pub label: &'a str,
    pub value: f64,
}

impl<'a> ReducedRecordJson<'a> {
    fn new(table: &'a str, r: &'a EmittedRecord) -> Self {
        Self {
            table,
            time: format_datetime(r.time),
            node_id: &r.series.node_id,
            source: &r.series.source,
            label: &r.series.label,
            value: r.value,
        }
    }
}

/// HTTP NDJSON exporter with compression (e.g., to Vector).
///
/// Records are sent in order, `batch_size` per POST. A failed request
/// aborts the write; earlier requests are not rolled back.
pub struct HttpSink {
    cfg: Arc<HttpExportConfig>,
    client: reqwest::Client,
}

impl HttpSink {
    /// Creates a new HTTP sink with the given configuration.
    pub fn new(cfg: HttpExportConfig) -> Result<Self> {
        let mut client_builder = reqwest::Client::builder().timeout(cfg.export_timeout);

        if !cfg.keep_alive {
            client_builder = client_builder.pool_max_idle_per_host(0);
        }

        let client = client_builder.build().context("building HTTP client")?;

        tracing::info!(
            address = %cfg.address,
            compression = %cfg.compression,
            batch_size = cfg.batch_size,
            "HTTP sink configured",
        );

        Ok(Self {
            cfg: Arc::new(cfg),
            client,
        })
    }

    async fn send_all(&self, target: &str, records: &[EmittedRecord]) -> Result<usize> {
        let mut written = 0;
        for chunk in records.chunks(self.cfg.batch_size.max(1)) {
            send_batch(&self.client, &self.cfg, target, chunk)
                .await
                .with_context(|| format!("after {written} records"))?;
            written += chunk.len();
        }
        Ok(written)
    }
}

impl Sink for HttpSink {
    fn name(&self) -> &str {
        "http"
    }

    async fn write(&self, target: &str, records: &[EmittedRecord]) -> Result<usize, SinkError> {
        if records.is_empty() {
            return Ok(0);
        }

        self.send_all(target, records)
            .await
            .map_err(|e| SinkError::new(self.name(), e))
    }
}

/// Serializes records as newline-delimited JSON.
fn encode_ndjson(target: &str, records: &[EmittedRecord]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(records.len() * 128);
    for r in records {
        serde_json::to_writer(&mut buf, &ReducedRecordJson::new(target, r))
            .context("serializing record to JSON")?;
        buf.push(b'\n');
    }
    Ok(buf)
}

/// Sends one batch of records via HTTP.
async fn send_batch(
    client: &reqwest::Client,
    cfg: &HttpExportConfig,
    target: &str,
    records: &[EmittedRecord],
) -> Result<()> {
    let buf = encode_ndjson(target, records)?;
    let raw_len = buf.len();

    let compressed = compress(&buf, &cfg.compression).context("compressing NDJSON data")?;

    let mut request = client
        .post(&cfg.address)
        .header("Content-Type", "application/x-ndjson")
        .body(compressed);

    if let Some(encoding) = content_encoding(&cfg.compression) {
        request = request.header("Content-Encoding", encoding);
    }

    for (k, v) in &cfg.headers {
        request = request.header(k.as_str(), v.as_str());
    }

    let resp = request
        .send()
        .await
        .context("sending HTTP export request")?;

    let status = resp.status();
    // Drain body for connection reuse.
    let _ = resp.bytes().await;

    if !status.is_success() {
        bail!("HTTP export unexpected status: {status}");
    }

    debug!(
        target,
        records = records.len(),
        bytes = raw_len,
        "exported batch via HTTP",
    );

    Ok(())
}

// --- Compression ---

/// Compresses data using the specified algorithm.
fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => compress_gzip(data),
        "zstd" => compress_zstd(data),
        "zlib" => compress_zlib(data),
        "snappy" => compress_snappy(data),
        other => bail!("unsupported compression: {other}"),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        "zstd" => Some("zstd"),
        "zlib" => Some("deflate"),
        "snappy" => Some("snappy"),
        _ => None,
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}

fn compress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    zstd::encode_all(data, 0).context("zstd encode")
}

fn compress_zlib(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("zlib write")?;
    encoder.finish().context("zlib finish")
}

fn compress_snappy(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = snap::raw::Encoder::new();
    encoder.compress_vec(data).context("snappy encode")
}
