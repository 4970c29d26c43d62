//! Inline data-redaction pipeline
//!
//! Splits outbound payloads into bounded chunks, submits them concurrently
//! to a classify/mask service, and reassembles the results in original
//! order. Availability wins over completeness: a chunk that errors or
//! times out degrades to its original bytes, and the failure is recorded
//! in the transformation summary rather than propagated to the client.
//!
//! The service itself is an external collaborator behind the
//! [`Classifier`] trait; this module only owns chunking, timeout and
//! reassembly policy.

pub mod http;
pub mod postgres;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::config::RedactionLimits;
use crate::error::{ProxyError, Result};

// ============================================================================
// Classifier interface
// ============================================================================

/// Masking parameters passed through to the classify service.
#[derive(Debug, Clone)]
pub struct MaskingConfig {
    /// Character used to mask matched values
    pub masking_character: String,
    /// Number of characters to mask per match (0 = all)
    pub number_to_mask: i32,
    /// Requested info-type names
    pub info_types: Vec<String>,
}

impl MaskingConfig {
    /// Build from per-session info types plus process-wide limits.
    /// Empty names are skipped; exceeding the info-type cap is an error.
    pub fn new(info_types: &[String], limits: &RedactionLimits) -> Result<Self> {
        let info_types: Vec<String> = info_types
            .iter()
            .filter(|t| !t.is_empty())
            .cloned()
            .collect();
        if info_types.len() > limits.max_info_types {
            return Err(ProxyError::Config(format!(
                "max ({}) info types reached",
                limits.max_info_types
            )));
        }
        Ok(Self {
            masking_character: limits.masking_character.clone(),
            number_to_mask: limits.number_to_mask,
            info_types,
        })
    }

    pub fn is_enabled(&self) -> bool {
        !self.info_types.is_empty()
    }
}

/// One (count, code, details) entry of a transformation result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryResult {
    pub count: i64,
    pub code: String,
    pub details: String,
}

/// Per-chunk outcome reported upstream alongside the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformationSummary {
    /// Chunk index within the submitted payload
    pub index: usize,
    /// Headline: info type name and transformed byte count
    #[serde(default)]
    pub summary: Vec<String>,
    /// Individual transformation results
    #[serde(default)]
    pub results: Vec<SummaryResult>,
    /// Set when the chunk degraded to its original bytes
    #[serde(default)]
    pub error: Option<String>,
}

impl TransformationSummary {
    fn degraded(index: usize, err: &ProxyError) -> Self {
        Self {
            index,
            error: Some(err.to_string()),
            ..Default::default()
        }
    }
}

/// Masked free-text content plus its transformation results.
#[derive(Debug, Clone, Default)]
pub struct RedactedText {
    pub content: String,
    pub summary: Vec<String>,
    pub results: Vec<SummaryResult>,
}

/// Column-oriented table submitted as one classify unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Masked table content plus its transformation results.
#[derive(Debug, Clone, Default)]
pub struct RedactedTable {
    pub rows: Vec<Vec<String>>,
    pub summary: Vec<String>,
    pub results: Vec<SummaryResult>,
}

/// Classify/mask service client.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Mask matches in a free-text buffer.
    async fn deidentify_text(&self, config: &MaskingConfig, text: &str) -> Result<RedactedText>;

    /// Mask matches in a tabular structure, preserving its shape.
    async fn deidentify_table(&self, config: &MaskingConfig, table: &Table)
        -> Result<RedactedTable>;
}

// ============================================================================
// Chunk pipeline
// ============================================================================

/// One redaction chunk: index, (possibly masked) data, and its summary.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: usize,
    pub data: Bytes,
    pub summary: TransformationSummary,
}

/// Split a payload into chunks of at most `max_chunk_size` bytes.
///
/// Boundaries are purely byte-offset based; every input byte lands in
/// exactly one chunk.
pub fn split_into_chunks(payload: &[u8], max_chunk_size: usize) -> Vec<Bytes> {
    if payload.len() <= max_chunk_size {
        return vec![Bytes::copy_from_slice(payload)];
    }
    payload
        .chunks(max_chunk_size)
        .map(Bytes::copy_from_slice)
        .collect()
}

/// Submit chunks concurrently, each under its own timeout.
///
/// Completion order is irrelevant: results are placed by index. A chunk
/// that errors, times out, or is not valid UTF-8 comes back as its
/// original bytes with the failure noted in its summary.
pub async fn redact_chunks(
    classifier: &Arc<dyn Classifier>,
    config: &MaskingConfig,
    limits: &RedactionLimits,
    chunks: Vec<Bytes>,
) -> Vec<Chunk> {
    let timeout = Duration::from_secs(limits.request_timeout_secs);
    let futures = chunks.into_iter().enumerate().map(|(index, data)| {
        let classifier = Arc::clone(classifier);
        let config = config.clone();
        async move { deidentify_chunk(&classifier, &config, timeout, index, data).await }
    });

    let mut redacted: Vec<Chunk> = join_all(futures).await;
    // join_all already preserves submission order; sorting by index keeps
    // the reassembly guarantee independent of completion order.
    redacted.sort_by_key(|c| c.index);
    redacted
}

async fn deidentify_chunk(
    classifier: &Arc<dyn Classifier>,
    config: &MaskingConfig,
    timeout: Duration,
    index: usize,
    data: Bytes,
) -> Chunk {
    let text = match std::str::from_utf8(&data) {
        Ok(text) => text,
        Err(_) => {
            // Binary content cannot round-trip through a textual classify
            // request; pass it through untouched.
            let err = ProxyError::Redaction("chunk is not valid UTF-8".into());
            return Chunk {
                index,
                data,
                summary: TransformationSummary::degraded(index, &err),
            };
        }
    };

    let result = tokio::time::timeout(timeout, classifier.deidentify_text(config, text)).await;
    match result {
        Ok(Ok(redacted)) => Chunk {
            index,
            data: Bytes::from(redacted.content.into_bytes()),
            summary: TransformationSummary {
                index,
                summary: redacted.summary,
                results: redacted.results,
                error: None,
            },
        },
        Ok(Err(err)) => {
            warn!("failed deidentifying chunk ({index}), err={err}");
            Chunk {
                index,
                data,
                summary: TransformationSummary::degraded(index, &err),
            }
        }
        Err(_) => {
            let err = ProxyError::Timeout(format!("classify request for chunk {index}"));
            warn!("failed deidentifying chunk ({index}), err={err}");
            Chunk {
                index,
                data,
                summary: TransformationSummary::degraded(index, &err),
            }
        }
    }
}

/// Recompose chunks into one buffer plus the summary list, strictly by
/// original index.
pub fn join_chunks(chunks: Vec<Chunk>) -> (Bytes, Vec<TransformationSummary>) {
    let mut buffer = BytesMut::new();
    let mut summaries = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        buffer.extend_from_slice(&chunk.data);
        summaries.push(chunk.summary);
    }
    (buffer.freeze(), summaries)
}

/// Full free-text pipeline for one payload.
///
/// Returns `None` when redaction does not apply (no info types requested
/// or the payload is at or below the minimum size) so the caller can
/// forward the original packet unchanged.
pub async fn redact_payload(
    classifier: &Arc<dyn Classifier>,
    config: &MaskingConfig,
    limits: &RedactionLimits,
    payload: &[u8],
) -> Option<(Bytes, Vec<TransformationSummary>)> {
    if !config.is_enabled() || payload.len() <= limits.min_redact_len {
        return None;
    }
    let chunks = split_into_chunks(payload, limits.max_chunk_size);
    let redacted = redact_chunks(classifier, config, limits, chunks).await;
    Some(join_chunks(redacted))
}
