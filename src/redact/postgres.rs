//! Postgres-aware tabular redaction
//!
//! Consecutive data-row packets are buffered (any interleaved non-data-row
//! packets are preserved verbatim) until a byte threshold, a safe row
//! count, or a ready-for-query packet ends the result set. The buffered
//! region is then decoded into a column-oriented table, classified as one
//! unit, re-encoded into data-row wire format, and flushed in original
//! relative order.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;

use crate::config::RedactionLimits;
use crate::error::Result;
use crate::protocol::postgres::codec::{data_row_packet, parse_data_row, Packet};
use crate::protocol::postgres::constants::{MSG_DATA_ROW, MSG_READY_FOR_QUERY};
use crate::protocol::postgres::messages::DataRow;
use crate::transport::ConnectionSink;

use super::{Classifier, MaskingConfig, Table, TransformationSummary};

/// Result-set buffers below this size skip classification entirely.
const MIN_TABLE_REDACT_LEN: usize = 15;

/// Outcome of offering one server packet to the redactor.
#[derive(Debug, PartialEq, Eq)]
pub enum Handled {
    /// The redactor consumed (or already wrote) the packet.
    Done,
    /// Not applicable here; the caller forwards the packet unchanged.
    Forward,
}

/// Buffering redactor for one Postgres connection's server-to-client
/// stream. Owned exclusively by the relay task.
pub struct DataRowRedactor {
    classifier: Option<Arc<dyn Classifier>>,
    config: MaskingConfig,
    limits: RedactionLimits,
    sink: ConnectionSink,
    /// Encoded data-row packets of the current batch
    data_rows: BytesMut,
    /// Encoded non-data-row packets seen mid-batch, flushed after the rows
    trailing: BytesMut,
    row_count: usize,
    /// Safe row budget for one classify request
    max_rows: usize,
}

impl DataRowRedactor {
    pub fn new(
        classifier: Option<Arc<dyn Classifier>>,
        config: MaskingConfig,
        limits: RedactionLimits,
        sink: ConnectionSink,
    ) -> Self {
        Self {
            classifier,
            config,
            limits,
            sink,
            data_rows: BytesMut::new(),
            trailing: BytesMut::new(),
            row_count: 0,
            max_rows: 0,
        }
    }

    fn enabled(&self) -> bool {
        self.classifier.is_some() && self.config.is_enabled()
    }

    /// Offer one server packet. `Forward` means the caller still owns
    /// delivery; `Done` means this redactor wrote (or buffered) it.
    pub async fn handle(&mut self, pkt: &Packet) -> Result<Handled> {
        if !self.enabled() {
            return Ok(Handled::Forward);
        }

        // The first data row starts a batch and fixes the row budget from
        // the column count: the classifier caps findings per request, so
        // wider rows shrink how many fit.
        if pkt.tag() == Some(MSG_DATA_ROW) && self.data_rows.is_empty() {
            let field_count = pkt
                .body()
                .get(..2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]) as usize)
                .unwrap_or(0);
            self.max_rows = self.limits.max_findings / field_count.max(1);
            self.data_rows.extend_from_slice(&pkt.encode());
            self.row_count = 1;
            return Ok(Handled::Done);
        }

        // No batch in progress: nothing for this redactor to do.
        if self.data_rows.is_empty() {
            return Ok(Handled::Forward);
        }

        if pkt.tag() == Some(MSG_DATA_ROW) {
            self.data_rows.extend_from_slice(&pkt.encode());
            self.row_count += 1;
        } else {
            self.trailing.extend_from_slice(&pkt.encode());
        }

        if self.data_rows.len() > self.limits.max_buffered_bytes || self.row_count >= self.max_rows
        {
            debug!(
                "redact and write, buffersize={}, rows={}/{}",
                self.data_rows.len(),
                self.row_count,
                self.max_rows
            );
            self.redact_and_write().await?;
            return Ok(Handled::Done);
        }

        // A data row starts the batch; ready-for-query ends the result set.
        if pkt.tag() == Some(MSG_READY_FOR_QUERY) {
            debug!("redact and write, rows={}/{}", self.row_count, self.max_rows);
            self.redact_and_write().await?;
        }
        Ok(Handled::Done)
    }

    /// Flush any buffered batch, e.g. when the relay loop ends.
    pub async fn flush(&mut self) -> Result<()> {
        if self.data_rows.is_empty() && self.trailing.is_empty() {
            return Ok(());
        }
        self.redact_and_write().await
    }

    async fn redact_and_write(&mut self) -> Result<()> {
        let data_rows = std::mem::take(&mut self.data_rows);
        let trailing = std::mem::take(&mut self.trailing);
        self.row_count = 0;

        let (redacted, summary) = self.redact_rows(&data_rows).await;

        let mut out = BytesMut::with_capacity(redacted.len() + trailing.len());
        out.extend_from_slice(&redacted);
        out.extend_from_slice(&trailing);

        match summary {
            Some(summary) => self.sink.write_with_summary(&out, &summary).await,
            None => self.sink.write(&out).await,
        }
    }

    /// Classify the buffered rows as one table. Any failure returns the
    /// original bytes with the error recorded in the summary.
    async fn redact_rows(
        &self,
        data_rows: &[u8],
    ) -> (BytesMut, Option<Vec<TransformationSummary>>) {
        let original = BytesMut::from(data_rows);
        if data_rows.len() < MIN_TABLE_REDACT_LEN {
            return (original, None);
        }
        let Some(classifier) = self.classifier.as_ref() else {
            return (original, None);
        };

        let rows = match decode_rows(data_rows) {
            Ok(rows) => rows,
            Err(err) => {
                warn!("failed decoding data row packets, err={err}");
                let summary = TransformationSummary {
                    error: Some(err.to_string()),
                    ..Default::default()
                };
                return (original, Some(vec![summary]));
            }
        };

        // NULL columns go to the classifier as empty strings and are
        // restored as NULLs on re-encode.
        let table = Table {
            headers: (1..=rows.first().map_or(0, |r| r.values.len()))
                .map(|i| i.to_string())
                .collect(),
            rows: rows
                .iter()
                .map(|row| {
                    row.values
                        .iter()
                        .map(|v| match v {
                            Some(data) => String::from_utf8_lossy(data).into_owned(),
                            None => String::new(),
                        })
                        .collect()
                })
                .collect(),
        };

        let timeout = Duration::from_secs(self.limits.request_timeout_secs);
        let result =
            tokio::time::timeout(timeout, classifier.deidentify_table(&self.config, &table)).await;

        let redacted = match result {
            Ok(Ok(redacted)) => redacted,
            Ok(Err(err)) => {
                warn!("failed redacting data row packets, err={err}");
                let summary = TransformationSummary {
                    error: Some(err.to_string()),
                    ..Default::default()
                };
                return (original, Some(vec![summary]));
            }
            Err(_) => {
                warn!("classify request for data rows timed out");
                let summary = TransformationSummary {
                    error: Some("classify request timed out".into()),
                    ..Default::default()
                };
                return (original, Some(vec![summary]));
            }
        };

        if redacted.rows.len() != rows.len() {
            warn!(
                "classifier returned {} rows, expected {}",
                redacted.rows.len(),
                rows.len()
            );
            return (original, None);
        }

        let mut out = BytesMut::with_capacity(data_rows.len());
        for (decoded, masked) in rows.iter().zip(redacted.rows.iter()) {
            let values = decoded
                .values
                .iter()
                .zip(masked.iter())
                .map(|(orig, masked)| orig.as_ref().map(|_| masked.clone().into_bytes()))
                .collect();
            out.extend_from_slice(&data_row_packet(&DataRow { values }).encode());
        }
        let summaries = vec![TransformationSummary {
            index: 0,
            summary: redacted.summary,
            results: redacted.results,
            error: None,
        }];
        (out, Some(summaries))
    }
}

/// Decode a buffer of concatenated data-row packets.
fn decode_rows(mut data: &[u8]) -> Result<Vec<DataRow>> {
    use crate::error::ProxyError;

    let mut rows = Vec::new();
    while !data.is_empty() {
        if data.len() < 5 {
            return Err(ProxyError::Protocol("truncated data row buffer".into()));
        }
        if data[0] != MSG_DATA_ROW {
            return Err(ProxyError::Protocol(format!(
                "expected data row packet, got={}",
                data[0] as char
            )));
        }
        let len = u32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;
        if len < 4 || data.len() < 1 + len {
            return Err(ProxyError::Protocol("truncated data row packet".into()));
        }
        rows.push(parse_data_row(&data[5..1 + len])?);
        data = &data[1 + len..];
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redact::testing::ScriptedClassifier;
    use crate::transport::{send, ChannelSink};

    fn row(values: &[Option<&str>]) -> Packet {
        data_row_packet(&DataRow {
            values: values
                .iter()
                .map(|v| v.map(|s| s.as_bytes().to_vec()))
                .collect(),
        })
    }

    fn ready_for_query() -> Packet {
        Packet::typed(MSG_READY_FOR_QUERY, vec![b'I'])
    }

    fn redactor(
        classifier: Option<Arc<dyn Classifier>>,
        info_types: &[&str],
        limits: RedactionLimits,
    ) -> (
        DataRowRedactor,
        tokio::sync::mpsc::UnboundedReceiver<crate::transport::TransportPacket>,
    ) {
        let (sink, rx) = ChannelSink::new();
        let sink = ConnectionSink::new(Arc::new(sink), send::PG_CLIENT_WRITE, "s", "c");
        let config = MaskingConfig::new(
            &info_types.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &limits,
        )
        .unwrap();
        (
            DataRowRedactor::new(classifier, config, limits, sink),
            rx,
        )
    }

    #[tokio::test]
    async fn test_disabled_redactor_forwards_everything() {
        let (mut redactor, _rx) = redactor(None, &["TEST"], RedactionLimits::default());
        assert_eq!(
            redactor.handle(&row(&[Some("alice")])).await.unwrap(),
            Handled::Forward
        );

        let classifier: Arc<dyn Classifier> = Arc::new(ScriptedClassifier::default());
        let (mut redactor, _rx) = redactor2(Some(classifier), &[]);
        assert_eq!(
            redactor.handle(&row(&[Some("alice")])).await.unwrap(),
            Handled::Forward
        );
    }

    fn redactor2(
        classifier: Option<Arc<dyn Classifier>>,
        info_types: &[&str],
    ) -> (
        DataRowRedactor,
        tokio::sync::mpsc::UnboundedReceiver<crate::transport::TransportPacket>,
    ) {
        redactor(classifier, info_types, RedactionLimits::default())
    }

    #[tokio::test]
    async fn test_non_row_packet_outside_batch_forwards() {
        let classifier: Arc<dyn Classifier> = Arc::new(ScriptedClassifier::default());
        let (mut redactor, _rx) = redactor2(Some(classifier), &["TEST"]);
        assert_eq!(
            redactor.handle(&ready_for_query()).await.unwrap(),
            Handled::Forward
        );
    }

    #[tokio::test]
    async fn test_batch_flushes_once_on_ready_for_query() {
        let classifier: Arc<dyn Classifier> = Arc::new(ScriptedClassifier::default());
        let (mut redactor, mut rx) = redactor2(Some(classifier), &["TEST"]);

        let rows = [
            row(&[Some("alice"), Some("alice@example.com")]),
            row(&[Some("bob"), Some("bob@example.com")]),
            row(&[Some("carol"), Some("carol@example.com")]),
        ];
        for pkt in &rows {
            assert_eq!(redactor.handle(pkt).await.unwrap(), Handled::Done);
        }
        assert!(rx.try_recv().is_err());

        assert_eq!(redactor.handle(&ready_for_query()).await.unwrap(), Handled::Done);
        let pkt = rx.recv().await.unwrap();
        assert!(rx.try_recv().is_err(), "exactly one flush expected");

        // All three rows, uppercased, in original order, then the trailing
        // ready-for-query packet.
        let rows = decode_rows(&pkt.payload[..pkt.payload.len() - 6]).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].values[0].as_deref(), Some(b"ALICE".as_slice()));
        assert_eq!(rows[1].values[0].as_deref(), Some(b"BOB".as_slice()));
        assert_eq!(rows[2].values[0].as_deref(), Some(b"CAROL".as_slice()));
        assert_eq!(&pkt.payload[pkt.payload.len() - 6..], ready_for_query().encode().as_ref());
    }

    #[tokio::test]
    async fn test_null_columns_survive_redaction() {
        let classifier: Arc<dyn Classifier> = Arc::new(ScriptedClassifier::default());
        let (mut redactor, mut rx) = redactor2(Some(classifier), &["TEST"]);

        redactor
            .handle(&row(&[Some("a value long enough"), None]))
            .await
            .unwrap();
        redactor.handle(&ready_for_query()).await.unwrap();

        let pkt = rx.recv().await.unwrap();
        let rows = decode_rows(&pkt.payload[..pkt.payload.len() - 6]).unwrap();
        assert_eq!(rows[0].values[1], None);
        assert_eq!(
            rows[0].values[0].as_deref(),
            Some(b"A VALUE LONG ENOUGH".as_slice())
        );
    }

    #[tokio::test]
    async fn test_classifier_error_degrades_to_original_rows() {
        let classifier: Arc<dyn Classifier> =
            Arc::new(ScriptedClassifier::failing_on(&["sensitive value here"]));
        let (mut redactor, mut rx) = redactor2(Some(classifier), &["TEST"]);

        let original = row(&[Some("sensitive value here")]);
        redactor.handle(&original).await.unwrap();
        redactor.handle(&ready_for_query()).await.unwrap();

        let pkt = rx.recv().await.unwrap();
        let expected = [original.encode().as_ref(), ready_for_query().encode().as_ref()].concat();
        assert_eq!(pkt.payload, expected);
        // degraded flush is flagged in the summary spec entry
        assert!(pkt.spec.contains_key(crate::transport::spec::TRANSFORMATION_SUMMARY));
    }

    #[tokio::test]
    async fn test_row_budget_derived_from_field_count() {
        let classifier: Arc<dyn Classifier> = Arc::new(ScriptedClassifier::default());
        let limits = RedactionLimits {
            max_findings: 4,
            ..Default::default()
        };
        let (mut redactor, mut rx) = redactor(Some(classifier), &["TEST"], limits);

        // Two columns -> budget of 2 rows per request.
        redactor.handle(&row(&[Some("r1c1"), Some("r1c2")])).await.unwrap();
        assert!(rx.try_recv().is_err());
        redactor.handle(&row(&[Some("r2c1"), Some("r2c2")])).await.unwrap();
        // Budget reached: flushed without waiting for ready-for-query.
        let pkt = rx.recv().await.unwrap();
        let rows = decode_rows(&pkt.payload).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_byte_threshold_triggers_flush() {
        let classifier: Arc<dyn Classifier> = Arc::new(ScriptedClassifier::default());
        let limits = RedactionLimits {
            max_buffered_bytes: 64,
            ..Default::default()
        };
        let (mut redactor, mut rx) = redactor(Some(classifier), &["TEST"], limits);

        let wide = "x".repeat(60);
        redactor.handle(&row(&[Some(&wide)])).await.unwrap();
        assert!(rx.try_recv().is_err());
        redactor.handle(&row(&[Some(&wide)])).await.unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_interleaved_packets_flush_after_rows() {
        let classifier: Arc<dyn Classifier> = Arc::new(ScriptedClassifier::default());
        let (mut redactor, mut rx) = redactor2(Some(classifier), &["TEST"]);

        let notice = Packet::typed(b'N', b"\0".to_vec());
        redactor.handle(&row(&[Some("first row value")])).await.unwrap();
        redactor.handle(&notice).await.unwrap();
        redactor.handle(&row(&[Some("second row value")])).await.unwrap();
        redactor.handle(&ready_for_query()).await.unwrap();

        let pkt = rx.recv().await.unwrap();
        // Rows come first (original relative order), then the buffered
        // notice and the ready-for-query, in arrival order.
        let tail = [notice.encode().as_ref(), ready_for_query().encode().as_ref()].concat();
        assert!(pkt.payload.ends_with(&tail));
        let rows = decode_rows(&pkt.payload[..pkt.payload.len() - tail.len()]).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_decode_rows_rejects_foreign_packet() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&ready_for_query().encode());
        assert!(decode_rows(&buf).is_err());
    }
}
