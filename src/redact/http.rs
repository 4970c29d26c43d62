//! HTTP classify/mask service client
//!
//! Speaks a small JSON deidentify API: one request per chunk (or table)
//! carrying the requested info types and masking parameters, one response
//! carrying the masked content plus transformation summaries. Endpoint and
//! credentials come from the session's masking configuration delivered at
//! session-open.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

use super::{Classifier, MaskingConfig, RedactedTable, RedactedText, SummaryResult, Table};

/// Classifier backed by a remote deidentify endpoint.
pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
    auth_token: Option<String>,
}

impl HttpClassifier {
    /// Build a client for the given deidentify endpoint.
    ///
    /// The connect timeout is kept short: per-chunk deadlines are enforced
    /// by the pipeline, not here.
    pub fn new(endpoint: &str, auth_token: Option<&str>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .map_err(|e| ProxyError::Config(format!("failed building classifier client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            auth_token: auth_token.map(|t| t.to_string()),
        })
    }

    async fn post(&self, request: &DeidentifyRequest<'_>) -> Result<DeidentifyResponse> {
        let mut builder = self.client.post(format!("{}/v1/deidentify", self.endpoint));
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder
            .json(request)
            .send()
            .await
            .map_err(|e| ProxyError::Redaction(format!("classify request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ProxyError::Redaction(format!(
                "classify request failed with status {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ProxyError::Redaction(format!("invalid classify response: {e}")))
    }
}

#[derive(Serialize)]
struct DeidentifyRequest<'a> {
    info_types: &'a [String],
    masking_character: &'a str,
    number_to_mask: i32,
    item: RequestItem<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "lowercase")]
enum RequestItem<'a> {
    Value(&'a str),
    Table(&'a Table),
}

#[derive(Deserialize)]
struct DeidentifyResponse {
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    table: Option<Table>,
    #[serde(default)]
    summary: Vec<String>,
    #[serde(default)]
    results: Vec<SummaryResult>,
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn deidentify_text(&self, config: &MaskingConfig, text: &str) -> Result<RedactedText> {
        let response = self
            .post(&DeidentifyRequest {
                info_types: &config.info_types,
                masking_character: &config.masking_character,
                number_to_mask: config.number_to_mask,
                item: RequestItem::Value(text),
            })
            .await?;

        let content = response
            .value
            .ok_or_else(|| ProxyError::Redaction("classify response missing value".into()))?;
        Ok(RedactedText {
            content,
            summary: response.summary,
            results: response.results,
        })
    }

    async fn deidentify_table(
        &self,
        config: &MaskingConfig,
        table: &Table,
    ) -> Result<RedactedTable> {
        let response = self
            .post(&DeidentifyRequest {
                info_types: &config.info_types,
                masking_character: &config.masking_character,
                number_to_mask: config.number_to_mask,
                item: RequestItem::Table(table),
            })
            .await?;

        let table = response
            .table
            .ok_or_else(|| ProxyError::Redaction("classify response missing table".into()))?;
        Ok(RedactedTable {
            rows: table.rows,
            summary: response.summary,
            results: response.results,
        })
    }
}
