//! Optional language-model metadata enrichment.
//!
//! Talks to a locally configured endpoint over a structured JSON contract:
//! text items get `{title, keywords, summary}`, images `{caption, keywords}`.
//! Only the enrichment pipeline calls this; the search path never does, and
//! the output only ever lands in metadata, never in item content.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::LlmConfig;

#[derive(Debug, Clone, Serialize)]
struct LlmRequest<'a> {
    kind: &'static str,
    title: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<&'a str>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TextEnrichment {
    pub title: Option<String>,
    pub keywords: Option<Vec<String>>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageEnrichment {
    pub caption: Option<String>,
    pub keywords: Option<Vec<String>>,
}

pub struct LlmClient {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl LlmClient {
    /// Build a client from config; `None` when disabled or unconfigured.
    pub fn from_config(config: &LlmConfig) -> Option<LlmClient> {
        if !config.enabled {
            return None;
        }
        let endpoint = config.endpoint.clone()?;

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .ok()?;

        Some(LlmClient { endpoint, client })
    }

    pub fn enrich_text(&self, title: &str, body: Option<&str>) -> anyhow::Result<TextEnrichment> {
        let request = LlmRequest {
            kind: "text",
            title,
            body,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()?
            .error_for_status()?;

        Ok(response.json()?)
    }

    pub fn enrich_image(
        &self,
        title: &str,
        ocr_text: Option<&str>,
    ) -> anyhow::Result<ImageEnrichment> {
        let request = LlmRequest {
            kind: "image",
            title,
            body: ocr_text,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()?
            .error_for_status()?;

        Ok(response.json()?)
    }
}
