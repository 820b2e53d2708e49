//! Insight records and the sinks that persist them.
//!
//! An insight is built once per processing call and handed to a sink at most
//! once. Persistence is best effort: `publish` logs a failing sink and reports
//! `false`, it never fails the analysis.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::{Classification, DisasterType, SafetyStatus};

pub const DEFAULT_INSIGHT_TABLE: &str = "insights";
pub const DEFAULT_INSIGHT_TIMEOUT: Duration = Duration::from_secs(10);

/// The persisted classification record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    #[serde(rename = "type")]
    pub disaster_type: DisasterType,
    /// Free-text place name. Never filled in by the pipeline; kept for the
    /// store's schema.
    pub location: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub status: SafetyStatus,
    pub created_at: DateTime<Utc>,
}

impl Insight {
    pub fn from_classification(
        classification: &Classification,
        latitude: Option<f64>,
        longitude: Option<f64>,
    ) -> Self {
        Self::at(classification, latitude, longitude, Utc::now())
    }

    pub fn at(
        classification: &Classification,
        latitude: Option<f64>,
        longitude: Option<f64>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            disaster_type: classification.disaster_type,
            location: None,
            latitude,
            longitude,
            status: classification.status,
            created_at,
        }
    }
}

/// Write-only destination for insights.
pub trait InsightSink: Send {
    fn name(&self) -> &'static str;

    fn persist(&mut self, insight: &Insight) -> Result<()>;
}

impl<S: InsightSink + ?Sized> InsightSink for Box<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn persist(&mut self, insight: &Insight) -> Result<()> {
        (**self).persist(insight)
    }
}

/// Hand `insight` to `sink` once. Returns whether it was stored.
pub fn publish(sink: &mut dyn InsightSink, insight: &Insight) -> bool {
    match sink.persist(insight) {
        Ok(()) => {
            log::info!(
                "insight persisted via {} ({} / {})",
                sink.name(),
                insight.disaster_type,
                insight.status
            );
            true
        }
        Err(err) => {
            log::warn!("insight sink failed: {} ({:#})", sink.name(), err);
            false
        }
    }
}

/// Discards insights. Used when no store is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl InsightSink for NullSink {
    fn name(&self) -> &'static str {
        "null"
    }

    fn persist(&mut self, _insight: &Insight) -> Result<()> {
        Ok(())
    }
}

/// Keeps insights in memory. Can be told to fail, for exercising the
/// best-effort contract.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    pub records: Vec<Insight>,
    pub fail: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            records: Vec::new(),
            fail: true,
        }
    }
}

impl InsightSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn persist(&mut self, insight: &Insight) -> Result<()> {
        if self.fail {
            return Err(anyhow!("memory sink configured to fail"));
        }
        self.records.push(insight.clone());
        Ok(())
    }
}

/// PostgREST-style table insert: `POST {base_url}/rest/v1/{table}`.
pub struct RestInsightSink {
    endpoint: String,
    api_key: Option<String>,
    agent: ureq::Agent,
}

impl RestInsightSink {
    pub fn new(base_url: &str, table: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let base = url::Url::parse(base_url)
            .with_context(|| format!("invalid insight store url {base_url}"))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(anyhow!("insight store url must be http(s): {base_url}"));
        }
        if table.is_empty() {
            return Err(anyhow!("insight table name is empty"));
        }
        let endpoint = format!("{}/rest/v1/{}", base_url.trim_end_matches('/'), table);
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self {
            endpoint,
            api_key,
            agent,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl InsightSink for RestInsightSink {
    fn name(&self) -> &'static str {
        "rest"
    }

    fn persist(&mut self, insight: &Insight) -> Result<()> {
        let body = serde_json::to_string(insight).context("serialize insight")?;
        let mut request = self
            .agent
            .post(&self.endpoint)
            .set("Content-Type", "application/json")
            .set("Prefer", "return=representation");
        if let Some(key) = &self.api_key {
            request = request
                .set("apikey", key)
                .set("Authorization", &format!("Bearer {key}"));
        }
        match request.send_string(&body) {
            Ok(response) if (200..300).contains(&response.status()) => Ok(()),
            Ok(response) => Err(anyhow!(
                "insight store answered {} {}",
                response.status(),
                response.status_text()
            )),
            Err(ureq::Error::Status(code, response)) => {
                let detail = response.into_string().unwrap_or_default();
                Err(anyhow!("insight store rejected insert ({code}): {detail}"))
            }
            Err(err) => Err(err).with_context(|| format!("post insight to {}", self.endpoint)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::AggregateSummary;
    use chrono::TimeZone;

    fn classification() -> Classification {
        Classification {
            disaster_type: DisasterType::Riot,
            status: SafetyStatus::Unsafe,
            summary: AggregateSummary::default(),
        }
    }

    #[test]
    fn serializes_store_payload() {
        let created = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let insight = Insight::at(&classification(), Some(12.5), None, created);
        let value = serde_json::to_value(&insight).unwrap();
        assert_eq!(value["type"], "riot");
        assert!(value["location"].is_null());
        assert_eq!(value["latitude"], 12.5);
        assert!(value["longitude"].is_null());
        assert_eq!(value["status"], "UNSAFE");
        assert_eq!(value["created_at"], "2024-05-01T12:30:00Z");
    }

    #[test]
    fn publish_reports_sink_outcome() {
        let insight = Insight::from_classification(&classification(), None, None);
        let mut ok = MemorySink::new();
        assert!(publish(&mut ok, &insight));
        assert_eq!(ok.records.len(), 1);

        let mut broken = MemorySink::failing();
        assert!(!publish(&mut broken, &insight));
        assert!(broken.records.is_empty());
    }

    #[test]
    fn rest_sink_builds_table_endpoint() {
        let sink = RestInsightSink::new(
            "https://store.example.com/",
            "insights",
            None,
            DEFAULT_INSIGHT_TIMEOUT,
        )
        .unwrap();
        assert_eq!(sink.endpoint(), "https://store.example.com/rest/v1/insights");
        assert!(RestInsightSink::new("ftp://x", "insights", None, DEFAULT_INSIGHT_TIMEOUT).is_err());
    }

    #[test]
    fn unreachable_store_is_a_sink_failure() {
        let mut sink = RestInsightSink::new(
            "http://127.0.0.1:9",
            "insights",
            Some("key".to_string()),
            Duration::from_secs(2),
        )
        .unwrap();
        let insight = Insight::from_classification(&classification(), None, None);
        assert!(!publish(&mut sink, &insight));
    }
}
