//! Provider webhook body.
//!
//! `{id, status, input, output, error, completed_at, metrics}`; `output` is a
//! URL string or an array of them depending on the model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use artforge_core::PredictionId;

use crate::prediction::PredictionUpdate;
use crate::status::{PredictionStatus, TransitionError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderWebhook {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub input: Option<serde_json::Value>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub metrics: Option<serde_json::Value>,
}

impl ProviderWebhook {
    pub fn parse(raw_body: &[u8]) -> Result<Self, TransitionError> {
        let payload: Self = serde_json::from_slice(raw_body)
            .map_err(|e| TransitionError::MalformedPayload(e.to_string()))?;
        // Surface bad ids/statuses at parse time so the endpoint can 400.
        payload.prediction_id()?;
        payload.parsed_status()?;
        Ok(payload)
    }

    pub fn prediction_id(&self) -> Result<PredictionId, TransitionError> {
        PredictionId::new(self.id.as_str())
            .map_err(|e| TransitionError::MalformedPayload(e.to_string()))
    }

    pub fn parsed_status(&self) -> Result<PredictionStatus, TransitionError> {
        self.status.parse()
    }

    /// Output URLs in provider order.
    pub fn output_urls(&self) -> Vec<String> {
        match &self.output {
            Some(serde_json::Value::String(url)) => vec![url.clone()],
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match &self.error {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) if s.trim().is_empty() => None,
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        }
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn to_update(&self, at: DateTime<Utc>) -> Result<PredictionUpdate, TransitionError> {
        Ok(PredictionUpdate {
            id: self.prediction_id()?,
            status: self.parsed_status()?,
            output: self.output_urls(),
            error: self.error_message(),
            metrics: self.metrics.clone(),
            completed_at: self.completed_at(),
            at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_array_and_string_outputs() {
        let arr = ProviderWebhook::parse(
            br#"{"id":"abc","status":"succeeded","output":["https://a/1.png","https://a/2.png"]}"#,
        )
        .unwrap();
        assert_eq!(arr.output_urls().len(), 2);

        let single =
            ProviderWebhook::parse(br#"{"id":"abc","status":"succeeded","output":"https://a/1.png"}"#)
                .unwrap();
        assert_eq!(single.output_urls(), vec!["https://a/1.png".to_string()]);
    }

    #[test]
    fn rejects_garbage_and_unknown_status() {
        assert!(matches!(
            ProviderWebhook::parse(b"not json"),
            Err(TransitionError::MalformedPayload(_))
        ));
        assert!(matches!(
            ProviderWebhook::parse(br#"{"id":"abc","status":"exploded"}"#),
            Err(TransitionError::UnknownStatus(_))
        ));
        assert!(ProviderWebhook::parse(br#"{"id":"  ","status":"failed"}"#).is_err());
    }

    #[test]
    fn update_carries_error_and_completion() {
        let p = ProviderWebhook::parse(
            br#"{"id":"abc","status":"failed","error":"out of memory","completed_at":"2024-05-01T10:00:00Z","metrics":{"predict_time":1.2}}"#,
        )
        .unwrap();
        let now = Utc::now();
        let u = p.to_update(now).unwrap();
        assert_eq!(u.status, PredictionStatus::Failed);
        assert_eq!(u.error.as_deref(), Some("out of memory"));
        assert_eq!(u.completed_at.unwrap().to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert!(u.output.is_empty());
    }
}
