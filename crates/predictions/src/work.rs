use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use artforge_core::{DomainError, DomainResult, PredictionId, UserId, WorkId};

use crate::kind::OperationKind;
use crate::prediction::Prediction;
use crate::status::PredictionStatus;

pub const MAX_TITLE_CHARS: usize = 80;
const FALLBACK_PROMPT_WORDS: usize = 6;

/// A gallery entry produced by one succeeded prediction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Work {
    pub id: WorkId,
    pub user_id: UserId,
    /// Unique; the archive's idempotency key.
    pub prediction_id: PredictionId,
    pub title: String,
    pub kind: OperationKind,
    pub original_image: Option<String>,
    pub processed_image: String,
    pub metadata: serde_json::Value,
    pub completed_at: DateTime<Utc>,
    pub processing_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl Work {
    /// Build the archive entry for a succeeded prediction.
    ///
    /// `hosted_outputs` are our re-hosted copies of the provider outputs, in
    /// provider order; the first one is the processed image.
    pub fn from_prediction(
        prediction: &Prediction,
        title: String,
        hosted_outputs: Vec<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if prediction.status != PredictionStatus::Succeeded {
            return Err(DomainError::invariant(format!(
                "work requires a succeeded prediction, {} is {}",
                prediction.id, prediction.status
            )));
        }
        let processed_image = hosted_outputs
            .first()
            .cloned()
            .ok_or_else(|| DomainError::validation("succeeded prediction has no output"))?;

        let metadata = serde_json::json!({
            "model": prediction.model,
            "outputs": hosted_outputs,
            "provider_outputs": prediction.output,
            "metrics": prediction.metrics,
            "input": prediction.input.to_provider_input(),
        });

        Ok(Self {
            id: WorkId::new(),
            user_id: prediction.user_id,
            prediction_id: prediction.id.clone(),
            title,
            kind: prediction.kind,
            original_image: prediction.input.source_image().map(str::to_string),
            processed_image,
            metadata,
            completed_at: prediction.completed_at.unwrap_or(now),
            processing_ms: prediction.processing_ms(),
            created_at: now,
        })
    }
}

/// Listing filter; both parts are optional and combine with AND.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkFilter {
    pub kind: Option<OperationKind>,
    /// Case-insensitive substring of the title.
    pub search: Option<String>,
}

impl WorkFilter {
    pub fn new(kind: Option<OperationKind>, search: Option<&str>) -> Self {
        let search = search
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);
        Self { kind, search }
    }

    pub fn matches(&self, work: &Work) -> bool {
        if let Some(kind) = self.kind {
            if work.kind != kind {
                return false;
            }
        }
        match &self.search {
            Some(needle) => work.title.to_lowercase().contains(needle.as_str()),
            None => true,
        }
    }
}

/// Clean up a generated title: strip quotes, collapse whitespace, cap length.
pub fn sanitize_title(raw: &str) -> Option<String> {
    let collapsed = raw
        .trim()
        .trim_matches(|c| matches!(c, '"' | '\'' | '`' | '“' | '”'))
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let collapsed = collapsed.trim_end_matches('.').to_string();
    if collapsed.is_empty() {
        return None;
    }
    Some(truncate_chars(&collapsed, MAX_TITLE_CHARS))
}

/// Title used when the title generator is unavailable.
pub fn fallback_title(kind: OperationKind, prompt: Option<&str>, now: DateTime<Utc>) -> String {
    let words: Vec<&str> = prompt
        .unwrap_or_default()
        .split_whitespace()
        .take(FALLBACK_PROMPT_WORDS)
        .collect();
    if words.is_empty() {
        return format!("{} {}", kind.label(), now.format("%Y-%m-%d %H:%M"));
    }
    let mut title = words.join(" ");
    if let Some(first) = title.get(..1) {
        title = first.to_uppercase() + &title[1..];
    }
    truncate_chars(&title, MAX_TITLE_CHARS)
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::ToolInput;
    use crate::prediction::PredictionUpdate;
    use chrono::TimeZone;
    use serde_json::json;

    fn succeeded_avatar() -> Prediction {
        let now = Utc::now();
        let input = ToolInput::parse(
            OperationKind::Avatar,
            json!({"image": "https://cdn.example/me.png", "prompt": "oil portrait"}),
        )
        .unwrap();
        let mut p = Prediction::starting(
            PredictionId::new("p-av").unwrap(),
            UserId::new(),
            "avatar-model",
            input,
            20,
            now,
        );
        let mut u = PredictionUpdate::status_only(p.id.clone(), PredictionStatus::Succeeded, now);
        u.output = vec!["https://provider/out.png".into()];
        p.apply_update(&u).unwrap();
        p
    }

    #[test]
    fn work_from_succeeded_prediction() {
        let p = succeeded_avatar();
        let w = Work::from_prediction(
            &p,
            "Oil portrait".into(),
            vec!["https://storage/ours.png".into()],
            Utc::now(),
        )
        .unwrap();
        assert_eq!(w.kind, OperationKind::Avatar);
        assert_eq!(w.prediction_id, p.id);
        assert_eq!(w.original_image.as_deref(), Some("https://cdn.example/me.png"));
        assert_eq!(w.processed_image, "https://storage/ours.png");
        assert_eq!(w.metadata["model"], "avatar-model");
    }

    #[test]
    fn work_requires_success_and_output() {
        let mut p = succeeded_avatar();
        assert!(Work::from_prediction(&p, "t".into(), vec![], Utc::now()).is_err());
        p.status = PredictionStatus::Failed;
        assert!(
            Work::from_prediction(&p, "t".into(), vec!["https://x".into()], Utc::now()).is_err()
        );
    }

    #[test]
    fn filter_matches_kind_and_title() {
        let p = succeeded_avatar();
        let w = Work::from_prediction(
            &p,
            "Portrait in oil".into(),
            vec!["https://storage/ours.png".into()],
            Utc::now(),
        )
        .unwrap();

        assert!(WorkFilter::new(Some(OperationKind::Avatar), Some("PORTRAIT")).matches(&w));
        assert!(WorkFilter::new(None, Some("  ")).matches(&w));
        assert!(!WorkFilter::new(Some(OperationKind::Edit), None).matches(&w));
        assert!(!WorkFilter::new(None, Some("landscape")).matches(&w));
    }

    #[test]
    fn titles() {
        assert_eq!(sanitize_title("  \"A Quiet  Harbor.\" ").as_deref(), Some("A Quiet Harbor"));
        assert_eq!(sanitize_title("\"\""), None);

        let now = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        assert_eq!(
            fallback_title(OperationKind::Generate, Some("a red fox in the snow at dawn"), now),
            "A red fox in the snow"
        );
        assert_eq!(
            fallback_title(OperationKind::RemoveBg, None, now),
            "Background removed 2024-05-01 09:30"
        );
    }
}
