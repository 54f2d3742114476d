use serde::Deserialize;
use serde_json::{Value, json};

use artforge_core::{Page, PageRequest};
use artforge_ledger::{LedgerEntry, UserBalance};
use artforge_predictions::{Prediction, Work};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl PageQuery {
    pub fn page(&self) -> PageRequest {
        PageRequest::new(self.limit, self.offset)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct WorksQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub search: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct RedeemRequest {
    pub code: String,
}

// -------------------------
// Response mapping
// -------------------------

pub fn prediction_to_json(p: &Prediction) -> Value {
    json!({
        "id": p.id.as_str(),
        "type": p.kind.as_str(),
        "model": p.model,
        "status": p.status.as_str(),
        "input": p.input.to_provider_input(),
        "output": p.output,
        "error": p.error,
        "metrics": p.metrics,
        "points": p.points_reserved,
        "created_at": p.created_at.to_rfc3339(),
        "started_at": p.started_at.map(|t| t.to_rfc3339()),
        "completed_at": p.completed_at.map(|t| t.to_rfc3339()),
    })
}

pub fn work_to_json(w: &Work) -> Value {
    json!({
        "id": w.id.to_string(),
        "prediction_id": w.prediction_id.as_str(),
        "title": w.title,
        "type": w.kind.as_str(),
        "original_image": w.original_image,
        "processed_image": w.processed_image,
        "metadata": w.metadata,
        "processing_ms": w.processing_ms,
        "completed_at": w.completed_at.to_rfc3339(),
        "created_at": w.created_at.to_rfc3339(),
    })
}

pub fn balance_to_json(b: &UserBalance) -> Value {
    json!({
        "points": b.points,
        "plan": b.plan.as_str(),
        "plan_points": b.plan_points,
        "plan_expires_at": b.plan_expires_at.map(|t| t.to_rfc3339()),
    })
}

pub fn entry_to_json(e: &LedgerEntry) -> Value {
    json!({
        "id": e.id.to_string(),
        "kind": e.kind.as_str(),
        "amount": e.amount,
        "balance_before": e.balance_before,
        "balance_after": e.balance_after,
        "prediction_id": e.prediction_id.as_ref().map(|p| p.as_str()),
        "metadata": e.metadata,
        "created_at": e.created_at.to_rfc3339(),
    })
}

pub fn page_to_json<T>(page: &Page<T>, item: impl Fn(&T) -> Value) -> Value {
    json!({
        "items": page.items.iter().map(item).collect::<Vec<_>>(),
        "total": page.total,
        "limit": page.limit,
        "offset": page.offset,
        "has_more": page.has_more,
    })
}
