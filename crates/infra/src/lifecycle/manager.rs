use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{Span, debug, error, info, instrument, warn};

use artforge_auth::{WebhookHeaders, WebhookVerifier};
use artforge_core::{Page, PageRequest, PredictionId, UserId, WorkId};
use artforge_events::{JobEvent, JobEventSink};
use artforge_ledger::{LedgerEntry, UserBalance};
use artforge_predictions::{
    ModelCatalog, OperationKind, Prediction, PredictionStatus, PredictionUpdate, ProviderWebhook,
    SideEffect, ToolInput, Transition, Work, WorkFilter, fallback_title,
};

use crate::external::{JobProvider, ObjectStorage, TitleGenerator};
use crate::ledger::{LedgerError, LedgerStore, Redeemed};
use crate::predictions::{PredictionStore, Upserted};
use crate::tasks::{RetryPolicy, Task, TaskId, TaskKind, TaskQueue};
use crate::works::WorkArchive;

use super::error::LifecycleError;

/// Everything the lifecycle talks to.
pub struct LifecycleParts {
    pub ledger: Arc<dyn LedgerStore>,
    pub predictions: Arc<dyn PredictionStore>,
    pub works: Arc<dyn WorkArchive>,
    pub tasks: Arc<dyn TaskQueue>,
    pub provider: Arc<dyn JobProvider>,
    pub storage: Arc<dyn ObjectStorage>,
    pub titles: Arc<dyn TitleGenerator>,
    pub events: Arc<dyn JobEventSink>,
    pub verifier: WebhookVerifier,
    pub catalog: ModelCatalog,
    /// Base of our own public URL; provider callbacks go to
    /// `{public_base_url}/webhooks/{tool}`.
    pub public_base_url: String,
}

/// Response body of a successful submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub id: PredictionId,
    pub input: serde_json::Value,
}

/// What the webhook endpoint acknowledges with 200.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookAck {
    Accepted(TaskId),
    /// Signature present but wrong. Acknowledged so the provider stops
    /// retrying; nothing is applied.
    Rejected,
}

/// Result of one `apply_transition`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// No job with this id; nothing can be reconciled.
    UnknownJob,
    /// Conflicting terminal or stale status; nothing changed.
    Ignored(Transition),
    Transitioned {
        transition: Transition,
        status: PredictionStatus,
        work_id: Option<WorkId>,
    },
}

pub struct PredictionLifecycle {
    ledger: Arc<dyn LedgerStore>,
    predictions: Arc<dyn PredictionStore>,
    works: Arc<dyn WorkArchive>,
    tasks: Arc<dyn TaskQueue>,
    provider: Arc<dyn JobProvider>,
    storage: Arc<dyn ObjectStorage>,
    titles: Arc<dyn TitleGenerator>,
    events: Arc<dyn JobEventSink>,
    verifier: WebhookVerifier,
    catalog: ModelCatalog,
    public_base_url: String,
    retry_policy: RetryPolicy,
    waker: Arc<Notify>,
}

impl PredictionLifecycle {
    pub fn new(parts: LifecycleParts) -> Self {
        Self {
            ledger: parts.ledger,
            predictions: parts.predictions,
            works: parts.works,
            tasks: parts.tasks,
            provider: parts.provider,
            storage: parts.storage,
            titles: parts.titles,
            events: parts.events,
            verifier: parts.verifier,
            catalog: parts.catalog,
            public_base_url: parts.public_base_url.trim_end_matches('/').to_string(),
            retry_policy: RetryPolicy::default(),
            waker: Arc::new(Notify::new()),
        }
    }

    /// Retry policy for transition tasks enqueued from now on.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Share the transition worker's waker so accepted webhooks run immediately.
    pub fn with_waker(mut self, waker: Arc<Notify>) -> Self {
        self.waker = waker;
        self
    }

    pub fn waker(&self) -> Arc<Notify> {
        self.waker.clone()
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    // ---------------------------------------------------------------------
    // Submit
    // ---------------------------------------------------------------------

    #[instrument(
        skip(self, body),
        fields(user_id = %user_id, kind = %kind, prediction_id = tracing::field::Empty),
        err
    )]
    pub async fn submit(
        &self,
        user_id: UserId,
        kind: OperationKind,
        body: serde_json::Value,
    ) -> Result<Submitted, LifecycleError> {
        let input = ToolInput::parse(kind, body)?;
        let spec = self.catalog.spec(kind)?.clone();

        self.ledger.open_account(user_id).await?;
        let reservation = self.ledger.reserve(user_id, spec.cost).await?;

        let callback_url = format!("{}/webhooks/{}", self.public_base_url, kind);
        let created = match self
            .provider
            .create_job(&spec.model, input.to_provider_input(), &callback_url)
            .await
        {
            Ok(created) => created,
            Err(err) => {
                error!(error = %err, reservation_id = %reservation.id, "provider rejected job");
                self.release_quietly(&reservation.id.to_string(), reservation.id).await;
                return Err(LifecycleError::ProviderUnavailable(err.to_string()));
            }
        };
        Span::current().record("prediction_id", tracing::field::display(&created.id));

        if let Err(err) = self.ledger.attach(reservation.id, &created.id).await {
            self.release_quietly(created.id.as_str(), reservation.id).await;
            return Err(err.into());
        }

        let prediction = Prediction::starting(
            created.id.clone(),
            user_id,
            spec.model,
            input,
            spec.cost,
            Utc::now(),
        );
        if let Err(err) = self.predictions.create(&prediction).await {
            self.release_quietly(created.id.as_str(), reservation.id).await;
            return Err(err.into());
        }

        info!(points = spec.cost, "job submitted");
        Ok(Submitted {
            id: created.id,
            input: created.input,
        })
    }

    async fn release_quietly(&self, label: &str, reservation_id: artforge_ledger::ReservationId) {
        if let Err(err) = self.ledger.release(reservation_id).await {
            error!(
                error = %err,
                reservation = label,
                "failed to release reservation; manual reconciliation needed"
            );
        }
    }

    // ---------------------------------------------------------------------
    // Webhook intake
    // ---------------------------------------------------------------------

    /// Verify, parse and enqueue. Never runs side effects inline.
    #[instrument(skip_all, fields(prediction_id = tracing::field::Empty), err)]
    pub async fn accept_webhook(
        &self,
        raw_body: &[u8],
        headers: &WebhookHeaders<'_>,
        now: DateTime<Utc>,
    ) -> Result<WebhookAck, LifecycleError> {
        if let Err(err) = self.verifier.verify(raw_body, headers, now) {
            if err.is_missing_header() {
                return Err(LifecycleError::MissingSignatureHeaders(err.to_string()));
            }
            warn!(error = %err, webhook_id = headers.id, "webhook signature rejected");
            return Ok(WebhookAck::Rejected);
        }

        let payload = ProviderWebhook::parse(raw_body)
            .map_err(|e| LifecycleError::MalformedWebhook(e.to_string()))?;
        let update = payload
            .to_update(now)
            .map_err(|e| LifecycleError::MalformedWebhook(e.to_string()))?;
        Span::current().record("prediction_id", tracing::field::display(&update.id));

        let task_payload = serde_json::to_value(&update)
            .map_err(|e| LifecycleError::MalformedWebhook(e.to_string()))?;
        let task = Task::new(TaskKind::ApplyTransition, task_payload)
            .with_retry_policy(self.retry_policy.clone());
        let task_id = self.tasks.enqueue(task).await?;
        self.waker.notify_one();

        debug!(%task_id, status = %update.status, "webhook accepted");
        Ok(WebhookAck::Accepted(task_id))
    }

    // ---------------------------------------------------------------------
    // Transition application (worker side)
    // ---------------------------------------------------------------------

    /// Apply one provider update and its side effects.
    ///
    /// The job row is written first; side effects then run, each skipped when
    /// already recorded. A redelivered terminal status re-runs whatever is
    /// still missing.
    #[instrument(
        skip(self, update),
        fields(prediction_id = %update.id, status = %update.status),
        err
    )]
    pub async fn apply_transition(
        &self,
        update: &PredictionUpdate,
    ) -> Result<Applied, LifecycleError> {
        let upserted = self
            .predictions
            .upsert(update)
            .await
            .map_err(LifecycleError::at("upsert"))?;
        let Some(Upserted {
            prediction,
            transition,
        }) = upserted
        else {
            warn!("webhook for unknown job ignored");
            return Ok(Applied::UnknownJob);
        };

        match transition {
            Transition::Conflict => {
                warn!(
                    recorded = %prediction.status,
                    incoming = %update.status,
                    "conflicting terminal status ignored; first one wins, reconcile with the provider"
                );
                return Ok(Applied::Ignored(transition));
            }
            Transition::Stale => {
                debug!(recorded = %prediction.status, "stale status ignored");
                return Ok(Applied::Ignored(transition));
            }
            Transition::Apply | Transition::Redelivery => {}
        }

        let work_id = match prediction.status {
            PredictionStatus::Succeeded => self.settle_success(&prediction).await?,
            PredictionStatus::Failed | PredictionStatus::Canceled => {
                self.settle_failure(&prediction).await?;
                None
            }
            PredictionStatus::Starting | PredictionStatus::Processing => None,
        };

        if transition == Transition::Apply || prediction.status.is_terminal() {
            let event = JobEvent::from_prediction(&prediction, work_id);
            match self.events.publish(event) {
                Ok(listeners) => debug!(listeners, "job event published"),
                Err(err) => warn!(error = %err, "job event not published"),
            }
        }

        info!(transition = transition.as_str(), "transition applied");
        Ok(Applied::Transitioned {
            transition,
            status: prediction.status,
            work_id,
        })
    }

    /// Archive the work, then commit the reservation.
    ///
    /// A recorded `WorkCreated` is final: a work the owner deleted stays
    /// deleted on redelivery. A success without outputs archives nothing but
    /// still commits, so the reservation never stays open.
    async fn settle_success(
        &self,
        prediction: &Prediction,
    ) -> Result<Option<WorkId>, LifecycleError> {
        let id = &prediction.id;

        let archived = self
            .predictions
            .has_applied(id, SideEffect::WorkCreated)
            .await
            .map_err(LifecycleError::at("archive"))?;
        let work_id = if archived {
            self.works
                .find_by_prediction(id)
                .await
                .map_err(LifecycleError::at("archive"))?
                .map(|w| w.id)
        } else if prediction.output.as_deref().unwrap_or_default().is_empty() {
            warn!(
                stage = "archive",
                "succeeded job has no output; no work archived, reconcile with the provider"
            );
            None
        } else {
            let work = match self
                .works
                .find_by_prediction(id)
                .await
                .map_err(LifecycleError::at("archive"))?
            {
                Some(existing) => existing,
                None => {
                    let title = self.title_for(prediction).await;
                    let hosted = self.rehost_outputs(prediction).await?;
                    let work = Work::from_prediction(prediction, title, hosted, Utc::now())
                        .map_err(LifecycleError::at("archive"))?;
                    self.works
                        .create(work)
                        .await
                        .map_err(LifecycleError::at("archive"))?
                }
            };
            self.predictions
                .record_applied(id, SideEffect::WorkCreated)
                .await
                .map_err(LifecycleError::at("archive"))?;
            Some(work.id)
        };

        let committed = self
            .predictions
            .has_applied(id, SideEffect::LedgerCommitted)
            .await
            .map_err(LifecycleError::at("commit"))?;
        if !committed {
            self.ledger
                .commit(id)
                .await
                .map_err(LifecycleError::at("commit"))?;
            self.predictions
                .record_applied(id, SideEffect::LedgerCommitted)
                .await
                .map_err(LifecycleError::at("commit"))?;
        }

        Ok(work_id)
    }

    async fn settle_failure(&self, prediction: &Prediction) -> Result<(), LifecycleError> {
        let id = &prediction.id;
        let refunded = self
            .predictions
            .has_applied(id, SideEffect::LedgerRefunded)
            .await
            .map_err(LifecycleError::at("refund"))?;
        if refunded {
            return Ok(());
        }

        match self.ledger.refund(id).await {
            Ok(Some(entry)) => info!(points = entry.amount, "reservation refunded"),
            Ok(None) => debug!("reservation already refunded"),
            Err(LedgerError::ReservationNotFound(_)) => {
                warn!("no reservation for failed job; nothing to refund");
            }
            Err(err) => return Err(LifecycleError::at("refund")(err)),
        }
        self.predictions
            .record_applied(id, SideEffect::LedgerRefunded)
            .await
            .map_err(LifecycleError::at("refund"))?;
        Ok(())
    }

    async fn title_for(&self, prediction: &Prediction) -> String {
        let prompt = prediction.input.prompt();
        if let Some(prompt) = prompt {
            match self.titles.generate_title(prompt).await {
                Ok(title) => return title,
                Err(err) => debug!(error = %err, "title generation failed; using fallback"),
            }
        }
        fallback_title(prediction.kind, prompt, prediction.completed_at.unwrap_or_else(Utc::now))
    }

    async fn rehost_outputs(&self, prediction: &Prediction) -> Result<Vec<String>, LifecycleError> {
        let outputs = prediction.output.as_deref().unwrap_or_default();
        let mut hosted = Vec::with_capacity(outputs.len());
        for url in outputs {
            let stored = self
                .storage
                .rehost(url)
                .await
                .map_err(LifecycleError::at("rehost"))?;
            hosted.push(stored.url);
        }
        Ok(hosted)
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Poll one job. Jobs of other users read as not found.
    pub async fn prediction(
        &self,
        user_id: UserId,
        id: &PredictionId,
    ) -> Result<Prediction, LifecycleError> {
        self.predictions
            .get(id)
            .await?
            .filter(|p| p.user_id == user_id)
            .ok_or(LifecycleError::NotFound)
    }

    pub async fn predictions(
        &self,
        user_id: UserId,
        page: PageRequest,
    ) -> Result<Page<Prediction>, LifecycleError> {
        Ok(self.predictions.list_for_user(user_id, page).await?)
    }

    pub async fn works(
        &self,
        user_id: UserId,
        filter: &WorkFilter,
        page: PageRequest,
    ) -> Result<Page<Work>, LifecycleError> {
        Ok(self.works.list_for_user(user_id, filter, page).await?)
    }

    /// Removes the gallery entry only; the job and the ledger are untouched.
    pub async fn delete_work(
        &self,
        user_id: UserId,
        work_id: WorkId,
    ) -> Result<(), LifecycleError> {
        if self.works.delete(work_id, user_id).await? {
            info!(%work_id, %user_id, "work deleted");
            Ok(())
        } else {
            Err(LifecycleError::NotFound)
        }
    }

    pub async fn balance(&self, user_id: UserId) -> Result<UserBalance, LifecycleError> {
        Ok(self.ledger.open_account(user_id).await?)
    }

    pub async fn transactions(
        &self,
        user_id: UserId,
        page: PageRequest,
    ) -> Result<Page<LedgerEntry>, LifecycleError> {
        Ok(self.ledger.transactions(user_id, page).await?)
    }

    #[instrument(skip(self, code), fields(user_id = %user_id), err)]
    pub async fn redeem(&self, user_id: UserId, code: &str) -> Result<Redeemed, LifecycleError> {
        self.ledger.open_account(user_id).await?;
        let redeemed = self.ledger.redeem(user_id, code).await?;
        info!(points = redeemed.balance.points, "code redeemed");
        Ok(redeemed)
    }
}
