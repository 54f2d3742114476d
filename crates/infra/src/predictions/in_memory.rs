use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use artforge_core::{Page, PageRequest, PredictionId, UserId};
use artforge_predictions::{Prediction, PredictionUpdate, SideEffect};

use super::{PredictionStore, PredictionStoreError, Upserted};

/// In-memory job store for tests/dev.
///
/// The write lock around the map serializes upserts, which is what keeps
/// concurrent deliveries for one job from both applying.
#[derive(Debug, Default)]
pub struct InMemoryPredictionStore {
    predictions: RwLock<HashMap<PredictionId, Prediction>>,
    effects: RwLock<HashMap<PredictionId, BTreeSet<SideEffect>>>,
}

fn poisoned<T>(_: T) -> PredictionStoreError {
    PredictionStoreError::Storage("prediction store lock poisoned".to_string())
}

impl InMemoryPredictionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait::async_trait]
impl PredictionStore for InMemoryPredictionStore {
    async fn create(&self, prediction: &Prediction) -> Result<(), PredictionStoreError> {
        let mut predictions = self.predictions.write().map_err(poisoned)?;
        if predictions.contains_key(&prediction.id) {
            return Err(PredictionStoreError::AlreadyExists(prediction.id.clone()));
        }
        predictions.insert(prediction.id.clone(), prediction.clone());
        Ok(())
    }

    async fn get(&self, id: &PredictionId) -> Result<Option<Prediction>, PredictionStoreError> {
        Ok(self.predictions.read().map_err(poisoned)?.get(id).cloned())
    }

    async fn upsert(
        &self,
        update: &PredictionUpdate,
    ) -> Result<Option<Upserted>, PredictionStoreError> {
        let mut predictions = self.predictions.write().map_err(poisoned)?;
        let Some(prediction) = predictions.get_mut(&update.id) else {
            return Ok(None);
        };
        let transition = prediction.apply_update(update)?;
        Ok(Some(Upserted {
            prediction: prediction.clone(),
            transition,
        }))
    }

    async fn list_for_user(
        &self,
        user_id: UserId,
        page: PageRequest,
    ) -> Result<Page<Prediction>, PredictionStoreError> {
        let mut mine: Vec<Prediction> = self
            .predictions
            .read()
            .map_err(poisoned)?
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        mine.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.as_str().cmp(a.id.as_str()))
        });
        Ok(Page::from_vec(mine, page))
    }

    async fn has_applied(
        &self,
        id: &PredictionId,
        effect: SideEffect,
    ) -> Result<bool, PredictionStoreError> {
        Ok(self
            .effects
            .read()
            .map_err(poisoned)?
            .get(id)
            .is_some_and(|set| set.contains(&effect)))
    }

    async fn record_applied(
        &self,
        id: &PredictionId,
        effect: SideEffect,
    ) -> Result<bool, PredictionStoreError> {
        let mut effects = self.effects.write().map_err(poisoned)?;
        Ok(effects.entry(id.clone()).or_default().insert(effect))
    }

    async fn applied(&self, id: &PredictionId) -> Result<Vec<SideEffect>, PredictionStoreError> {
        Ok(self
            .effects
            .read()
            .map_err(poisoned)?
            .get(id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use artforge_predictions::{OperationKind, PredictionStatus, ToolInput, Transition};
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn job(id: &str, user: UserId) -> Prediction {
        let input = ToolInput::parse(OperationKind::Generate, json!({"prompt": "a lighthouse"}))
            .unwrap();
        Prediction::starting(
            PredictionId::new(id).unwrap(),
            user,
            "gen-model",
            input,
            10,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn create_rejects_duplicates() {
        let store = InMemoryPredictionStore::new();
        let p = job("p-1", UserId::new());
        store.create(&p).await.unwrap();
        assert!(matches!(
            store.create(&p).await,
            Err(PredictionStoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn upsert_reports_transition_and_keeps_first_terminal() {
        let store = InMemoryPredictionStore::new();
        let p = job("p-1", UserId::new());
        store.create(&p).await.unwrap();
        let now = Utc::now();

        let failed = PredictionUpdate::status_only(p.id.clone(), PredictionStatus::Failed, now);
        let first = store.upsert(&failed).await.unwrap().unwrap();
        assert_eq!(first.transition, Transition::Apply);

        let again = store.upsert(&failed).await.unwrap().unwrap();
        assert_eq!(again.transition, Transition::Redelivery);

        let late = PredictionUpdate::status_only(
            p.id.clone(),
            PredictionStatus::Succeeded,
            now + Duration::seconds(1),
        );
        let conflict = store.upsert(&late).await.unwrap().unwrap();
        assert_eq!(conflict.transition, Transition::Conflict);
        assert_eq!(conflict.prediction.status, PredictionStatus::Failed);

        let unknown = PredictionUpdate::status_only(
            PredictionId::new("ghost").unwrap(),
            PredictionStatus::Failed,
            now,
        );
        assert!(store.upsert(&unknown).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lists_only_the_owners_jobs() {
        let store = InMemoryPredictionStore::new();
        let a = UserId::new();
        let b = UserId::new();
        store.create(&job("a-1", a)).await.unwrap();
        store.create(&job("a-2", a)).await.unwrap();
        store.create(&job("b-1", b)).await.unwrap();

        let page = store.list_for_user(a, PageRequest::default()).await.unwrap();
        assert_eq!(page.total, 2);
        assert!(page.items.iter().all(|p| p.user_id == a));
    }

    #[tokio::test]
    async fn side_effects_record_once() {
        let store = InMemoryPredictionStore::new();
        let id = PredictionId::new("p-1").unwrap();
        assert!(!store.has_applied(&id, SideEffect::WorkCreated).await.unwrap());
        assert!(store.record_applied(&id, SideEffect::LedgerCommitted).await.unwrap());
        assert!(store.record_applied(&id, SideEffect::WorkCreated).await.unwrap());
        assert!(!store.record_applied(&id, SideEffect::WorkCreated).await.unwrap());
        assert_eq!(
            store.applied(&id).await.unwrap(),
            vec![SideEffect::WorkCreated, SideEffect::LedgerCommitted]
        );
    }
}
