use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use artforge_core::{Page, PageRequest, PredictionId, UserId, WorkId};
use artforge_predictions::{Work, WorkFilter};

use super::{WorkArchive, WorkArchiveError};

/// In-memory archive for tests/dev. Keyed by prediction id.
#[derive(Debug, Default)]
pub struct InMemoryWorkArchive {
    works: RwLock<HashMap<PredictionId, Work>>,
}

fn poisoned<T>(_: T) -> WorkArchiveError {
    WorkArchiveError::Storage("work archive lock poisoned".to_string())
}

impl InMemoryWorkArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.works.read().map(|w| w.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl WorkArchive for InMemoryWorkArchive {
    async fn create(&self, work: Work) -> Result<Work, WorkArchiveError> {
        let mut works = self.works.write().map_err(poisoned)?;
        Ok(works
            .entry(work.prediction_id.clone())
            .or_insert(work)
            .clone())
    }

    async fn find_by_prediction(
        &self,
        prediction_id: &PredictionId,
    ) -> Result<Option<Work>, WorkArchiveError> {
        Ok(self.works.read().map_err(poisoned)?.get(prediction_id).cloned())
    }

    async fn list_for_user(
        &self,
        user_id: UserId,
        filter: &WorkFilter,
        page: PageRequest,
    ) -> Result<Page<Work>, WorkArchiveError> {
        let mut matching: Vec<Work> = self
            .works
            .read()
            .map_err(poisoned)?
            .values()
            .filter(|w| w.user_id == user_id && filter.matches(w))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.as_uuid().cmp(a.id.as_uuid()))
        });
        Ok(Page::from_vec(matching, page))
    }

    async fn delete(&self, work_id: WorkId, user_id: UserId) -> Result<bool, WorkArchiveError> {
        let mut works = self.works.write().map_err(poisoned)?;
        let key = works
            .iter()
            .find(|(_, w)| w.id == work_id && w.user_id == user_id)
            .map(|(k, _)| k.clone());
        Ok(key.is_some_and(|k| works.remove(&k).is_some()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use artforge_predictions::OperationKind;
    use chrono::Utc;
    use serde_json::json;

    fn work(user: UserId, pid: &str, kind: OperationKind, title: &str) -> Work {
        let now = Utc::now();
        Work {
            id: WorkId::new(),
            user_id: user,
            prediction_id: PredictionId::new(pid).unwrap(),
            title: title.to_string(),
            kind,
            original_image: None,
            processed_image: format!("https://storage/{pid}.png"),
            metadata: json!({}),
            completed_at: now,
            processing_ms: Some(1200),
            created_at: now,
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_per_prediction() {
        let archive = InMemoryWorkArchive::new();
        let user = UserId::new();
        let first = archive
            .create(work(user, "p-1", OperationKind::Edit, "First"))
            .await
            .unwrap();
        let second = archive
            .create(work(user, "p-1", OperationKind::Edit, "Second"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.title, "First");
        assert_eq!(archive.len(), 1);
    }

    #[tokio::test]
    async fn filters_never_cross_users() {
        let archive = InMemoryWorkArchive::new();
        let a = UserId::new();
        let b = UserId::new();
        archive
            .create(work(a, "a-1", OperationKind::Avatar, "Studio portrait"))
            .await
            .unwrap();
        archive
            .create(work(a, "a-2", OperationKind::Generate, "Portrait of a cat"))
            .await
            .unwrap();
        archive
            .create(work(b, "b-1", OperationKind::Avatar, "Portrait at dusk"))
            .await
            .unwrap();

        let filter = WorkFilter::new(Some(OperationKind::Avatar), Some("portrait"));
        let page = archive.list_for_user(a, &filter, PageRequest::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].prediction_id.as_str(), "a-1");
    }

    #[tokio::test]
    async fn delete_requires_ownership() {
        let archive = InMemoryWorkArchive::new();
        let owner = UserId::new();
        let w = archive
            .create(work(owner, "p-1", OperationKind::RemoveBg, "Cutout"))
            .await
            .unwrap();

        assert!(!archive.delete(w.id, UserId::new()).await.unwrap());
        assert!(archive.delete(w.id, owner).await.unwrap());
        assert!(!archive.delete(w.id, owner).await.unwrap());
        assert!(archive.is_empty());
    }
}
