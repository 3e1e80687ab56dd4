use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use time::OffsetDateTime;
use tracing::instrument;
use uuid::Uuid;

use crate::{
    short_code::ShortCode,
    url_repo::{NewUrlMapping, StoreError, UrlMapping, UrlRepository},
};

/// Map-backed [`UrlRepository`] for tests and local runs.
///
/// `codes` is the uniqueness index: a code is claimed through its entry lock,
/// so concurrent creates of the same code cannot both succeed.
#[derive(Debug, Default)]
pub struct InMemoryUrlRepository {
    mappings: DashMap<Uuid, UrlMapping>,
    codes: DashMap<String, Uuid>,
}

impl InMemoryUrlRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

#[async_trait]
impl UrlRepository for InMemoryUrlRepository {
    #[instrument(skip(self))]
    async fn create(&self, mapping: NewUrlMapping) -> Result<UrlMapping, StoreError> {
        match self.codes.entry(mapping.code.as_str().to_owned()) {
            Entry::Occupied(_) => Err(StoreError::DuplicateCode),
            Entry::Vacant(slot) => {
                let now = OffsetDateTime::now_utc();
                let created = UrlMapping {
                    id: Uuid::new_v4(),
                    code: mapping.code,
                    original_url: mapping.original_url,
                    created_at: now,
                    updated_at: now,
                };
                self.mappings.insert(created.id, created.clone());
                slot.insert(created.id);
                Ok(created)
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_by_code(&self, code: &ShortCode) -> Result<UrlMapping, StoreError> {
        let id = self
            .codes
            .get(code.as_str())
            .map(|id| *id)
            .ok_or(StoreError::NotFound)?;
        self.get_by_id(id).await
    }

    #[instrument(skip(self))]
    async fn get_by_id(&self, id: Uuid) -> Result<UrlMapping, StoreError> {
        self.mappings
            .get(&id)
            .map(|mapping| mapping.clone())
            .ok_or(StoreError::NotFound)
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let (_, removed) = self.mappings.remove(&id).ok_or(StoreError::NotFound)?;
        self.codes.remove(removed.code.as_str());
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
