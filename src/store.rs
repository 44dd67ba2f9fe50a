//! Case repository seam.
//!
//! The store is the single source of truth for a case. Writes are plain
//! read-modify-upsert with no version check.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    case::Case,
    error::{BridgeError, Result},
};

#[async_trait]
pub trait CaseStore: Send + Sync {
    async fn get(&self, case_id: &str) -> Result<Option<Case>>;

    /// The case currently living in `channel_id`.
    async fn get_by_channel(&self, channel_id: &str) -> Result<Option<Case>>;

    async fn upsert(&self, case: Case) -> Result<Case>;

    /// Persist a promoted case as its own record under its (new) channel.
    async fn create_with_channel(&self, case: Case) -> Result<Case>;

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Case>>;

    /// First case found under any of `keys`, tried in order.
    async fn get_by_conversation(&self, keys: &[&str]) -> Result<Option<Case>> {
        for key in keys {
            if let Some(case) = self.get_by_channel(key).await? {
                return Ok(Some(case));
            }
        }
        Ok(None)
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    cases: HashMap<String, Case>,
    by_channel: HashMap<String, String>,
}

impl StoreInner {
    fn index(&mut self, case: &Case) {
        if !case.channel_id.is_empty() {
            self.by_channel
                .insert(case.channel_id.clone(), case.case_id.clone());
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryCaseStore {
    inner: Mutex<StoreInner>,
}

impl MemoryCaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().cases.is_empty()
    }
}

#[async_trait]
impl CaseStore for MemoryCaseStore {
    async fn get(&self, case_id: &str) -> Result<Option<Case>> {
        Ok(self.inner.lock().cases.get(case_id).cloned())
    }

    async fn get_by_channel(&self, channel_id: &str) -> Result<Option<Case>> {
        let inner = self.inner.lock();
        Ok(inner
            .by_channel
            .get(channel_id)
            .and_then(|case_id| inner.cases.get(case_id))
            .cloned())
    }

    async fn upsert(&self, mut case: Case) -> Result<Case> {
        case.touch();
        let mut inner = self.inner.lock();
        inner.index(&case);
        inner.cases.insert(case.case_id.clone(), case.clone());
        Ok(case)
    }

    async fn create_with_channel(&self, mut case: Case) -> Result<Case> {
        if case.channel_id.is_empty() {
            return Err(BridgeError::Store(format!(
                "case {} has no channel to be created under",
                case.case_id
            )));
        }
        let mut inner = self.inner.lock();
        if inner.cases.contains_key(&case.case_id) {
            return Err(BridgeError::Store(format!(
                "case {} already exists",
                case.case_id
            )));
        }
        case.touch();
        inner.index(&case);
        inner.cases.insert(case.case_id.clone(), case.clone());
        Ok(case)
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Case>> {
        let inner = self.inner.lock();
        let mut cases: Vec<Case> = inner
            .cases
            .values()
            .filter(|case| case.user_id == user_id)
            .cloned()
            .collect();
        cases.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(cases)
    }
}

#[cfg(test)]
mod tests {
    use super::{CaseStore, MemoryCaseStore};
    use crate::case::{Case, CaseStatus};

    #[tokio::test]
    async fn upsert_indexes_by_channel() {
        let store = MemoryCaseStore::new();
        let case = Case::new("oc_1", "u_1", CaseStatus::PreNew);
        let saved = store.upsert(case.clone()).await.unwrap();

        let by_channel = store.get_by_channel("oc_1").await.unwrap().unwrap();
        assert_eq!(by_channel.case_id, saved.case_id);
        assert!(store.get_by_channel("oc_2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conversation_lookup_tries_keys_in_order() {
        let store = MemoryCaseStore::new();
        store
            .upsert(Case::new("u_1", "u_1", CaseStatus::PreNew))
            .await
            .unwrap();

        let found = store
            .get_by_conversation(&["oc_missing", "u_1"])
            .await
            .unwrap();
        assert_eq!(found.map(|c| c.channel_id), Some("u_1".to_string()));
    }

    #[tokio::test]
    async fn create_with_channel_rejects_duplicates_and_missing_channel() {
        let store = MemoryCaseStore::new();
        let mut case = Case::new("oc_1", "u_1", CaseStatus::Open);
        store.create_with_channel(case.clone()).await.unwrap();
        assert!(store.create_with_channel(case.clone()).await.is_err());

        case.case_id = "case-other".into();
        case.channel_id.clear();
        assert!(store.create_with_channel(case).await.is_err());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn list_by_user_filters_owner() {
        let store = MemoryCaseStore::new();
        store
            .upsert(Case::new("oc_1", "u_1", CaseStatus::New))
            .await
            .unwrap();
        store
            .upsert(Case::new("oc_2", "u_2", CaseStatus::New))
            .await
            .unwrap();

        let cases = store.list_by_user("u_1").await.unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].channel_id, "oc_1");
    }
}
