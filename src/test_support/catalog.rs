use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::catalog::{CatalogError, CatalogManga, JobStatus, RemoteCatalog};

const LOCAL_SOURCE_ID: &str = "0";
const CREATED_CATEGORY_ID: i64 = 7;

#[derive(Default)]
struct FakeState {
    mangas: BTreeMap<i64, CatalogManga>,
    indexed_on_refresh: Vec<CatalogManga>,
    categories: Vec<(i64, String)>,
    created_categories: Vec<String>,
    statuses: VecDeque<JobStatus>,
    fail_attach: bool,
}

/// In-memory [`RemoteCatalog`] recording every call.
pub struct FakeCatalog {
    state: Mutex<FakeState>,
    calls: AtomicUsize,
    has_local_source: bool,
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            calls: AtomicUsize::new(0),
            has_local_source: true,
        }
    }

    pub fn without_local_source(mut self) -> Self {
        self.has_local_source = false;
        self
    }

    fn manga(title: &str, id: i64, in_library: bool) -> CatalogManga {
        CatalogManga {
            id,
            title: title.to_string(),
            in_library,
            category_ids: Vec::new(),
        }
    }

    /// Makes `title` queryable right away.
    pub fn index(&self, title: &str, id: i64, in_library: bool) {
        self.state
            .lock()
            .unwrap()
            .mangas
            .insert(id, Self::manga(title, id, in_library));
    }

    /// Makes `title` queryable after the next source refresh.
    pub fn index_on_refresh(&self, title: &str, id: i64) {
        self.state
            .lock()
            .unwrap()
            .indexed_on_refresh
            .push(Self::manga(title, id, false));
    }

    /// Queues a status returned by the next `library_update_status` call.
    pub fn push_status(&self, status: JobStatus) {
        self.state.lock().unwrap().statuses.push_back(status);
    }

    pub fn fail_attach(&self, fail: bool) {
        self.state.lock().unwrap().fail_attach = fail;
    }

    pub fn is_attached(&self, id: i64) -> bool {
        self.state
            .lock()
            .unwrap()
            .mangas
            .get(&id)
            .is_some_and(|m| m.is_attached_to(CREATED_CATEGORY_ID))
    }

    pub fn created_categories(&self) -> Vec<String> {
        self.state.lock().unwrap().created_categories.clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteCatalog for FakeCatalog {
    async fn local_source_id(&self) -> Result<Option<String>, CatalogError> {
        self.record_call();
        Ok(self.has_local_source.then(|| LOCAL_SOURCE_ID.to_string()))
    }

    async fn find_category(&self, name: &str) -> Result<Option<i64>, CatalogError> {
        self.record_call();
        let state = self.state.lock().unwrap();
        Ok(state
            .categories
            .iter()
            .find(|(_, existing)| existing == name)
            .map(|(id, _)| *id))
    }

    async fn create_category(&self, name: &str) -> Result<i64, CatalogError> {
        self.record_call();
        let mut state = self.state.lock().unwrap();
        state.categories.push((CREATED_CATEGORY_ID, name.to_string()));
        state.created_categories.push(name.to_string());
        Ok(CREATED_CATEGORY_ID)
    }

    async fn mangas_by_title(&self, source_id: &str, title: &str) -> Result<Vec<CatalogManga>, CatalogError> {
        self.record_call();
        assert_eq!(source_id, LOCAL_SOURCE_ID);
        let state = self.state.lock().unwrap();
        Ok(state
            .mangas
            .values()
            .filter(|m| m.title == title)
            .cloned()
            .collect())
    }

    async fn mangas_not_in_library(&self, source_id: &str) -> Result<Vec<CatalogManga>, CatalogError> {
        self.record_call();
        assert_eq!(source_id, LOCAL_SOURCE_ID);
        let state = self.state.lock().unwrap();
        Ok(state
            .mangas
            .values()
            .filter(|m| !m.in_library)
            .cloned()
            .collect())
    }

    async fn set_in_library(&self, ids: &[i64]) -> Result<(), CatalogError> {
        self.record_call();
        let mut state = self.state.lock().unwrap();
        if state.fail_attach {
            return Err(CatalogError::HttpStatus {
                operation: "updateMangas",
                status: 500,
            });
        }
        for id in ids {
            if let Some(manga) = state.mangas.get_mut(id) {
                manga.in_library = true;
            }
        }
        Ok(())
    }

    async fn add_to_category(&self, ids: &[i64], category_id: i64) -> Result<(), CatalogError> {
        self.record_call();
        let mut state = self.state.lock().unwrap();
        for id in ids {
            if let Some(manga) = state.mangas.get_mut(id)
                && !manga.category_ids.contains(&category_id)
            {
                manga.category_ids.push(category_id);
            }
        }
        Ok(())
    }

    async fn fetch_source_latest(&self, source_id: &str) -> Result<(), CatalogError> {
        self.record_call();
        assert_eq!(source_id, LOCAL_SOURCE_ID);
        let mut state = self.state.lock().unwrap();
        let refreshed: Vec<CatalogManga> = state.indexed_on_refresh.drain(..).collect();
        for manga in refreshed {
            state.mangas.insert(manga.id, manga);
        }
        Ok(())
    }

    async fn trigger_category_update(&self, _category_id: i64) -> Result<(), CatalogError> {
        self.record_call();
        Ok(())
    }

    async fn library_update_status(&self) -> Result<JobStatus, CatalogError> {
        self.record_call();
        Ok(self.state.lock().unwrap().statuses.pop_front().unwrap_or_default())
    }
}
