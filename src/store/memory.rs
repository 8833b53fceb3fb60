//! In-memory backend: the primary test backend, and a reference for the
//! store contracts. All maps live behind one mutex so compare-and-swap is a
//! single critical section.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::domain::{Batch, Execution, ExecutionStatus, OutputFile};
use crate::store::{
    BatchStore, CasOutcome, ExecutionStore, OutputFileStore, Page, PageRequest, StoreResult,
};

#[derive(Default)]
struct Inner {
    batches: HashMap<Uuid, Batch>,
    executions: HashMap<Uuid, Execution>,
    files: HashMap<Uuid, OutputFile>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store poisoned")
    }
}

impl BatchStore for MemoryStore {
    fn clone_box(&self) -> Box<dyn BatchStore> {
        Box::new(self.clone())
    }

    fn insert<'a>(&'a self, batch: &'a Batch) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.lock().batches.insert(batch.id, batch.clone().persisted());
            Ok(())
        })
    }

    fn get(&self, id: Uuid) -> BoxFuture<'_, StoreResult<Option<Batch>>> {
        Box::pin(async move { Ok(self.lock().batches.get(&id).cloned()) })
    }
}

impl ExecutionStore for MemoryStore {
    fn clone_box(&self) -> Box<dyn ExecutionStore> {
        Box::new(self.clone())
    }

    fn insert<'a>(&'a self, execution: &'a Execution) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.lock().executions.insert(execution.id, execution.clone());
            Ok(())
        })
    }

    fn get(&self, id: Uuid) -> BoxFuture<'_, StoreResult<Option<Execution>>> {
        Box::pin(async move { Ok(self.lock().executions.get(&id).cloned()) })
    }

    fn compare_and_swap<'a>(
        &'a self,
        updated: &'a Execution,
        expected_version: u64,
    ) -> BoxFuture<'a, StoreResult<CasOutcome>> {
        Box::pin(async move {
            let mut inner = self.lock();
            let Some(current) = inner.executions.get_mut(&updated.id) else {
                return Err(crate::store::StoreError::NotFound(updated.id));
            };
            if current.version != expected_version {
                return Ok(CasOutcome::VersionMismatch);
            }
            let mut next = updated.clone();
            next.version = expected_version + 1;
            *current = next;
            Ok(CasOutcome::Updated)
        })
    }

    fn find_by_status<'a>(
        &'a self,
        tenant: &'a str,
        statuses: &'a [ExecutionStatus],
        page: PageRequest,
    ) -> BoxFuture<'a, StoreResult<Page<Execution>>> {
        Box::pin(async move {
            let inner = self.lock();
            let mut matches: Vec<Execution> = inner
                .executions
                .values()
                .filter(|e| e.tenant == tenant && statuses.contains(&e.current_status))
                .cloned()
                .collect();
            matches.sort_by_key(|e| (e.created, e.id));
            let total = matches.len() as u64;
            let items = matches
                .into_iter()
                .skip(page.offset() as usize)
                .take(page.size as usize)
                .collect();
            Ok(Page {
                items,
                page: page.page,
                total,
            })
        })
    }

    fn find_timed_out(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> BoxFuture<'_, StoreResult<Vec<Execution>>> {
        Box::pin(async move {
            let inner = self.lock();
            let mut matches: Vec<Execution> = inner
                .executions
                .values()
                .filter(|e| e.timed_out_at(now))
                .cloned()
                .collect();
            matches.sort_by_key(|e| (e.last_updated, e.id));
            matches.truncate(limit as usize);
            Ok(matches)
        })
    }

    fn count_active<'a>(
        &'a self,
        user_email: &'a str,
        process_business_id: Uuid,
    ) -> BoxFuture<'a, StoreResult<u64>> {
        Box::pin(async move {
            let inner = self.lock();
            let count = inner
                .executions
                .values()
                .filter(|e| {
                    e.user_email == user_email
                        && e.process_business_id == process_business_id
                        && e.current_status.is_active()
                })
                .count();
            Ok(count as u64)
        })
    }
}

impl OutputFileStore for MemoryStore {
    fn clone_box(&self) -> Box<dyn OutputFileStore> {
        Box::new(self.clone())
    }

    fn insert<'a>(&'a self, file: &'a OutputFile) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.lock().files.insert(file.id, file.clone());
            Ok(())
        })
    }

    fn get(&self, id: Uuid) -> BoxFuture<'_, StoreResult<Option<OutputFile>>> {
        Box::pin(async move { Ok(self.lock().files.get(&id).cloned()) })
    }

    fn set_downloaded(&self, id: Uuid) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            let mut inner = self.lock();
            let Some(file) = inner.files.get_mut(&id) else {
                return Err(crate::store::StoreError::NotFound(id));
            };
            file.downloaded = true;
            Ok(())
        })
    }

    fn set_deleted(&self, id: Uuid) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            let mut inner = self.lock();
            let Some(file) = inner.files.get_mut(&id) else {
                return Err(crate::store::StoreError::NotFound(id));
            };
            file.deleted = true;
            Ok(())
        })
    }

    fn find_downloaded_not_deleted<'a>(
        &'a self,
        tenant: &'a str,
        page: PageRequest,
    ) -> BoxFuture<'a, StoreResult<Page<OutputFile>>> {
        Box::pin(async move {
            let inner = self.lock();
            let mut matches: Vec<OutputFile> = inner
                .files
                .values()
                .filter(|f| {
                    f.downloaded
                        && !f.deleted
                        && inner
                            .executions
                            .get(&f.exec_id)
                            .is_some_and(|e| e.tenant == tenant)
                })
                .cloned()
                .collect();
            matches.sort_by_key(|f| (f.created, f.id));
            let total = matches.len() as u64;
            let items = matches
                .into_iter()
                .skip(page.offset() as usize)
                .take(page.size as usize)
                .collect();
            Ok(Page {
                items,
                page: page.page,
                total,
            })
        })
    }

    fn find_by_exec_id(&self, exec_id: Uuid) -> BoxFuture<'_, StoreResult<Vec<OutputFile>>> {
        Box::pin(async move {
            let inner = self.lock();
            let mut files: Vec<OutputFile> = inner
                .files
                .values()
                .filter(|f| f.exec_id == exec_id)
                .cloned()
                .collect();
            files.sort_by_key(|f| (f.created, f.id));
            Ok(files)
        })
    }

    fn live_bytes_for_process(
        &self,
        process_business_id: Uuid,
    ) -> BoxFuture<'_, StoreResult<u64>> {
        Box::pin(async move {
            let inner = self.lock();
            let total = inner
                .files
                .values()
                .filter(|f| {
                    !f.deleted
                        && inner
                            .executions
                            .get(&f.exec_id)
                            .is_some_and(|e| e.process_business_id == process_business_id)
                })
                .map(|f| f.size_bytes)
                .sum();
            Ok(total)
        })
    }
}
