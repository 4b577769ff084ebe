//! In-process upload pipeline: a deduplicating queue drained by one worker
//! task that pushes packages to the cloud and links the resulting course.

pub mod lock;

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cloud::{CloudApi, CloudError, UploadedCourse};
use crate::models::{ContentId, ExternalCourse, LaunchMode};
use crate::store::CloudStore;
use lock::DistributedLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Queued,
    Processing,
    Retrying,
    Completed,
    FailedPermanently,
}

#[derive(Debug, Clone)]
pub struct UploadTask {
    pub package_path: PathBuf,
    pub content_id: ContentId,
    pub course_id: Option<String>,
    pub title: Option<String>,
    pub retry_count: u32,
    pub status: UploadStatus,
    not_before: Option<Instant>,
}

impl UploadTask {
    pub fn new(package_path: PathBuf, content_id: ContentId) -> Self {
        Self {
            package_path,
            content_id,
            course_id: None,
            title: None,
            retry_count: 0,
            status: UploadStatus::Queued,
            not_before: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_course_id(mut self, course_id: impl Into<String>) -> Self {
        self.course_id = Some(course_id.into());
        self
    }

    fn lock_key(&self) -> String {
        lock_key(self.content_id)
    }
}

fn lock_key(content_id: ContentId) -> String {
    format!("upload:{content_id}")
}

/// Answer from the processing lock for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockOutcome {
    Held,
    /// Another holder owns the lock.
    Busy,
    /// The backend failed; the task runs unlocked.
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Failures allowed before a task is failed permanently.
    pub max_retries: u32,
    /// Delay before a retried task is picked up, multiplied by its retry count.
    pub retry_backoff: Duration,
    /// How long the idle worker sleeps when nobody notifies it.
    pub idle_poll: Duration,
    pub lock_ttl: Duration,
    /// Permanently failed tasks kept for inspection.
    pub failed_capacity: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_secs(5),
            idle_poll: Duration::from_secs(1),
            lock_ttl: Duration::from_secs(600),
            failed_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedTask {
    pub content_id: ContentId,
    pub package_path: PathBuf,
    pub retry_count: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub running: bool,
    pub queue_depth: usize,
    pub retry_depth: usize,
    pub processing: usize,
    pub failed: usize,
    pub restarts: u32,
}

/// What happened to a submitted task.
#[derive(Debug)]
pub enum Submitted {
    Queued,
    Duplicate,
    /// The worker could not run, so the upload happened inline.
    Uploaded(UploadedCourse),
}

#[derive(Default)]
struct QueueState {
    primary: VecDeque<UploadTask>,
    retry: VecDeque<UploadTask>,
    processing: HashSet<ContentId>,
    /// Locks taken by the worker and not yet released.
    worker_locks: HashSet<ContentId>,
    failed: VecDeque<FailedTask>,
}

impl QueueState {
    fn is_pending(&self, id: ContentId) -> bool {
        self.processing.contains(&id)
            || self.primary.iter().any(|t| t.content_id == id)
            || self.retry.iter().any(|t| t.content_id == id)
    }
}

struct Worker {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

struct Inner {
    cloud: Arc<dyn CloudApi>,
    store: Arc<dyn CloudStore>,
    lock: Arc<dyn DistributedLock>,
    settings: WorkerSettings,
    state: Mutex<QueueState>,
    notify: Notify,
}

pub struct UploadQueue {
    inner: Arc<Inner>,
    worker: Mutex<Option<Worker>>,
    shutdown: CancellationToken,
    restarts: AtomicU32,
}

impl UploadQueue {
    pub fn new(
        cloud: Arc<dyn CloudApi>,
        store: Arc<dyn CloudStore>,
        lock: Arc<dyn DistributedLock>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cloud,
                store,
                lock,
                settings,
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
            }),
            worker: Mutex::new(None),
            shutdown: CancellationToken::new(),
            restarts: AtomicU32::new(0),
        }
    }

    /// Queues a task unless its content id is already processing, queued or
    /// waiting for a retry. Returns false for such duplicates.
    pub async fn enqueue(&self, mut task: UploadTask) -> bool {
        let mut st = self.inner.state.lock().await;
        let id = task.content_id;
        if st.is_pending(id) {
            debug!(content_id = id, "upload already pending, skipping");
            return false;
        }
        task.status = UploadStatus::Queued;
        st.primary.push_back(task);
        drop(st);

        self.inner.notify.notify_one();
        info!(content_id = id, "upload queued");
        true
    }

    /// Starts the worker unless it is already alive. False once the queue
    /// has been stopped or when there is no runtime to spawn on.
    pub async fn ensure_worker_running(&self) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        let mut worker = self.worker.lock().await;
        if let Some(w) = worker.as_ref() {
            if !w.join.is_finished() {
                return true;
            }
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return false;
        }

        let restarting = worker.is_some();
        if restarting {
            // The dead worker's in-flight task is gone; free its marker and its
            // lock so the content can be queued again.
            let orphaned: Vec<ContentId> = {
                let mut st = self.inner.state.lock().await;
                st.processing.clear();
                st.worker_locks.drain().collect()
            };
            for id in orphaned {
                self.inner.release_key(id).await;
            }
            self.restarts.fetch_add(1, Ordering::Relaxed);
            warn!("upload worker was not running, restarting");
        }

        let cancel = self.shutdown.child_token();
        let join = tokio::spawn(run_worker(self.inner.clone(), cancel.clone()));
        *worker = Some(Worker { cancel, join });
        true
    }

    /// Restarts a dead worker. True when a worker is alive afterwards.
    pub async fn health_check(&self) -> bool {
        let alive = self.is_running().await;
        if alive {
            return true;
        }
        if self.shutdown.is_cancelled() {
            return false;
        }
        error!("upload worker health check failed");
        self.ensure_worker_running().await
    }

    async fn is_running(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .is_some_and(|w| !w.join.is_finished())
    }

    pub async fn status(&self) -> QueueStatus {
        let running = self.is_running().await;
        let st = self.inner.state.lock().await;
        QueueStatus {
            running,
            queue_depth: st.primary.len(),
            retry_depth: st.retry.len(),
            processing: st.processing.len(),
            failed: st.failed.len(),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }

    /// Most recent first.
    pub async fn failed_tasks(&self) -> Vec<FailedTask> {
        self.inner.state.lock().await.failed.iter().rev().cloned().collect()
    }

    /// Queues the task, or uploads it inline when no worker can run.
    ///
    /// The inline path obeys the same rules as the worker: content that is
    /// already pending, or locked by another holder, is reported as a duplicate.
    pub async fn submit(&self, task: UploadTask) -> Result<Submitted, CloudError> {
        if self.ensure_worker_running().await {
            return Ok(if self.enqueue(task).await {
                Submitted::Queued
            } else {
                Submitted::Duplicate
            });
        }

        let id = task.content_id;
        {
            let mut st = self.inner.state.lock().await;
            if st.is_pending(id) {
                debug!(content_id = id, "upload already pending, skipping inline upload");
                return Ok(Submitted::Duplicate);
            }
            st.processing.insert(id);
        }

        let outcome = self.inner.lock_for(&task).await;
        let result = if outcome == LockOutcome::Busy {
            debug!(content_id = id, "upload locked elsewhere, skipping inline upload");
            Ok(Submitted::Duplicate)
        } else {
            warn!(content_id = id, "upload worker unavailable, uploading inline");
            let result = self.inner.upload(&task).await;
            if outcome == LockOutcome::Held {
                self.inner.release_key(id).await;
            }
            result.map(Submitted::Uploaded)
        };

        self.inner.state.lock().await.processing.remove(&id);
        result
    }

    /// Stops the worker after its current task and refuses to restart it.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let worker = self.worker.lock().await.take();
        if let Some(w) = worker {
            w.cancel.cancel();
            if let Err(e) = w.join.await {
                warn!(error = %e, "upload worker ended abnormally");
            }
        }
        info!("upload queue stopped");
    }

    /// Runs `health_check` every `interval` until the queue is stopped.
    pub fn spawn_health_monitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        queue.health_check().await;
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            debug!("upload health monitor stopped");
        })
    }
}

async fn run_worker(inner: Arc<Inner>, cancel: CancellationToken) {
    info!("upload worker started");
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match inner.next_task().await {
            Some(task) => inner.process(task).await,
            None => {
                tokio::select! {
                    _ = inner.notify.notified() => {}
                    _ = tokio::time::sleep(inner.settings.idle_poll) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
    }
    info!("upload worker stopped");
}

impl Inner {
    /// Primary queue first, then the oldest retry whose backoff has elapsed.
    async fn next_task(&self) -> Option<UploadTask> {
        let mut st = self.state.lock().await;
        let mut task = match st.primary.pop_front() {
            Some(t) => t,
            None => {
                let now = Instant::now();
                let ready = st
                    .retry
                    .iter()
                    .position(|t| t.not_before.map_or(true, |nb| nb <= now))?;
                st.retry.remove(ready)?
            }
        };
        task.status = UploadStatus::Processing;
        st.processing.insert(task.content_id);
        Some(task)
    }

    async fn process(&self, mut task: UploadTask) {
        let outcome = self.lock_for(&task).await;
        if outcome == LockOutcome::Busy {
            // Another process owns this content right now; look again later
            // without charging a retry.
            debug!(content_id = task.content_id, "upload locked elsewhere, deferring");
            task.status = UploadStatus::Retrying;
            task.not_before = Some(Instant::now() + self.settings.retry_backoff);
            let mut st = self.state.lock().await;
            st.processing.remove(&task.content_id);
            st.retry.push_back(task);
            return;
        }

        if outcome == LockOutcome::Held {
            self.state.lock().await.worker_locks.insert(task.content_id);
        }
        let result = self.upload(&task).await;
        if outcome == LockOutcome::Held {
            self.release_key(task.content_id).await;
        }

        let mut st = self.state.lock().await;
        st.worker_locks.remove(&task.content_id);
        st.processing.remove(&task.content_id);
        match result {
            Ok(course) => {
                task.status = UploadStatus::Completed;
                info!(content_id = task.content_id, course_id = %course.course_id, "upload completed");
            }
            Err(e) => {
                task.retry_count += 1;
                if e.is_requeueable() && task.retry_count <= self.settings.max_retries {
                    warn!(
                        content_id = task.content_id,
                        retry = task.retry_count,
                        error = %e,
                        "upload failed, will retry"
                    );
                    if matches!(e, CloudError::DuplicateId(_)) {
                        task.course_id = None;
                    }
                    task.status = UploadStatus::Retrying;
                    task.not_before =
                        Some(Instant::now() + self.settings.retry_backoff * task.retry_count);
                    st.retry.push_back(task);
                } else {
                    task.status = UploadStatus::FailedPermanently;
                    error!(
                        content_id = task.content_id,
                        retries = task.retry_count,
                        error = %e,
                        "upload failed permanently"
                    );
                    if st.failed.len() >= self.settings.failed_capacity {
                        st.failed.pop_front();
                    }
                    st.failed.push_back(FailedTask {
                        content_id: task.content_id,
                        package_path: task.package_path,
                        retry_count: task.retry_count,
                        error: e.to_string(),
                        failed_at: Utc::now(),
                    });
                }
            }
        }
    }

    /// Backend errors degrade to running unlocked.
    async fn lock_for(&self, task: &UploadTask) -> LockOutcome {
        match self.lock.acquire(&task.lock_key(), self.settings.lock_ttl).await {
            Ok(true) => LockOutcome::Held,
            Ok(false) => LockOutcome::Busy,
            Err(e) => {
                warn!(content_id = task.content_id, error = %e, "processing lock unavailable, continuing without it");
                LockOutcome::Unavailable
            }
        }
    }

    async fn release_key(&self, content_id: ContentId) {
        if let Err(e) = self.lock.release(&lock_key(content_id)).await {
            warn!(content_id, error = %e, "failed to release processing lock");
        }
    }

    /// Uploads and links. A failed link is logged; the upload stands.
    async fn upload(&self, task: &UploadTask) -> Result<UploadedCourse, CloudError> {
        let course = self
            .cloud
            .upload_package(&task.package_path, task.course_id.as_deref(), task.title.as_deref())
            .await?;

        let link = ExternalCourse {
            id: course.course_id.clone(),
            content_id: task.content_id,
            title: course.title.clone(),
            launch_mode: LaunchMode::Frameset,
            launch_target: "_self".into(),
            default_destination_id: None,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.link_course(&link).await {
            warn!(
                content_id = task.content_id,
                course_id = %course.course_id,
                error = %e,
                "uploaded course could not be linked locally"
            );
        }
        Ok(course)
    }
}

#[cfg(test)]
mod tests {
    use super::lock::{LockError, MemoryLock, NoopLock};
    use super::*;
    use crate::cloud::{
        LaunchRequest, NewRegistration, RegistrationStatus, RemoteDestination, RemoteDispatch,
    };
    use crate::models::ContentItem;
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    /// Scripted cloud: pops one outcome per upload, succeeding once the
    /// script runs dry.
    #[derive(Default)]
    struct FakeCloud {
        script: std::sync::Mutex<VecDeque<Option<CloudError>>>,
        uploads: AtomicUsize,
        gate: Option<Arc<Notify>>,
        panic_on_upload: bool,
    }

    impl FakeCloud {
        fn failing(errors: Vec<CloudError>) -> Self {
            Self {
                script: std::sync::Mutex::new(errors.into_iter().map(Some).collect()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl CloudApi for FakeCloud {
        fn is_configured(&self) -> bool {
            true
        }

        async fn upload_package(
            &self,
            _path: &Path,
            desired: Option<&str>,
            title: Option<&str>,
        ) -> Result<UploadedCourse, CloudError> {
            if self.panic_on_upload {
                panic!("worker crash");
            }
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.uploads.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front().flatten();
            match next {
                Some(e) => Err(e),
                None => Ok(UploadedCourse {
                    course_id: desired.unwrap_or("course-1").to_string(),
                    title: title.unwrap_or("Course").to_string(),
                }),
            }
        }

        async fn ensure_destination(&self, _: &str, _: &str) -> Result<RemoteDestination, CloudError> {
            unimplemented!()
        }

        async fn ensure_dispatch(&self, _: &str, _: &str, _: &str) -> Result<RemoteDispatch, CloudError> {
            unimplemented!()
        }

        async fn create_registration(&self, _: &NewRegistration) -> Result<(), CloudError> {
            unimplemented!()
        }

        async fn build_launch_link(&self, _: &LaunchRequest) -> Result<String, CloudError> {
            unimplemented!()
        }

        async fn get_registration_status(&self, _: &str) -> Result<RegistrationStatus, CloudError> {
            unimplemented!()
        }

        async fn delete_course(&self, _: &str) -> Result<(), CloudError> {
            unimplemented!()
        }
    }

    struct BrokenLock;

    #[async_trait]
    impl DistributedLock for BrokenLock {
        async fn acquire(&self, _: &str, _: Duration) -> Result<bool, LockError> {
            Err(LockError::Unavailable("cache down".into()))
        }

        async fn release(&self, _: &str) -> Result<(), LockError> {
            Err(LockError::Unavailable("cache down".into()))
        }
    }

    fn fast_settings(max_retries: u32) -> WorkerSettings {
        WorkerSettings {
            max_retries,
            retry_backoff: Duration::ZERO,
            idle_poll: Duration::from_millis(5),
            ..WorkerSettings::default()
        }
    }

    async fn store_with_item(id: ContentId) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.add_content_item(ContentItem { id, title: "Fire Safety".into() }).await;
        store
    }

    fn transient() -> CloudError {
        CloudError::Server { status: 503, message: "busy".into() }
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..500 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn enqueue_dedups_queued_content() {
        let q = UploadQueue::new(
            Arc::new(FakeCloud::default()),
            store_with_item(42).await,
            Arc::new(NoopLock),
            fast_settings(3),
        );
        assert!(q.enqueue(UploadTask::new("a.zip".into(), 42)).await);
        assert!(!q.enqueue(UploadTask::new("b.zip".into(), 42)).await);
        assert!(q.enqueue(UploadTask::new("c.zip".into(), 43)).await);
        assert_eq!(q.status().await.queue_depth, 2);
    }

    #[tokio::test]
    async fn enqueue_dedups_processing_content() {
        let gate = Arc::new(Notify::new());
        let cloud = FakeCloud { gate: Some(gate.clone()), ..Default::default() };
        let q = UploadQueue::new(Arc::new(cloud), store_with_item(42).await, Arc::new(NoopLock), fast_settings(3));
        q.ensure_worker_running().await;
        assert!(q.enqueue(UploadTask::new("a.zip".into(), 42)).await);

        wait_until(|| async { q.status().await.processing == 1 }).await;
        assert!(!q.enqueue(UploadTask::new("a.zip".into(), 42)).await);
        assert_eq!(q.status().await.queue_depth, 0);

        gate.notify_one();
        wait_until(|| async { q.status().await.processing == 0 }).await;
        assert!(q.enqueue(UploadTask::new("a.zip".into(), 42)).await);
        gate.notify_one();
        q.stop().await;
    }

    #[tokio::test]
    async fn successful_upload_links_course() {
        let store = store_with_item(42).await;
        let q = UploadQueue::new(Arc::new(FakeCloud::default()), store.clone(), Arc::new(MemoryLock::new()), fast_settings(3));
        q.ensure_worker_running().await;
        q.enqueue(UploadTask::new("a.zip".into(), 42).with_course_id("fire").with_title("Fire Safety"))
            .await;

        wait_until(|| async { store.course_for_content(42).await.unwrap().is_some() }).await;
        let course = store.course_for_content(42).await.unwrap().unwrap();
        assert_eq!(course.id, "fire");
        assert_eq!(course.title, "Fire Safety");
        q.stop().await;
    }

    #[tokio::test]
    async fn link_failure_does_not_fail_the_upload() {
        // No content item 7 in the store, so linking fails.
        let store = Arc::new(MemoryStore::new());
        let cloud = Arc::new(FakeCloud::default());
        let q = UploadQueue::new(cloud.clone(), store.clone(), Arc::new(NoopLock), fast_settings(0));
        q.ensure_worker_running().await;
        q.enqueue(UploadTask::new("a.zip".into(), 7)).await;

        wait_until(|| async { cloud.uploads.load(Ordering::SeqCst) == 1 }).await;
        wait_until(|| async { q.status().await.processing == 0 }).await;
        let status = q.status().await;
        assert_eq!(status.failed, 0);
        assert_eq!(status.retry_depth, 0);
        q.stop().await;
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let store = store_with_item(42).await;
        let cloud = Arc::new(FakeCloud::failing(vec![transient(), transient()]));
        let q = UploadQueue::new(cloud.clone(), store.clone(), Arc::new(NoopLock), fast_settings(3));
        q.ensure_worker_running().await;
        q.enqueue(UploadTask::new("a.zip".into(), 42)).await;

        wait_until(|| async { store.course_for_content(42).await.unwrap().is_some() }).await;
        assert_eq!(cloud.uploads.load(Ordering::SeqCst), 3);
        assert!(q.failed_tasks().await.is_empty());
        q.stop().await;
    }

    #[tokio::test]
    async fn retry_ceiling_fails_permanently() {
        let cloud = Arc::new(FakeCloud::failing(vec![transient(), transient(), transient()]));
        let q = UploadQueue::new(cloud.clone(), store_with_item(42).await, Arc::new(NoopLock), fast_settings(2));
        q.ensure_worker_running().await;
        q.enqueue(UploadTask::new("a.zip".into(), 42)).await;

        wait_until(|| async { q.status().await.failed == 1 }).await;
        let failed = q.failed_tasks().await;
        assert_eq!(failed[0].content_id, 42);
        assert_eq!(failed[0].retry_count, 3);
        assert_eq!(cloud.uploads.load(Ordering::SeqCst), 3);

        let status = q.status().await;
        assert_eq!(status.retry_depth, 0);
        assert_eq!(status.queue_depth, 0);
        q.stop().await;
    }

    #[tokio::test]
    async fn permanent_errors_are_not_requeued() {
        let cloud = Arc::new(FakeCloud::failing(vec![CloudError::NotConfigured]));
        let q = UploadQueue::new(cloud.clone(), store_with_item(42).await, Arc::new(NoopLock), fast_settings(3));
        q.ensure_worker_running().await;
        q.enqueue(UploadTask::new("a.zip".into(), 42)).await;

        wait_until(|| async { q.status().await.failed == 1 }).await;
        assert_eq!(cloud.uploads.load(Ordering::SeqCst), 1);
        assert!(q.failed_tasks().await[0].error.contains("not configured"));
        q.stop().await;
    }

    #[tokio::test]
    async fn lock_backend_outage_degrades_to_unlocked() {
        let store = store_with_item(42).await;
        let q = UploadQueue::new(Arc::new(FakeCloud::default()), store.clone(), Arc::new(BrokenLock), fast_settings(3));
        q.ensure_worker_running().await;
        q.enqueue(UploadTask::new("a.zip".into(), 42)).await;

        wait_until(|| async { store.course_for_content(42).await.unwrap().is_some() }).await;
        q.stop().await;
    }

    #[tokio::test]
    async fn health_check_restarts_dead_worker() {
        let cloud = FakeCloud { panic_on_upload: true, ..Default::default() };
        let q = UploadQueue::new(Arc::new(cloud), store_with_item(42).await, Arc::new(NoopLock), fast_settings(3));
        assert!(q.ensure_worker_running().await);
        q.enqueue(UploadTask::new("a.zip".into(), 42)).await;

        wait_until(|| async { !q.status().await.running }).await;
        assert!(q.health_check().await);

        let status = q.status().await;
        assert!(status.running);
        assert_eq!(status.restarts, 1);
        assert_eq!(status.processing, 0);
        q.stop().await;
    }

    #[tokio::test]
    async fn submit_after_stop_uploads_inline() {
        let store = store_with_item(42).await;
        let q = UploadQueue::new(Arc::new(FakeCloud::default()), store.clone(), Arc::new(NoopLock), fast_settings(3));
        q.stop().await;
        assert!(!q.ensure_worker_running().await);

        match q.submit(UploadTask::new("a.zip".into(), 42).with_course_id("inline")).await.unwrap() {
            Submitted::Uploaded(course) => assert_eq!(course.course_id, "inline"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(store.course_for_content(42).await.unwrap().is_some());
        assert!(!q.health_check().await);
    }

    #[tokio::test]
    async fn inline_submit_respects_a_lock_held_elsewhere() {
        let cloud = Arc::new(FakeCloud::default());
        let lock = Arc::new(MemoryLock::new());
        assert!(lock.acquire("upload:42", Duration::from_secs(600)).await.unwrap());
        let q = UploadQueue::new(cloud.clone(), store_with_item(42).await, lock.clone(), fast_settings(3));
        q.stop().await;

        let outcome = q.submit(UploadTask::new("a.zip".into(), 42)).await.unwrap();
        assert!(matches!(outcome, Submitted::Duplicate));
        assert_eq!(cloud.uploads.load(Ordering::SeqCst), 0);
        assert_eq!(q.status().await.processing, 0);
        // still owned by the other holder
        assert!(!lock.acquire("upload:42", Duration::from_secs(600)).await.unwrap());
    }

    #[tokio::test]
    async fn inline_submit_skips_pending_content() {
        let cloud = Arc::new(FakeCloud::default());
        let q = UploadQueue::new(cloud.clone(), store_with_item(42).await, Arc::new(NoopLock), fast_settings(3));
        assert!(q.enqueue(UploadTask::new("a.zip".into(), 42)).await);
        q.stop().await;

        let outcome = q.submit(UploadTask::new("b.zip".into(), 42)).await.unwrap();
        assert!(matches!(outcome, Submitted::Duplicate));
        assert_eq!(cloud.uploads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn inline_submit_releases_its_lock() {
        let lock = Arc::new(MemoryLock::new());
        let q = UploadQueue::new(Arc::new(FakeCloud::default()), store_with_item(42).await, lock.clone(), fast_settings(3));
        q.stop().await;

        assert!(matches!(q.submit(UploadTask::new("a.zip".into(), 42)).await.unwrap(), Submitted::Uploaded(_)));
        assert!(lock.acquire("upload:42", Duration::from_secs(1)).await.unwrap());
        assert_eq!(q.status().await.processing, 0);
    }

    #[tokio::test]
    async fn inline_submit_runs_unlocked_when_lock_backend_is_down() {
        let cloud = Arc::new(FakeCloud::default());
        let q = UploadQueue::new(cloud.clone(), store_with_item(42).await, Arc::new(BrokenLock), fast_settings(3));
        q.stop().await;

        assert!(matches!(q.submit(UploadTask::new("a.zip".into(), 42)).await.unwrap(), Submitted::Uploaded(_)));
        assert_eq!(cloud.uploads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delayed_retry_does_not_block_ready_ones() {
        let q = UploadQueue::new(Arc::new(FakeCloud::default()), store_with_item(42).await, Arc::new(NoopLock), fast_settings(3));
        {
            let mut st = q.inner.state.lock().await;
            let mut later = UploadTask::new("a.zip".into(), 42);
            later.not_before = Some(Instant::now() + Duration::from_secs(3600));
            st.retry.push_back(later);
            st.retry.push_back(UploadTask::new("b.zip".into(), 43));
        }

        let task = q.inner.next_task().await.unwrap();
        assert_eq!(task.content_id, 43);
        assert!(q.inner.next_task().await.is_none());
        let status = q.status().await;
        assert_eq!(status.retry_depth, 1);
        assert_eq!(status.processing, 1);
    }

    #[tokio::test]
    async fn restart_releases_the_crashed_task_lock() {
        let cloud = FakeCloud { panic_on_upload: true, ..Default::default() };
        let lock = Arc::new(MemoryLock::new());
        let q = UploadQueue::new(Arc::new(cloud), store_with_item(42).await, lock.clone(), fast_settings(3));
        assert!(q.ensure_worker_running().await);
        q.enqueue(UploadTask::new("a.zip".into(), 42)).await;

        wait_until(|| async { !q.status().await.running }).await;
        assert!(!lock.acquire("upload:42", Duration::from_secs(1)).await.unwrap());

        assert!(q.health_check().await);
        assert!(lock.acquire("upload:42", Duration::from_secs(1)).await.unwrap());
        assert!(q.inner.state.lock().await.worker_locks.is_empty());
        q.stop().await;
    }

    #[tokio::test]
    async fn submit_queues_when_worker_runs() {
        let q = UploadQueue::new(Arc::new(FakeCloud { gate: Some(Arc::new(Notify::new())), ..Default::default() }), store_with_item(42).await, Arc::new(NoopLock), fast_settings(3));
        assert!(matches!(q.submit(UploadTask::new("a.zip".into(), 42)).await.unwrap(), Submitted::Queued));
        assert!(matches!(q.submit(UploadTask::new("a.zip".into(), 42)).await.unwrap(), Submitted::Duplicate));
        assert!(q.status().await.running);
    }
}
