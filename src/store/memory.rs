//! In-memory store. One mutex guards all state, which makes each call atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{CloudStore, LedgerStore, StoreError};
use crate::ledger::{apply_remote_snapshot, apply_update, resolve_attempt};
use crate::models::*;

#[derive(Default)]
struct State {
    content_items: HashMap<ContentId, ContentItem>,
    learners: HashMap<LearnerId, Learner>,
    courses: HashMap<ContentId, ExternalCourse>,
    destinations: HashMap<String, Destination>,
    dispatches: HashMap<String, Dispatch>,
    registrations: HashMap<String, Registration>,
    enrollments: HashMap<Uuid, Enrollment>,
    enrollment_index: HashMap<(LearnerId, ContentId), Uuid>,
    attempts: HashMap<Uuid, Attempt>,
    bindings: HashMap<(Uuid, String), SessionBinding>,
    commit_log: Vec<CommitLogEntry>,
}

impl State {
    fn enrollment_for(
        &mut self,
        learner_id: LearnerId,
        content_id: ContentId,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, StoreError> {
        let key = (learner_id, content_id);
        match self.enrollment_index.get(&key).copied() {
            Some(id) => self
                .enrollments
                .get(&id)
                .cloned()
                .ok_or_else(|| StoreError::Corrupt(format!("dangling enrollment index {id}"))),
            None => {
                let e = Enrollment::new(learner_id, content_id, now);
                self.enrollment_index.insert(key, e.id);
                self.enrollments.insert(e.id, e.clone());
                Ok(e)
            }
        }
    }

    fn latest_attempt(&self, enrollment_id: Uuid) -> Option<Attempt> {
        self.attempts
            .values()
            .filter(|a| a.enrollment_id == enrollment_id)
            .max_by_key(|a| a.attempt_number)
            .cloned()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_content_item(&self, item: ContentItem) {
        self.state.lock().await.content_items.insert(item.id, item);
    }

    pub async fn add_learner(&self, learner: Learner) {
        self.state.lock().await.learners.insert(learner.id, learner);
    }

    pub async fn dispatch_count(&self) -> usize {
        self.state.lock().await.dispatches.len()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn ingest(
        &self,
        update: &ProgressUpdate,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, StoreError> {
        let mut st = self.state.lock().await;

        let mut enrollment = st.enrollment_for(update.learner_id, update.content_id, now)?;
        let loaded = enrollment.clone();

        let bound = st
            .bindings
            .get(&(enrollment.id, update.session_id.clone()))
            .and_then(|b| st.attempts.get(&b.attempt_id).map(|a| (b.clone(), a.clone())));
        let latest = if bound.is_none() {
            st.latest_attempt(enrollment.id)
        } else {
            None
        };

        let mut resolved = resolve_attempt(&mut enrollment, bound, latest, update, now);
        let Some(entry) = apply_update(
            &mut enrollment,
            &mut resolved.attempt,
            update,
            resolved.seq_offset,
            now,
        )?
        else {
            return Ok(IngestOutcome {
                enrollment: loaded,
                attempt: resolved.attempt,
                ignored: true,
            });
        };

        st.enrollments.insert(enrollment.id, enrollment.clone());
        st.attempts.insert(resolved.attempt.id, resolved.attempt.clone());
        if let Some(binding) = resolved.new_binding {
            st.bindings
                .insert((enrollment.id, binding.session_id.clone()), binding);
        }
        st.commit_log.push(entry);

        Ok(IngestOutcome {
            enrollment,
            attempt: resolved.attempt,
            ignored: false,
        })
    }

    async fn apply_remote(
        &self,
        learner_id: LearnerId,
        content_id: ContentId,
        snapshot: &Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, StoreError> {
        let mut st = self.state.lock().await;

        let mut enrollment = st.enrollment_for(learner_id, content_id, now)?;
        let latest = st.latest_attempt(enrollment.id);
        let applied = apply_remote_snapshot(&mut enrollment, latest, snapshot, now);
        if applied.changed {
            st.enrollments.insert(enrollment.id, enrollment.clone());
            st.attempts.insert(applied.attempt.id, applied.attempt.clone());
        }
        Ok(IngestOutcome {
            enrollment,
            attempt: applied.attempt,
            ignored: !applied.changed,
        })
    }

    async fn find_enrollment(
        &self,
        learner_id: LearnerId,
        content_id: ContentId,
    ) -> Result<Option<Enrollment>, StoreError> {
        let st = self.state.lock().await;
        Ok(st
            .enrollment_index
            .get(&(learner_id, content_id))
            .and_then(|id| st.enrollments.get(id))
            .cloned())
    }

    async fn list_attempts(&self, enrollment_id: Uuid) -> Result<Vec<Attempt>, StoreError> {
        let st = self.state.lock().await;
        let mut out: Vec<Attempt> = st
            .attempts
            .values()
            .filter(|a| a.enrollment_id == enrollment_id)
            .cloned()
            .collect();
        out.sort_by_key(|a| a.attempt_number);
        Ok(out)
    }

    async fn commit_log(&self, attempt_id: Uuid) -> Result<Vec<CommitLogEntry>, StoreError> {
        let st = self.state.lock().await;
        let mut out: Vec<CommitLogEntry> = st
            .commit_log
            .iter()
            .filter(|c| c.attempt_id == attempt_id)
            .cloned()
            .collect();
        out.sort_by_key(|c| c.sequence_number);
        Ok(out)
    }
}

#[async_trait]
impl CloudStore for MemoryStore {
    async fn content_item(&self, id: ContentId) -> Result<Option<ContentItem>, StoreError> {
        Ok(self.state.lock().await.content_items.get(&id).cloned())
    }

    async fn learner(&self, id: LearnerId) -> Result<Option<Learner>, StoreError> {
        Ok(self.state.lock().await.learners.get(&id).cloned())
    }

    async fn course_for_content(
        &self,
        content_id: ContentId,
    ) -> Result<Option<ExternalCourse>, StoreError> {
        Ok(self.state.lock().await.courses.get(&content_id).cloned())
    }

    async fn get_course(&self, course_id: &str) -> Result<Option<ExternalCourse>, StoreError> {
        let st = self.state.lock().await;
        Ok(st.courses.values().find(|c| c.id == course_id).cloned())
    }

    async fn link_course(&self, course: &ExternalCourse) -> Result<(), StoreError> {
        let mut st = self.state.lock().await;
        if !st.content_items.contains_key(&course.content_id) {
            return Err(StoreError::NotFound(format!("content item {}", course.content_id)));
        }
        st.courses.insert(course.content_id, course.clone());
        Ok(())
    }

    async fn get_or_create_destination(
        &self,
        id: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Destination, StoreError> {
        let mut st = self.state.lock().await;
        let dest = st
            .destinations
            .entry(id.to_string())
            .or_insert_with(|| Destination {
                id: id.to_string(),
                name: name.to_string(),
                remote_created: false,
                created_at: now,
            });
        Ok(dest.clone())
    }

    async fn mark_destination_remote(&self, id: &str) -> Result<(), StoreError> {
        let mut st = self.state.lock().await;
        let dest = st
            .destinations
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("destination {id}")))?;
        dest.remote_created = true;
        Ok(())
    }

    async fn get_or_create_dispatch(
        &self,
        course_id: &str,
        destination_id: &str,
        candidate_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Dispatch, StoreError> {
        let mut st = self.state.lock().await;
        if let Some(existing) = st
            .dispatches
            .values()
            .find(|d| d.course_id == course_id && d.destination_id == destination_id)
        {
            return Ok(existing.clone());
        }
        let dispatch = Dispatch {
            id: candidate_id.to_string(),
            course_id: course_id.to_string(),
            destination_id: destination_id.to_string(),
            enabled: true,
            registration_cap: 0,
            registration_count: 0,
            expiration_date: None,
            remote_created: false,
            created_at: now,
        };
        st.dispatches.insert(dispatch.id.clone(), dispatch.clone());
        Ok(dispatch)
    }

    async fn mark_dispatch_remote(&self, id: &str) -> Result<(), StoreError> {
        let mut st = self.state.lock().await;
        let d = st
            .dispatches
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("dispatch {id}")))?;
        d.remote_created = true;
        Ok(())
    }

    async fn increment_dispatch_registrations(&self, id: &str) -> Result<(), StoreError> {
        let mut st = self.state.lock().await;
        let d = st
            .dispatches
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("dispatch {id}")))?;
        d.registration_count += 1;
        Ok(())
    }

    async fn find_registration(
        &self,
        learner_id: LearnerId,
        course_id: &str,
    ) -> Result<Option<Registration>, StoreError> {
        let st = self.state.lock().await;
        Ok(st
            .registrations
            .values()
            .find(|r| r.learner_id == learner_id && r.course_id == course_id)
            .cloned())
    }

    async fn get_registration(&self, id: &str) -> Result<Option<Registration>, StoreError> {
        Ok(self.state.lock().await.registrations.get(id).cloned())
    }

    async fn insert_registration(&self, reg: &Registration) -> Result<Registration, StoreError> {
        let mut st = self.state.lock().await;
        if let Some(existing) = st
            .registrations
            .values()
            .find(|r| r.learner_id == reg.learner_id && r.course_id == reg.course_id)
        {
            return Ok(existing.clone());
        }
        st.registrations.insert(reg.id.clone(), reg.clone());
        Ok(reg.clone())
    }

    async fn mark_registration_remote(&self, id: &str) -> Result<(), StoreError> {
        let mut st = self.state.lock().await;
        let r = st
            .registrations
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("registration {id}")))?;
        r.remote_created = true;
        Ok(())
    }

    async fn save_registration_sync(&self, reg: &Registration) -> Result<(), StoreError> {
        let mut st = self.state.lock().await;
        let r = st
            .registrations
            .get_mut(&reg.id)
            .ok_or_else(|| StoreError::NotFound(format!("registration {}", reg.id)))?;
        r.completion_status = reg.completion_status.clone();
        r.success_status = reg.success_status.clone();
        r.score = reg.score;
        r.total_seconds = reg.total_seconds;
        r.last_sync = reg.last_sync.clone();
        r.last_synced_at = reg.last_synced_at;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_is_unique_per_course_and_destination() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let a = store.get_or_create_dispatch("c1", "d1", "x1", now).await.unwrap();
        let b = store.get_or_create_dispatch("c1", "d1", "x2", now).await.unwrap();
        assert_eq!(a.id, "x1");
        assert_eq!(b.id, "x1");
        store.get_or_create_dispatch("c2", "d1", "x3", now).await.unwrap();
        assert_eq!(store.dispatch_count().await, 2);
    }

    #[tokio::test]
    async fn first_registration_write_wins() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mk = |id: &str| Registration {
            id: id.to_string(),
            learner_id: 1,
            content_id: 2,
            course_id: "c".into(),
            completion_status: None,
            success_status: None,
            score: None,
            total_seconds: 0,
            last_sync: None,
            last_synced_at: None,
            remote_created: false,
            created_at: now,
        };
        let first = store.insert_registration(&mk("r1")).await.unwrap();
        let second = store.insert_registration(&mk("r2")).await.unwrap();
        assert_eq!(first.id, "r1");
        assert_eq!(second.id, "r1");
        assert!(store.get_registration("r2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn link_course_requires_content_item() {
        let store = MemoryStore::new();
        let course = ExternalCourse {
            id: "ext-1".into(),
            content_id: 9,
            title: "T".into(),
            launch_mode: LaunchMode::Frameset,
            launch_target: "_self".into(),
            default_destination_id: None,
            created_at: Utc::now(),
        };
        assert!(matches!(store.link_course(&course).await, Err(StoreError::NotFound(_))));
        store.add_content_item(ContentItem { id: 9, title: "T".into() }).await;
        store.link_course(&course).await.unwrap();
        assert_eq!(store.get_course("ext-1").await.unwrap().unwrap().content_id, 9);
    }
}
