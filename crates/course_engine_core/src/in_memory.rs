//! crates/course_engine_core/src/in_memory.rs
//!
//! DashMap-backed implementations of the persistence ports. Used by the test
//! suite and by the service when no database is configured. Every operation
//! touches a single key under that key's shard lock, which gives the same
//! per-key atomicity the database adapters provide.

use crate::domain::{Course, CourseStatus, Tier};
use crate::ports::{CounterUpdate, CoursePatch, CourseRepository, PortError, PortResult, UsageStore};
use crate::usage::{UsageKey, UsageWindow};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

//=========================================================================================
// Courses
//=========================================================================================

#[derive(Clone, Default)]
pub struct InMemoryCourseRepository {
    courses: Arc<DashMap<Uuid, Course>>,
}

impl InMemoryCourseRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CourseRepository for InMemoryCourseRepository {
    async fn create_course(&self, course: &Course) -> PortResult<()> {
        self.courses.insert(course.id, course.clone());
        Ok(())
    }

    async fn get_course(&self, course_id: Uuid) -> PortResult<Course> {
        self.courses
            .get(&course_id)
            .map(|c| c.value().clone())
            .ok_or_else(|| PortError::NotFound(format!("course {}", course_id)))
    }

    async fn update_course(&self, course_id: Uuid, patch: &CoursePatch) -> PortResult<()> {
        let mut entry = self
            .courses
            .get_mut(&course_id)
            .ok_or_else(|| PortError::NotFound(format!("course {}", course_id)))?;
        let updated = patch.apply_to(entry.value())?;
        *entry.value_mut() = updated;
        Ok(())
    }

    async fn list_courses(&self, user_id: Uuid) -> PortResult<Vec<Course>> {
        let mut courses: Vec<Course> = self
            .courses
            .iter()
            .filter(|c| c.user_id == user_id && c.status != CourseStatus::Deleted)
            .map(|c| c.value().clone())
            .collect();
        courses.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(courses)
    }

    async fn count_active_courses(&self, user_id: Uuid) -> PortResult<u32> {
        let count = self
            .courses
            .iter()
            .filter(|c| c.user_id == user_id && c.status == CourseStatus::Active)
            .count();
        Ok(count as u32)
    }
}

//=========================================================================================
// Usage Counters
//=========================================================================================

/// Keeps only the current period per user, tier and window; a counter from a
/// newer period replaces the old one, so memory stays bounded by the number
/// of users.
#[derive(Clone, Default)]
pub struct InMemoryUsageStore {
    counters: Arc<DashMap<(Uuid, Tier, UsageWindow), Bucket>>,
}

#[derive(Debug, Clone)]
struct Bucket {
    period: String,
    used: u64,
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn series(key: &UsageKey) -> (Uuid, Tier, UsageWindow) {
        (key.user_id, key.tier, key.window)
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.counters.len()
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn increment_if_below(
        &self,
        key: &UsageKey,
        amount: u64,
        limit: u64,
    ) -> PortResult<CounterUpdate> {
        // The entry guard holds the shard lock across the check and the increment.
        let mut bucket = self.counters.entry(Self::series(key)).or_insert_with(|| Bucket {
            period: key.period.clone(),
            used: 0,
        });
        if bucket.period < key.period {
            *bucket = Bucket {
                period: key.period.clone(),
                used: 0,
            };
        } else if bucket.period > key.period {
            // A straggler from a period that already rolled over counts from zero.
            return Ok(CounterUpdate {
                admitted: amount <= limit,
                used: if amount <= limit { amount } else { 0 },
            });
        }
        if bucket.used + amount > limit {
            return Ok(CounterUpdate {
                admitted: false,
                used: bucket.used,
            });
        }
        bucket.used += amount;
        Ok(CounterUpdate {
            admitted: true,
            used: bucket.used,
        })
    }

    async fn current(&self, key: &UsageKey) -> PortResult<u64> {
        Ok(self
            .counters
            .get(&Self::series(key))
            .filter(|bucket| bucket.period == key.period)
            .map(|bucket| bucket.used)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    #[tokio::test]
    async fn deleted_courses_are_hidden_from_listing() {
        let repo = InMemoryCourseRepository::new();
        let user = Uuid::new_v4();
        let keep = Course::new(user, "Keep", "goal");
        let mut gone = Course::new(user, "Gone", "goal");
        gone.status = CourseStatus::Deleted;
        repo.create_course(&keep).await.unwrap();
        repo.create_course(&gone).await.unwrap();

        let listed = repo.list_courses(user).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title, "Keep");
        assert_eq!(repo.count_active_courses(user).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_of_missing_course_is_not_found() {
        let repo = InMemoryCourseRepository::new();
        let err = repo
            .update_course(Uuid::new_v4(), &CoursePatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::NotFound(_)));
    }

    #[tokio::test]
    async fn counter_stops_at_limit() {
        let store = InMemoryUsageStore::new();
        let key = UsageKey::new(Uuid::new_v4(), Tier::Free, UsageWindow::DailyTokens, Utc::now());
        assert!(store.increment_if_below(&key, 6, 10).await.unwrap().admitted);
        let denied = store.increment_if_below(&key, 5, 10).await.unwrap();
        assert!(!denied.admitted);
        assert_eq!(denied.used, 6);
        assert!(store.increment_if_below(&key, 4, 10).await.unwrap().admitted);
        assert_eq!(store.current(&key).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn new_period_replaces_the_old_bucket() {
        let store = InMemoryUsageStore::new();
        let user = Uuid::new_v4();
        let monday: DateTime<Utc> = "2026-03-02T10:00:00Z".parse().unwrap();
        let tuesday: DateTime<Utc> = "2026-03-03T10:00:00Z".parse().unwrap();
        let old = UsageKey::new(user, Tier::Free, UsageWindow::DailyGenerations, monday);
        let new = UsageKey::new(user, Tier::Free, UsageWindow::DailyGenerations, tuesday);

        store.increment_if_below(&old, 9, 10).await.unwrap();
        let fresh = store.increment_if_below(&new, 1, 10).await.unwrap();
        assert!(fresh.admitted);
        assert_eq!(fresh.used, 1);
        assert_eq!(store.bucket_count(), 1);
        assert_eq!(store.current(&old).await.unwrap(), 0);

        // A late request for the finished day does not disturb today's count.
        assert!(store.increment_if_below(&old, 1, 10).await.unwrap().admitted);
        assert_eq!(store.current(&new).await.unwrap(), 1);
    }
}
