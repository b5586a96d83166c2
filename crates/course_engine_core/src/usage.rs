//! crates/course_engine_core/src/usage.rs
//!
//! Tier-based usage limits. Counters live in a shared `UsageStore` keyed by
//! user, tier, metric window and period bucket; a new bucket starts at zero,
//! which is the only reset there is.

use crate::domain::Tier;
use crate::ports::{PortResult, UsageStore};
use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

//=========================================================================================
// Limits
//=========================================================================================

/// A metered quantity and the period it is counted over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageWindow {
    DailyGenerations,
    DailyTokens,
    WeeklyTokens,
}

impl UsageWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DailyGenerations => "daily_generations",
            Self::DailyTokens => "daily_tokens",
            Self::WeeklyTokens => "weekly_tokens",
        }
    }

    fn is_weekly(&self) -> bool {
        matches!(self, Self::WeeklyTokens)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierLimits {
    pub daily_generations: u64,
    pub daily_tokens: u64,
    pub weekly_tokens: u64,
    pub max_active_courses: u32,
}

impl TierLimits {
    pub const FREE: TierLimits = TierLimits {
        daily_generations: 100,
        daily_tokens: 100_000,
        weekly_tokens: 1_000_000,
        max_active_courses: 2,
    };

    pub const PRO: TierLimits = TierLimits {
        daily_generations: 1_000,
        daily_tokens: 500_000,
        weekly_tokens: 5_000_000,
        max_active_courses: 5,
    };

    pub fn for_tier(tier: Tier) -> Self {
        match tier {
            Tier::Free => Self::FREE,
            Tier::Pro => Self::PRO,
        }
    }

    pub fn limit(&self, window: UsageWindow) -> u64 {
        match window {
            UsageWindow::DailyGenerations => self.daily_generations,
            UsageWindow::DailyTokens => self.daily_tokens,
            UsageWindow::WeeklyTokens => self.weekly_tokens,
        }
    }
}

//=========================================================================================
// Period Buckets
//=========================================================================================

/// `YYYY-MM-DD` for daily windows, ISO `YYYY-Www` for weekly ones, both in UTC.
pub fn period_bucket(window: UsageWindow, now: DateTime<Utc>) -> String {
    if window.is_weekly() {
        let week = now.iso_week();
        format!("{}-W{:02}", week.year(), week.week())
    } else {
        now.format("%Y-%m-%d").to_string()
    }
}

/// When the current bucket rolls over: next UTC midnight, or next Monday 00:00 UTC.
pub fn next_reset(window: UsageWindow, now: DateTime<Utc>) -> DateTime<Utc> {
    let days_ahead = if window.is_weekly() {
        7 - i64::from(now.weekday().num_days_from_monday())
    } else {
        1
    };
    let date = now.date_naive() + Duration::days(days_ahead);
    Utc.from_utc_datetime(&date.and_time(NaiveTime::default()))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageKey {
    pub user_id: Uuid,
    pub tier: Tier,
    pub window: UsageWindow,
    pub period: String,
}

impl UsageKey {
    pub fn new(user_id: Uuid, tier: Tier, window: UsageWindow, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            tier,
            window,
            period: period_bucket(window, now),
        }
    }

    /// Flat identifier for stores that key by a single string.
    pub fn storage_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.user_id,
            self.tier.as_str(),
            self.window.as_str(),
            self.period
        )
    }
}

//=========================================================================================
// Limiter
//=========================================================================================

/// Outcome of a limit check. Usage and limit are always filled in so callers
/// can explain a denial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageDecision {
    pub allowed: bool,
    pub used: u64,
    pub limit: u64,
    pub window: Option<UsageWindow>,
    pub period: Option<String>,
    pub resets_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct UsageLimiter {
    store: Arc<dyn UsageStore>,
}

impl UsageLimiter {
    pub fn new(store: Arc<dyn UsageStore>) -> Self {
        Self { store }
    }

    /// Reserves one unit of `window` for the user if it is still below the tier limit.
    pub async fn check_and_reserve(
        &self,
        user_id: Uuid,
        tier: Tier,
        window: UsageWindow,
    ) -> PortResult<UsageDecision> {
        self.reserve(user_id, tier, window, 1).await
    }

    /// Reserves `amount` units atomically; nothing is counted when denied.
    pub async fn reserve(
        &self,
        user_id: Uuid,
        tier: Tier,
        window: UsageWindow,
        amount: u64,
    ) -> PortResult<UsageDecision> {
        let now = Utc::now();
        let key = UsageKey::new(user_id, tier, window, now);
        let limit = TierLimits::for_tier(tier).limit(window);

        let update = if amount > limit {
            let used = self.store.current(&key).await?;
            crate::ports::CounterUpdate {
                admitted: false,
                used,
            }
        } else {
            self.store.increment_if_below(&key, amount, limit).await?
        };

        if !update.admitted {
            info!(
                user_id = %user_id,
                window = window.as_str(),
                used = update.used,
                limit,
                "Usage limit reached"
            );
        }

        Ok(UsageDecision {
            allowed: update.admitted,
            used: update.used,
            limit,
            window: Some(window),
            period: Some(key.period),
            resets_at: Some(next_reset(window, now)),
        })
    }

    /// Reports current usage without reserving anything.
    pub async fn peek(
        &self,
        user_id: Uuid,
        tier: Tier,
        window: UsageWindow,
    ) -> PortResult<UsageDecision> {
        let now = Utc::now();
        let key = UsageKey::new(user_id, tier, window, now);
        let limit = TierLimits::for_tier(tier).limit(window);
        let used = self.store.current(&key).await?;
        Ok(UsageDecision {
            allowed: used < limit,
            used,
            limit,
            window: Some(window),
            period: Some(key.period),
            resets_at: Some(next_reset(window, now)),
        })
    }

    /// Whether the user may hold one more active course.
    pub fn check_active_courses(tier: Tier, active_courses: u32) -> UsageDecision {
        let limit = TierLimits::for_tier(tier).max_active_courses;
        UsageDecision {
            allowed: active_courses < limit,
            used: u64::from(active_courses),
            limit: u64::from(limit),
            window: None,
            period: None,
            resets_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryUsageStore;

    #[test]
    fn limits_differ_by_tier() {
        assert_eq!(TierLimits::for_tier(Tier::Free).daily_generations, 100);
        assert_eq!(TierLimits::for_tier(Tier::Pro).daily_generations, 1_000);
        assert_eq!(TierLimits::for_tier(Tier::Free).max_active_courses, 2);
        assert_eq!(TierLimits::for_tier(Tier::Pro).weekly_tokens, 5_000_000);
    }

    #[test]
    fn period_buckets_use_utc_date_and_iso_week() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 23, 30, 0).unwrap();
        assert_eq!(period_bucket(UsageWindow::DailyGenerations, now), "2026-01-01");
        // 2026-01-01 is a Thursday in ISO week 1 of 2026.
        assert_eq!(period_bucket(UsageWindow::WeeklyTokens, now), "2026-W01");

        let late_december = Utc.with_ymd_and_hms(2024, 12, 30, 8, 0, 0).unwrap();
        assert_eq!(period_bucket(UsageWindow::WeeklyTokens, late_december), "2025-W01");
    }

    #[test]
    fn resets_at_next_midnight_and_next_monday() {
        let thursday = Utc.with_ymd_and_hms(2026, 1, 1, 23, 30, 0).unwrap();
        assert_eq!(
            next_reset(UsageWindow::DailyTokens, thursday),
            Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap()
        );
        assert_eq!(
            next_reset(UsageWindow::WeeklyTokens, thursday),
            Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn denial_reports_usage_and_limit() {
        let limiter = UsageLimiter::new(Arc::new(InMemoryUsageStore::new()));
        let user = Uuid::new_v4();
        for _ in 0..100 {
            assert!(limiter
                .check_and_reserve(user, Tier::Free, UsageWindow::DailyGenerations)
                .await
                .unwrap()
                .allowed);
        }
        let denied = limiter
            .check_and_reserve(user, Tier::Free, UsageWindow::DailyGenerations)
            .await
            .unwrap();
        assert!(!denied.allowed);
        assert_eq!((denied.used, denied.limit), (100, 100));
        assert!(denied.resets_at.is_some());

        // Another tier is a separate counter.
        let pro = limiter
            .check_and_reserve(user, Tier::Pro, UsageWindow::DailyGenerations)
            .await
            .unwrap();
        assert!(pro.allowed);
        assert_eq!(pro.used, 1);
    }

    #[tokio::test]
    async fn concurrent_reservations_never_exceed_limit() {
        let store = Arc::new(InMemoryUsageStore::new());
        let limiter = UsageLimiter::new(store.clone());
        let user = Uuid::new_v4();

        // Leave exactly one unit of headroom.
        let key = UsageKey::new(user, Tier::Free, UsageWindow::DailyGenerations, Utc::now());
        store.increment_if_below(&key, 99, 100).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .check_and_reserve(user, Tier::Free, UsageWindow::DailyGenerations)
                    .await
                    .unwrap()
                    .allowed
            }));
        }
        let admitted = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(store.current(&key).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn oversized_reservation_is_denied_without_counting() {
        let limiter = UsageLimiter::new(Arc::new(InMemoryUsageStore::new()));
        let user = Uuid::new_v4();
        let decision = limiter
            .reserve(user, Tier::Free, UsageWindow::DailyTokens, 100_001)
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.used, 0);
    }

    #[test]
    fn active_course_cap() {
        assert!(UsageLimiter::check_active_courses(Tier::Free, 1).allowed);
        let denied = UsageLimiter::check_active_courses(Tier::Free, 2);
        assert!(!denied.allowed);
        assert_eq!((denied.used, denied.limit), (2, 2));
        assert!(UsageLimiter::check_active_courses(Tier::Pro, 4).allowed);
    }
}
