//! Durable per-day cap on posted replies.
//!
//! The counter lives in the database so a restart does not reset it. A slot is
//! reserved before posting and released when the post fails, so the stored
//! count only grows by confirmed posts and never exceeds `max`.
use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use crate::db::{self, Pool};
use crate::model::BudgetStatus;

/// Window key for `now`: the UTC calendar day.
pub fn window_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

#[derive(Debug, Clone)]
pub struct ReplyBudget {
    pool: Pool,
    max: u32,
}

/// A held slot. Hand it back with `ReplyBudget::release` if the post fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub window: String,
}

impl ReplyBudget {
    pub fn new(pool: Pool, max: u32) -> Self {
        Self { pool, max }
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub async fn status(&self) -> Result<BudgetStatus> {
        self.status_at(Utc::now()).await
    }

    pub async fn status_at(&self, now: DateTime<Utc>) -> Result<BudgetStatus> {
        let window = window_key(now);
        let count = db::budget_count(&self.pool, &window).await?;
        Ok(BudgetStatus {
            window,
            count,
            max: self.max,
        })
    }

    pub async fn try_reserve(&self) -> Result<Option<Reservation>> {
        self.try_reserve_at(Utc::now()).await
    }

    #[instrument(skip_all)]
    pub async fn try_reserve_at(&self, now: DateTime<Utc>) -> Result<Option<Reservation>> {
        let window = window_key(now);
        if db::try_reserve_budget(&self.pool, &window, self.max).await? {
            Ok(Some(Reservation { window }))
        } else {
            debug!(%window, max = self.max, "reply budget exhausted");
            Ok(None)
        }
    }

    pub async fn release(&self, reservation: Reservation) -> Result<()> {
        db::release_budget(&self.pool, &reservation.window).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn budget(max: u32) -> ReplyBudget {
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        ReplyBudget::new(pool, max)
    }

    #[test]
    fn window_is_utc_day() {
        let t = Utc.with_ymd_and_hms(2024, 6, 1, 23, 59, 59).unwrap();
        assert_eq!(window_key(t), "2024-06-01");
    }

    #[tokio::test]
    async fn reserve_stops_at_max() {
        let b = budget(2).await;
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        assert!(b.try_reserve_at(now).await.unwrap().is_some());
        assert!(b.try_reserve_at(now).await.unwrap().is_some());
        assert!(b.try_reserve_at(now).await.unwrap().is_none());

        let status = b.status_at(now).await.unwrap();
        assert_eq!(status.count, 2);
        assert!(status.exhausted());
    }

    #[tokio::test]
    async fn release_returns_slot() {
        let b = budget(1).await;
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let r = b.try_reserve_at(now).await.unwrap().unwrap();
        b.release(r).await.unwrap();
        assert_eq!(b.status_at(now).await.unwrap().count, 0);
        assert!(b.try_reserve_at(now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn new_day_starts_fresh() {
        let b = budget(1).await;
        let day1 = Utc.with_ymd_and_hms(2024, 6, 1, 23, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2024, 6, 2, 0, 30, 0).unwrap();
        assert!(b.try_reserve_at(day1).await.unwrap().is_some());
        assert!(b.try_reserve_at(day1).await.unwrap().is_none());
        assert!(b.try_reserve_at(day2).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn zero_max_never_reserves() {
        let b = budget(0).await;
        assert!(b.try_reserve().await.unwrap().is_none());
        assert_eq!(b.status().await.unwrap().count, 0);
    }
}
