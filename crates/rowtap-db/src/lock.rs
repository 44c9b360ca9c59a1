//! Row-backed distributed locks.
//!
//! A lock is a row in the `locks` table. `try_lock` is a non-blocking
//! upsert that steals expired rows, then verifies ownership by reading the
//! row back. There are no leases to refresh: a crashed owner's row expires
//! and is reconciled by the owner check on the next acquire. Ticketed
//! locks (`name.0 .. name.n-1`) bound concurrency per key.

use mysql_async::prelude::*;
use mysql_async::Pool;
use tracing::debug;
use uuid::Uuid;

use crate::Result;

/// How long an unreleased lock row stays valid. Holders refresh well
/// within this; a crashed holder's row becomes stealable after it.
pub const LOCK_TTL: std::time::Duration = std::time::Duration::from_secs(60);

const LOCK_TTL_SECS: u32 = LOCK_TTL.as_secs() as u32;

pub struct Lock {
    pool: Pool,
    owner: String,
    held: Option<String>,
}

impl Lock {
    pub fn new(pool: Pool) -> Lock {
        Lock {
            pool,
            owner: Uuid::new_v4().simple().to_string(),
            held: None,
        }
    }

    /// Try to take `name`. Non-blocking; false when another live owner
    /// holds it.
    pub async fn try_lock(&mut self, name: &str) -> Result<bool> {
        let mut conn = self.pool.get_conn().await?;
        conn.exec_drop(
            "INSERT INTO locks (name, owner, expires) \
             VALUES (?, ?, NOW() + INTERVAL ? SECOND) \
             ON DUPLICATE KEY UPDATE \
               owner = IF(expires < NOW() OR owner = VALUES(owner), VALUES(owner), owner), \
               expires = IF(owner = VALUES(owner), VALUES(expires), expires)",
            (name, &self.owner, LOCK_TTL_SECS),
        )
        .await?;
        let holder: Option<String> = conn
            .exec_first("SELECT owner FROM locks WHERE name = ?", (name,))
            .await?;
        let got = holder.as_deref() == Some(self.owner.as_str());
        if got {
            debug!(name, "lock acquired");
            self.held = Some(name.to_string());
        }
        Ok(got)
    }

    /// Try tickets `name.0 .. name.{n-1}`; any free ticket succeeds.
    pub async fn try_lock_shared(&mut self, name: &str, tickets: usize) -> Result<bool> {
        for i in 0..tickets.max(1) {
            if self.try_lock(&format!("{name}.{i}")).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Extend the TTL of the held lock.
    pub async fn refresh(&mut self) -> Result<()> {
        if let Some(name) = &self.held {
            let mut conn = self.pool.get_conn().await?;
            conn.exec_drop(
                "UPDATE locks SET expires = NOW() + INTERVAL ? SECOND \
                 WHERE name = ? AND owner = ?",
                (LOCK_TTL_SECS, name, &self.owner),
            )
            .await?;
        }
        Ok(())
    }

    /// Release the held lock, if any. Only the owner's row is removed.
    pub async fn unlock(&mut self) -> Result<()> {
        if let Some(name) = self.held.take() {
            let mut conn = self.pool.get_conn().await?;
            conn.exec_drop(
                "DELETE FROM locks WHERE name = ? AND owner = ?",
                (name.as_str(), &self.owner),
            )
            .await?;
            debug!(name = name.as_str(), "lock released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateStore;
    use crate::Addr;

    async fn test_pool() -> Option<Pool> {
        let addr = Addr {
            host: "localhost".into(),
            port: 3306,
            user: "root".into(),
            password: String::new(),
            db: Some("rowtap_test_state".into()),
        };
        match StateStore::connect(&addr).await {
            Ok(store) => Some(store.pool().clone()),
            Err(_) => {
                eprintln!("no local MySQL detected, skipping");
                None
            }
        }
    }

    #[tokio::test]
    async fn exclusive_acquire_and_release() {
        let Some(pool) = test_pool().await else { return };

        let mut a = Lock::new(pool.clone());
        let mut b = Lock::new(pool.clone());

        assert!(a.try_lock("table_id.9001").await.unwrap());
        assert!(!b.try_lock("table_id.9001").await.unwrap());
        // Re-acquire by the same owner succeeds.
        assert!(a.try_lock("table_id.9001").await.unwrap());

        a.unlock().await.unwrap();
        assert!(b.try_lock("table_id.9001").await.unwrap());
        b.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn shared_tickets_bound_concurrency() {
        let Some(pool) = test_pool().await else { return };

        let mut a = Lock::new(pool.clone());
        let mut b = Lock::new(pool.clone());
        let mut c = Lock::new(pool.clone());

        assert!(a.try_lock_shared("svc.cluster9", 2).await.unwrap());
        assert!(b.try_lock_shared("svc.cluster9", 2).await.unwrap());
        assert!(!c.try_lock_shared("svc.cluster9", 2).await.unwrap());

        a.unlock().await.unwrap();
        assert!(c.try_lock_shared("svc.cluster9", 2).await.unwrap());
        b.unlock().await.unwrap();
        c.unlock().await.unwrap();
    }
}
