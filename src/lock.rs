//! Named, TTL-bounded mutual exclusion stored in the `locks` table
//!
//! Acquisition is non-blocking. An expired lock can be taken over by anyone,
//! so a worker that crashes mid-build holds the name for at most its TTL.

use crate::error::Result;
use crate::meta::{now_ts, ts_after, MetaDb};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lock factory bound to a database
#[derive(Clone)]
pub struct DistributedLock {
    db: MetaDb,
}

impl DistributedLock {
    pub fn new(db: MetaDb) -> Self {
        Self { db }
    }

    /// Try to take `name` for `ttl`. Returns `None` if someone else holds it.
    pub async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockGuard>> {
        let owner = Uuid::new_v4().to_string();
        let result = sqlx::query(
            r#"
            INSERT INTO locks (name, owner, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                owner = excluded.owner,
                expires_at = excluded.expires_at
            WHERE locks.expires_at <= ?
            "#,
        )
        .bind(name)
        .bind(&owner)
        .bind(ts_after(ttl))
        .bind(now_ts())
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 1 {
            debug!(lock = name, owner = %owner, "Lock acquired");
            Ok(Some(LockGuard {
                db: self.db.clone(),
                name: name.to_string(),
                owner,
                released: false,
            }))
        } else {
            debug!(lock = name, "Lock busy");
            Ok(None)
        }
    }

    /// Whether `name` is currently held by anyone
    pub async fn is_held(&self, name: &str) -> Result<bool> {
        let held: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM locks WHERE name = ? AND expires_at > ?")
                .bind(name)
                .bind(now_ts())
                .fetch_optional(self.db.pool())
                .await?;
        Ok(held.is_some())
    }
}

/// Held lock. Released explicitly with [`LockGuard::release`], or in the
/// background when dropped.
pub struct LockGuard {
    db: MetaDb,
    name: String,
    owner: String,
    released: bool,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lock if this guard still owns it
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        delete_owned(&self.db, &self.name, &self.owner).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let db = self.db.clone();
        let name = std::mem::take(&mut self.name);
        let owner = std::mem::take(&mut self.owner);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = delete_owned(&db, &name, &owner).await {
                        warn!(lock = %name, "Failed to release dropped lock: {}", e);
                    }
                });
            }
            Err(_) => warn!(lock = %name, "Lock dropped outside a runtime; left to expire"),
        }
    }
}

async fn delete_owned(db: &MetaDb, name: &str, owner: &str) -> Result<()> {
    sqlx::query("DELETE FROM locks WHERE name = ? AND owner = ?")
        .bind(name)
        .bind(owner)
        .execute(db.pool())
        .await?;
    debug!(lock = name, "Lock released");
    Ok(())
}
