//! Per-instance deployment locks.
//!
//! Two deployments touching distinct instances run freely; two targeting the
//! same instance serialize here. A bounded wait keeps a wedged deployment
//! from parking its successors forever.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Default acquire budget before the later deployment gives up.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);

/// Lock table keyed by instance id.
#[derive(Default)]
pub struct InstanceLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for an instance, waiting up to `timeout`.
    pub fn acquire(&self, instance_id: &str, timeout: Duration) -> Result<InstanceLockGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock().expect("instance lock table poisoned");
        while held.contains(instance_id) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::InstanceBusy(instance_id.to_string()));
            }
            let (guard, wait) = self
                .released
                .wait_timeout(held, remaining)
                .expect("instance lock table poisoned");
            held = guard;
            if wait.timed_out() && held.contains(instance_id) {
                return Err(Error::InstanceBusy(instance_id.to_string()));
            }
        }
        held.insert(instance_id.to_string());
        Ok(InstanceLockGuard {
            locks: self,
            instance_id: instance_id.to_string(),
        })
    }
}

/// Releases the instance lock on drop.
pub struct InstanceLockGuard<'a> {
    locks: &'a InstanceLocks,
    instance_id: String,
}

impl Drop for InstanceLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self
            .locks
            .held
            .lock()
            .expect("instance lock table poisoned");
        held.remove(&self.instance_id);
        self.locks.released.notify_all();
    }
}

/// Process-wide lock table shared by every deployment in this process.
pub fn instance_locks() -> &'static InstanceLocks {
    static LOCKS: OnceLock<InstanceLocks> = OnceLock::new();
    LOCKS.get_or_init(InstanceLocks::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn second_acquire_times_out_while_held() {
        let locks = InstanceLocks::new();
        let guard = locks.acquire("inst_a", Duration::from_millis(50)).unwrap();
        let err = locks.acquire("inst_a", Duration::from_millis(50));
        assert!(matches!(err, Err(Error::InstanceBusy(_))));
        drop(guard);
        assert!(locks.acquire("inst_a", Duration::from_millis(50)).is_ok());
    }

    #[test]
    fn distinct_instances_do_not_contend() {
        let locks = InstanceLocks::new();
        let _a = locks.acquire("inst_a", Duration::from_millis(50)).unwrap();
        let _b = locks.acquire("inst_b", Duration::from_millis(50)).unwrap();
    }

    #[test]
    fn waiter_proceeds_once_holder_releases() {
        let locks = Arc::new(InstanceLocks::new());
        let guard = locks.acquire("inst_a", Duration::from_millis(50)).unwrap();
        let waiter = {
            let locks = locks.clone();
            std::thread::spawn(move || {
                locks
                    .acquire("inst_a", Duration::from_secs(5))
                    .map(|guard| drop(guard))
            })
        };
        std::thread::sleep(Duration::from_millis(100));
        drop(guard);
        waiter.join().unwrap().expect("waiter should acquire");
    }
}
