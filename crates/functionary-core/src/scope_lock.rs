use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::models::{FunctionScope, RegistryError, RegistryResult};

/// Lock arena keyed by `(package, name)`.
///
/// Work on one scope is serialized; different scopes never wait on each
/// other. Entries are dropped once nobody holds or waits on them.
#[derive(Default)]
pub struct ScopeLocks {
    slots: Mutex<HashMap<FunctionScope, Arc<Mutex<()>>>>,
}

impl ScopeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scope<R>(
        &self,
        scope: &FunctionScope,
        operation: impl FnOnce() -> R,
    ) -> RegistryResult<R> {
        let held = {
            let mut slots = self.lock_slots()?;
            HeldScope {
                locks: self,
                scope,
                slot: Some(Arc::clone(slots.entry(scope.clone()).or_default())),
            }
        };

        // Declared after `held` so it unlocks first, also when `operation` unwinds.
        // The slot guards no data, so a panic in an earlier holder leaves nothing to repair.
        let _guard = held.lock();
        Ok(operation())
    }

    /// Number of scopes currently held or awaited.
    pub fn tracked_scopes(&self) -> RegistryResult<usize> {
        Ok(self.lock_slots()?.len())
    }

    fn release(&self, scope: &FunctionScope) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // Clones are only taken under `slots`, so a count of one means no other holder.
        if slots
            .get(scope)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(scope);
        }
    }

    fn lock_slots(&self) -> RegistryResult<MutexGuard<'_, HashMap<FunctionScope, Arc<Mutex<()>>>>> {
        self.slots
            .lock()
            .map_err(|_| RegistryError::internal("scope lock arena mutex poisoned"))
    }
}

/// A claim on one scope's slot; pruning happens on drop so unwinding holders
/// leave no entry behind.
struct HeldScope<'a> {
    locks: &'a ScopeLocks,
    scope: &'a FunctionScope,
    slot: Option<Arc<Mutex<()>>>,
}

impl HeldScope<'_> {
    fn lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.slot
            .as_ref()
            .map(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Drop for HeldScope<'_> {
    fn drop(&mut self) {
        drop(self.slot.take());
        self.locks.release(self.scope);
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::models::PackageId;

    #[test]
    fn serializes_work_within_one_scope() {
        let locks = ScopeLocks::new();
        let scope = FunctionScope::new(PackageId::generate(), "resize");
        let inside = AtomicUsize::new(0);
        let max_inside = AtomicUsize::new(0);

        thread::scope(|threads| {
            for _ in 0..8 {
                threads.spawn(|| {
                    locks
                        .with_scope(&scope, || {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_inside.fetch_max(now, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(2));
                            inside.fetch_sub(1, Ordering::SeqCst);
                        })
                        .unwrap();
                });
            }
        });

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn different_scopes_do_not_block_each_other() {
        let locks = ScopeLocks::new();
        let package_id = PackageId::generate();
        let first = FunctionScope::new(package_id, "resize");
        let second = FunctionScope::new(package_id, "crop");
        let barrier = Barrier::new(2);

        // Each holder waits for the other while holding its own scope; this
        // only completes if the scopes are independent.
        thread::scope(|threads| {
            threads.spawn(|| locks.with_scope(&first, || barrier.wait()).unwrap());
            threads.spawn(|| locks.with_scope(&second, || barrier.wait()).unwrap());
        });
    }

    #[test]
    fn releases_idle_scopes() {
        let locks = ScopeLocks::new();
        let scope = FunctionScope::new(PackageId::generate(), "resize");

        let value = locks
            .with_scope(&scope, || locks.tracked_scopes().unwrap())
            .unwrap();

        assert_eq!(value, 1);
        assert_eq!(locks.tracked_scopes().unwrap(), 0);
    }

    #[test]
    fn releases_scope_when_the_operation_panics() {
        let locks = ScopeLocks::new();
        let scope = FunctionScope::new(PackageId::generate(), "resize");

        let outcome: thread::Result<RegistryResult<()>> =
            panic::catch_unwind(AssertUnwindSafe(|| {
                locks.with_scope(&scope, || panic!("publish failed mid-transaction"))
            }));

        assert!(outcome.is_err());
        assert_eq!(locks.tracked_scopes().unwrap(), 0);
        assert_eq!(locks.with_scope(&scope, || 7).unwrap(), 7);
        assert_eq!(locks.tracked_scopes().unwrap(), 0);
    }
}
