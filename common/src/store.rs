use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::types::DeviceState;

/// Single source of truth for the latch state, shared by the hardware and
/// network contexts.
///
/// Both `read` and `mutate` take the same mutex and block until it is free.
/// Closures passed to `mutate` must stay short and must not do I/O or drive
/// actuators.
#[derive(Debug, Default)]
pub struct StateStore {
    inner: Mutex<DeviceState>,
}

impl StateStore {
    pub fn new(initial: DeviceState) -> Self {
        Self {
            inner: Mutex::new(initial),
        }
    }

    /// Consistent snapshot of all three fields.
    pub fn read(&self) -> DeviceState {
        *self.lock()
    }

    /// Applies `apply` inside one critical section.
    pub fn mutate<R>(&self, apply: impl FnOnce(&mut DeviceState) -> R) -> R {
        let mut guard = self.lock();
        apply(&mut guard)
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        // DeviceState is plain data with its alarm re-derived on every write,
        // so a holder that panicked cannot have left it torn.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn mutate_returns_closure_result() {
        let store = StateStore::new(DeviceState::new(false, true));
        let changed = store.mutate(|state| state.set_locked(true));

        assert!(changed);
        assert!(store.read().locked());
        assert!(!store.read().alarm_active());
    }

    #[test]
    fn concurrent_mutations_never_tear_the_alarm_invariant() {
        let store = Arc::new(StateStore::new(DeviceState::new(false, true)));

        let writers: Vec<_> = (0..4)
            .map(|worker| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for step in 0..500 {
                        store.mutate(|state| {
                            if (worker + step) % 2 == 0 {
                                state.toggle_locked();
                            } else {
                                state.set_door_closed(!state.door_closed());
                            }
                        });
                    }
                })
            })
            .collect();

        for _ in 0..2_000 {
            let snapshot = store.read();
            assert_eq!(
                snapshot.alarm_active(),
                snapshot.locked() && !snapshot.door_closed()
            );
        }

        for writer in writers {
            writer.join().unwrap();
        }
    }

    #[test]
    fn poisoned_lock_is_recovered() {
        let store = Arc::new(StateStore::new(DeviceState::new(true, true)));
        let poisoner = Arc::clone(&store);

        let result = thread::spawn(move || {
            poisoner.mutate(|state| {
                state.set_door_closed(false);
                panic!("holder died");
            })
        })
        .join();

        assert!(result.is_err());
        let snapshot = store.read();
        assert!(!snapshot.door_closed());
        assert!(snapshot.alarm_active());
    }
}
