use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

/// One-way signal shared between threads. Once set it stays set.
#[derive(Debug, Clone, Default)]
pub struct Flag {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Flag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock() = true;
        cvar.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.inner.0.lock()
    }

    pub fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let mut set = lock.lock();
        while !*set {
            cvar.wait(&mut set);
        }
    }

    /// Returns whether the flag was set before `timeout` elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut set = lock.lock();
        if !*set {
            cvar.wait_for(&mut set, timeout);
        }
        *set
    }
}
