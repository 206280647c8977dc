//! Bounded pool of browser instances.
//!
//! The pool holds at most `size` instances behind a counting semaphore.
//! [`FetchPool::acquire`] hands out a [`PoolGuard`] that owns both the
//! semaphore permit and the instance itself, so the permit covers the whole
//! navigate, settle and read sequence and no other task can touch the
//! instance until the guard is dropped.
//!
//! Instances are created lazily by the factory. A guard marked with
//! [`PoolGuard::discard`] drops its instance instead of returning it; the next
//! checkout builds a replacement, so capacity is never lost.

use crate::browser::BrowserDriver;
use crate::error::{DriverError, PoolError};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

type Factory<D> = dyn Fn(usize) -> Result<D, DriverError> + Send + Sync;

struct PoolInner<D> {
    idle: Mutex<Vec<D>>,
    factory: Box<Factory<D>>,
    launched: AtomicUsize,
    live: AtomicUsize,
    in_use: AtomicUsize,
    peak_in_use: AtomicUsize,
}

impl<D> PoolInner<D> {
    fn put_back(&self, instance: D) {
        match self.idle.lock() {
            Ok(mut idle) => idle.push(instance),
            Err(poisoned) => poisoned.into_inner().push(instance),
        }
    }

    fn take_idle(&self) -> Option<D> {
        match self.idle.lock() {
            Ok(mut idle) => idle.pop(),
            Err(poisoned) => poisoned.into_inner().pop(),
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub in_use: usize,
    pub peak_in_use: usize,
    /// Instances currently alive, idle or checked out.
    pub live: usize,
}

pub struct FetchPool<D> {
    size: usize,
    semaphore: Arc<Semaphore>,
    inner: Arc<PoolInner<D>>,
}

impl<D: BrowserDriver> FetchPool<D> {
    /// Create a pool of `size` instances built on demand by `factory`.
    ///
    /// The factory receives a sequence number for naming the instance in logs.
    pub fn new<F>(size: usize, factory: F) -> Self
    where
        F: Fn(usize) -> Result<D, DriverError> + Send + Sync + 'static,
    {
        let size = size.max(1);
        info!(size, "Browser pool initialized");
        Self {
            size,
            semaphore: Arc::new(Semaphore::new(size)),
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::with_capacity(size)),
                factory: Box::new(factory),
                launched: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                in_use: AtomicUsize::new(0),
                peak_in_use: AtomicUsize::new(0),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Wait until an instance is free and check it out.
    pub async fn acquire(&self) -> Result<PoolGuard<D>, PoolError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        let instance = match self.inner.take_idle() {
            Some(instance) => instance,
            None => {
                let seq = self.inner.launched.fetch_add(1, Ordering::SeqCst);
                match (self.inner.factory)(seq) {
                    Ok(instance) => {
                        self.inner.live.fetch_add(1, Ordering::SeqCst);
                        debug!(instance = seq, "Launched browser instance");
                        instance
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to launch browser instance");
                        return Err(PoolError::Launch(e.to_string()));
                    }
                }
            }
        };

        let now = self.inner.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak_in_use.fetch_max(now, Ordering::SeqCst);

        Ok(PoolGuard {
            instance: Some(instance),
            permit: Some(permit),
            inner: Arc::clone(&self.inner),
            discard: false,
        })
    }

    /// [`acquire`](Self::acquire) bounded by `wait`.
    pub async fn acquire_timeout(&self, wait: Duration) -> Result<PoolGuard<D>, PoolError> {
        match tokio::time::timeout(wait, self.acquire()).await {
            Ok(result) => result,
            Err(_) => Err(PoolError::Exhausted(wait)),
        }
    }

    /// Return an instance to the pool. Equivalent to dropping the guard.
    pub fn release(&self, guard: PoolGuard<D>) {
        drop(guard);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.size,
            in_use: self.inner.in_use.load(Ordering::SeqCst),
            peak_in_use: self.inner.peak_in_use.load(Ordering::SeqCst),
            live: self.inner.live.load(Ordering::SeqCst),
        }
    }

    /// Refuse new checkouts and close every idle instance.
    pub async fn shutdown(&self) {
        self.semaphore.close();
        let mut closed = 0usize;
        while let Some(mut instance) = self.inner.take_idle() {
            instance.close().await;
            self.inner.live.fetch_sub(1, Ordering::SeqCst);
            closed += 1;
        }
        info!(closed, "Browser pool shut down");
    }
}

/// Exclusive checkout of one pooled instance.
pub struct PoolGuard<D> {
    instance: Option<D>,
    permit: Option<OwnedSemaphorePermit>,
    inner: Arc<PoolInner<D>>,
    discard: bool,
}

impl<D> PoolGuard<D> {
    /// Drop the instance on release instead of returning it to the pool.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl<D> Deref for PoolGuard<D> {
    type Target = D;

    fn deref(&self) -> &D {
        self.instance.as_ref().expect("instance present until drop")
    }
}

impl<D> DerefMut for PoolGuard<D> {
    fn deref_mut(&mut self) -> &mut D {
        self.instance.as_mut().expect("instance present until drop")
    }
}

impl<D> Drop for PoolGuard<D> {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            if self.discard {
                self.inner.live.fetch_sub(1, Ordering::SeqCst);
                drop(instance);
            } else {
                self.inner.put_back(instance);
            }
        }
        self.inner.in_use.fetch_sub(1, Ordering::SeqCst);
        // The instance is back in the idle list before the slot opens up.
        drop(self.permit.take());
    }
}
