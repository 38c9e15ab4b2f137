//! Bounded pool of rendering contexts
//!
//! The pool is warmed synchronously with `max_size` contexts. Callers wait up
//! to the configured threshold for one to come back; after that the pool
//! creates an overflow context instead of failing, up to `max_size * 2`
//! contexts alive at once. Returned contexts are requeued while there is room
//! and torn down otherwise.
//!
//! Counters live under a plain mutex that is separate from the availability
//! queue; every creation reserves its slot under that mutex first, so
//! concurrent overflow attempts cannot exceed the cap together.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Creates and tears down rendering contexts.
///
/// Both calls may block (e.g. on a browser round trip); the pool only invokes
/// `create` from a blocking-friendly thread once it is running.
pub trait ContextFactory: Send + Sync + 'static {
    type Context: Send + 'static;

    fn create(&self) -> Result<Self::Context>;

    fn destroy(&self, context: Self::Context) {
        drop(context);
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub available: usize,
    pub active: usize,
    pub max_size: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    active: usize,
    idle: usize,
    closed: bool,
}

struct Shared<F: ContextFactory> {
    factory: F,
    max_size: usize,
    wait_threshold: Duration,
    state: Mutex<PoolState>,
    tx: mpsc::Sender<F::Context>,
    rx: tokio::sync::Mutex<mpsc::Receiver<F::Context>>,
    shutdown: CancellationToken,
}

impl<F: ContextFactory> Shared<F> {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn give_back(&self, context: F::Context) {
        let rejected = {
            let mut state = self.state();
            if state.closed {
                context
            } else {
                match self.tx.try_send(context) {
                    Ok(()) => {
                        state.active = state.active.saturating_sub(1);
                        state.idle += 1;
                        return;
                    }
                    Err(e) => e.into_inner(),
                }
            }
        };

        // the slot stays counted until the context is gone
        debug!("Tearing down returned context");
        self.factory.destroy(rejected);
        self.release_slot();
    }

    fn release_slot(&self) {
        let mut state = self.state();
        state.active = state.active.saturating_sub(1);
    }
}

/// Pool of reusable rendering contexts. Cloning shares the same pool.
pub struct BrowserPool<F: ContextFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: ContextFactory> Clone for BrowserPool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: ContextFactory> BrowserPool<F> {
    /// Create the pool and warm it with `max_size` contexts.
    ///
    /// If any context fails to start, the ones already created are torn down
    /// and the error is returned.
    pub fn new(factory: F, max_size: usize, wait_threshold: Duration) -> Result<Self> {
        if max_size == 0 {
            return Err(Error::InitializationError(
                "pool size must be at least 1".into(),
            ));
        }

        let mut warm = Vec::with_capacity(max_size);
        for i in 0..max_size {
            match factory.create() {
                Ok(context) => warm.push(context),
                Err(e) => {
                    warn!("Failed to create rendering context {}/{}: {}", i + 1, max_size, e);
                    for context in warm {
                        factory.destroy(context);
                    }
                    return Err(Error::InitializationError(format!(
                        "failed to warm browser pool: {}",
                        e
                    )));
                }
            }
        }

        let (tx, rx) = mpsc::channel(max_size);
        let idle = warm.len();
        for context in warm {
            if let Err(e) = tx.try_send(context) {
                factory.destroy(e.into_inner());
            }
        }

        info!("Browser pool ready with {} contexts", idle);
        Ok(Self {
            shared: Arc::new(Shared {
                factory,
                max_size,
                wait_threshold,
                state: Mutex::new(PoolState {
                    active: 0,
                    idle,
                    closed: false,
                }),
                tx,
                rx: tokio::sync::Mutex::new(rx),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Check out a context.
    ///
    /// Waits until one is returned, `cancel` fires (`Cancelled`), the pool
    /// closes (`PoolClosed`) or the wait threshold elapses, in which case an
    /// overflow context is created if the cap allows (`PoolExhausted` when it
    /// does not).
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<PooledContext<F>> {
        let shared = &self.shared;
        if shared.state().closed {
            return Err(Error::PoolClosed);
        }

        let waited = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = shared.shutdown.cancelled() => return Err(Error::PoolClosed),
            res = tokio::time::timeout(shared.wait_threshold, async {
                let mut rx = shared.rx.lock().await;
                rx.recv().await
            }) => res,
        };

        match waited {
            Ok(Some(context)) => {
                {
                    let mut state = shared.state();
                    state.idle = state.idle.saturating_sub(1);
                    state.active += 1;
                }
                debug!("Checked out pooled context");
                Ok(self.guard(context))
            }
            Ok(None) => Err(Error::PoolClosed),
            Err(_) => self.grow().await,
        }
    }

    async fn grow(&self) -> Result<PooledContext<F>> {
        {
            let mut state = self.shared.state();
            if state.closed {
                return Err(Error::PoolClosed);
            }
            if state.active + state.idle >= self.shared.max_size * 2 {
                warn!(
                    "Browser pool exhausted ({} active, {} idle)",
                    state.active, state.idle
                );
                return Err(Error::PoolExhausted);
            }
            // reserve the slot before creating
            state.active += 1;
        }
        warn!("No context returned within {:?}, creating overflow context", self.shared.wait_threshold);

        // Creation runs detached and hands its result over a oneshot, so a
        // caller that stops waiting never strands the reserved slot.
        let (tx, rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || {
            let created = shared.factory.create();
            if created.is_err() {
                shared.release_slot();
            }
            if let Err(Ok(context)) = tx.send(created) {
                debug!("Overflow context finished after its caller left");
                shared.give_back(context);
            }
        });

        match rx.await {
            Ok(created) => created.map(|context| self.guard(context)),
            Err(_) => {
                self.shared.release_slot();
                Err(Error::Other("context creation task failed".into()))
            }
        }
    }

    fn guard(&self, context: F::Context) -> PooledContext<F> {
        PooledContext {
            context: Some(context),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Close the pool and tear down every idle context.
    ///
    /// Checked-out contexts are torn down when they are released.
    pub async fn close(&self) {
        {
            let mut state = self.shared.state();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.shared.shutdown.cancel();

        let mut rx = self.shared.rx.lock().await;
        rx.close();
        let mut drained = 0;
        while let Ok(context) = rx.try_recv() {
            self.shared.factory.destroy(context);
            drained += 1;
        }

        let mut state = self.shared.state();
        state.idle = state.idle.saturating_sub(drained);
        info!(
            "Browser pool closed ({} idle torn down, {} still checked out)",
            drained, state.active
        );
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state();
        PoolStats {
            available: state.idle,
            active: state.active,
            max_size: self.shared.max_size,
        }
    }

    pub fn max_size(&self) -> usize {
        self.shared.max_size
    }
}

/// Exclusive handle on a pooled context; returns it to the pool on drop.
pub struct PooledContext<F: ContextFactory> {
    context: Option<F::Context>,
    shared: Arc<Shared<F>>,
}

impl<F: ContextFactory> PooledContext<F> {
    /// Return the context to the pool now.
    pub fn release(self) {
        drop(self);
    }
}

impl<F: ContextFactory> Deref for PooledContext<F> {
    type Target = F::Context;

    fn deref(&self) -> &Self::Target {
        // only taken in drop
        self.context.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<F: ContextFactory> DerefMut for PooledContext<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.context.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<F: ContextFactory> Drop for PooledContext<F> {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            self.shared.give_back(context);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Factory that counts live contexts and can be told to fail.
    #[derive(Clone, Default)]
    pub(crate) struct CountingFactory {
        pub created: Arc<AtomicUsize>,
        pub destroyed: Arc<AtomicUsize>,
        pub peak_live: Arc<AtomicUsize>,
        pub fail_after: Option<usize>,
        pub create_delay: Duration,
    }

    impl CountingFactory {
        pub fn live(&self) -> usize {
            self.created.load(Ordering::SeqCst) - self.destroyed.load(Ordering::SeqCst)
        }
    }

    impl ContextFactory for CountingFactory {
        type Context = usize;

        fn create(&self) -> Result<usize> {
            std::thread::sleep(self.create_delay);
            let n = self.created.load(Ordering::SeqCst);
            if self.fail_after.map_or(false, |limit| n >= limit) {
                return Err(Error::InitializationError("no more browsers".into()));
            }
            let id = self.created.fetch_add(1, Ordering::SeqCst);
            self.peak_live.fetch_max(self.live(), Ordering::SeqCst);
            Ok(id)
        }

        fn destroy(&self, _context: usize) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    const SHORT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn warm_up_fills_the_pool() {
        let factory = CountingFactory::default();
        let pool = BrowserPool::new(factory.clone(), 3, SHORT).unwrap();
        assert_eq!(factory.live(), 3);
        assert_eq!(
            pool.stats(),
            PoolStats {
                available: 3,
                active: 0,
                max_size: 3
            }
        );
    }

    #[tokio::test]
    async fn warm_up_failure_tears_down_partial_pool() {
        let factory = CountingFactory {
            fail_after: Some(2),
            ..Default::default()
        };
        let err = BrowserPool::new(factory.clone(), 3, SHORT).err().unwrap();
        assert!(matches!(err, Error::InitializationError(_)));
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(factory.live(), 0);
    }

    #[tokio::test]
    async fn contexts_are_reused() {
        let factory = CountingFactory::default();
        let pool = BrowserPool::new(factory.clone(), 2, SHORT).unwrap();
        let token = CancellationToken::new();

        for _ in 0..5 {
            let ctx = pool.acquire(&token).await.unwrap();
            assert_eq!(pool.stats().active, 1);
            ctx.release();
        }
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().available, 2);
    }

    #[tokio::test]
    async fn overflow_is_bounded_and_torn_down() {
        let factory = CountingFactory::default();
        let pool = BrowserPool::new(factory.clone(), 1, SHORT).unwrap();
        let token = CancellationToken::new();

        let a = pool.acquire(&token).await.unwrap();
        let b = pool.acquire(&token).await.unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().active, 2);

        assert!(matches!(pool.acquire(&token).await, Err(Error::PoolExhausted)));

        b.release();
        a.release();
        // queue holds one context; the other is torn down
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(
            pool.stats(),
            PoolStats {
                available: 1,
                active: 0,
                max_size: 1
            }
        );
    }

    #[tokio::test]
    async fn abandoned_overflow_creation_is_not_leaked() {
        let factory = CountingFactory {
            create_delay: Duration::from_millis(150),
            ..Default::default()
        };
        let pool = BrowserPool::new(factory.clone(), 1, SHORT).unwrap();
        let token = CancellationToken::new();
        let held = pool.acquire(&token).await.unwrap();

        // caller gives up while the overflow context is still starting
        let abandoned = tokio::time::timeout(Duration::from_millis(60), pool.acquire(&token)).await;
        assert!(abandoned.is_err());
        assert_eq!(pool.stats().active, 2);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            pool.stats(),
            PoolStats {
                available: 1,
                active: 1,
                max_size: 1
            }
        );

        held.release();
        pool.close().await;
        assert_eq!(pool.stats().active, 0);
        assert_eq!(factory.live(), 0);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_overflow_creation_frees_its_slot() {
        let factory = CountingFactory {
            fail_after: Some(1),
            ..Default::default()
        };
        let pool = BrowserPool::new(factory.clone(), 1, SHORT).unwrap();
        let token = CancellationToken::new();
        let _held = pool.acquire(&token).await.unwrap();

        let err = pool.acquire(&token).await.err().unwrap();
        assert!(matches!(err, Error::InitializationError(_)));
        assert_eq!(pool.stats().active, 1);
    }

    #[tokio::test]
    async fn cancellation_returns_immediately() {
        let factory = CountingFactory::default();
        let pool = BrowserPool::new(factory, 1, Duration::from_secs(30)).unwrap();
        let token = CancellationToken::new();
        let _held = pool.acquire(&token).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(pool.acquire(&cancel).await, Err(Error::Cancelled)));
        assert_eq!(pool.stats().active, 1);
    }

    #[tokio::test]
    async fn waiter_gets_released_context() {
        let factory = CountingFactory::default();
        let pool = BrowserPool::new(factory.clone(), 1, Duration::from_secs(5)).unwrap();
        let token = CancellationToken::new();
        let held = pool.acquire(&token).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            let token = token.clone();
            tokio::spawn(async move { pool.acquire(&token).await.map(|c| *c) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let id = *held;
        held.release();

        assert_eq!(waiter.await.unwrap().unwrap(), id);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_leaks_nothing() {
        let factory = CountingFactory::default();
        let pool = BrowserPool::new(factory.clone(), 2, SHORT).unwrap();
        let token = CancellationToken::new();
        let held = pool.acquire(&token).await.unwrap();

        pool.close().await;
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire(&token).await, Err(Error::PoolClosed)));
        assert_eq!(factory.live(), 1);

        held.release();
        assert_eq!(factory.live(), 0);
        assert_eq!(pool.stats().active, 0);
    }

    #[tokio::test]
    async fn close_wakes_waiters() {
        let factory = CountingFactory::default();
        let pool = BrowserPool::new(factory, 1, Duration::from_secs(30)).unwrap();
        let token = CancellationToken::new();
        let _held = pool.acquire(&token).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            let token = token.clone();
            tokio::spawn(async move { pool.acquire(&token).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.close().await;
        assert!(matches!(waiter.await.unwrap(), Err(Error::PoolClosed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_load_respects_cap() {
        let factory = CountingFactory::default();
        let pool = BrowserPool::new(factory.clone(), 2, Duration::from_millis(5)).unwrap();
        let token = CancellationToken::new();

        let mut tasks = Vec::new();
        for _ in 0..24 {
            let pool = pool.clone();
            let token = token.clone();
            tasks.push(tokio::spawn(async move {
                match pool.acquire(&token).await {
                    Ok(ctx) => {
                        let stats = pool.stats();
                        assert!(stats.active + stats.available <= 4);
                        tokio::time::sleep(Duration::from_millis(15)).await;
                        ctx.release();
                        Ok(())
                    }
                    Err(Error::PoolExhausted) => Err(()),
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }));
        }
        for task in tasks {
            let _ = task.await.unwrap();
        }

        assert!(factory.peak_live.load(Ordering::SeqCst) <= 4);
        pool.close().await;
        assert_eq!(factory.live(), 0);
    }
}
