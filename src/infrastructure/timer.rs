//! Periodic background tasks with a shared shutdown signal
//!
//! Each component that owns timers keeps a `TimerSet`. Tasks hold a
//! `Weak` reference to their component and exit once it is dropped or
//! the set is stopped. Stopping aborts tasks at their next await point,
//! so work already inside a tick runs to completion.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::{Result, SubstrateError};

/// Group of periodic tasks sharing one shutdown signal
pub struct TimerSet {
    name: &'static str,
    handle: Handle,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl TimerSet {
    /// Bind to the ambient tokio runtime
    ///
    /// # Errors
    /// Returns `SubstrateError::NoRuntime` outside a runtime context.
    pub fn new(name: &'static str) -> Result<Self> {
        let handle = Handle::try_current().map_err(|_| SubstrateError::NoRuntime)?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            name,
            handle,
            shutdown,
            tasks: Vec::new(),
        })
    }

    /// Run `f` every `period` while `target` is alive
    ///
    /// The first run happens one period after spawn.
    pub fn every<T, F>(&mut self, period: Duration, target: &Arc<T>, f: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&T) + Send + 'static,
    {
        let weak: Weak<T> = Arc::downgrade(target);
        let mut stop = self.shutdown.subscribe();
        let period = period.max(Duration::from_millis(1));
        let name = self.name;

        let task = self.handle.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(target) = weak.upgrade() else { break };
                        f(&target);
                    }
                    _ = stop.changed() => break,
                }
            }
            tracing::trace!(target: "substrate", "{} timer exited", name);
        });
        self.tasks.push(task);
    }

    /// Run `f` with a period re-read from `period_of` before every sleep
    pub fn every_dynamic<T, P, F>(&mut self, target: &Arc<T>, period_of: P, f: F)
    where
        T: Send + Sync + 'static,
        P: Fn(&T) -> Duration + Send + 'static,
        F: Fn(&T) + Send + 'static,
    {
        let weak: Weak<T> = Arc::downgrade(target);
        let mut stop = self.shutdown.subscribe();

        let task = self.handle.spawn(async move {
            loop {
                let period = match weak.upgrade() {
                    Some(target) => period_of(&target).max(Duration::from_millis(1)),
                    None => break,
                };
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        let Some(target) = weak.upgrade() else { break };
                        f(&target);
                    }
                    _ = stop.changed() => break,
                }
            }
        });
        self.tasks.push(task);
    }

    /// Spawn an arbitrary future that should stop with this set
    pub fn spawn<Fut>(&mut self, fut: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut stop = self.shutdown.subscribe();
        let task = self.handle.spawn(async move {
            tokio::select! {
                _ = fut => {}
                _ = stop.changed() => {}
            }
        });
        self.tasks.push(task);
    }

    /// Number of tasks spawned
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Signal and abort every task
    pub fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in &self.tasks {
            task.abort();
        }
        tracing::debug!(target: "substrate", "{} timers stopped ({} tasks)", self.name, self.tasks.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_requires_runtime() {
        assert!(matches!(TimerSet::new("test"), Err(SubstrateError::NoRuntime)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_runs_and_stops() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut timers = TimerSet::new("test").unwrap();
        timers.every(Duration::from_millis(10), &counter, |c| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(timers.len(), 1);

        tokio::time::sleep(Duration::from_millis(55)).await;
        let seen = counter.load(Ordering::SeqCst);
        assert!(seen >= 4, "expected at least 4 runs, got {}", seen);

        timers.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after);
    }

    #[test]
    fn test_spawned_future_stops_with_set() {
        let ran = Arc::new(AtomicU32::new(0));
        let seen = ran.clone();
        tokio_test::block_on(async move {
            let mut timers = TimerSet::new("test").unwrap();
            timers.spawn(async move {
                seen.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<()>().await;
            });
            for _ in 0..10 {
                if ran.load(Ordering::SeqCst) > 0 {
                    break;
                }
                tokio::task::yield_now().await;
            }
            assert_eq!(ran.load(Ordering::SeqCst), 1);
            assert_eq!(timers.len(), 1);
            timers.stop();
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_exits_when_target_dropped() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut timers = TimerSet::new("test").unwrap();
        timers.every_dynamic(
            &counter,
            |_| Duration::from_millis(5),
            |c| {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );
        tokio::time::sleep(Duration::from_millis(12)).await;
        drop(counter);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(timers.tasks.iter().all(|t| t.is_finished()));
        timers.stop();
    }
}
