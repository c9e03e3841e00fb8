//! Loop scaffolding shared by the enforcers
//!
//! Each enforcer owns a few long-lived tasks: a periodic loop, and for the
//! DNS guardian an event-driven loop fed by the OS change listener. Both kinds
//! stop when their [`Shutdown`] fires, and both run under
//! [`spawn_supervised`], which turns a panic into a crash report instead of
//! letting it reach the host.

use crate::logging;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Sending side of a cancellation signal
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Receiving side of a cancellation signal
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Create a linked trigger/signal pair
pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn fire(&self) {
        let _ = self.tx.send(true);
    }
}

impl Shutdown {
    pub fn is_fired(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the trigger fires or is dropped
    pub async fn fired(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Lock a run-state mutex, recovering the data if a crashed loop poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Spawn a long-lived loop; a panic inside it is logged as a crash and the
/// task ends quietly
pub fn spawn_supervised<F>(name: &'static str, task: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        log::debug!("{} loop started", name);
        match AssertUnwindSafe(task).catch_unwind().await {
            Ok(()) => log::debug!("{} loop exited", name),
            Err(payload) => {
                logging::log_crash(
                    &format!("{} loop terminated; continuing without it", name),
                    &logging::panic_message(payload.as_ref()),
                );
            }
        }
    })
}

/// Call `tick` every `period` until `shutdown` fires; the first call happens
/// immediately
pub async fn run_periodic<F, Fut>(period: Duration, mut shutdown: Shutdown, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.fired() => break,
            _ = timer.tick() => {
                if shutdown.is_fired() {
                    break;
                }
                tick().await;
            }
        }
    }
}

/// Call `on_event` for each notification on `events`, after waiting `settle`
/// for the change to finish applying
///
/// Notifications that arrive during the settle delay are folded into the same
/// call.
pub async fn run_triggered<F, Fut>(
    mut events: mpsc::Receiver<()>,
    settle: Duration,
    mut shutdown: Shutdown,
    mut on_event: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        tokio::select! {
            _ = shutdown.fired() => break,
            event = events.recv() => {
                if event.is_none() {
                    log::debug!("Change notifications closed");
                    break;
                }

                tokio::select! {
                    _ = shutdown.fired() => break,
                    _ = tokio::time::sleep(settle) => {}
                }

                while events.try_recv().is_ok() {}
                on_event().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_shutdown_fires() {
        let (trigger, mut shutdown) = shutdown_channel();
        assert!(!shutdown.is_fired());
        trigger.fire();
        shutdown.fired().await;
        assert!(shutdown.is_fired());
    }

    #[tokio::test]
    async fn test_shutdown_resolves_when_trigger_dropped() {
        let (trigger, mut shutdown) = shutdown_channel();
        drop(trigger);
        shutdown.fired().await;
    }

    #[tokio::test]
    async fn test_periodic_runs_immediately_and_stops() {
        let (trigger, shutdown) = shutdown_channel();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let handle = tokio::spawn(run_periodic(Duration::from_secs(3600), shutdown, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        trigger.fire();
        handle.await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_triggered_coalesces_burst() {
        let (trigger, shutdown) = shutdown_channel();
        let (tx, rx) = mpsc::channel(8);
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let handle = tokio::spawn(run_triggered(
            rx,
            Duration::from_millis(50),
            shutdown,
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        ));

        for _ in 0..3 {
            tx.send(()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        trigger.fire();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_triggered_ends_when_sender_dropped() {
        let (_trigger, shutdown) = shutdown_channel();
        let (tx, rx) = mpsc::channel::<()>(1);
        drop(tx);
        run_triggered(rx, Duration::ZERO, shutdown, || async {}).await;
    }

    #[tokio::test]
    async fn test_supervised_panic_does_not_propagate() {
        let handle = spawn_supervised("test", async {
            panic!("boom");
        });
        // The JoinHandle completes normally: the panic was caught inside
        assert!(handle.await.is_ok());
    }
}
