//! Coalescing rebuild trigger.

use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Runs a job on a single worker whenever notified.
///
/// The signal channel holds one slot. A notification that arrives while the
/// job runs fills the slot and causes exactly one follow-up run; any further
/// notifications before that run starts are dropped. `notify` never blocks.
#[derive(Debug, Clone)]
pub struct CoalescingNotifier {
    tx: mpsc::Sender<()>,
}

impl CoalescingNotifier {
    /// Spawn the worker. It exits when `cancel` fires or every notifier is
    /// dropped.
    pub fn spawn<F, Fut>(cancel: CancellationToken, mut job: F) -> (Self, JoinHandle<()>)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    signal = rx.recv() => match signal {
                        Some(()) => job().await,
                        None => break,
                    },
                }
            }
            debug!("coalescing notifier stopped");
        });
        (Self { tx }, handle)
    }

    /// Request a run. Returns false if one is already pending.
    pub fn notify(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    #[tokio::test]
    async fn test_burst_collapses_into_one_follow_up() {
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let cancel = CancellationToken::new();

        let (notifier, handle) = CoalescingNotifier::spawn(cancel.clone(), {
            let runs = runs.clone();
            let gate = gate.clone();
            move || {
                let runs = runs.clone();
                let gate = gate.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    gate.acquire().await.unwrap().forget();
                }
            }
        });

        assert!(notifier.notify());
        // wait for the first run to start and block
        while runs.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(notifier.notify(), "one follow-up fits");
        for _ in 0..100 {
            assert!(!notifier.notify());
        }

        gate.add_permits(2);
        while runs.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stops_when_dropped() {
        let (notifier, handle) =
            CoalescingNotifier::spawn(CancellationToken::new(), || async {});
        notifier.notify();
        drop(notifier);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
