// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Background Tasks
//!
//! Owned, cancellable periodic loops used for the pool's idle sweep and the
//! scheduled backups.
//!
//! ## Shutdown
//!
//! Each task is driven by a `tokio_util::sync::CancellationToken`. The owner
//! keeps the [`BackgroundTask`] and stops it deterministically with
//! [`BackgroundTask::shutdown`]; dropping the handle also cancels the loop, so
//! no timer outlives its owner.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A periodic loop running on the tokio runtime.
pub struct BackgroundTask {
    name: &'static str,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Spawn `step` every `period`, optionally running it once right away.
    ///
    /// `step` returns `false` to end the loop on its own (e.g. when the
    /// service it drives has been dropped).
    pub fn spawn_periodic<F, Fut>(
        name: &'static str,
        period: Duration,
        run_immediately: bool,
        mut step: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let handle = tokio::spawn(async move {
            info!(
                task = name,
                interval_secs = period.as_secs(),
                "Background task starting"
            );

            if run_immediately && !step().await {
                info!(task = name, "Background task finished");
                return;
            }

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {},
                    _ = token.cancelled() => {
                        info!(task = name, "Background task shutting down");
                        return;
                    }
                }

                if token.is_cancelled() {
                    return;
                }
                if !step().await {
                    info!(task = name, "Background task finished");
                    return;
                }
            }
        });

        Self {
            name,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancel the loop and wait for the current step to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(task = self.name, error = %e, "Background task ended abnormally");
            }
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn runs_immediately_then_periodically() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let task = BackgroundTask::spawn_periodic("test", Duration::from_millis(10), true, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(task.is_running());
        task.shutdown().await;

        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several ticks, saw {seen}");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn delayed_start_waits_one_period() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let task = BackgroundTask::spawn_periodic("test", Duration::from_secs(3600), false, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        task.shutdown().await;
    }

    #[tokio::test]
    async fn step_can_end_the_loop() {
        let task = BackgroundTask::spawn_periodic("test", Duration::from_millis(5), true, || async {
            false
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!task.is_running());
        task.shutdown().await;
    }
}
