//! Trigger-driven retry loop for the label injector.
//!
//! The trigger is edge-sensitive: any number of kicks arriving while a tick
//! runs coalesce into exactly one follow-up tick. Failed ticks retry with
//! exponential backoff, capped by `Config::max_retry_interval`.

use crate::IpCache;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

impl IpCache {
    /// Kicks the label injector. Idempotent; the injector task is spawned on
    /// first use, so this must be called within a tokio runtime.
    pub fn trigger_label_injection(&self) {
        self.injector_task.get_or_init(|| {
            let cache = self
                .self_ref
                .upgrade()
                .expect("cache is referenced by the caller");
            let ctx = self.shutdown.clone();
            tokio::spawn(async move { cache.run_label_injector(ctx).await })
        });
        self.injection_trigger.notify_one();
    }

    async fn run_label_injector(&self, ctx: CancellationToken) {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = self.injection_trigger.notified() => {}
            }

            let mut backoff = INITIAL_BACKOFF;
            loop {
                let start = time::Instant::now();
                let result = self.handle_label_injection(&ctx).await;
                self.metrics
                    .injection_duration
                    .observe(start.elapsed().as_secs_f64());

                match result {
                    Ok(()) => break,
                    Err(error) => {
                        if ctx.is_cancelled() {
                            return;
                        }
                        self.metrics.injection_errors.inc();
                        tracing::warn!(%error, ?backoff, "label injection failed; retrying");
                        tokio::select! {
                            _ = ctx.cancelled() => return,
                            _ = time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(self.config.max_retry_interval);
                    }
                }
            }
        }
    }
}
