//! Single-provider execution: the per-request retry state machine
//!
//! One `Executor` per configured provider. Each logical request walks
//! SELECT -> ATTEMPT -> classify, rotating credentials on rate limits,
//! retrying transients in place, and surfacing permanent failures to the
//! orchestrator so it can advance the model roster. All waits are async
//! sleeps; concurrent requests are never blocked by another request's
//! backoff.

use crate::classify::{backoff_delay, classify, ErrorClass};
use crate::client::{ProviderClient, StreamEvent};
use crate::config::RetryConfig;
use crate::message::{ChatPayload, Usage};
use crate::pool::KeyPool;
use crate::{Error, Result};
use futures::stream::Stream;
use futures::StreamExt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Transient failures tolerated on one model before it is declared
/// unavailable and the roster advances
const TRANSIENT_RETRIES_PER_MODEL: u32 = 3;

/// Diagnostic record of one provider call, owned by the in-flight request
#[derive(Debug, Clone)]
pub struct Attempt {
    /// Pool index of the credential used, when one was selected
    pub key_index: Option<usize>,

    /// Model attempted
    pub model: String,

    /// Outcome summary: "success" or the classified error text
    pub outcome: String,

    /// Backoff waited before this attempt
    pub waited: Duration,
}

/// Drives bounded retry-with-rotation against one provider.
pub struct Executor {
    client: Box<dyn ProviderClient>,
    pool: Arc<KeyPool>,
    retry: RetryConfig,
}

impl Executor {
    /// Create an executor over a wire client and its credential pool
    pub fn new(client: Box<dyn ProviderClient>, pool: Arc<KeyPool>, retry: RetryConfig) -> Self {
        Executor { client, pool, retry }
    }

    /// The credential pool backing this executor
    pub fn pool(&self) -> &KeyPool {
        &self.pool
    }

    /// Provider-call budget when the caller does not override it:
    /// two tries per credential before the pool is declared spent
    pub fn default_max_attempts(&self) -> u32 {
        (self.pool.len() as u32) * 2
    }

    /// Default output cap of the underlying provider dialect
    pub fn default_max_tokens(&self) -> u32 {
        self.client.default_max_tokens()
    }

    /// Execute one request against one model, retrying within budget.
    ///
    /// `trail` is shared across models of the same logical request so the
    /// attempt budget and the diagnostic record both span the roster walk.
    /// Returns [`Error::ModelUnavailable`] when the model should be skipped,
    /// [`Error::PoolExhausted`] when every credential is cooling down, or the
    /// last classified error once `max_attempts` provider calls were spent.
    pub async fn execute(
        &self,
        payload: &ChatPayload,
        model: &str,
        max_attempts: u32,
        trail: &mut Vec<Attempt>,
    ) -> Result<(String, Usage)> {
        // Request-local counters; a flaky call here never biases other requests
        let mut rate_limit_failures: u32 = 0;
        let mut transient_failures: u32 = 0;
        let mut waited = Duration::ZERO;

        loop {
            if trail.len() as u32 >= max_attempts {
                return Err(Error::ProviderTransient(format!(
                    "attempt budget of {} spent",
                    max_attempts
                )));
            }

            let key = self.pool.current()?;
            tracing::debug!(key = key.index, model, "attempting provider call");

            match self.client.chat(payload, model, &key.secret).await {
                Ok((content, usage)) => {
                    trail.push(Attempt {
                        key_index: Some(key.index),
                        model: model.to_string(),
                        outcome: "success".to_string(),
                        waited,
                    });
                    return Ok((content, usage));
                }
                Err(err) => {
                    trail.push(Attempt {
                        key_index: Some(key.index),
                        model: model.to_string(),
                        outcome: err.to_string(),
                        waited,
                    });

                    match classify(&err) {
                        ErrorClass::Permanent => {
                            return Err(match err {
                                e @ Error::ModelUnavailable(_) => e,
                                other => Error::ModelUnavailable(other.to_string()),
                            });
                        }
                        ErrorClass::RateLimited { retry_after } => {
                            let cooldown = retry_after.unwrap_or_else(|| self.retry.cooldown());
                            // Rotation may itself fail with PoolExhausted
                            self.pool.mark_failed(key.index, cooldown)?;

                            if trail.len() as u32 >= max_attempts {
                                return Err(err);
                            }
                            let delay = backoff_delay(
                                self.retry.backoff_base(),
                                self.retry.backoff_ceiling(),
                                rate_limit_failures,
                            );
                            rate_limit_failures += 1;
                            tracing::warn!(
                                model,
                                delay_ms = delay.as_millis() as u64,
                                "rate limited, rotated credential, backing off"
                            );
                            tokio::time::sleep(delay).await;
                            waited = delay;
                        }
                        ErrorClass::Transient => {
                            transient_failures += 1;
                            if transient_failures >= TRANSIENT_RETRIES_PER_MODEL {
                                // Persisting past the retry budget counts as
                                // the model being unavailable (roster advance)
                                return Err(Error::ModelUnavailable(err.to_string()));
                            }
                            if trail.len() as u32 >= max_attempts {
                                return Err(err);
                            }
                            let delay = self.retry.backoff_base();
                            tracing::warn!(
                                model,
                                delay_ms = delay.as_millis() as u64,
                                "transient provider error, retrying on same credential"
                            );
                            tokio::time::sleep(delay).await;
                            waited = delay;
                        }
                    }
                }
            }
        }
    }

    /// Execute one streaming request against one model.
    ///
    /// Failures occurring before an attempt's first delta are retried under
    /// the same state machine as [`execute`](Self::execute); once output has
    /// been emitted the classified error is forwarded and the stream ends;
    /// partial-result buffering belongs to the caller. `budget` is shared
    /// with the orchestrator's roster walk so the total provider-call count
    /// stays bounded.
    pub fn execute_stream(
        self: Arc<Self>,
        payload: ChatPayload,
        model: String,
        budget: Arc<AtomicU32>,
    ) -> Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>> {
        let executor = self;

        Box::pin(async_stream::stream! {
            let mut rate_limit_failures: u32 = 0;
            let mut transient_failures: u32 = 0;

            'attempts: loop {
                if budget.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| b.checked_sub(1)).is_err() {
                    yield Err(Error::ProviderTransient("attempt budget spent".to_string()));
                    return;
                }

                let key = match executor.pool.current() {
                    Ok(k) => k,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };

                let mut inner = executor.client.chat_stream(&payload, &model, &key.secret);
                let mut emitted = false;

                while let Some(item) = inner.next().await {
                    match item {
                        Ok(event) => {
                            let done = event.done;
                            emitted = true;
                            yield Ok(event);
                            if done {
                                return;
                            }
                        }
                        Err(err) if !emitted => {
                            match classify(&err) {
                                ErrorClass::Permanent => {
                                    yield Err(match err {
                                        e @ Error::ModelUnavailable(_) => e,
                                        other => Error::ModelUnavailable(other.to_string()),
                                    });
                                    return;
                                }
                                ErrorClass::RateLimited { retry_after } => {
                                    let cooldown = retry_after
                                        .unwrap_or_else(|| executor.retry.cooldown());
                                    if let Err(e) = executor.pool.mark_failed(key.index, cooldown) {
                                        yield Err(e);
                                        return;
                                    }
                                    let delay = backoff_delay(
                                        executor.retry.backoff_base(),
                                        executor.retry.backoff_ceiling(),
                                        rate_limit_failures,
                                    );
                                    rate_limit_failures += 1;
                                    tokio::time::sleep(delay).await;
                                    continue 'attempts;
                                }
                                ErrorClass::Transient => {
                                    transient_failures += 1;
                                    if transient_failures >= TRANSIENT_RETRIES_PER_MODEL {
                                        yield Err(Error::ModelUnavailable(err.to_string()));
                                        return;
                                    }
                                    tokio::time::sleep(executor.retry.backoff_base()).await;
                                    continue 'attempts;
                                }
                            }
                        }
                        Err(err) => {
                            // Mid-stream failure after output: the caller owns
                            // whatever partial text it already received
                            yield Err(err);
                            return;
                        }
                    }
                }

                if emitted {
                    // Stream ended without a done marker; treat as complete
                    return;
                }

                // Stream closed before any event: retry as a transient
                transient_failures += 1;
                if transient_failures >= TRANSIENT_RETRIES_PER_MODEL {
                    yield Err(Error::ModelUnavailable(
                        "stream ended without output".to_string(),
                    ));
                    return;
                }
                tokio::time::sleep(executor.retry.backoff_base()).await;
            }
        })
    }
}
