//! Gateway orchestrator
//!
//! The entry point external callers use. Enforces the single-flight policy
//! per resource key, walks the model roster on permanent failures, and
//! normalizes every terminal outcome: callers never see a raw provider
//! exception, only a [`Reply`] or a [`SubmitError`] carrying the attempt
//! trail.

use crate::client::StreamEvent;
use crate::config::GatewayConfig;
use crate::executor::{Attempt, Executor};
use crate::message::{ChatPayload, SubmitOptions, Usage};
use crate::pool::KeyPool;
use crate::provider::create_client;
use crate::roster::ModelRoster;
use crate::{Error, Result};
use futures::stream::Stream;
use futures::StreamExt;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex};
use thiserror::Error as ThisError;

/// Normalized success result
#[derive(Debug, Clone)]
pub struct Reply {
    /// Generated content
    pub content: String,

    /// Model that produced the content
    pub model: String,

    /// Token usage reported by the provider
    pub usage: Option<Usage>,
}

/// Normalized terminal failure
#[derive(Debug, ThisError)]
pub enum SubmitError {
    /// A request for the same resource key is already outstanding.
    /// Rejected immediately, never queued.
    #[error("a request for this resource is already in flight")]
    Busy,

    /// The request could not be served; `trail` records every attempt made
    #[error("request failed after {} attempt(s): {error}", .trail.len())]
    Failed {
        /// Terminal error: pool/roster exhaustion or an unclassified failure
        error: Error,
        /// One entry per provider call actually made
        trail: Vec<Attempt>,
    },
}

/// Process-wide in-flight guard: at most one outstanding request per
/// resource key. Not a queue; a concurrent duplicate is rejected.
struct Flights {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl Flights {
    fn new() -> Self {
        Flights {
            inner: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn acquire(&self, key: &str) -> Result<FlightPermit> {
        let mut held = self.inner.lock().unwrap();
        if !held.insert(key.to_string()) {
            return Err(Error::Busy);
        }
        Ok(FlightPermit {
            key: key.to_string(),
            inner: Arc::clone(&self.inner),
        })
    }
}

/// RAII permit for one resource key; released on every exit path, including
/// cancellation, when the permit drops.
struct FlightPermit {
    key: String,
    inner: Arc<Mutex<HashSet<String>>>,
}

impl Drop for FlightPermit {
    fn drop(&mut self) {
        self.inner.lock().unwrap().remove(&self.key);
    }
}

/// Per-provider machinery: retry executor plus model roster
struct Lane {
    executor: Arc<Executor>,
    roster: Arc<ModelRoster>,
}

/// Resilient multi-provider inference gateway.
///
/// `Send + Sync`; independent `submit` calls run concurrently and share the
/// per-provider credential pool and roster state.
pub struct Gateway {
    lanes: IndexMap<String, Lane>,
    flights: Flights,
}

impl Gateway {
    /// Build a gateway from configuration: one executor, credential pool and
    /// model roster per configured provider.
    pub fn from_config(config: GatewayConfig) -> Result<Self> {
        let mut lanes = IndexMap::new();
        for (name, provider) in &config.providers {
            let client = create_client(provider)?;
            let pool = Arc::new(KeyPool::new(provider.api_keys.clone())?);
            let roster = Arc::new(ModelRoster::new(provider.models.clone())?);
            let executor = Arc::new(Executor::new(client, pool, config.retry.clone()));
            lanes.insert(name.clone(), Lane { executor, roster });
        }
        if lanes.is_empty() {
            return Err(Error::Config("no providers configured".into()));
        }
        Ok(Gateway {
            lanes,
            flights: Flights::new(),
        })
    }

    /// Submit a request and drive it to a normalized terminal outcome.
    ///
    /// With a `resource_key`, a concurrent duplicate returns
    /// [`SubmitError::Busy`] immediately. The roster is walked in priority
    /// order; models reported unavailable are demoted and the next one tried,
    /// until success, roster exhaustion, or the attempt budget is spent.
    pub async fn submit(
        &self,
        resource_key: Option<&str>,
        provider: &str,
        payload: ChatPayload,
        options: SubmitOptions,
    ) -> std::result::Result<Reply, SubmitError> {
        let lane = self.lane(provider)?;

        let _permit = match resource_key {
            Some(key) => Some(self.flights.acquire(key).map_err(|_| SubmitError::Busy)?),
            None => None,
        };

        let max_attempts = options
            .max_attempts
            .unwrap_or_else(|| lane.executor.default_max_attempts());

        let mut trail: Vec<Attempt> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut last_error: Option<Error> = None;

        while let Some(entry) = lane.roster.next(&visited) {
            if trail.len() as u32 >= max_attempts {
                break;
            }
            visited.insert(entry.id.clone());

            let attempt_payload = resolve_payload(&payload, &options, entry.max_tokens);
            match lane
                .executor
                .execute(&attempt_payload, &entry.id, max_attempts, &mut trail)
                .await
            {
                Ok((content, usage)) => {
                    lane.roster.record_success(&entry.id);
                    return Ok(Reply {
                        content,
                        model: entry.id,
                        usage: Some(usage),
                    });
                }
                Err(err @ Error::ModelUnavailable(_)) => {
                    lane.roster.record_failure(&entry.id);
                    last_error = Some(err);
                }
                Err(err @ Error::PoolExhausted) => {
                    return Err(SubmitError::Failed { error: err, trail });
                }
                Err(err) => {
                    // Attempt budget spent or unclassified failure; stop here
                    last_error = Some(err);
                    break;
                }
            }
        }

        let exhausted_roster = visited.len() == lane.roster.len();
        let error = if exhausted_roster {
            Error::RosterExhausted
        } else {
            last_error.unwrap_or(Error::RosterExhausted)
        };
        Err(SubmitError::Failed { error, trail })
    }

    /// Submit a streaming request.
    ///
    /// Admission (the single-flight check) happens before the stream is
    /// returned; the permit is held by the stream itself and released when it
    /// is dropped, so abandoning the stream frees the resource key.
    pub fn submit_stream(
        &self,
        resource_key: Option<&str>,
        provider: &str,
        payload: ChatPayload,
        options: SubmitOptions,
    ) -> std::result::Result<Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>, SubmitError>
    {
        let lane = self.lane(provider)?;
        let permit = match resource_key {
            Some(key) => Some(self.flights.acquire(key).map_err(|_| SubmitError::Busy)?),
            None => None,
        };

        let executor = Arc::clone(&lane.executor);
        let roster = Arc::clone(&lane.roster);
        let max_attempts = options
            .max_attempts
            .unwrap_or_else(|| executor.default_max_attempts());
        let budget = Arc::new(AtomicU32::new(max_attempts));

        Ok(Box::pin(async_stream::stream! {
            // Held until this stream is dropped
            let _permit = permit;
            let mut visited: HashSet<String> = HashSet::new();

            'roster: while let Some(entry) = roster.next(&visited) {
                visited.insert(entry.id.clone());
                let attempt_payload = resolve_payload(&payload, &options, entry.max_tokens);
                let mut inner = Arc::clone(&executor).execute_stream(
                    attempt_payload,
                    entry.id.clone(),
                    Arc::clone(&budget),
                );

                let mut emitted = false;
                while let Some(item) = inner.next().await {
                    match item {
                        Ok(event) => {
                            let done = event.done;
                            emitted = true;
                            yield Ok(event);
                            if done {
                                roster.record_success(&entry.id);
                                return;
                            }
                        }
                        Err(Error::ModelUnavailable(msg)) if !emitted => {
                            roster.record_failure(&entry.id);
                            tracing::warn!(model = %entry.id, %msg, "model unavailable, advancing roster");
                            continue 'roster;
                        }
                        Err(err) => {
                            yield Err(err);
                            return;
                        }
                    }
                }

                if emitted {
                    // Stream completed without an explicit done event
                    roster.record_success(&entry.id);
                    return;
                }
            }

            yield Err(Error::RosterExhausted);
        }))
    }

    /// Restore a provider's configured model order, for use between
    /// independent campaigns.
    pub fn reset_roster(&self, provider: &str) -> Result<()> {
        let lane = self
            .lanes
            .get(provider)
            .ok_or_else(|| Error::Config(format!("unknown provider '{}'", provider)))?;
        lane.roster.reset();
        Ok(())
    }

    /// Current model order for a provider, for diagnostics
    pub fn roster_snapshot(&self, provider: &str) -> Result<Vec<String>> {
        let lane = self
            .lanes
            .get(provider)
            .ok_or_else(|| Error::Config(format!("unknown provider '{}'", provider)))?;
        Ok(lane.roster.snapshot())
    }

    fn lane(&self, provider: &str) -> std::result::Result<&Lane, SubmitError> {
        self.lanes.get(provider).ok_or_else(|| SubmitError::Failed {
            error: Error::Config(format!("unknown provider '{}'", provider)),
            trail: Vec::new(),
        })
    }
}

/// Resolve the effective output cap: per-call option, then the payload's own
/// value, then the model's configured cap (provider default applies last, in
/// the wire client).
fn resolve_payload(
    payload: &ChatPayload,
    options: &SubmitOptions,
    model_cap: Option<u32>,
) -> ChatPayload {
    let mut resolved = payload.clone();
    if let Some(cap) = options.max_tokens {
        resolved.max_tokens = Some(cap);
    } else if resolved.max_tokens.is_none() {
        resolved.max_tokens = model_cap;
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flight_permit_released_on_drop() {
        let flights = Flights::new();
        {
            let _permit = flights.acquire("img-1").unwrap();
            assert!(matches!(flights.acquire("img-1"), Err(Error::Busy)));
            // A different key is unaffected
            assert!(flights.acquire("img-2").is_ok());
        }
        assert!(flights.acquire("img-1").is_ok());
    }

    #[test]
    fn test_resolve_payload_precedence() {
        let payload = ChatPayload::new(vec![]);
        let options = SubmitOptions {
            max_tokens: Some(100),
            ..Default::default()
        };
        assert_eq!(resolve_payload(&payload, &options, Some(50)).max_tokens, Some(100));

        let no_options = SubmitOptions::default();
        assert_eq!(resolve_payload(&payload, &no_options, Some(50)).max_tokens, Some(50));

        let own = payload.clone().with_max_tokens(25);
        assert_eq!(resolve_payload(&own, &no_options, Some(50)).max_tokens, Some(25));
    }
}
