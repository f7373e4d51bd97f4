//! Deduplicated image pulls.
//!
//! First-pull-wins with shared wait, keyed by image reference: the first
//! requester performs the pull, concurrent requesters for the same image
//! await the same completion instead of serializing behind a global lock.

use dashmap::DashMap;
use k3c_runtime::DynRuntime;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{CoreError, Result};

type PullOutcome = Option<std::result::Result<(), String>>;

/// Per-image pull gate.
#[derive(Default)]
pub struct PullGate {
    inflight: DashMap<String, watch::Receiver<PullOutcome>>,
}

impl PullGate {
    /// Creates a new gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensures `reference` is present locally, pulling it at most once no
    /// matter how many callers ask concurrently.
    pub async fn ensure(
        &self,
        runtime: &DynRuntime,
        reference: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if runtime.image_exists(reference, cancel).await? {
            debug!(image = reference, "already present, skipping pull");
            return Ok(());
        }

        // Either join an in-flight pull or become the puller. The entry API
        // makes the decision atomic.
        let mut waiter = None;
        let tx = {
            match self.inflight.entry(reference.to_string()) {
                dashmap::mapref::entry::Entry::Occupied(entry) => {
                    waiter = Some(entry.get().clone());
                    None
                }
                dashmap::mapref::entry::Entry::Vacant(entry) => {
                    let (tx, rx) = watch::channel(None);
                    entry.insert(rx);
                    Some(tx)
                }
            }
        };

        if let Some(mut rx) = waiter {
            debug!(image = reference, "awaiting in-flight pull");
            loop {
                if let Some(outcome) = rx.borrow().clone() {
                    return outcome.map_err(|msg| {
                        CoreError::Common(k3c_error::CommonError::internal(msg))
                    });
                }
                if rx.changed().await.is_err() {
                    // puller dropped without publishing; retry from scratch
                    return Box::pin(self.ensure(runtime, reference, cancel)).await;
                }
            }
        }

        let tx = tx.expect("no waiter means we hold the sender");
        info!(image = reference, "pulling");
        let outcome = runtime.image_pull(reference, cancel).await;
        let shared = outcome.as_ref().map(|_| ()).map_err(ToString::to_string);
        let _ = tx.send(Some(shared));
        self.inflight.remove(reference);

        outcome.map_err(CoreError::from)
    }
}

#[cfg(test)]
mod tests {
    // Exercised end-to-end in tests/cluster_lifecycle.rs against the mock
    // runtime, which counts pull invocations per image.
}
