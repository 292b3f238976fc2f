//! A single-process reducer for the accumulation engine
//!
//! Holds the latest accumulated document per reducer key and the dedup id of
//! every consumed input. Submissions are serialized, so at most one
//! accumulation runs per key, and an input that was already consumed is
//! answered as a duplicate without being accumulated again.

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    accumulator::{Accumulator, Error, Outcome},
    plan::MeteringPlans,
    usage::{AccumulatedUsage, MeteredUsage, RejectedUsage},
};

/// Answer to one submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// The usage was accumulated.
    Created {
        /// Where the accumulated document can be read back
        location: String,
        /// The accumulated document
        doc: AccumulatedUsage,
    },
    /// The input was consumed before.
    Duplicate {
        /// Dedup id of the input
        id: String,
    },
    /// A plan rejected the usage.
    Rejected(RejectedUsage),
}

impl Submission {
    /// HTTP-equivalent status of this answer.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Submission::Created { .. } => 201,
            Submission::Duplicate { .. } => 409,
            Submission::Rejected(_) => 200,
        }
    }
}

/// Location of an accumulated document.
#[must_use]
pub fn location(doc: &AccumulatedUsage) -> String {
    format!(
        "/v1/metering/accumulated/usage/k/{}/t/{}/{}",
        doc.identity.reducer_key(),
        doc.end,
        doc.start
    )
}

#[derive(Debug, Default)]
struct State {
    docs: FxHashMap<String, AccumulatedUsage>,
    // Never pruned.
    consumed: FxHashSet<String>,
}

/// In-memory reducer driving an [`Accumulator`].
///
/// Every consumed dedup id is kept for the life of the ledger, so memory
/// grows with the number of distinct observations. Replays are detected no
/// matter how late they arrive. Deployments needing bounded memory persist
/// markers outside the process instead.
#[derive(Debug)]
pub struct InMemoryLedger<P> {
    accumulator: Accumulator<P>,
    state: Mutex<State>,
}

impl<P> InMemoryLedger<P>
where
    P: MeteringPlans,
{
    /// Create an empty ledger.
    #[must_use]
    pub fn new(accumulator: Accumulator<P>) -> Self {
        Self {
            accumulator,
            state: Mutex::new(State::default()),
        }
    }

    /// Accumulate `usage` into the latest document of its key.
    ///
    /// # Errors
    ///
    /// Propagates the accumulator's errors. Nothing is recorded for a failed
    /// submission, so it may be retried.
    pub async fn submit(&self, usage: &MeteredUsage, auth: Option<&str>) -> Result<Submission, Error> {
        let id = usage.dedup_id();
        let mut state = self.state.lock().await;
        if state.consumed.contains(&id) {
            metrics::counter!("duplicate_usage").increment(1);
            info!(%id, "ignoring duplicate usage");
            return Ok(Submission::Duplicate { id });
        }

        let key = usage.reducer_key();
        let outcome = self
            .accumulator
            .accumulate(state.docs.get(&key), usage, auth)
            .await?;
        match outcome {
            Outcome::Accumulated { doc, marker } => {
                debug!(key = %marker.key, id = %marker.id, processed = marker.processed, "usage consumed");
                state.consumed.insert(marker.id);
                state.docs.insert(marker.key, doc.clone());
                Ok(Submission::Created {
                    location: location(&doc),
                    doc,
                })
            }
            Outcome::Rejected(rejected) => Ok(Submission::Rejected(rejected)),
        }
    }

    /// The latest accumulated document of `key`.
    pub async fn latest(&self, key: &str) -> Option<AccumulatedUsage> {
        self.state.lock().await.docs.get(key).cloned()
    }
}
