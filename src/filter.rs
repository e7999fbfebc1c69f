//! Filter evaluation for subscriptions.
//!
//! Each (subscription, key) pair carries a [`ForwardState`]: a sampling
//! counter and the content last forwarded to that subscriber. The counter
//! advances on every update for the key and wraps at the sampling factor,
//! so the sampling condition holds on updates 0, N, 2N, ... regardless of
//! what the change condition decided in between. The change condition
//! compares against the content this subscriber last received.
//!
//! With sampling factor 2 and contents `aa bb bb bb bb cc dd`:
//!
//! | mode                   | 0 | 1 | 2 | 3 | 4 | 5 | 6 |
//! |------------------------|---|---|---|---|---|---|---|
//! | off                    | Y | Y | Y | Y | Y | Y | Y |
//! | sampling               | Y | N | Y | N | Y | N | Y |
//! | on change              | Y | Y | N | N | N | Y | Y |
//! | sampling and on change | Y | N | Y | N | N | N | Y |
//! | sampling or on change  | Y | Y | Y | N | Y | Y | Y |

use crate::types::{FilterMode, Payload};

/// Outcome of one evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
    pub forward: bool,
    /// Counter value to store for the next update.
    pub counter: u32,
}

/// Decide whether `new` is forwarded.
///
/// `counter` is the position inside the current sampling cycle and
/// `last_forwarded` is `None` until something was forwarded for this key.
/// A `sampling` of 0 is treated as 1; the registry rejects it earlier.
pub fn evaluate(
    mode: FilterMode,
    sampling: u16,
    counter: u32,
    last_forwarded: Option<&Payload>,
    new: &Payload,
) -> Decision {
    let period = u32::from(sampling.max(1));
    let sample_due = counter % period == 0;
    let changed = match last_forwarded {
        Some(last) => !last.same_content(new),
        None => true,
    };

    let forward = match mode {
        FilterMode::FilterOff => true,
        FilterMode::FilterSampling => sample_due,
        FilterMode::FilterOnChange => changed,
        FilterMode::FilterSamplingAndOnChange => sample_due && changed,
        FilterMode::FilterSamplingOrOnChange => sample_due || changed,
    };

    Decision {
        forward,
        counter: (counter + 1) % period,
    }
}

/// Forwarding state of one subscription for one key.
#[derive(Clone, Debug, Default)]
pub struct ForwardState {
    counter: u32,
    last_forwarded: Option<Payload>,
}

impl ForwardState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate `new` and record it as forwarded when it passes.
    pub fn apply(&mut self, mode: FilterMode, sampling: u16, new: &Payload) -> bool {
        let decision = evaluate(
            mode,
            sampling,
            self.counter,
            self.last_forwarded.as_ref(),
            new,
        );
        self.counter = decision.counter;
        if decision.forward {
            self.last_forwarded = Some(new.clone());
        }
        decision.forward
    }

    pub fn last_forwarded(&self) -> Option<&Payload> {
        self.last_forwarded.as_ref()
    }
}
