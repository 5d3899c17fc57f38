//! Standard invariant checks.
//!
//! These invariants capture behavioral properties that must always hold.
//! They verify WHAT must be true, not specific test scenarios.

use super::{Invariant, InvariantResult, SystemSnapshot, Violation};

/// Neither endpoint may close.
///
/// Both endpoints follow the protocol, so a close means one of them judged
/// a legitimate update to be a violation.
pub struct NoFatalClose;

impl Invariant for NoFatalClose {
    fn name(&self) -> &'static str {
        "no_fatal_close"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        match state.endpoints.iter().find(|e| e.closed) {
            Some(endpoint) => Err(Violation {
                invariant: self.name(),
                message: format!(
                    "{:?} closed: {}",
                    endpoint.role,
                    endpoint.close_reason.as_deref().unwrap_or("no reason recorded")
                ),
            }),
            None => Ok(()),
        }
    }
}

/// Key generations never decrease in either direction.
pub struct GenerationMonotonicity;

impl Invariant for GenerationMonotonicity {
    fn name(&self) -> &'static str {
        "generation_monotonicity"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for endpoint in &state.endpoints {
            for (direction, history) in
                [("local", &endpoint.local_history), ("remote", &endpoint.remote_history)]
            {
                if let Some(window) = history.windows(2).find(|w| w[1] < w[0]) {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "{:?} {direction} generation decreased {} → {}",
                            endpoint.role, window[0], window[1]
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A receiver is never ahead of its sender, and a sender is never more than
/// one generation ahead of its receiver.
///
/// The receiver only advances on an authenticated packet from the sender,
/// and the sender only advances again once that packet was acknowledged.
pub struct GenerationLockStep;

impl Invariant for GenerationLockStep {
    fn name(&self) -> &'static str {
        "generation_lock_step"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for sender in &state.endpoints {
            let Some(receiver) = state.peer_of(sender.role) else {
                continue;
            };
            let (sent, read) = (sender.local_generation, receiver.remote_generation);
            if sent < read || sent - read > 1 {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "{:?} writes generation {sent} but {:?} reads generation {read}",
                        sender.role, receiver.role
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Sent and received key phase transitions of an endpoint stay within
/// `tolerance` of each other.
///
/// Holds only on a link without loss or reordering: a lost packet can hide a
/// whole phase run, and a reordered one adds spurious transitions.
pub struct TransitionBalance {
    /// Largest allowed difference.
    pub tolerance: usize,
}

impl Default for TransitionBalance {
    fn default() -> Self {
        Self { tolerance: 2 }
    }
}

impl Invariant for TransitionBalance {
    fn name(&self) -> &'static str {
        "transition_balance"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for endpoint in &state.endpoints {
            let difference = endpoint.sent_transitions.abs_diff(endpoint.received_transitions);
            if difference > self.tolerance {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "{:?} sent {} transitions but received {}",
                        endpoint.role, endpoint.sent_transitions, endpoint.received_transitions
                    ),
                });
            }
        }
        Ok(())
    }
}
