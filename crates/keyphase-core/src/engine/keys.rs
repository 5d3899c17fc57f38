//! Per-direction key storage: at most two generations plus the secret that
//! derives the next one.

use keyphase_crypto::{KeySet, TrafficSecret, derive_next};

/// When the previous generation may be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retention<I> {
    /// Until the peer acknowledges a packet sent under the current generation
    UntilConfirmed,
    /// Until this deadline passes
    Until(I),
}

/// Live generations for one direction.
///
/// The variants make "more than two generations" unrepresentable.
#[derive(Debug, Default)]
pub(crate) enum Generations<I> {
    /// No secrets installed yet
    #[default]
    Unset,
    /// Only the current generation is live
    Single(KeySet),
    /// The current generation plus the one it superseded
    Dual { current: KeySet, previous: KeySet, retention: Retention<I> },
}

impl<I: Copy + Ord> Generations<I> {
    pub(crate) fn current(&self) -> Option<&KeySet> {
        match self {
            Self::Unset => None,
            Self::Single(current) | Self::Dual { current, .. } => Some(current),
        }
    }

    pub(crate) fn previous(&self) -> Option<&KeySet> {
        match self {
            Self::Dual { previous, .. } => Some(previous),
            _ => None,
        }
    }

    pub(crate) fn retention(&self) -> Option<Retention<I>> {
        match self {
            Self::Dual { retention, .. } => Some(*retention),
            _ => None,
        }
    }

    /// Make `next` current. The old current becomes previous; an older
    /// previous is dropped (and zeroized) immediately.
    pub(crate) fn advance(&mut self, next: KeySet, retention: Retention<I>) {
        *self = match std::mem::take(self) {
            Self::Unset => Self::Single(next),
            Self::Single(current) | Self::Dual { current, .. } => {
                Self::Dual { current: next, previous: current, retention }
            },
        };
    }

    /// Drop the previous generation, returning its number.
    pub(crate) fn drop_previous(&mut self) -> Option<u64> {
        match std::mem::take(self) {
            Self::Dual { current, previous, .. } => {
                let generation = previous.generation();
                *self = Self::Single(current);
                Some(generation)
            },
            other => {
                *self = other;
                None
            },
        }
    }

    /// Drop the previous generation if its deadline has passed.
    pub(crate) fn expire(&mut self, now: I) -> Option<u64> {
        match self.retention() {
            Some(Retention::Until(deadline)) if now >= deadline => self.drop_previous(),
            _ => None,
        }
    }

    pub(crate) fn deadline(&self) -> Option<I> {
        match self.retention() {
            Some(Retention::Until(deadline)) => Some(deadline),
            _ => None,
        }
    }
}

/// The secret of the current generation and, once derived, the next
/// generation's secret and keys.
#[derive(Debug)]
pub(crate) struct Ratchet {
    secret: TrafficSecret,
    next: Option<(TrafficSecret, KeySet)>,
}

impl Ratchet {
    pub(crate) fn new(secret: TrafficSecret) -> Self {
        Self { secret, next: None }
    }

    /// Next generation's keys, deriving them on first use.
    pub(crate) fn peek(&mut self, current: &KeySet) -> &KeySet {
        let (_, keys) = self.next.get_or_insert_with(|| derive_next(&self.secret, current));
        keys
    }

    /// Whether the next generation has already been derived.
    pub(crate) fn is_primed(&self) -> bool {
        self.next.is_some()
    }

    /// Step the ratchet, returning the next generation's keys. The current
    /// secret is overwritten (and zeroized by drop).
    pub(crate) fn advance(&mut self, current: &KeySet) -> KeySet {
        let (secret, keys) = match self.next.take() {
            Some(next) => next,
            None => derive_next(&self.secret, current),
        };
        self.secret = secret;
        keys
    }
}
