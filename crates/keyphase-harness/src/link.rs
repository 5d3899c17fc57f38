//! One-way datagram link with seeded loss and reordering.
//!
//! Datagrams are scheduled for a delivery round. A clean send is due in the
//! round it was sent; a reordered one is held back a few rounds so that
//! later datagrams overtake it.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::trace;

/// Longest a reordered datagram is held back, in rounds.
pub const MAX_REORDER_DELAY: u64 = 8;

/// What happened to the datagrams offered to a link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Datagrams handed to the receiver
    pub delivered: u64,
    /// Datagrams dropped
    pub lost: u64,
    /// Datagrams held back behind later ones
    pub reordered: u64,
}

#[derive(Debug)]
struct InFlight {
    due: u64,
    sequence: u64,
    datagram: Vec<u8>,
}

/// A lossy, reordering one-way link.
#[derive(Debug)]
pub struct Link {
    loss: f64,
    reorder: f64,
    rng: ChaCha8Rng,
    in_flight: Vec<InFlight>,
    next_sequence: u64,
    stats: LinkStats,
}

impl Link {
    /// Link dropping a `loss` fraction and delaying a `reorder` fraction of
    /// datagrams. Both probabilities are clamped to `0.0..=1.0`.
    pub fn new(loss: f64, reorder: f64, seed: u64) -> Self {
        Self {
            loss: clamp_probability(loss),
            reorder: clamp_probability(reorder),
            rng: ChaCha8Rng::seed_from_u64(seed),
            in_flight: Vec::new(),
            next_sequence: 0,
            stats: LinkStats::default(),
        }
    }

    /// A link that delivers everything in order.
    pub fn perfect() -> Self {
        Self::new(0.0, 0.0, 0)
    }

    /// Offer a datagram sent during `round`.
    pub fn send(&mut self, datagram: Vec<u8>, round: u64) {
        if self.rng.gen_bool(self.loss) {
            self.stats.lost += 1;
            trace!(round, size = datagram.len(), "link dropped datagram");
            return;
        }

        let due = if self.rng.gen_bool(self.reorder) {
            self.stats.reordered += 1;
            round + self.rng.gen_range(1..=MAX_REORDER_DELAY)
        } else {
            round
        };

        self.in_flight.push(InFlight { due, sequence: self.next_sequence, datagram });
        self.next_sequence += 1;
    }

    /// Datagrams due by `round`, in delivery order.
    pub fn deliver(&mut self, round: u64) -> Vec<Vec<u8>> {
        let (mut due, waiting): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.in_flight).into_iter().partition(|d| d.due <= round);
        self.in_flight = waiting;

        due.sort_by_key(|d| (d.due, d.sequence));
        self.stats.delivered += due.len() as u64;
        due.into_iter().map(|d| d.datagram).collect()
    }

    /// Datagrams still held back.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Counters.
    pub fn stats(&self) -> LinkStats {
        self.stats
    }
}

fn clamp_probability(p: f64) -> f64 {
    if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_link_delivers_in_order() {
        let mut link = Link::perfect();
        link.send(vec![1], 0);
        link.send(vec![2], 0);
        link.send(vec![3], 1);

        assert_eq!(link.deliver(0), vec![vec![1], vec![2]]);
        assert_eq!(link.deliver(1), vec![vec![3]]);
        assert_eq!(link.stats(), LinkStats { delivered: 3, lost: 0, reordered: 0 });
    }

    #[test]
    fn total_loss_delivers_nothing() {
        let mut link = Link::new(1.0, 0.0, 7);
        for round in 0..10 {
            link.send(vec![0], round);
        }
        assert!(link.deliver(100).is_empty());
        assert_eq!(link.stats().lost, 10);
    }

    #[test]
    fn reordered_datagrams_arrive_later() {
        let mut link = Link::new(0.0, 1.0, 7);
        link.send(vec![1], 0);

        assert!(link.deliver(0).is_empty());
        assert_eq!(link.in_flight(), 1);
        assert_eq!(link.deliver(MAX_REORDER_DELAY), vec![vec![1]]);
    }

    #[test]
    fn same_seed_same_schedule() {
        let run = |seed| {
            let mut link = Link::new(0.3, 0.3, seed);
            let mut delivered = Vec::new();
            for round in 0..50u64 {
                link.send(vec![round as u8], round);
                delivered.extend(link.deliver(round));
            }
            delivered
        };
        assert_eq!(run(9), run(9));
    }

    #[test]
    fn probabilities_are_clamped() {
        let mut link = Link::new(f64::NAN, 7.0, 1);
        link.send(vec![1], 0);
        assert_eq!(link.stats().lost, 0);
        assert_eq!(link.stats().reordered, 1);
    }
}
