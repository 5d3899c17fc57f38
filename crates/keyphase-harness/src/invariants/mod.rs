//! Invariant checking for deterministic simulation testing.
//!
//! Invariants are properties that must hold after every simulation round,
//! whatever the link did. The simulation extracts a [`SystemSnapshot`] from
//! both endpoints and runs every registered [`Invariant`] against it.
//!
//! # Usage
//!
//! ```ignore
//! let registry = InvariantRegistry::standard();
//! registry.check_all(&simulation.snapshot())?;
//! ```

mod checks;
mod snapshot;

pub use checks::{GenerationLockStep, GenerationMonotonicity, NoFatalClose, TransitionBalance};
pub use snapshot::{EndpointSnapshot, SystemSnapshot};

/// Invariant check result.
pub type InvariantResult = Result<(), Violation>;

/// Invariant violation with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Name of the violated invariant.
    pub invariant: &'static str,
    /// Description of what went wrong.
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.invariant, self.message)
    }
}

impl std::error::Error for Violation {}

/// An invariant that can be checked against system state.
pub trait Invariant: Send + Sync {
    /// Invariant name for error reporting.
    fn name(&self) -> &'static str;

    /// Check the invariant against the current state.
    fn check(&self, state: &SystemSnapshot) -> InvariantResult;
}

/// Registry of invariants to check.
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl Default for InvariantRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl InvariantRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { invariants: Vec::new() }
    }

    /// Invariants that hold on any link.
    ///
    /// Includes:
    /// - [`NoFatalClose`]: well-behaved peers never close each other
    /// - [`GenerationMonotonicity`]: generations never decrease
    /// - [`GenerationLockStep`]: a sender is never behind, and never more
    ///   than one generation ahead of, its receiver
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(NoFatalClose);
        registry.add(GenerationMonotonicity);
        registry.add(GenerationLockStep);
        registry
    }

    /// [`Self::standard`] plus [`TransitionBalance`], which only holds when
    /// the link neither loses nor reorders datagrams.
    pub fn lossless() -> Self {
        let mut registry = Self::standard();
        registry.add(TransitionBalance::default());
        registry
    }

    /// Add an invariant to the registry.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Number of registered invariants.
    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    /// Whether no invariants are registered.
    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }

    /// Check all invariants against the given state.
    ///
    /// Returns `Ok(())` if all invariants hold, or all violations found.
    pub fn check_all(&self, state: &SystemSnapshot) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> =
            self.invariants.iter().filter_map(|inv| inv.check(state).err()).collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }
}
