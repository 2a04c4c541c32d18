//! The four worker roles and their shared activation cycle.
//!
//! Roles are stateless shells over a five-step cycle: perceive the medium,
//! decide whether and where to act, invoke an external effector, and deposit
//! the result back into the store. All coordination is stigmergic; roles never
//! address each other, only the shared medium.

use std::cell::RefCell;
use std::path::Path;

use anyhow::Result;
use rand::rngs::StdRng;
use tracing::{debug, warn};

use crate::core::types::RoleTag;
use crate::io::config::Config;
use crate::io::detector::PatternDetector;
use crate::io::git::Vcs;
use crate::io::llm::LlmClient;
use crate::io::store::{LockViolation, PheromoneStore};
use crate::io::testing::TestRunner;

pub mod discover;
pub mod testing;
pub mod transform;
pub mod validate;

pub use discover::Discover;
pub use testing::Test;
pub use transform::Transform;
pub use validate::Validate;

/// Everything a role may touch during one activation.
///
/// The store reference is the only channel back into the medium; effectors
/// are trait objects so scripted doubles slot in for tests.
pub struct RoleContext<'a> {
    pub store: &'a PheromoneStore,
    pub config: &'a Config,
    pub target: &'a Path,
    pub tick: u64,
    pub dry_run: bool,
    pub llm: &'a LlmClient,
    pub detector: &'a dyn PatternDetector,
    pub tests: &'a dyn TestRunner,
    pub vcs: &'a dyn Vcs,
    pub rng: &'a RefCell<StdRng>,
}

/// Shared role cycle. The variation between roles is narrow and data-driven:
/// a perception filter, a decision policy, an effector binding, and a
/// transition set.
pub trait Role {
    type View;
    type Action;
    type Outcome;

    fn tag(&self) -> RoleTag;

    /// Produce a read-only view of the relevant store slices.
    fn perceive(&self, ctx: &RoleContext<'_>) -> Result<Self::View>;

    /// False means the role idles this tick.
    fn should_act(&self, view: &Self::View) -> bool;

    /// Select exactly one unit of work from the view.
    fn decide(&self, ctx: &RoleContext<'_>, view: Self::View) -> Result<Self::Action>;

    /// Invoke the external effector. File-scoped failures are encoded in the
    /// outcome; `Ok(None)` means the role backed off without acting (e.g. a
    /// budget refusal). Errors escaping here are run-scoped.
    fn execute(&self, ctx: &RoleContext<'_>, action: Self::Action) -> Result<Option<Self::Outcome>>;

    /// Translate the outcome into store mutations.
    fn deposit(&self, ctx: &RoleContext<'_>, outcome: Self::Outcome) -> Result<()>;

    /// Run one full cycle; returns whether the role acted.
    fn run(&self, ctx: &RoleContext<'_>) -> Result<bool> {
        let view = self.perceive(ctx)?;
        if !self.should_act(&view) {
            debug!(role = self.tag().as_str(), "idle");
            return Ok(false);
        }
        let action = self.decide(ctx, view)?;
        let Some(outcome) = self.execute(ctx, action)? else {
            debug!(role = self.tag().as_str(), "backed off without acting");
            return Ok(false);
        };
        match self.deposit(ctx, outcome) {
            Ok(()) => {
                debug!(role = self.tag().as_str(), "acted");
                Ok(true)
            }
            // A lost scope-lock race is "do not act", not a failure.
            Err(err) if err.downcast_ref::<LockViolation>().is_some() => {
                warn!(role = self.tag().as_str(), error = %err, "deposit blocked by scope lock");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}
