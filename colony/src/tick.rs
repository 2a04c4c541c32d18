//! One tick of the round-robin orchestration.

use anyhow::Result;
use tracing::info;

use crate::io::store::MaintenanceReport;
use crate::metrics::RoleActions;
use crate::roles::{Discover, Role, RoleContext, Test, Transform, Validate};

/// The four role runtimes, constructed once per run.
pub struct Roles {
    pub discover: Discover,
    pub transform: Transform,
    pub test: Test,
    pub validate: Validate,
}

impl Roles {
    pub fn new() -> Result<Self> {
        Ok(Self {
            discover: Discover,
            transform: Transform::new()?,
            test: Test,
            validate: Validate,
        })
    }
}

/// What one tick did, before metrics recording and failure promotion.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub tick: u64,
    pub maintenance: MaintenanceReport,
    pub actions: RoleActions,
}

/// Run the in-tick sequence: maintenance, decay, then the four roles in fixed
/// order. Within a tick each role sees all deposits of the roles before it.
pub fn run_tick(ctx: &RoleContext<'_>, roles: &Roles) -> Result<TickReport> {
    let maintenance = ctx.store.maintain_status(ctx.tick)?;
    if !maintenance.ttl_released.is_empty() || !maintenance.retry_requeued.is_empty() {
        info!(
            tick = ctx.tick,
            ttl_released = ?maintenance.ttl_released,
            retry_requeued = ?maintenance.retry_requeued,
            "tick maintenance"
        );
    }

    ctx.store.apply_intensity_decay()?;
    ctx.store.apply_inhibition_decay()?;

    let actions = RoleActions {
        discover: roles.discover.run(ctx)?,
        transform: roles.transform.run(ctx)?,
        test: roles.test.run(ctx)?,
        validate: roles.validate.run(ctx)?,
    };

    Ok(TickReport { tick: ctx.tick, maintenance, actions })
}
