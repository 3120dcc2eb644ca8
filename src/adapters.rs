//! Production and development implementations of the collaborator ports.

pub mod hooks;
pub mod plan;
pub mod portal;
pub mod tax;

pub use hooks::NoopHooks;
pub use plan::{HttpPlanOracle, UnlimitedPlan};
pub use portal::{CommandPortalRenderer, DisabledPortal};
pub use tax::StaticTaxLookup;
