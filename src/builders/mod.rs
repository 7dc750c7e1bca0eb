//! Builders to construct orchestration components.

pub mod pool_builder;
pub mod scheduler_builder;

pub use pool_builder::ResourcePoolBuilder;
pub use scheduler_builder::JobSchedulerBuilder;
