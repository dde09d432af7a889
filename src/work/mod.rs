mod plan;
mod status;
mod unit;

pub use plan::WorkPlan;
pub use status::UnitStatus;
pub use unit::{Partition, SearchQuery, WorkUnit};
