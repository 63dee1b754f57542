mod build;
mod explain;
mod types;

pub use build::{build_plan, PlanError};
pub use explain::explain;
pub use types::{Address, Node, Plan, PlanNode, RuntimeName, Scheme};
