mod matcher;
mod radix_tree;

pub use matcher::{ClusterSelector, CompiledRoute, RouteTable};
pub use radix_tree::{HeaderOp, HeaderOpAction};
