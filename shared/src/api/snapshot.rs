use serde::{Deserialize, Serialize};

/// One full result set pushed to a live subscriber. `generation` starts at 1
/// and increases with every delivery on the same subscription.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
    pub generation: u64,
    pub items: T,
}
