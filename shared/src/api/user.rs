use serde::{Deserialize, Serialize};

/// Claims of the bearer tokens minted by the identity service.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Claims {
    pub user_id: String,
    pub exp: usize,
}
