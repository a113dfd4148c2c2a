//! Revision-stable line item identity.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a logical line item that survives every revision of its document.
///
/// Row ids (`estimation_item_id`, `purchase_request_item_id`) are reissued per
/// version; allocation links and audit carry-forward key on this value instead.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct StableId(pub Uuid);

impl StableId {
    /// Issue a fresh identity for an item that has never been saved.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for StableId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for StableId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for StableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
