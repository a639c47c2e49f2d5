use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ids::CustomerId;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub name: String,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Customer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: CustomerId::new(),
            name: name.into(),
            extra: BTreeMap::new(),
        }
    }

    /// Placeholder identity used when a request does not name a customer.
    pub fn guest() -> Self {
        Self::new("Guest")
    }
}
