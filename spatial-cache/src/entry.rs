use serde::{Deserialize, Serialize};

use crate::region::Region;
use crate::types::PayloadHandle;

/// A region paired with the handle of the payload it bounds.
///
/// Entries only live inside nodes. Two entries are the same entry when both
/// the bounds and the payload handle are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entry {
    pub bounds: Region,
    pub payload: PayloadHandle,
}

impl Entry {
    pub fn new(bounds: Region, payload: impl Into<PayloadHandle>) -> Self {
        Self {
            bounds,
            payload: payload.into(),
        }
    }

    pub fn matches(&self, bounds: &Region, payload: PayloadHandle) -> bool {
        self.payload == payload && self.bounds == *bounds
    }
}
