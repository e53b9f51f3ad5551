//! Strongly-typed identifiers used across the allocator.
//!
//! Downstream crates (mem, io, cli) should *not* use raw integers for IDs.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! new_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(v: u64) -> Self {
                Self(v)
            }
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

new_id!(SlabId);
new_id!(ChunkId);
new_id!(FileId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display_and_serde() {
        let id = ChunkId::new(42);
        assert_eq!(id.to_string(), "ChunkId(42)");
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        let back: ChunkId = serde_json::from_str("42").unwrap();
        assert_eq!(back, id);
    }
}
