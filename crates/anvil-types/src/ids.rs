//! Identifier types for Anvil entities

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Declares a uuid-backed identifier newtype with the shared
/// `new`/`Default`/`Display` surface.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Identifies one inference request across its whole lifecycle
    RequestId
);

uuid_id!(
    /// Identifies one assembled batch, stamped at dispatch
    BatchId
);
