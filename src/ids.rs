//! Opaque string identifiers used throughout the execution runtime.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! opaque_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Build an id from anything string-like.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the inner string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

opaque_id!(NodeId, "Identifies a node within a diagram.");
opaque_id!(EdgeId, "Identifies an edge within a diagram.");
opaque_id!(ExecutionId, "Identifies a single diagram execution.");
opaque_id!(DiagramId, "Identifies a diagram definition.");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_by_value() {
        assert_eq!(NodeId::new("a"), NodeId::from("a"));
        assert_ne!(NodeId::new("a"), NodeId::new("b"));
    }

    #[test]
    fn display_round_trips_inner_string() {
        let id = ExecutionId::new("exec-1");
        assert_eq!(id.to_string(), "exec-1");
    }
}
