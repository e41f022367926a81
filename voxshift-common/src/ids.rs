//! Typed row identities
//!
//! Every ledger row is keyed by an integer rowid. The newtypes keep generation
//! ids and audio ids from being mixed up at call sites; both serialize as bare
//! integers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wrap a raw rowid.
            pub const fn new(raw: i64) -> Self {
                Self(raw)
            }

            /// Raw rowid for binding into SQL.
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            /// Parses a positive decimal id.
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().parse::<i64>() {
                    Ok(raw) if raw > 0 => Ok(Self(raw)),
                    _ => Err(Error::InvalidInput(format!(
                        "Malformed {}: {:?}",
                        $label, s
                    ))),
                }
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }
    };
}

row_id!(
    /// Identity of a generation request row.
    GenerationId,
    "generation id"
);

row_id!(
    /// Identity of an audio row.
    AudioId,
    "audio id"
);
