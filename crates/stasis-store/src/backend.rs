use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PayloadError;
use crate::payload::{Payload, Persistable};

/// How a store holds values in memory and which partition they commit to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Every set converts to a JSON tree; gets walk the tree.
    #[default]
    Tree,
    /// Values are kept as-is and only encoded at commit. Gets require the
    /// exact stored type and in-place population is unsupported.
    Boxed,
    /// Every set serializes to bincode; gets deserialize on demand.
    Binary,
}

impl Backend {
    /// Encode a value the way this backend stores it.
    pub fn encode<T: Persistable>(&self, value: T) -> Result<Payload, PayloadError> {
        match self {
            Self::Tree => Payload::tree(&value),
            Self::Boxed => Ok(Payload::live(value)),
            Self::Binary => Payload::binary(&value),
        }
    }

    /// Bring an externally built payload into this backend's form.
    ///
    /// Live payloads are converted. A tree payload cannot become binary
    /// without its concrete type and is kept as a tree.
    pub fn conform(&self, payload: Payload) -> Result<Payload, PayloadError> {
        match self {
            Self::Tree => payload.into_tree(),
            Self::Boxed => Ok(payload),
            Self::Binary => payload.into_binary(),
        }
    }

    /// Returns `true` if commits use the binary container.
    pub fn writes_binary(&self) -> bool {
        matches!(self, Self::Binary)
    }

    pub fn supports_populate(&self) -> bool {
        !matches!(self, Self::Boxed)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Tree => "tree",
            Self::Boxed => "boxed",
            Self::Binary => "binary",
        };
        f.write_str(name)
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tree" => Ok(Self::Tree),
            "boxed" => Ok(Self::Boxed),
            "binary" => Ok(Self::Binary),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}
