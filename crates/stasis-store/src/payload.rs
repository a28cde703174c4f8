use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use stasis_types::{TypeToken, Typed};

use crate::error::PayloadError;

/// A value that can be stored in a [`RecordStore`](crate::RecordStore).
pub trait Persistable: Typed + Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Persistable for T where T: Typed + Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

type AnyValue = dyn Any + Send + Sync;

/// Which representation a [`Payload`] currently holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadKind {
    /// The original Rust value, type-erased.
    Live,
    /// A generic JSON tree.
    Tree,
    /// JSON text of a boxed value read back from disk.
    Encoded,
    /// A bincode blob.
    Binary,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Live => "live",
            Self::Tree => "tree",
            Self::Encoded => "encoded",
            Self::Binary => "binary",
        };
        f.write_str(name)
    }
}

#[derive(Clone)]
struct LiveValue {
    value: Arc<AnyValue>,
    to_tree: fn(&AnyValue, &TypeToken) -> Result<Value, PayloadError>,
    to_binary: fn(&AnyValue, &TypeToken) -> Result<Vec<u8>, PayloadError>,
}

#[derive(Clone)]
enum Repr {
    Live(LiveValue),
    Tree(Value),
    Encoded(String),
    Binary(Vec<u8>),
}

/// A type-erased record value tagged with its [`TypeToken`].
///
/// Decoding rules:
/// - `Tree` coerces structurally into any compatible type.
/// - `Live` requires the exact Rust type that was stored.
/// - `Encoded` and `Binary` require an exact token match.
#[derive(Clone)]
pub struct Payload {
    token: TypeToken,
    repr: Repr,
}

impl Payload {
    /// Box a value as-is. Conversion to bytes is deferred until commit.
    pub fn live<T: Persistable>(value: T) -> Self {
        Self {
            token: T::type_token(),
            repr: Repr::Live(LiveValue {
                value: Arc::new(value),
                to_tree: live_to_tree::<T>,
                to_binary: live_to_binary::<T>,
            }),
        }
    }

    /// Convert a value to a JSON tree now.
    pub fn tree<T: Persistable>(value: &T) -> Result<Self, PayloadError> {
        let token = T::type_token();
        let tree = serde_json::to_value(value).map_err(|e| PayloadError::Encode {
            token: token.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self::from_tree(token, tree))
    }

    /// Serialize a value to a bincode blob now.
    pub fn binary<T: Persistable>(value: &T) -> Result<Self, PayloadError> {
        let token = T::type_token();
        let bytes = bincode::serialize(value).map_err(|e| PayloadError::Encode {
            token: token.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self::from_binary(token, bytes))
    }

    pub fn from_tree(token: TypeToken, tree: Value) -> Self {
        Self {
            token,
            repr: Repr::Tree(tree),
        }
    }

    pub fn from_text(token: TypeToken, json: String) -> Self {
        Self {
            token,
            repr: Repr::Encoded(json),
        }
    }

    pub fn from_binary(token: TypeToken, bytes: Vec<u8>) -> Self {
        Self {
            token,
            repr: Repr::Binary(bytes),
        }
    }

    pub fn token(&self) -> &TypeToken {
        &self.token
    }

    pub fn kind(&self) -> PayloadKind {
        match &self.repr {
            Repr::Live(_) => PayloadKind::Live,
            Repr::Tree(_) => PayloadKind::Tree,
            Repr::Encoded(_) => PayloadKind::Encoded,
            Repr::Binary(_) => PayloadKind::Binary,
        }
    }

    /// Read the payload as `T`.
    pub fn decode<T: Persistable>(&self) -> Result<T, PayloadError> {
        let expected = T::type_token();
        match &self.repr {
            Repr::Tree(tree) => T::deserialize(tree).map_err(|e| self.decode_error(e)),
            Repr::Live(live) => {
                self.check_token(&expected)?;
                (*live.value)
                    .downcast_ref::<T>()
                    .cloned()
                    .ok_or_else(|| PayloadError::WrongLiveType {
                        token: self.token.clone(),
                    })
            }
            Repr::Encoded(json) => {
                self.check_token(&expected)?;
                serde_json::from_str(json).map_err(|e| self.decode_error(e))
            }
            Repr::Binary(bytes) => {
                self.check_token(&expected)?;
                bincode::deserialize(bytes).map_err(|e| self.decode_error(e))
            }
        }
    }

    /// Overwrite `target` in place from the payload.
    ///
    /// Structured payloads are merged field by field over the target's
    /// current state, so fields absent from the record keep their values.
    /// Binary payloads replace the target wholesale.
    pub fn merge_into<T: Persistable>(&self, target: &mut T) -> Result<(), PayloadError> {
        let patch = match &self.repr {
            Repr::Tree(tree) => tree.clone(),
            Repr::Encoded(_) => {
                self.check_token(&T::type_token())?;
                self.to_json()?
            }
            Repr::Live(_) | Repr::Binary(_) => {
                *target = self.decode()?;
                return Ok(());
            }
        };
        let mut base = serde_json::to_value(&*target).map_err(|e| PayloadError::Encode {
            token: self.token.clone(),
            reason: e.to_string(),
        })?;
        merge_json(&mut base, patch);
        *target = T::deserialize(base).map_err(|e| self.decode_error(e))?;
        Ok(())
    }

    /// A JSON view of the payload, for tooling.
    pub fn to_json(&self) -> Result<Value, PayloadError> {
        match &self.repr {
            Repr::Live(live) => (live.to_tree)(&*live.value, &self.token),
            Repr::Tree(tree) => Ok(tree.clone()),
            Repr::Encoded(json) => serde_json::from_str(json).map_err(|e| self.decode_error(e)),
            Repr::Binary(_) => Err(PayloadError::Opaque {
                token: self.token.clone(),
            }),
        }
    }

    /// JSON text of a live, tree, or encoded payload.
    pub(crate) fn to_text(&self) -> Result<String, PayloadError> {
        match &self.repr {
            Repr::Encoded(json) => Ok(json.clone()),
            _ => serde_json::to_string(&self.to_json()?).map_err(|e| PayloadError::Encode {
                token: self.token.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Convert a live payload into its tree form. Other forms pass through.
    pub(crate) fn into_tree(self) -> Result<Self, PayloadError> {
        match &self.repr {
            Repr::Live(live) => {
                let tree = (live.to_tree)(&*live.value, &self.token)?;
                Ok(Self::from_tree(self.token, tree))
            }
            Repr::Encoded(_) => {
                let tree = self.to_json()?;
                Ok(Self::from_tree(self.token, tree))
            }
            _ => Ok(self),
        }
    }

    /// Convert a live payload into its binary form. Other forms pass through.
    pub(crate) fn into_binary(self) -> Result<Self, PayloadError> {
        match &self.repr {
            Repr::Live(live) => {
                let bytes = (live.to_binary)(&*live.value, &self.token)?;
                Ok(Self::from_binary(self.token, bytes))
            }
            _ => Ok(self),
        }
    }

    pub(crate) fn binary_bytes(&self) -> Option<&[u8]> {
        match &self.repr {
            Repr::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub(crate) fn tree_value(&self) -> Option<&Value> {
        match &self.repr {
            Repr::Tree(tree) => Some(tree),
            _ => None,
        }
    }

    fn check_token(&self, expected: &TypeToken) -> Result<(), PayloadError> {
        if &self.token != expected {
            return Err(PayloadError::TokenMismatch {
                expected: expected.clone(),
                actual: self.token.clone(),
            });
        }
        Ok(())
    }

    fn decode_error(&self, e: impl fmt::Display) -> PayloadError {
        PayloadError::Decode {
            token: self.token.clone(),
            reason: e.to_string(),
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("token", &self.token)
            .field("kind", &self.kind())
            .finish()
    }
}

fn live_to_tree<T: Persistable>(value: &AnyValue, token: &TypeToken) -> Result<Value, PayloadError> {
    let value = value.downcast_ref::<T>().ok_or_else(|| PayloadError::WrongLiveType {
        token: token.clone(),
    })?;
    serde_json::to_value(value).map_err(|e| PayloadError::Encode {
        token: token.clone(),
        reason: e.to_string(),
    })
}

fn live_to_binary<T: Persistable>(
    value: &AnyValue,
    token: &TypeToken,
) -> Result<Vec<u8>, PayloadError> {
    let value = value.downcast_ref::<T>().ok_or_else(|| PayloadError::WrongLiveType {
        token: token.clone(),
    })?;
    bincode::serialize(value).map_err(|e| PayloadError::Encode {
        token: token.clone(),
        reason: e.to_string(),
    })
}

fn merge_json(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
