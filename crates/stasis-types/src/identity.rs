use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Width in bytes of every stasis identifier.
pub const UID_LEN: usize = 16;

/// Fixed-width 128-bit identifier.
///
/// All identities (instance, template, part) share this representation so
/// they can be combined bytewise into [`CompositeKey`]s. A `Uid` serializes
/// as its 32-character hex form so text containers stay readable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Uid([u8; UID_LEN]);

impl Uid {
    /// The all-zero identifier. Never a valid identity.
    pub const NIL: Self = Self([0; UID_LEN]);

    /// Generate a fresh identifier (UUID v7, time-ordered).
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().into_bytes())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; UID_LEN]) -> Self {
        Self(bytes)
    }

    /// Derive an identifier from a name under a domain tag.
    ///
    /// The same `(domain, name)` always yields the same identifier.
    pub fn derive(domain: &str, name: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(domain.as_bytes());
        hasher.update(b":");
        hasher.update(name.as_bytes());
        let hash = hasher.finalize();
        let mut bytes = [0u8; UID_LEN];
        bytes.copy_from_slice(&hash.as_bytes()[..UID_LEN]);
        Self(bytes)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; UID_LEN] {
        &self.0
    }

    /// Returns `true` for the all-zero identifier.
    pub fn is_nil(&self) -> bool {
        self.0 == [0; UID_LEN]
    }

    /// Bytewise XOR of two identifiers.
    pub fn xor(&self, other: &Self) -> Self {
        let mut out = [0u8; UID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Self(out)
    }

    /// Full hex-encoded string (32 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short identifier (first 8 hex characters).
    pub fn short_id(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from a 32-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        if bytes.len() != UID_LEN {
            return Err(TypeError::InvalidLength {
                expected: UID_LEN,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; UID_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl From<Uid> for String {
    fn from(uid: Uid) -> Self {
        uid.to_hex()
    }
}

impl TryFrom<String> for Uid {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", self.short_id())
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

macro_rules! uid_newtype {
    ($(#[$meta:meta])* $name:ident, $prefix:literal, $what:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uid);

        impl $name {
            /// Wrap a raw identifier, rejecting the nil identifier.
            pub fn new(uid: Uid) -> Result<Self, TypeError> {
                if uid.is_nil() {
                    return Err(TypeError::NilIdentifier($what));
                }
                Ok(Self(uid))
            }

            /// Wrap a raw identifier without validation.
            pub const fn from_uid(uid: Uid) -> Self {
                Self(uid)
            }

            /// Parse from hex, rejecting the nil identifier.
            pub fn from_hex(s: &str) -> Result<Self, TypeError> {
                Self::new(Uid::from_hex(s)?)
            }

            /// The underlying identifier.
            pub fn uid(&self) -> &Uid {
                &self.0
            }

            /// Returns `true` if the identifier is nil (invalid).
            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }

            /// Short display form.
            pub fn short_id(&self) -> String {
                format!(concat!($prefix, ":{}"), self.0.short_id())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.short_id())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.short_id())
            }
        }
    };
}

uid_newtype!(
    /// Identity of one live object.
    ///
    /// Generated when the object first becomes eligible for persistence,
    /// stable while the object lives, and re-assigned from the snapshot when
    /// the object is spawned during restore so back-references resolve.
    InstanceId,
    "i",
    "instance identity"
);

uid_newtype!(
    /// Authoring-time identity of a spawnable template. Immutable once assigned.
    TemplateId,
    "t",
    "template identity"
);

uid_newtype!(
    /// Build-stable key of a part, unique only within its owning object.
    PartKey,
    "p",
    "part key"
);

impl InstanceId {
    /// Generate a fresh instance identity.
    pub fn generate() -> Self {
        Self(Uid::generate())
    }

    /// Store key of this object's identity record.
    pub fn record_key(&self) -> String {
        self.0.to_hex()
    }
}

impl TemplateId {
    /// Derive a template identity from an asset path or name.
    pub fn named(name: &str) -> Result<Self, TypeError> {
        if name.is_empty() {
            return Err(TypeError::EmptyName("template identity"));
        }
        Ok(Self(Uid::derive("stasis-template-v1", name)))
    }
}

impl PartKey {
    /// Derive a part key from a stable name such as `"transform"`.
    pub fn named(name: &str) -> Result<Self, TypeError> {
        if name.is_empty() {
            return Err(TypeError::EmptyName("part key"));
        }
        Ok(Self(Uid::derive("stasis-part-v1", name)))
    }

    /// Store key of a free-standing part (one with no owning object).
    pub fn record_key(&self) -> String {
        self.0.to_hex()
    }
}

/// Store-unique key of a part, derived from its owner and its local key.
///
/// `CompositeKey::derive(owner, part)` is the bytewise XOR of the two
/// identifiers. Given the key and either operand the other is recoverable.
/// The derivation is for uniqueness only and carries no secrecy.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompositeKey(Uid);

impl CompositeKey {
    /// Combine an owner's instance identity with a part's local key.
    pub fn derive(owner: &InstanceId, part: &PartKey) -> Self {
        Self(owner.uid().xor(part.uid()))
    }

    /// Recover the part key given the owner.
    pub fn part_for(&self, owner: &InstanceId) -> PartKey {
        PartKey::from_uid(self.0.xor(owner.uid()))
    }

    /// The underlying identifier.
    pub fn uid(&self) -> &Uid {
        &self.0
    }

    /// Store key of the part record.
    pub fn record_key(&self) -> String {
        self.0.to_hex()
    }
}

impl fmt::Debug for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompositeKey({})", self.0.short_id())
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_hex())
    }
}
