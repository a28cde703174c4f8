use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable name of a snapshot payload type.
///
/// The store records the token next to every value and uses it to reject
/// reads of a record as the wrong type. Tokens must not change between
/// builds, so they are declared explicitly rather than derived from Rust
/// type names.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeToken(Cow<'static, str>);

impl TypeToken {
    /// A token from a static name.
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// A token from an owned name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// The token string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TypeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeToken({})", self.0)
    }
}

impl fmt::Display for TypeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A type with a stable [`TypeToken`].
pub trait Typed {
    /// The token identifying this type in the store.
    fn type_token() -> TypeToken;
}

/// Implement [`Typed`] for a type with a fixed token string.
///
/// ```
/// use stasis_types::{impl_typed, Typed};
///
/// struct Inventory;
/// impl_typed!(Inventory => "game.inventory");
///
/// assert_eq!(Inventory::type_token().as_str(), "game.inventory");
/// ```
#[macro_export]
macro_rules! impl_typed {
    ($($ty:ty => $name:literal),+ $(,)?) => {
        $(
            impl $crate::Typed for $ty {
                fn type_token() -> $crate::TypeToken {
                    $crate::TypeToken::from_static($name)
                }
            }
        )+
    };
}

impl_typed!(
    bool => "bool",
    u8 => "u8",
    u16 => "u16",
    u32 => "u32",
    u64 => "u64",
    i8 => "i8",
    i16 => "i16",
    i32 => "i32",
    i64 => "i64",
    f32 => "f32",
    f64 => "f64",
    char => "char",
    String => "string",
    BTreeSet<String> => "set<string>",
);

impl<T: Typed> Typed for Vec<T> {
    fn type_token() -> TypeToken {
        TypeToken::new(format!("vec<{}>", T::type_token()))
    }
}

impl<T: Typed> Typed for Option<T> {
    fn type_token() -> TypeToken {
        TypeToken::new(format!("option<{}>", T::type_token()))
    }
}

impl<T: Typed> Typed for BTreeMap<String, T> {
    fn type_token() -> TypeToken {
        TypeToken::new(format!("map<string,{}>", T::type_token()))
    }
}

impl_typed!(
    crate::IdentityRecord => "stasis.identity-record",
    crate::ScopeContext => "stasis.scope-context",
    crate::Placement => "stasis.placement",
);
