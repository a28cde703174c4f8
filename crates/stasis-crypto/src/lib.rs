//! Envelope primitives for stasis save files.
//!
//! A committed store is written as `obfuscate(compress(bytes))` and read
//! back through the inverse chain. Both steps are optional and selected by
//! configuration.
//!
//! The obfuscation cipher uses a fixed, compiled-in key and IV. It keeps
//! casual readers out of save files and detects corruption. It is **not**
//! a security boundary.

pub mod cipher;
pub mod compression;
pub mod envelope;
pub mod error;

pub use cipher::Obfuscator;
pub use compression::Compression;
pub use envelope::Envelope;
pub use error::{CryptoError, CryptoResult};
