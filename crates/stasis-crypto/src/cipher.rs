use crate::error::{CryptoError, CryptoResult};

/// Leading bytes of every obfuscated blob.
pub const MAGIC: &[u8; 4] = b"STXO";

/// Length of the keyed integrity tag appended to the ciphertext.
pub const TAG_LEN: usize = 32;

const KEY_CONTEXT: &str = "stasis save obfuscation 2024-06 keystream";
const MAC_CONTEXT: &str = "stasis save obfuscation 2024-06 tag";
const FIXED_KEY_MATERIAL: &[u8] = b"stasis-fixed-key-material-v1";
const FIXED_IV: [u8; 16] = *b"stasis-fixed-iv1";

/// Symmetric keystream obfuscation for save files.
///
/// Framing:
/// ```text
/// [4 bytes: magic "STXO"]
/// [N bytes: plaintext XOR BLAKE3-XOF(key, iv)]
/// [32 bytes: keyed BLAKE3 tag over magic || ciphertext]
/// ```
///
/// Key and IV are fixed, so every file is readable by every build. This is
/// obfuscation plus corruption detection, nothing more.
#[derive(Clone)]
pub struct Obfuscator {
    stream_key: [u8; 32],
    mac_key: [u8; 32],
    iv: [u8; 16],
}

impl Obfuscator {
    /// The compiled-in key and IV used for all save files.
    pub fn fixed() -> Self {
        Self::with_key(FIXED_KEY_MATERIAL, FIXED_IV)
    }

    /// Build from explicit key material and IV (tests and tooling).
    pub fn with_key(key_material: &[u8], iv: [u8; 16]) -> Self {
        Self {
            stream_key: blake3::derive_key(KEY_CONTEXT, key_material),
            mac_key: blake3::derive_key(MAC_CONTEXT, key_material),
            iv,
        }
    }

    /// Obfuscate `plaintext` into a framed blob.
    pub fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAGIC.len() + plaintext.len() + TAG_LEN);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(plaintext);
        self.apply_keystream(&mut out[MAGIC.len()..]);
        let tag = self.tag(&out);
        out.extend_from_slice(&tag);
        out
    }

    /// Verify and de-obfuscate a framed blob.
    pub fn open(&self, blob: &[u8]) -> CryptoResult<Vec<u8>> {
        if blob.len() < MAGIC.len() + TAG_LEN {
            return Err(CryptoError::Truncated { len: blob.len() });
        }
        if &blob[..MAGIC.len()] != MAGIC {
            return Err(CryptoError::InvalidMagic {
                expected: String::from_utf8_lossy(MAGIC).into(),
                actual: String::from_utf8_lossy(&blob[..MAGIC.len()]).into(),
            });
        }
        let (body, tag) = blob.split_at(blob.len() - TAG_LEN);
        let expected = blake3::Hash::from(self.tag(body));
        let actual = blake3::Hash::from_bytes(tag_array(tag));
        // blake3::Hash equality is constant-time.
        if expected != actual {
            return Err(CryptoError::TagMismatch);
        }
        let mut plaintext = body[MAGIC.len()..].to_vec();
        self.apply_keystream(&mut plaintext);
        Ok(plaintext)
    }

    fn apply_keystream(&self, data: &mut [u8]) {
        let mut hasher = blake3::Hasher::new_keyed(&self.stream_key);
        hasher.update(&self.iv);
        let mut reader = hasher.finalize_xof();
        let mut block = [0u8; 64];
        for chunk in data.chunks_mut(block.len()) {
            reader.fill(&mut block[..chunk.len()]);
            for (byte, key) in chunk.iter_mut().zip(block.iter()) {
                *byte ^= key;
            }
        }
    }

    fn tag(&self, framed: &[u8]) -> [u8; TAG_LEN] {
        *blake3::keyed_hash(&self.mac_key, framed).as_bytes()
    }
}

impl Default for Obfuscator {
    fn default() -> Self {
        Self::fixed()
    }
}

impl std::fmt::Debug for Obfuscator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Obfuscator").finish_non_exhaustive()
    }
}

fn tag_array(tag: &[u8]) -> [u8; TAG_LEN] {
    let mut arr = [0u8; TAG_LEN];
    arr.copy_from_slice(tag);
    arr
}
