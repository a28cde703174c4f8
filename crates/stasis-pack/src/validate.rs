use std::collections::HashSet;
use std::sync::Arc;

use stasis_types::PartKey;
use tracing::warn;

use crate::error::PackError;
use crate::part::Part;

/// Parts that passed validation, plus the problems found.
pub struct ValidatedParts {
    pub parts: Vec<(PartKey, Arc<dyn Part>)>,
    pub rejected: Vec<PackError>,
    /// Keys reported by more than one part; only the first is kept.
    pub duplicates: Vec<PartKey>,
}

/// Drop parts with a nil key and all but the first part per key.
pub fn validate_parts(owner: &str, parts: Vec<Arc<dyn Part>>) -> ValidatedParts {
    let mut seen = HashSet::new();
    let mut validated = ValidatedParts {
        parts: Vec::with_capacity(parts.len()),
        rejected: Vec::new(),
        duplicates: Vec::new(),
    };

    for part in parts {
        let key = part.part_key();
        if key.is_nil() {
            warn!(owner = %owner, "part with nil key excluded");
            validated.rejected.push(PackError::InvalidPartKey {
                owner: owner.to_string(),
            });
            continue;
        }
        if !seen.insert(key) {
            warn!(owner = %owner, part = %key, "duplicate part key, keeping first");
            validated.duplicates.push(key);
            continue;
        }
        validated.parts.push((key, part));
    }
    validated
}
