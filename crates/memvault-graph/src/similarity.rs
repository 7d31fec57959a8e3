//! Entity similarity for fuzzy deduplication.
//!
//! The score is `0.8 · labelSim + 0.2 · typeEquality`. Label similarity
//! takes the better of normalized Levenshtein and Jaro-Winkler: pure
//! edit distance under-scores diminutive name variants ("Alicia" vs
//! "Alice" is 0.67 normalized), while Jaro-Winkler's common-prefix
//! weighting is the standard signal for exactly that case.

use crate::types::EntityType;
use strsim::{jaro_winkler, normalized_levenshtein};

/// Label similarity in [0, 1], case-insensitive.
pub fn label_similarity(a: &str, b: &str) -> f32 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    if a == b {
        return 1.0;
    }
    let lev = normalized_levenshtein(&a, &b) as f32;
    let jw = jaro_winkler(&a, &b) as f32;
    lev.max(jw)
}

/// Weighted entity similarity: label 0.8, type equality 0.2.
pub fn entity_similarity(
    a_label: &str,
    a_type: EntityType,
    b_label: &str,
    b_type: EntityType,
) -> f32 {
    let type_eq = if a_type == b_type { 1.0 } else { 0.0 };
    0.8 * label_similarity(a_label, b_label) + 0.2 * type_eq
}
