//! Approximate matching of LLM-proposed names against the real vault.
//!
//! Both lookups normalize, prefer an exact normalized match, then try
//! bidirectional substring containment, and only then fall back to normalized Levenshtein similarity
//! `1 - distance / max(len_a, len_b)`. A best candidate is returned only when
//! it meets the threshold.

use std::path::Path;

use crate::vault;

pub const SECTION_THRESHOLD: f64 = 0.6;
pub const FILENAME_THRESHOLD: f64 = 0.7;

/// Edit distance over Unicode scalar values.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() || b.is_empty() {
        return a.len().max(b.len());
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// `1 - distance / max_len`, or `0.0` when both strings are empty.
pub fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 0.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

/// H2 heading names in `content`, without the leading hashes.
pub fn section_names(content: &str) -> Vec<String> {
    content
        .lines()
        .filter(|l| l.starts_with("##") && !l.starts_with("###"))
        .map(|l| l.trim_start_matches('#').trim().to_string())
        .collect()
}

/// Resolve `target` to an existing `##` heading in `content`.
///
/// Returns the heading text as written in the file (e.g. `Job Applications`
/// for target `applications`), or `None` when nothing clears `threshold`.
pub fn find_best_section_match(content: &str, target: &str, threshold: f64) -> Option<String> {
    let sections = section_names(content);
    let target_norm = target.trim().to_lowercase();
    if sections.is_empty() || target_norm.is_empty() {
        return None;
    }

    best_match(
        sections.iter().map(|s| (s.to_lowercase(), s.clone())),
        &target_norm,
        threshold,
    )
}

/// Resolve `target` to an existing vault file, returning its relative path.
///
/// Compares against file stems with `_` and `-` folded to spaces; `about.md`
/// files are never candidates.
pub fn find_similar_filename(vault_root: &Path, target: &str, threshold: f64) -> Option<String> {
    let target_stem = Path::new(target)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| target.to_string());
    let target_norm = normalize_filename(&target_stem);
    if target_norm.is_empty() {
        return None;
    }

    let files = vault::list_vault_files(vault_root, false).ok()?;
    best_match(
        files.into_iter().map(|f| {
            let stem = Path::new(&f.relative_path)
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            (normalize_filename(&stem), f.relative_path)
        }),
        &target_norm,
        threshold,
    )
}

fn normalize_filename(name: &str) -> String {
    name.to_lowercase().replace(['_', '-'], " ").trim().to_string()
}

/// Shared matcher over `(normalized, original)` candidates.
fn best_match(
    candidates: impl Iterator<Item = (String, String)>,
    target_norm: &str,
    threshold: f64,
) -> Option<String> {
    let candidates: Vec<(String, String)> = candidates.filter(|(n, _)| !n.is_empty()).collect();

    if let Some((_, original)) = candidates.iter().find(|(norm, _)| norm == target_norm) {
        return Some(original.clone());
    }

    for (norm, original) in &candidates {
        if norm.contains(target_norm) || target_norm.contains(norm.as_str()) {
            return Some(original.clone());
        }
    }

    let mut best: Option<(f64, &String)> = None;
    for (norm, original) in &candidates {
        let score = similarity(target_norm, norm);
        if best.map_or(true, |(b, _)| score > b) {
            best = Some((score, original));
        }
    }

    match best {
        Some((score, original)) if score >= threshold => Some(original.clone()),
        _ => None,
    }
}
