//! Structural checks run on every note the ingestion loop touches.
//!
//! Errors are plain sentences; the orchestrator feeds them back to the
//! router as correction instructions on the next attempt.

use std::path::Path;

use crate::citations::{marker_ids, CitationLedger};
use crate::vault::RELATED_HEADING;

/// Validate a note's markdown against its citation ledger.
///
/// `label` prefixes each error (usually the vault-relative path).
/// Returns an empty list when the note is well-formed.
pub fn validate_note(path: &Path, label: &str, ledger: &dyn CitationLedger) -> Vec<String> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => return vec![format!("{}: cannot read file: {}", label, e)],
    };

    let mut errors: Vec<String> = validate_markdown(&content)
        .into_iter()
        .map(|e| format!("{}: {}", label, e))
        .collect();

    let ids = marker_ids(&content);
    if ids.is_empty() {
        return errors;
    }

    let citations = match ledger.get_citations(path) {
        Ok(c) => c,
        Err(e) => {
            errors.push(format!("{}: cannot read citations: {}", label, e));
            return errors;
        }
    };

    let missing = match ledger.missing_fields(path) {
        Ok(m) => m,
        Err(e) => {
            errors.push(format!("{}: cannot read citations: {}", label, e));
            return errors;
        }
    };

    for id in ids {
        if let Some(keys) = missing.get(&id) {
            errors.push(format!(
                "{}: citation [{}] is missing required fields: {}",
                label,
                id,
                keys.join(", ")
            ));
        }
        match citations.get(&id) {
            None => errors.push(format!(
                "{}: citation [{}] has no entry in the citation file",
                label, id
            )),
            Some(record) => {
                if record.platform.trim().is_empty() {
                    errors.push(format!("{}: citation [{}] is missing platform", label, id));
                }
                if record.timestamp.trim().is_empty() {
                    errors.push(format!("{}: citation [{}] is missing timestamp", label, id));
                }
            }
        }
    }

    errors
}

/// Markdown-only checks: title, `## Related`, heading syntax.
pub fn validate_markdown(content: &str) -> Vec<String> {
    let mut errors = Vec::new();

    let first = content.lines().find(|l| !l.trim().is_empty());
    match first {
        Some(line) if line.starts_with("# ") && line.len() > 2 => {}
        _ => errors.push("missing title: file must start with '# Title'".to_string()),
    }

    if !content.lines().any(|l| l.trim_end() == RELATED_HEADING) {
        errors.push(format!("missing '{}' section", RELATED_HEADING));
    }

    let mut in_fence = false;
    for (i, line) in content.lines().enumerate() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence || !line.starts_with('#') {
            continue;
        }
        if !is_valid_heading(line) {
            errors.push(format!(
                "invalid heading syntax on line {}: '{}'",
                i + 1,
                line.trim_end()
            ));
        }
    }

    errors
}

fn is_valid_heading(line: &str) -> bool {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if !(1..=6).contains(&hashes) {
        return false;
    }
    let rest = &line[hashes..];
    rest.starts_with(' ') && !rest.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::citations::{CitationLedger, Citations, InMemoryLedger, JsonSidecarLedger};
    use crate::models::CitationRecord;

    #[test]
    fn test_well_formed_markdown() {
        let md = "# Job Search\n\nApplied [1].\n\n## Applications\n\n## Related\n\n";
        assert!(validate_markdown(md).is_empty());
    }

    #[test]
    fn test_missing_title_and_related() {
        let errors = validate_markdown("Some text\n\n## Notes\n");
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("missing title"));
        assert!(errors[1].contains("## Related"));
    }

    #[test]
    fn test_bad_heading_syntax() {
        let errors = validate_markdown("# T\n\n##Broken\n\n####### too deep\n\n## Related\n");
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("line 3"));
    }

    #[test]
    fn test_headings_inside_fences_ignored() {
        let md = "# T\n\n```sh\n#!/bin/sh\n```\n\n## Related\n";
        assert!(validate_markdown(md).is_empty());
    }

    #[test]
    fn test_marker_without_citation() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a.md");
        std::fs::write(&path, "# A\n\nFact [1]. Other [2].\n\n## Related\n").unwrap();

        let ledger = InMemoryLedger::new();
        let mut c = Citations::new();
        c.insert(
            1,
            CitationRecord {
                platform: "Gmail".to_string(),
                timestamp: "2024-01-01T00:00:00Z".to_string(),
                url: None,
                quote: None,
                note: None,
            },
        );
        ledger.add_citations(&path, c).unwrap();

        let errors = validate_note(&path, "a.md", &ledger);
        assert_eq!(errors, vec!["a.md: citation [2] has no entry in the citation file"]);
    }

    #[test]
    fn test_sidecar_entry_missing_url_and_quote() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a.md");
        std::fs::write(&path, "# A\n\nFact [1].\n\n## Related\n").unwrap();
        std::fs::write(
            dir.path().join("a.json"),
            r#"{"1": {"platform": "Gmail", "timestamp": "2024-10-15T00:00:00Z"}}"#,
        )
        .unwrap();

        let errors = validate_note(&path, "a.md", &JsonSidecarLedger::new());
        assert_eq!(
            errors,
            vec!["a.md: citation [1] is missing required fields: url, quote"]
        );
    }

    #[test]
    fn test_sidecar_null_url_and_quote_accepted() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a.md");
        std::fs::write(&path, "# A\n\nFact [1].\n\n## Related\n").unwrap();
        std::fs::write(
            dir.path().join("a.json"),
            r#"{"1": {"platform": "Gmail", "timestamp": "2024-10-15T00:00:00Z", "url": null, "quote": null}}"#,
        )
        .unwrap();
        assert!(validate_note(&path, "a.md", &JsonSidecarLedger::new()).is_empty());

        let ledger = JsonSidecarLedger::new();
        let mut c = Citations::new();
        c.insert(
            2,
            CitationRecord {
                platform: "LinkedIn".to_string(),
                timestamp: "2024-10-16T00:00:00Z".to_string(),
                url: None,
                quote: None,
                note: None,
            },
        );
        ledger.add_citations(&path, c).unwrap();
        std::fs::write(&path, "# A\n\nFact [1]. More [2].\n\n## Related\n").unwrap();
        assert!(validate_note(&path, "a.md", &ledger).is_empty());
    }
}
