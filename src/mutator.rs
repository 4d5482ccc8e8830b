//! File mutator: applies one planned [`Edit`] to the markdown tree.
//!
//! | Action | Behavior |
//! |--------|----------|
//! | `create` | write `# Stem` + content + `## Related`; an existing file is appended to instead |
//! | `append` | insert before `## Related`, or at the end of `section` when given |
//! | `update_citation` | add ` [n]` right after the `find` text |
//!
//! Target paths are resolved inside the vault. An `append` to a file that
//! does not exist is redirected to the closest existing file name (fuzzy
//! match) before falling back to creating it. Section names are resolved
//! the same way; a section that cannot be found is created just above
//! `## Related`.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

use crate::fuzzy::{find_best_section_match, find_similar_filename, FILENAME_THRESHOLD, SECTION_THRESHOLD};
use crate::models::{Edit, EditAction};
use crate::vault::{new_file_template, read_text, resolve_in_vault, write_text, RELATED_HEADING};

/// What a single edit did.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedEdit {
    /// Vault-relative path actually written.
    pub file: String,
    pub path: PathBuf,
    pub created: bool,
}

pub struct FileMutator {
    root: PathBuf,
}

impl FileMutator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve where `edit` lands, following fuzzy redirects for appends.
    pub fn target(&self, edit: &Edit) -> Result<(String, PathBuf)> {
        let relative = normalize_note_path(&edit.file);
        let path = resolve_in_vault(&self.root, &relative)?;
        if path.exists() || edit.action == EditAction::Create {
            return Ok((relative, path));
        }

        if let Some(similar) = find_similar_filename(&self.root, &relative, FILENAME_THRESHOLD) {
            tracing::debug!(requested = %relative, resolved = %similar, "fuzzy file match");
            let path = resolve_in_vault(&self.root, &similar)?;
            return Ok((similar, path));
        }
        Ok((relative, path))
    }

    /// Apply `edit`. `marker` is the citation id appended by `update_citation`.
    pub fn apply(&self, edit: &Edit, marker: u32) -> Result<AppliedEdit> {
        let (file, path) = self.target(edit)?;
        let exists = path.is_file();

        match edit.action {
            EditAction::Create | EditAction::Append if !exists => {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "Untitled".to_string());
                let body = match &edit.section {
                    Some(section) => format!("## {}\n\n{}", section.trim(), edit.content.trim()),
                    None => edit.content.trim().to_string(),
                };
                write_text(&path, &new_file_template(&stem, &body))?;
                tracing::info!(file = %file, "created note");
                Ok(AppliedEdit {
                    file,
                    path,
                    created: true,
                })
            }
            EditAction::Create | EditAction::Append => {
                let existing = read_text(&path)?;
                let updated = match &edit.section {
                    Some(section) => insert_into_section(&existing, section, &edit.content),
                    None => insert_before_related(&existing, &edit.content),
                };
                write_text(&path, &updated)?;
                tracing::info!(file = %file, section = ?edit.section, "appended to note");
                Ok(AppliedEdit {
                    file,
                    path,
                    created: false,
                })
            }
            EditAction::UpdateCitation => {
                if !exists {
                    bail!("{}: cannot update citation, file does not exist", file);
                }
                let find = edit
                    .find
                    .as_deref()
                    .filter(|f| !f.trim().is_empty())
                    .with_context(|| format!("{}: update_citation edit has no 'find' text", file))?;
                let existing = read_text(&path)?;
                let updated = append_marker_after(&existing, find, marker)
                    .with_context(|| format!("{}: text to cite not found: {}", file, find))?;
                write_text(&path, &updated)?;
                tracing::info!(file = %file, marker, "added citation to existing text");
                Ok(AppliedEdit {
                    file,
                    path,
                    created: false,
                })
            }
        }
    }
}

/// `career/Job Search` → `career/Job Search.md`; separators normalized.
pub fn normalize_note_path(file: &str) -> String {
    let trimmed = file.trim().replace('\\', "/");
    let trimmed = trimmed.trim_start_matches("./");
    if Path::new(trimmed).extension().is_some() {
        trimmed.to_string()
    } else {
        format!("{}.md", trimmed)
    }
}

/// `(byte offset of line start, heading text)` for every `## ` heading.
fn h2_headings(content: &str) -> Vec<(usize, &str)> {
    let mut offset = 0;
    let mut headings = Vec::new();
    for line in content.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if trimmed.starts_with("##") && !trimmed.starts_with("###") {
            headings.push((offset, trimmed.trim_start_matches('#').trim()));
        }
        offset += line.len();
    }
    headings
}

fn related_offset(content: &str) -> Option<usize> {
    let related = RELATED_HEADING.trim_start_matches('#').trim();
    h2_headings(content)
        .into_iter()
        .find(|(_, text)| text.eq_ignore_ascii_case(related))
        .map(|(offset, _)| offset)
}

fn insert_at(content: &str, at: usize, block: &str) -> String {
    let (before, after) = content.split_at(at);
    let before = before.trim_end();
    let block = block.trim();
    let after = after.trim_start_matches('\n');

    let mut out = String::with_capacity(content.len() + block.len() + 4);
    if !before.is_empty() {
        out.push_str(before);
        out.push_str("\n\n");
    }
    out.push_str(block);
    if after.trim().is_empty() {
        out.push('\n');
    } else {
        out.push_str("\n\n");
        out.push_str(after);
    }
    out
}

/// Insert `block` just above `## Related`, adding the section when missing.
pub fn insert_before_related(content: &str, block: &str) -> String {
    match related_offset(content) {
        Some(at) => insert_at(content, at, block),
        None => format!(
            "{}\n\n{}\n\n{}\n\n",
            content.trim_end(),
            block.trim(),
            RELATED_HEADING
        ),
    }
}

/// Insert `block` at the end of the `##` section best matching `section`.
pub fn insert_into_section(content: &str, section: &str, block: &str) -> String {
    let Some(heading) = find_best_section_match(content, section, SECTION_THRESHOLD) else {
        let new_section = format!("## {}\n\n{}", section.trim(), block.trim());
        return insert_before_related(content, &new_section);
    };

    let headings = h2_headings(content);
    let Some(pos) = headings.iter().position(|(_, text)| *text == heading) else {
        return insert_before_related(content, block);
    };
    let end = headings
        .get(pos + 1)
        .map_or(content.len(), |(offset, _)| *offset);
    insert_at(content, end, block)
}

/// Append ` [marker]` after the first occurrence of `find`.
///
/// A trailing period in the matched text stays after the marker
/// (`Joined Meta.` → `Joined Meta [2].`).
pub fn append_marker_after(content: &str, find: &str, marker: u32) -> Option<String> {
    let find = find.trim();
    let start = content.find(find)?;
    let mut end = start + find.len();
    if find.ends_with('.') {
        end -= 1;
    }
    let mut out = String::with_capacity(content.len() + 6);
    out.push_str(&content[..end]);
    out.push_str(&format!(" [{}]", marker));
    out.push_str(&content[end..]);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Priority;
    use tempfile::TempDir;

    fn edit(file: &str, action: EditAction, content: &str) -> Edit {
        Edit {
            file: file.to_string(),
            priority: Priority::Primary,
            content: content.to_string(),
            action,
            reason: String::new(),
            section: None,
            find: None,
        }
    }

    #[test]
    fn test_create_uses_template() {
        let dir = TempDir::new().unwrap();
        let m = FileMutator::new(dir.path());
        let applied = m
            .apply(&edit("career/Meta.md", EditAction::Create, "Applied to Meta [1]."), 1)
            .unwrap();
        assert!(applied.created);
        let text = std::fs::read_to_string(dir.path().join("career/Meta.md")).unwrap();
        assert_eq!(text, "# Meta\n\nApplied to Meta [1].\n\n## Related\n\n");
    }

    #[test]
    fn test_create_existing_appends() {
        let dir = TempDir::new().unwrap();
        let m = FileMutator::new(dir.path());
        m.apply(&edit("career/Meta", EditAction::Create, "First [1]."), 1)
            .unwrap();
        let second = m
            .apply(&edit("career/Meta.md", EditAction::Create, "Second [2]."), 2)
            .unwrap();
        assert!(!second.created);
        let text = std::fs::read_to_string(dir.path().join("career/Meta.md")).unwrap();
        assert_eq!(
            text,
            "# Meta\n\nFirst [1].\n\nSecond [2].\n\n## Related\n\n"
        );
    }

    #[test]
    fn test_append_goes_before_related() {
        let content = "# Notes\n\nOld.\n\n## Related\n\n- [[Other]]\n";
        let out = insert_before_related(content, "New [1].");
        assert_eq!(out, "# Notes\n\nOld.\n\nNew [1].\n\n## Related\n\n- [[Other]]\n");
    }

    #[test]
    fn test_append_without_related_adds_it() {
        let out = insert_before_related("# Notes\n\nOld.\n", "New.");
        assert_eq!(out, "# Notes\n\nOld.\n\nNew.\n\n## Related\n\n");
    }

    #[test]
    fn test_section_insert_fuzzy() {
        let content = "# Job Search\n\n## Job Applications\n\nApplied to Google.\n\n## Interviews\n\nNone yet.\n\n## Related\n\n";
        let out = insert_into_section(content, "applications", "Applied to Meta [1].");
        assert_eq!(
            out,
            "# Job Search\n\n## Job Applications\n\nApplied to Google.\n\nApplied to Meta [1].\n\n## Interviews\n\nNone yet.\n\n## Related\n\n"
        );
    }

    #[test]
    fn test_missing_section_created_before_related() {
        let content = "# Job Search\n\nIntro.\n\n## Related\n\n";
        let out = insert_into_section(content, "Offers", "Meta offer [1].");
        assert_eq!(
            out,
            "# Job Search\n\nIntro.\n\n## Offers\n\nMeta offer [1].\n\n## Related\n\n"
        );
    }

    #[test]
    fn test_update_citation_marker() {
        let content = "# Meta\n\nInterviewed at Meta on Oct 2 [1].\n\n## Related\n\n";
        let out = append_marker_after(content, "Interviewed at Meta on Oct 2", 2).unwrap();
        assert!(out.contains("Interviewed at Meta on Oct 2 [2] [1]."));

        let out = append_marker_after("Joined Meta.\n", "Joined Meta.", 3).unwrap();
        assert_eq!(out, "Joined Meta [3].\n");

        assert!(append_marker_after(content, "not there", 2).is_none());
    }

    #[test]
    fn test_update_citation_requires_existing_text() {
        let dir = TempDir::new().unwrap();
        let m = FileMutator::new(dir.path());
        m.apply(&edit("career/Meta.md", EditAction::Create, "Joined Meta [1]."), 1)
            .unwrap();

        let mut upd = edit("career/Meta.md", EditAction::UpdateCitation, "");
        upd.find = Some("Joined Meta".to_string());
        m.apply(&upd, 2).unwrap();
        let text = std::fs::read_to_string(dir.path().join("career/Meta.md")).unwrap();
        assert!(text.contains("Joined Meta [2] [1]."));

        upd.find = Some("Left Meta".to_string());
        assert!(m.apply(&upd, 3).is_err());
    }

    #[test]
    fn test_append_redirects_to_similar_file() {
        let dir = TempDir::new().unwrap();
        let m = FileMutator::new(dir.path());
        m.apply(&edit("career/Job Search.md", EditAction::Create, "Start."), 1)
            .unwrap();
        let applied = m
            .apply(&edit("career/job_search.md", EditAction::Append, "More."), 1)
            .unwrap();
        assert_eq!(applied.file, "career/Job Search.md");
        assert!(!dir.path().join("career/job_search.md").exists());
    }

    #[test]
    fn test_traversal_rejected() {
        let dir = TempDir::new().unwrap();
        let m = FileMutator::new(dir.path());
        assert!(m
            .apply(&edit("../outside.md", EditAction::Create, "x"), 1)
            .is_err());
    }

    #[test]
    fn test_normalize_note_path() {
        assert_eq!(normalize_note_path("career/Job Search"), "career/Job Search.md");
        assert_eq!(normalize_note_path("./personal\\Notes.md"), "personal/Notes.md");
    }
}
