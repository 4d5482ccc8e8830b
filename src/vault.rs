//! Vault filesystem layout and safe path handling.
//!
//! A vault is a root folder of category directories (`personal/`,
//! `career/`, ...) holding markdown notes and their JSON citation sidecars.
//! Hidden directories (e.g. `.brainvault/`) hold internal state and are never
//! treated as categories.
//!
//! ```text
//! my-vault/
//! ├── .brainvault/        app.json, data/, logs/, connector state
//! ├── career/
//! │   ├── about.md        folder description, excluded from routing/search
//! │   ├── Job Search.md
//! │   └── Job Search.json citation sidecar
//! └── personal/ ...
//! ```

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Default category folders and their `about.md` descriptions.
pub const DEFAULT_FOLDERS: &[(&str, &str)] = &[
    (
        "personal",
        "Personal information, preferences, and key details about yourself",
    ),
    (
        "career",
        "Professional development, job search, work experience, and career planning",
    ),
    (
        "projects",
        "Personal projects, side work, ideas, and ongoing initiatives",
    ),
    (
        "research",
        "Learning materials, research notes, papers, and technical studies",
    ),
    (
        "social",
        "Social interactions, relationships, networking, and conversations",
    ),
    (
        "finance",
        "Financial decisions, budgets, investments, and money management",
    ),
    (
        "health",
        "Health tracking, fitness goals, wellness practices, and medical information",
    ),
    (
        "learning",
        "Courses, skill development, tutorials, and educational content",
    ),
    (
        "archive",
        "Completed projects, outdated content, and historical information",
    ),
];

pub const ABOUT_FILE: &str = "about.md";
pub const RELATED_HEADING: &str = "## Related";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VaultPathError {
    #[error("Access denied: path escapes the vault: {0}")]
    Escapes(String),
    #[error("Invalid path: {0}")]
    Invalid(String),
}

/// Resolve a vault-relative path to an absolute location inside `root`.
///
/// Rejects absolute paths, `..` components that climb above the root, and
/// existing paths whose canonical form (after symlinks) leaves the vault.
pub fn resolve_in_vault(root: &Path, relative: &str) -> Result<PathBuf, VaultPathError> {
    let trimmed = relative.trim();
    if trimmed.is_empty() {
        return Err(VaultPathError::Invalid("empty path".to_string()));
    }

    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(VaultPathError::Escapes(relative.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(VaultPathError::Escapes(relative.to_string()));
            }
        }
    }

    let mut resolved = root.to_path_buf();
    for part in &parts {
        resolved.push(part);
    }

    if resolved.exists() {
        if let (Ok(canon_root), Ok(canon_path)) = (root.canonicalize(), resolved.canonicalize()) {
            if !canon_path.starts_with(&canon_root) {
                return Err(VaultPathError::Escapes(relative.to_string()));
            }
        }
    }

    Ok(resolved)
}

/// Vault-relative display form with `/` separators.
pub fn relative_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Create the vault skeleton. Existing files are left untouched.
pub fn init_vault(root: &Path, state_dir: &Path, embedding_model: &str) -> Result<Vec<String>> {
    std::fs::create_dir_all(root)
        .with_context(|| format!("Failed to create vault root: {}", root.display()))?;
    std::fs::create_dir_all(state_dir.join("data"))?;
    std::fs::create_dir_all(state_dir.join("logs"))?;

    let app_json = state_dir.join("app.json");
    if !app_json.exists() {
        let app = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "vault_path": root.display().to_string(),
            "created": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "settings": {
                "default_folders": DEFAULT_FOLDERS.iter().map(|(f, _)| *f).collect::<Vec<_>>(),
                "embedding_model": embedding_model,
            }
        });
        std::fs::write(&app_json, serde_json::to_string_pretty(&app)?)?;
    }

    let mut created = Vec::new();
    for (folder, description) in DEFAULT_FOLDERS {
        let dir = root.join(folder);
        std::fs::create_dir_all(&dir)?;
        let about = dir.join(ABOUT_FILE);
        if !about.exists() {
            std::fs::write(&about, about_template(folder, description))?;
        }
        created.push(folder.to_string());
    }

    Ok(created)
}

fn about_template(folder: &str, description: &str) -> String {
    let mut title = folder.to_string();
    if let Some(first) = title.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    format!(
        "# {}\n\n{}\n\n---\n\n*This folder was created automatically. You can edit or delete this about.md file.*\n",
        title, description
    )
}

/// Skeleton for a note created on first write.
pub fn new_file_template(stem: &str, content: &str) -> String {
    format!("# {}\n\n{}\n\n{}\n\n", stem, content.trim(), RELATED_HEADING)
}

#[derive(Debug, Clone, Serialize)]
pub struct VaultFileInfo {
    pub folder: String,
    pub filename: String,
    pub relative_path: String,
    /// First five non-empty lines.
    pub preview: String,
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Markdown notes under the category folders, sorted by relative path.
pub fn list_vault_files(root: &Path, include_about: bool) -> Result<Vec<VaultFileInfo>> {
    let mut files = Vec::new();
    if !root.is_dir() {
        return Ok(files);
    }

    let walker = WalkDir::new(root)
        .min_depth(2)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(&e.file_name().to_string_lossy()));

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unreadable vault entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let filename = entry.file_name().to_string_lossy().to_string();
        if !include_about && filename.eq_ignore_ascii_case(ABOUT_FILE) {
            continue;
        }

        let relative = relative_path(root, path);
        let folder = relative.split('/').next().unwrap_or_default().to_string();
        let preview = std::fs::read_to_string(path)
            .map(|c| {
                c.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .take(5)
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        files.push(VaultFileInfo {
            folder,
            filename,
            relative_path: relative,
            preview,
        });
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(files)
}

#[derive(Debug, Clone, Serialize)]
pub struct DirEntryInfo {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
}

/// Immediate children of a vault directory, directories first.
pub fn list_dir(root: &Path, relative: Option<&str>) -> Result<Vec<DirEntryInfo>> {
    let dir = match relative.filter(|r| !r.trim().is_empty()) {
        Some(rel) => resolve_in_vault(root, rel)?,
        None => root.to_path_buf(),
    };

    let mut entries = Vec::new();
    for entry in std::fs::read_dir(&dir)
        .with_context(|| format!("Failed to list directory: {}", dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if is_hidden(&name) {
            continue;
        }
        let is_dir = entry.file_type()?.is_dir();
        entries.push(DirEntryInfo {
            path: relative_path(root, &entry.path()),
            name,
            is_dir,
        });
    }

    entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
    Ok(entries)
}

pub fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// Overwrite `path`, creating parent directories as needed.
pub fn write_text(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}
