use std::path::{Component, Path, PathBuf};

use dirs_next::home_dir;

pub fn expand_tilde(path: &str) -> PathBuf {
    let p = path.trim();
    if p == "~" {
        return home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = p.strip_prefix("~/") {
        return home_dir().unwrap_or_else(|| PathBuf::from("~")).join(rest);
    }
    if let Some(rest) = p.strip_prefix("~\\") {
        // Windows-style
        return home_dir().unwrap_or_else(|| PathBuf::from("~")).join(rest);
    }
    PathBuf::from(p)
}

/// Lexically normalizes `path` (drops `.` and folds `..` where possible).
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let can_pop = matches!(normalized.components().next_back(), Some(Component::Normal(_)));
                if can_pop {
                    normalized.pop();
                } else {
                    normalized.push("..");
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Expresses `path` relative to `root` using forward slashes.
///
/// Paths outside of `root` are prefixed with as many `..` segments as needed.
pub fn relative_to(path: &Path, root: &Path) -> String {
    let path = normalize_path(path);
    let root = normalize_path(root);

    let path_components: Vec<Component> = path.components().collect();
    let root_components: Vec<Component> = root.components().collect();
    let shared = path_components
        .iter()
        .zip(root_components.iter())
        .take_while(|(left, right)| left == right)
        .count();

    let mut segments: Vec<String> = Vec::new();
    for _ in shared..root_components.len() {
        segments.push("..".to_string());
    }
    for component in &path_components[shared..] {
        segments.push(component.as_os_str().to_string_lossy().to_string());
    }
    segments.join("/")
}

/// Returns `true` for relative paths that climb above the invocation root.
pub fn is_parent_relative(relative_path: &str) -> bool {
    relative_path == ".." || relative_path.starts_with("../")
}

/// Storage namespace for a workflow: its relative path without the extension.
pub fn namespace_for(relative_path: &str) -> String {
    let trimmed = relative_path.trim_start_matches("./");
    match trimmed.rfind('.') {
        Some(dot) if dot > 0 && !trimmed[dot..].contains('/') => trimmed[..dot].to_string(),
        _ => trimmed.to_string(),
    }
}
