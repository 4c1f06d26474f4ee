//! Workflow discovery and parsing.
//!
//! Workflows come either from glob patterns evaluated relative to the
//! invocation directory or from a single inline document. Discovered files are
//! ordered by their relative path; files outside the invocation directory
//! (relative paths starting with `..`) run last, ordered by absolute path.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use pollflow_types::WorkflowDefinition;
use pollflow_util::path_processing::{is_parent_relative, normalize_path, relative_to};

use crate::error::EngineError;

/// Relative path reported for inline workflow content.
pub const INLINE_WORKFLOW_PATH: &str = "inline.yml";

/// A workflow to run, not yet parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowSource {
    pub path: PathBuf,
    /// Forward-slash path relative to the invocation directory.
    pub relative_path: String,
    /// Inline document text; `None` for files read from `path`.
    pub content: Option<String>,
}

impl WorkflowSource {
    fn file(path: PathBuf, cwd: &Path) -> Self {
        let relative_path = relative_to(&path, cwd);
        Self {
            path,
            relative_path,
            content: None,
        }
    }

    fn inline(content: String, cwd: &Path) -> Self {
        Self {
            path: cwd.join(INLINE_WORKFLOW_PATH),
            relative_path: INLINE_WORKFLOW_PATH.to_string(),
            content: Some(content),
        }
    }

    /// Directory the workflow lives in.
    pub fn directory(&self) -> PathBuf {
        self.path.parent().map(Path::to_path_buf).unwrap_or_default()
    }

    /// Parses the document.
    pub fn load(&self) -> Result<WorkflowDefinition> {
        match &self.content {
            Some(content) => parse_workflow_content(content).context("failed to parse inline workflow"),
            None => parse_workflow_file(&self.path),
        }
    }
}

/// Resolves the workflows to run. Supplying both patterns and content is an error.
pub fn discover_workflows(patterns: &[String], content: Option<&str>, cwd: &Path) -> Result<Vec<WorkflowSource>> {
    let cwd = normalize_path(cwd);
    if let Some(content) = content {
        if !patterns.is_empty() {
            return Err(EngineError::ConflictingInputs.into());
        }
        return Ok(vec![WorkflowSource::inline(content.to_string(), &cwd)]);
    }

    let mut seen = HashSet::new();
    let mut sources = Vec::new();
    for pattern in patterns {
        let absolute = normalize_path(&cwd.join(pattern)).to_string_lossy().to_string();
        let entries = glob::glob(&absolute).with_context(|| format!("invalid workflow pattern '{pattern}'"))?;
        for entry in entries {
            let path = match entry {
                Ok(path) => normalize_path(&path),
                Err(error) => {
                    warn!(pattern = %pattern, error = %error, "skipping unreadable path");
                    continue;
                }
            };
            if path.is_file() && seen.insert(path.clone()) {
                sources.push(WorkflowSource::file(path, &cwd));
            }
        }
    }

    sort_sources(&mut sources);
    debug!(count = sources.len(), "discovered workflows");
    Ok(sources)
}

/// Local workflows by relative path, then outside ones by absolute path.
pub fn sort_sources(sources: &mut [WorkflowSource]) {
    sources.sort_by(|left, right| {
        let left_outside = is_parent_relative(&left.relative_path);
        let right_outside = is_parent_relative(&right.relative_path);
        left_outside.cmp(&right_outside).then_with(|| {
            if left_outside {
                left.path.cmp(&right.path)
            } else {
                left.relative_path.cmp(&right.relative_path)
            }
        })
    });
}

/// Reads and parses a YAML (or JSON) workflow file.
pub fn parse_workflow_file(path: &Path) -> Result<WorkflowDefinition> {
    let content = fs::read_to_string(path).with_context(|| format!("failed to read workflow {}", path.display()))?;
    parse_workflow_content(&content).with_context(|| format!("failed to parse workflow {}", path.display()))
}

/// Parses workflow text. JSON documents are valid YAML and take the same path.
pub fn parse_workflow_content(content: &str) -> Result<WorkflowDefinition> {
    if content.trim().is_empty() {
        return Ok(WorkflowDefinition::default());
    }
    Ok(serde_yaml::from_str(content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, relative: &str, body: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn discovers_and_orders_by_relative_path() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("project");
        write(&root, "workflows/b.yml", "sources: []");
        write(&root, "workflows/a.yaml", "sources: []");
        write(&root, "workflows/nested/c.yml", "sources: []");
        write(temp.path(), "shared/z.yml", "sources: []");
        write(temp.path(), "other/y.yml", "sources: []");

        let patterns = vec![
            "workflows/**/*.yml".to_string(),
            "workflows/*.yaml".to_string(),
            "../shared/*.yml".to_string(),
            "../other/*.yml".to_string(),
            "workflows/b.yml".to_string(),
        ];
        let sources = discover_workflows(&patterns, None, &root).unwrap();
        let relative: Vec<&str> = sources.iter().map(|source| source.relative_path.as_str()).collect();
        assert_eq!(
            relative,
            vec!["workflows/a.yaml", "workflows/b.yml", "workflows/nested/c.yml", "../other/y.yml", "../shared/z.yml"]
        );
    }

    #[test]
    fn inline_content_excludes_patterns() {
        let temp = tempfile::tempdir().unwrap();
        let sources = discover_workflows(&[], Some("sources: []"), temp.path()).unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].relative_path, INLINE_WORKFLOW_PATH);
        assert!(sources[0].load().unwrap().sources.is_empty());

        let error = discover_workflows(&["*.yml".to_string()], Some("sources: []"), temp.path()).unwrap_err();
        assert!(matches!(error.downcast_ref::<EngineError>(), Some(EngineError::ConflictingInputs)));
    }

    #[test]
    fn parse_errors_name_the_file() {
        let temp = tempfile::tempdir().unwrap();
        write(temp.path(), "broken.yml", "sources: [");
        let error = parse_workflow_file(&temp.path().join("broken.yml")).unwrap_err();
        assert!(error.to_string().contains("broken.yml"));
    }

    #[test]
    fn json_documents_parse() {
        let workflow = parse_workflow_content(r#"{ "sources": [{ "use": "echo", "args": [[]] }], "limit": 3 }"#).unwrap();
        assert_eq!(workflow.sources.len(), 1);
        assert_eq!(workflow.general.limit, Some(serde_json::json!(3)));
    }
}
