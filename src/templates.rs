//! # Template rendering for agent parameters.
//!
//! Args, env entries, text files and built-in DSNs may contain placeholders
//! of the form `{{ .key }}` (delimiters are configurable per agent). Text
//! files are rendered first and written to the agent's temporary directory;
//! their absolute paths then become available as `{{ .TextFiles.<name> }}`.
//!
//! ## Rules
//! - An unknown key is an error, never an empty substitution.
//! - Text file names must be plain file names (no separators, no `.`/`..`).
//! - The agent directory is recreated from scratch on every render, so files
//!   from a previous run never survive a restart.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::error::TemplateError;

const DEFAULT_LEFT: &str = "{{";
const DEFAULT_RIGHT: &str = "}}";
const TEXT_FILES_PREFIX: &str = "TextFiles.";

/// Renders templates of one agent.
#[derive(Debug)]
pub struct TemplateRenderer {
    dir: PathBuf,
    params: BTreeMap<String, String>,
    pattern: Regex,
}

impl TemplateRenderer {
    /// Creates a renderer writing text files into `dir`.
    ///
    /// `None` delimiters fall back to `{{` and `}}`.
    pub fn new(
        dir: impl Into<PathBuf>,
        params: BTreeMap<String, String>,
        left: Option<&str>,
        right: Option<&str>,
    ) -> Result<Self, TemplateError> {
        let left = left.filter(|s| !s.is_empty()).unwrap_or(DEFAULT_LEFT);
        let right = right.filter(|s| !s.is_empty()).unwrap_or(DEFAULT_RIGHT);
        if left == right {
            return Err(TemplateError::InvalidDelimiters {
                left: left.to_string(),
                right: right.to_string(),
            });
        }

        let expr = format!(
            r"{}\s*\.([A-Za-z0-9_.]+)\s*{}",
            regex::escape(left),
            regex::escape(right)
        );
        let pattern = Regex::new(&expr).map_err(|_| TemplateError::InvalidDelimiters {
            left: left.to_string(),
            right: right.to_string(),
        })?;

        Ok(Self {
            dir: dir.into(),
            params,
            pattern,
        })
    }

    /// Directory text files are written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Renders and writes `files`, then exposes their paths as `TextFiles.<name>`.
    ///
    /// Returns the written paths keyed by file name. Nothing is written for an
    /// empty map.
    pub fn render_files(
        &mut self,
        files: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, PathBuf>, TemplateError> {
        if files.is_empty() {
            return Ok(BTreeMap::new());
        }
        for name in files.keys() {
            check_file_name(name)?;
        }

        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(TemplateError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        }
        fs::create_dir_all(&self.dir).map_err(|source| TemplateError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut written = BTreeMap::new();
        for (name, content) in files {
            let rendered = self.render(name, content)?;
            let path = self.dir.join(name);
            fs::write(&path, rendered).map_err(|source| TemplateError::Io {
                path: path.clone(),
                source,
            })?;
            written.insert(name.clone(), path);
        }

        for (name, path) in &written {
            self.params.insert(
                format!("{TEXT_FILES_PREFIX}{name}"),
                path.to_string_lossy().into_owned(),
            );
        }
        Ok(written)
    }

    /// Renders a single template; `name` only labels errors.
    pub fn render(&self, name: &str, template: &str) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(template.len());
        let mut last = 0;

        for caps in self.pattern.captures_iter(template) {
            let (Some(whole), Some(key)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let value = self
                .params
                .get(key.as_str())
                .ok_or_else(|| TemplateError::MissingKey {
                    template: name.to_string(),
                    key: key.as_str().to_string(),
                })?;
            out.push_str(&template[last..whole.start()]);
            out.push_str(value);
            last = whole.end();
        }

        out.push_str(&template[last..]);
        Ok(out)
    }

    /// Renders every entry of `templates`, labelling errors with `label`.
    pub fn render_all(&self, label: &str, templates: &[String]) -> Result<Vec<String>, TemplateError> {
        templates.iter().map(|t| self.render(label, t)).collect()
    }
}

fn check_file_name(name: &str) -> Result<(), TemplateError> {
    let unsafe_name = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if unsafe_name {
        return Err(TemplateError::UnsafeFileName(name.to_string()));
    }
    Ok(())
}
