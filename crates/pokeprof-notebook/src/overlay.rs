/// Errata overlay: rewrites or annotates retrieved sections with published corrections.
///
/// Entries are keyed by `(document_name, section_number)`, or by
/// `(document_name, lower-cased title)` for untitled-number nodes such as cards.
/// Rendering always starts from `source_content`, so applying the same set twice
/// gives the same result as applying it once.
use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::AppError;
use crate::model::{AppliedErrata, ErrataMode, RetrievedSection};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrataEntry {
    pub document_name: String,
    #[serde(default)]
    pub section_number: String,
    /// Used when the target node has no section number (card entries).
    #[serde(default)]
    pub title: Option<String>,
    pub mode: ErrataMode,
    /// Replacement text, or the note appended in annotate mode.
    pub text: String,
    /// Superseded wording, shown in annotations when present.
    #[serde(default)]
    pub old_text: Option<String>,
    #[serde(default)]
    pub source: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrataFile {
    pub entries: Vec<ErrataEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct ErrataSet {
    by_section: HashMap<(String, String), ErrataEntry>,
    by_title: HashMap<(String, String), ErrataEntry>,
}

impl ErrataSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Later entries with the same key replace earlier ones. Entries with neither a
    /// section number nor a title are skipped.
    pub fn from_entries(entries: Vec<ErrataEntry>) -> Self {
        let mut set = Self::default();
        for entry in entries {
            let document = entry.document_name.clone();
            let section = entry.section_number.trim().to_string();
            if !section.is_empty() {
                set.by_section.insert((document, section), entry);
            } else if let Some(title) = entry.title.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
                set.by_title.insert((document, title.to_lowercase()), entry);
            } else {
                warn!(document = %entry.document_name, "skipping errata entry without section number or title");
            }
        }
        set
    }

    pub fn load(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("cannot read errata file {}: {e}", path.display()))
        })?;
        let file: ErrataFile = serde_json::from_str(&raw).map_err(|e| {
            AppError::Config(format!("invalid errata file {}: {e}", path.display()))
        })?;
        let set = Self::from_entries(file.entries);
        info!(path = %path.display(), entries = set.len(), "errata loaded");
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.by_section.len() + self.by_title.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lookup(&self, section: &RetrievedSection) -> Option<&ErrataEntry> {
        if !section.section_number.is_empty() {
            if let Some(entry) = self
                .by_section
                .get(&(section.document_name.clone(), section.section_number.clone()))
            {
                return Some(entry);
            }
        }
        self.by_title.get(&(
            section.document_name.clone(),
            section.title.trim().to_lowercase(),
        ))
    }

    /// Rewrite `sections`, keeping their order; unmatched sections pass through with
    /// their stored content.
    pub fn apply(&self, sections: Vec<RetrievedSection>) -> Vec<RetrievedSection> {
        sections
            .into_iter()
            .map(|mut section| {
                match self.lookup(&section) {
                    Some(entry) => {
                        section.content = render(&section.source_content, entry);
                        section.errata = Some(AppliedErrata {
                            mode: entry.mode,
                            source: entry.source.clone(),
                        });
                    }
                    None => {
                        section.content = section.source_content.clone();
                        section.errata = None;
                    }
                }
                section
            })
            .collect()
    }
}

fn render(source_content: &str, entry: &ErrataEntry) -> String {
    match entry.mode {
        ErrataMode::Replace => entry.text.clone(),
        ErrataMode::Annotate => {
            let source = if entry.source.is_empty() {
                "errata".to_string()
            } else {
                entry.source.clone()
            };
            let mut note = format!("{}\n\n> Errata ({source}): {}", source_content.trim_end(), entry.text);
            if let Some(old) = entry.old_text.as_deref().filter(|o| !o.is_empty()) {
                note.push_str(&format!("\n> Previously: {old}"));
            }
            note
        }
    }
}
