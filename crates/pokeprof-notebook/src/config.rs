use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::model::{DocumentType, RetrievalBudget};

pub const DEFAULT_PERSONA: &str = "judge";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Application configuration loaded explicitly from environment variables.
///
/// Only the index directory is required. Redis, the domain config file, errata and
/// prompts are optional; when absent the server runs with built-in defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory the file index store reads and writes `{document_name}.json` in.
    pub index_dir: PathBuf,
    pub domain_config_path: Option<PathBuf>,
    pub errata_path: Option<PathBuf>,
    /// Directory of `{persona}_system.txt` prompt files.
    pub prompts_dir: Option<PathBuf>,
    /// Redis connection URL. `None` disables caching and the Redis index mirror.
    pub redis_url: Option<String>,
    pub oracle_model: String,
    pub synth_model: String,
    /// Skip the oracle entirely and rank with keyword overlap only.
    pub oracle_disabled: bool,
    pub oracle_timeout: Duration,
    pub synth_timeout: Duration,
    pub max_concurrent_oracle_calls: usize,
    pub budget: RetrievalBudget,
    pub http_listen_addr: Option<String>,
    pub mcp_tcp_listen_addr: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `POKEPROF_INDEX_DIR`: directory holding built indexes
    ///
    /// Optional:
    /// - `POKEPROF_DOMAIN_CONFIG`, `POKEPROF_ERRATA_PATH`, `POKEPROF_PROMPTS_DIR`
    /// - `REDIS_URL`: Redis connection string (omit to disable caching)
    /// - `POKEPROF_ORACLE_MODEL`, `POKEPROF_SYNTH_MODEL`, `POKEPROF_ORACLE_DISABLED`
    /// - `POKEPROF_ORACLE_TIMEOUT_SECS`, `POKEPROF_SYNTH_TIMEOUT_SECS`
    /// - `POKEPROF_MAX_CONCURRENT_ORACLE_CALLS`
    /// - `POKEPROF_MAX_SECTIONS`, `POKEPROF_MAX_DEPTH`, `POKEPROF_MAX_ORACLE_CALLS`
    /// - `POKEPROF_HTTP_LISTEN_ADDR`, `MCP_TCP_LISTEN_ADDR`
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let index_dir = non_empty("POKEPROF_INDEX_DIR").map(PathBuf::from).ok_or_else(|| {
            AppError::Config("POKEPROF_INDEX_DIR environment variable is required".to_string())
        })?;

        let defaults = RetrievalBudget::default();
        let budget = RetrievalBudget {
            max_sections: parse_var(&non_empty, "POKEPROF_MAX_SECTIONS", defaults.max_sections)?,
            max_depth: parse_var(&non_empty, "POKEPROF_MAX_DEPTH", defaults.max_depth)?,
            max_oracle_calls: parse_var(
                &non_empty,
                "POKEPROF_MAX_ORACLE_CALLS",
                defaults.max_oracle_calls,
            )?,
        };
        if budget.max_sections == 0 {
            return Err(AppError::Config(
                "POKEPROF_MAX_SECTIONS must be at least 1".to_string(),
            ));
        }

        let max_concurrent_oracle_calls: usize =
            parse_var(&non_empty, "POKEPROF_MAX_CONCURRENT_ORACLE_CALLS", 4)?;
        if max_concurrent_oracle_calls == 0 {
            return Err(AppError::Config(
                "POKEPROF_MAX_CONCURRENT_ORACLE_CALLS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            index_dir,
            domain_config_path: non_empty("POKEPROF_DOMAIN_CONFIG").map(PathBuf::from),
            errata_path: non_empty("POKEPROF_ERRATA_PATH").map(PathBuf::from),
            prompts_dir: non_empty("POKEPROF_PROMPTS_DIR").map(PathBuf::from),
            redis_url: non_empty("REDIS_URL"),
            oracle_model: non_empty("POKEPROF_ORACLE_MODEL")
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            synth_model: non_empty("POKEPROF_SYNTH_MODEL")
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            oracle_disabled: parse_var(&non_empty, "POKEPROF_ORACLE_DISABLED", false)?,
            oracle_timeout: Duration::from_secs(parse_var(
                &non_empty,
                "POKEPROF_ORACLE_TIMEOUT_SECS",
                20,
            )?),
            synth_timeout: Duration::from_secs(parse_var(
                &non_empty,
                "POKEPROF_SYNTH_TIMEOUT_SECS",
                120,
            )?),
            max_concurrent_oracle_calls,
            budget,
            http_listen_addr: non_empty("POKEPROF_HTTP_LISTEN_ADDR"),
            mcp_tcp_listen_addr: non_empty("MCP_TCP_LISTEN_ADDR"),
        })
    }

    /// Domain config from `POKEPROF_DOMAIN_CONFIG`, or the built-in tables.
    pub fn load_domain(&self) -> Result<DomainConfig, AppError> {
        match &self.domain_config_path {
            Some(path) => DomainConfig::from_file(path),
            None => Ok(DomainConfig::default()),
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("{key}={raw:?} is invalid: {e}"))),
        None => Ok(default),
    }
}

/// One source document the update service knows how to (re)build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSource {
    pub name: String,
    pub document_type: DocumentType,
    /// Intermediate markdown produced by ingestion. Relative paths resolve against the
    /// directory of the domain config file.
    pub markdown_path: PathBuf,
}

/// Domain tables: which documents exist, which keywords point at which document
/// types, and how each persona biases routing and sizes its answer context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    pub domain_name: String,
    pub documents: Vec<DocumentSource>,
    /// Lower-cased keyword or phrase → document types it points at.
    pub routing_hints: BTreeMap<String, Vec<DocumentType>>,
    pub personas: Vec<String>,
    pub default_persona: String,
    /// Persona → document type name → additive routing bias.
    pub persona_bias: BTreeMap<String, BTreeMap<String, f32>>,
    /// Persona → context token budget for synthesis.
    pub token_budgets: BTreeMap<String, usize>,
    /// Expected shape of section numbers, checked by tree validation after a build.
    pub section_pattern: Option<String>,
}

impl DomainConfig {
    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("cannot read domain config {}: {e}", path.display()))
        })?;
        let mut config: DomainConfig = serde_json::from_str(&raw).map_err(|e| {
            AppError::Config(format!("invalid domain config {}: {e}", path.display()))
        })?;
        if let Some(base) = path.parent() {
            for doc in &mut config.documents {
                if doc.markdown_path.is_relative() {
                    doc.markdown_path = base.join(&doc.markdown_path);
                }
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let mut names = std::collections::HashSet::new();
        for doc in &self.documents {
            if doc.name.trim().is_empty() {
                return Err(AppError::Config("document with empty name".to_string()));
            }
            if !names.insert(doc.name.as_str()) {
                return Err(AppError::Config(format!("duplicate document name: {}", doc.name)));
            }
        }
        if !self.personas.iter().any(|p| p == &self.default_persona) {
            return Err(AppError::Config(format!(
                "default persona '{}' is not in the persona list",
                self.default_persona
            )));
        }
        for biases in self.persona_bias.values() {
            for type_name in biases.keys() {
                DocumentType::from_str(type_name)?;
            }
        }
        if let Some(pattern) = &self.section_pattern {
            regex::Regex::new(pattern)
                .map_err(|e| AppError::Config(format!("invalid section_pattern: {e}")))?;
        }
        Ok(())
    }

    /// Canonical persona name; unknown or empty personas map to the default.
    pub fn resolve_persona(&self, persona: Option<&str>) -> String {
        let wanted = persona.map(|p| p.trim().to_lowercase()).unwrap_or_default();
        if self.personas.iter().any(|p| *p == wanted) {
            wanted
        } else {
            self.default_persona.clone()
        }
    }

    pub fn persona_bias_for(&self, persona: &str, document_type: DocumentType) -> f32 {
        self.persona_bias
            .get(persona)
            .and_then(|biases| biases.get(document_type.as_str()))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn token_budget(&self, persona: &str) -> usize {
        self.token_budgets
            .get(persona)
            .or_else(|| self.token_budgets.get(&self.default_persona))
            .copied()
            .unwrap_or(4000)
    }

    pub fn section_regex(&self) -> Option<regex::Regex> {
        self.section_pattern
            .as_deref()
            .and_then(|p| regex::Regex::new(p).ok())
    }
}

impl Default for DomainConfig {
    fn default() -> Self {
        use DocumentType::*;

        let hints: &[(&str, &[DocumentType])] = &[
            ("prize", &[Rulebook]),
            ("setup", &[Rulebook]),
            ("mulligan", &[Rulebook]),
            ("opening hand", &[Rulebook]),
            ("turn", &[Rulebook]),
            ("attack", &[Rulebook, CardDatabase]),
            ("ability", &[Rulebook, CardDatabase]),
            ("energy", &[Rulebook]),
            ("retreat", &[Rulebook]),
            ("bench", &[Rulebook]),
            ("active pokemon", &[Rulebook]),
            ("evolve", &[Rulebook]),
            ("evolution", &[Rulebook]),
            ("knock out", &[Rulebook]),
            ("knocked out", &[Rulebook]),
            ("damage", &[Rulebook]),
            ("weakness", &[Rulebook]),
            ("resistance", &[Rulebook]),
            ("special condition", &[Rulebook]),
            ("poisoned", &[Rulebook]),
            ("burned", &[Rulebook]),
            ("asleep", &[Rulebook]),
            ("paralyzed", &[Rulebook]),
            ("confused", &[Rulebook]),
            ("stadium", &[Rulebook]),
            ("supporter", &[Rulebook]),
            ("pokemon tool", &[Rulebook]),
            ("vstar power", &[Rulebook]),
            ("rule box", &[Rulebook]),
            ("penalty", &[PenaltyGuidelines]),
            ("infraction", &[PenaltyGuidelines]),
            ("warning", &[PenaltyGuidelines]),
            ("caution", &[PenaltyGuidelines]),
            ("game loss", &[PenaltyGuidelines]),
            ("match loss", &[PenaltyGuidelines]),
            ("disqualif", &[PenaltyGuidelines]),
            ("marked card", &[PenaltyGuidelines]),
            ("slow play", &[PenaltyGuidelines]),
            ("deck error", &[PenaltyGuidelines]),
            ("drawing extra", &[PenaltyGuidelines]),
            ("unsporting", &[PenaltyGuidelines]),
            ("judge", &[PenaltyGuidelines]),
            ("legal", &[LegalCardList]),
            ("banned", &[LegalCardList]),
            ("standard", &[LegalCardList]),
            ("expanded", &[LegalCardList]),
            ("rotation", &[LegalCardList]),
            ("regulation mark", &[LegalCardList]),
            ("format", &[LegalCardList]),
            ("ruling", &[RulingsCompendium]),
            ("compendium", &[RulingsCompendium]),
            ("interact", &[RulingsCompendium]),
            ("card text", &[CardDatabase]),
            ("errata", &[CardDatabase]),
            ("hp", &[CardDatabase]),
        ];

        let personas = ["judge", "professor", "player"];
        let bias: &[(&str, &[(DocumentType, f32)])] = &[
            ("judge", &[(Rulebook, 0.5), (PenaltyGuidelines, 0.5)]),
            ("professor", &[(Rulebook, 0.5), (PenaltyGuidelines, 0.3)]),
            ("player", &[(Rulebook, 0.5), (PenaltyGuidelines, -0.5)]),
        ];

        Self {
            domain_name: "Pokemon TCG".to_string(),
            documents: Vec::new(),
            routing_hints: hints
                .iter()
                .map(|(kw, types)| (kw.to_string(), types.to_vec()))
                .collect(),
            personas: personas.iter().map(|p| p.to_string()).collect(),
            default_persona: DEFAULT_PERSONA.to_string(),
            persona_bias: bias
                .iter()
                .map(|(persona, entries)| {
                    let map = entries
                        .iter()
                        .map(|(t, b)| (t.as_str().to_string(), *b))
                        .collect();
                    (persona.to_string(), map)
                })
                .collect(),
            token_budgets: [("judge", 6000), ("professor", 4000), ("player", 3000)]
                .iter()
                .map(|(p, b)| (p.to_string(), *b))
                .collect(),
            section_pattern: Some(r"^\d{1,3}(\.\d+)*(\.[a-z](\.\d+)*)?$".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn index_dir_is_required() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(err.to_string().contains("POKEPROF_INDEX_DIR"));
    }

    #[test]
    fn defaults_apply() {
        let config = Config::from_lookup(lookup(&[("POKEPROF_INDEX_DIR", "/tmp/idx")])).unwrap();
        assert_eq!(config.index_dir, PathBuf::from("/tmp/idx"));
        assert_eq!(config.budget, RetrievalBudget::default());
        assert_eq!(config.oracle_timeout, Duration::from_secs(20));
        assert_eq!(config.synth_timeout, Duration::from_secs(120));
        assert_eq!(config.max_concurrent_oracle_calls, 4);
        assert_eq!(config.oracle_model, "gpt-4o-mini");
        assert!(!config.oracle_disabled);
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn malformed_numbers_are_config_errors() {
        let err = Config::from_lookup(lookup(&[
            ("POKEPROF_INDEX_DIR", "/tmp/idx"),
            ("POKEPROF_MAX_DEPTH", "deep"),
        ]))
        .unwrap_err();
        assert!(matches!(err, AppError::Config(ref m) if m.contains("POKEPROF_MAX_DEPTH")));
    }

    #[test]
    fn zero_concurrency_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("POKEPROF_INDEX_DIR", "/tmp/idx"),
            ("POKEPROF_MAX_CONCURRENT_ORACLE_CALLS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn default_domain_is_valid() {
        let domain = DomainConfig::default();
        domain.validate().unwrap();
        assert_eq!(domain.token_budget("judge"), 6000);
        assert_eq!(domain.token_budget("player"), 3000);
        assert_eq!(domain.persona_bias_for("player", DocumentType::PenaltyGuidelines), -0.5);
        assert!(domain.routing_hints["prize"].contains(&DocumentType::Rulebook));
    }

    #[test]
    fn unknown_persona_falls_back_to_default() {
        let domain = DomainConfig::default();
        assert_eq!(domain.resolve_persona(Some("Professor")), "professor");
        assert_eq!(domain.resolve_persona(Some("wizard")), "judge");
        assert_eq!(domain.resolve_persona(None), "judge");
    }

    #[test]
    fn domain_file_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("domain.json");
        std::fs::write(
            &path,
            r#"{
                "domain_name": "Test",
                "documents": [
                    {"name": "rulebook", "document_type": "rulebook", "markdown_path": "md/rulebook.md"}
                ]
            }"#,
        )
        .unwrap();
        let domain = DomainConfig::from_file(&path).unwrap();
        assert_eq!(domain.domain_name, "Test");
        assert_eq!(domain.documents[0].markdown_path, dir.path().join("md/rulebook.md"));
        // Omitted tables keep the built-in defaults.
        assert_eq!(domain.default_persona, "judge");
    }

    #[test]
    fn duplicate_document_names_rejected() {
        let mut domain = DomainConfig::default();
        let doc = DocumentSource {
            name: "rulebook".to_string(),
            document_type: DocumentType::Rulebook,
            markdown_path: PathBuf::from("a.md"),
        };
        domain.documents = vec![doc.clone(), doc];
        assert!(domain.validate().is_err());
    }
}
