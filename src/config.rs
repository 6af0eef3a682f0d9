use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub repair: RepairConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Where per-knowledge-base artifact directories live. Every component
/// receives this explicitly; there is no process-wide path convention.
#[derive(Debug, Deserialize, Clone)]
pub struct ArtifactsConfig {
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    700
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Knowledge-base inference policy for orphaned chunks: document-id ranges
/// agreed upon at deployment time. A heuristic of last resort — every use
/// is flagged in the repair report, never silently treated as ground truth.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RepairConfig {
    #[serde(default)]
    pub kb_ranges: Vec<KbRange>,
    #[serde(default)]
    pub default_kb_id: Option<i64>,
}

/// Documents with `id <= max_doc_id` (and above any preceding range) are
/// assigned to `kb_id`.
#[derive(Debug, Deserialize, Clone)]
pub struct KbRange {
    pub max_doc_id: i64,
    pub kb_id: i64,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }

    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() && config.embedding.provider != "fixture" {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "fixture" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or fixture.",
            other
        ),
    }

    // Validate repair ranges: ascending and unambiguous
    let mut prev_max = i64::MIN;
    for range in &config.repair.kb_ranges {
        if range.max_doc_id <= prev_max {
            anyhow::bail!(
                "repair.kb_ranges must be sorted by strictly increasing max_doc_id (got {})",
                range.max_doc_id
            );
        }
        prev_max = range.max_doc_id;
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("kbx.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_minimal_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(
            tmp.path(),
            r#"
[db]
path = "kb.sqlite"

[artifacts]
root = "data/knowledge_bases"
"#,
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.embedding.provider, "disabled");
        assert_eq!(cfg.chunking.max_tokens, 700);
        assert!(cfg.repair.kb_ranges.is_empty());
        assert!(cfg.repair.default_kb_id.is_none());
    }

    #[test]
    fn test_fixture_provider_needs_only_dims() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(
            tmp.path(),
            r#"
[db]
path = "kb.sqlite"

[artifacts]
root = "data/knowledge_bases"

[embedding]
provider = "fixture"
dims = 32
"#,
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.embedding.dims, Some(32));
    }

    #[test]
    fn test_openai_requires_model() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(
            tmp.path(),
            r#"
[db]
path = "kb.sqlite"

[artifacts]
root = "data"

[embedding]
provider = "openai"
dims = 1536
"#,
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_unsorted_ranges_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(
            tmp.path(),
            r#"
[db]
path = "kb.sqlite"

[artifacts]
root = "data"

[[repair.kb_ranges]]
max_doc_id = 14
kb_id = 2

[[repair.kb_ranges]]
max_doc_id = 7
kb_id = 1
"#,
        );
        assert!(load_config(&path).is_err());
    }
}
