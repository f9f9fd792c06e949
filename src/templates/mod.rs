//! Versioned prompt-template catalog and renderer for `PrepareSystemPrompt`
//! and the Turn-1/Turn-2 user-message stages (spec §4.5, §9).
//!
//! Templates live on disk under `TEMPLATE_BASE_PATH/<name>/<version>/template.hbs`,
//! one subdirectory per semver version. [`TemplateCatalog::render`] resolves
//! the highest version for a name, renders it with Handlebars in strict mode
//! (so an unbound variable fails the render instead of emitting an empty
//! string), and caches the loaded source behind a read-mostly lock — the
//! "single-writer initialization barrier" spec §9 calls for: readers take
//! the catalog's `RwLock` for reads once a template is warm, and only the
//! first caller to miss pays the write-lock/disk-read cost.

use async_trait::async_trait;
use handlebars::Handlebars;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::{LlmRequestConfig, ThinkingType};
use crate::error::{Error, Result};

/// One resolved, cached template: its source text and the version directory
/// it was loaded from.
#[derive(Debug, Clone)]
struct CachedTemplate {
    version: String,
    source: String,
}

/// The thinking-mode block of [`CompleteSystemPrompt`] (spec §9's
/// `BedrockConfig.thinking`).
#[derive(Debug, Clone, Serialize)]
pub struct ThinkingSpec {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub budget_tokens: u32,
}

/// The rendered system prompt plus the LLM request configuration it must
/// travel with (spec §4.5: "serializes a `CompleteSystemPrompt` object that
/// also carries the LLM configuration").
#[derive(Debug, Clone, Serialize)]
pub struct CompleteSystemPrompt {
    pub system_prompt: String,
    pub template_version: String,
    pub anthropic_version: String,
    pub max_tokens: u32,
    pub thinking: ThinkingSpec,
    pub model_id: String,
}

/// A rendered (non-system) prompt, e.g. a Turn-1 or Turn-2 user message.
#[derive(Debug, Clone)]
pub struct RenderedPrompt {
    pub text: String,
    pub template_version: String,
}

/// Selects and renders templates from a versioned catalog on disk.
#[async_trait]
pub trait TemplateEngine: Send + Sync {
    async fn render_system_prompt(
        &self,
        template_name: &str,
        context: &serde_json::Value,
        llm: &LlmRequestConfig,
    ) -> Result<CompleteSystemPrompt>;

    async fn render(&self, template_name: &str, context: &serde_json::Value) -> Result<RenderedPrompt>;
}

/// Disk-backed template catalog under a `TEMPLATE_BASE_PATH` root.
pub struct TemplateCatalog {
    base_path: PathBuf,
    cache: Arc<RwLock<HashMap<String, CachedTemplate>>>,
}

impl TemplateCatalog {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Resolve and read the named template, preferring the warm cache and
    /// falling back to a disk read under the write lock on a miss.
    async fn load(&self, name: &str) -> Result<CachedTemplate> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(name) {
                return Ok(cached.clone());
            }
        }

        let mut cache = self.cache.write().await;
        if let Some(cached) = cache.get(name) {
            return Ok(cached.clone());
        }

        let (version, path) = get_latest_version(&self.base_path, name)?;
        let source = std::fs::read_to_string(&path).map_err(|e| {
            Error::template_processing(
                "TemplateCatalog",
                "load",
                format!("failed to read template {}: {e}", path.display()),
            )
        })?;

        let cached = CachedTemplate { version, source };
        cache.insert(name.to_string(), cached.clone());
        Ok(cached)
    }

    fn render_source(source: &str, context: &serde_json::Value) -> Result<String> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);
        handlebars
            .render_template(source, context)
            .map_err(|e| Error::template_processing("TemplateCatalog", "render", e.to_string()))
    }
}

#[async_trait]
impl TemplateEngine for TemplateCatalog {
    async fn render_system_prompt(
        &self,
        template_name: &str,
        context: &serde_json::Value,
        llm: &LlmRequestConfig,
    ) -> Result<CompleteSystemPrompt> {
        let cached = self.load(template_name).await?;
        let system_prompt = Self::render_source(&cached.source, context)?;

        Ok(CompleteSystemPrompt {
            system_prompt,
            template_version: cached.version,
            anthropic_version: llm.anthropic_version.clone(),
            max_tokens: llm.max_tokens,
            thinking: ThinkingSpec {
                kind: match llm.thinking_type {
                    ThinkingType::Enabled => "enabled",
                    ThinkingType::Disabled => "disabled",
                },
                budget_tokens: llm.budget_tokens,
            },
            model_id: llm.model_id.clone(),
        })
    }

    async fn render(&self, template_name: &str, context: &serde_json::Value) -> Result<RenderedPrompt> {
        let cached = self.load(template_name).await?;
        let text = Self::render_source(&cached.source, context)?;
        Ok(RenderedPrompt {
            text,
            template_version: cached.version,
        })
    }
}

/// Parse a `major.minor.patch` directory name into a comparable tuple.
/// Non-conforming directory names are ignored rather than treated as an
/// error, so stray files under the template root don't break resolution.
fn parse_semver_dir(name: &str) -> Option<(u32, u32, u32)> {
    let mut parts = name.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

/// `GetLatestVersion(name)`: the highest semver subdirectory of
/// `base_path/name` that contains a `template.hbs` file (spec §4.5).
fn get_latest_version(base_path: &Path, name: &str) -> Result<(String, PathBuf)> {
    let template_dir = base_path.join(name);
    let entries = std::fs::read_dir(&template_dir).map_err(|e| {
        Error::template_processing(
            "TemplateCatalog",
            "get_latest_version",
            format!("no template catalog at {}: {e}", template_dir.display()),
        )
    })?;

    let mut best: Option<((u32, u32, u32), String)> = None;
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }
        let dir_name = entry.file_name().to_string_lossy().into_owned();
        let Some(version) = parse_semver_dir(&dir_name) else {
            continue;
        };
        if !entry.path().join("template.hbs").is_file() {
            continue;
        }
        if best.as_ref().map(|(v, _)| version > *v).unwrap_or(true) {
            best = Some((version, dir_name));
        }
    }

    let (_, version) = best.ok_or_else(|| {
        Error::template_processing(
            "TemplateCatalog",
            "get_latest_version",
            format!("no versioned template found for '{name}' under {}", template_dir.display()),
        )
    })?;

    let path = template_dir.join(&version).join("template.hbs");
    Ok((version, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_template(dir: &Path, name: &str, version: &str, body: &str) {
        let version_dir = dir.join(name).join(version);
        std::fs::create_dir_all(&version_dir).unwrap();
        std::fs::write(version_dir.join("template.hbs"), body).unwrap();
    }

    #[test]
    fn get_latest_version_picks_the_highest_semver_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_template(dir.path(), "greeting", "1.0.0", "hi {{name}}");
        write_template(dir.path(), "greeting", "1.2.0", "hello {{name}}");
        write_template(dir.path(), "greeting", "1.10.0", "hey {{name}}");

        let (version, path) = get_latest_version(dir.path(), "greeting").unwrap();
        assert_eq!(version, "1.10.0");
        assert!(path.ends_with("1.10.0/template.hbs"));
    }

    #[test]
    fn get_latest_version_errors_when_catalog_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = get_latest_version(dir.path(), "nonexistent").unwrap_err();
        assert!(matches!(err, Error::TemplateProcessing { .. }));
    }

    #[tokio::test]
    async fn render_system_prompt_binds_context_and_llm_config() {
        let dir = tempfile::tempdir().unwrap();
        write_template(
            dir.path(),
            "layout-vs-checking",
            "1.0.0",
            "rows={{machine_structure.row_count}}",
        );

        let catalog = TemplateCatalog::new(dir.path());
        let llm = LlmRequestConfig {
            anthropic_version: "2023-06-01".to_string(),
            model_id: "claude-3-5-sonnet-20241022".to_string(),
            max_tokens: 4096,
            budget_tokens: 2048,
            thinking_type: ThinkingType::Enabled,
            temperature: 0.0,
            top_p: 1.0,
        };
        let context = json!({ "machine_structure": { "row_count": 6 } });

        let prompt = catalog
            .render_system_prompt("layout-vs-checking", &context, &llm)
            .await
            .unwrap();

        assert_eq!(prompt.system_prompt, "rows=6");
        assert_eq!(prompt.template_version, "1.0.0");
        assert_eq!(prompt.thinking.kind, "enabled");
        assert_eq!(prompt.max_tokens, 4096);
    }

    #[tokio::test]
    async fn render_with_unbound_variable_is_a_template_processing_error() {
        let dir = tempfile::tempdir().unwrap();
        write_template(dir.path(), "turn2-prompt", "1.0.0", "{{missing_field}}");

        let catalog = TemplateCatalog::new(dir.path());
        let err = catalog
            .render("turn2-prompt", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TemplateProcessing { .. }));
        assert!(!err.retry_strategy().is_retryable());
    }

    #[tokio::test]
    async fn second_render_is_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        write_template(dir.path(), "turn1-prompt", "1.0.0", "static text");
        let catalog = TemplateCatalog::new(dir.path());

        let first = catalog.render("turn1-prompt", &json!({})).await.unwrap();
        std::fs::remove_dir_all(dir.path().join("turn1-prompt")).unwrap();
        let second = catalog.render("turn1-prompt", &json!({})).await.unwrap();

        assert_eq!(first.text, second.text);
        assert_eq!(second.text, "static text");
    }
}
