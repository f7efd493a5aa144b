use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Openai,
    Anthropic,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitScope {
    Multi,
    Project,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    pub provider: LlmProvider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub deadline_ms: u64,
    pub max_concurrency: usize,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: LlmProvider::None,
            api_key: None,
            deadline_ms: 2000,
            max_concurrency: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitSettings {
    pub target_minutes: u32,
    pub force_split_scope: SplitScope,
}

impl Default for SplitSettings {
    fn default() -> Self {
        Self {
            target_minutes: 4,
            force_split_scope: SplitScope::Multi,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    pub handler_queue: usize,
    pub default_deadline_ms: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            handler_queue: 64,
            default_deadline_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub split: SplitSettings,
    #[serde(default)]
    pub runtime: RuntimeSettings,
}

/// Layered config store: file < env < runtime overrides, the three layers
/// a single-process backend service needs (SPEC_FULL.md §6).
#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    runtime: Value,
}

#[derive(Clone)]
pub struct ConfigStore {
    file_path: Option<PathBuf>,
    layers: Arc<RwLock<ConfigLayers>>,
}

fn empty_object() -> Value {
    json!({})
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                deep_merge(base_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

fn env_layer() -> Value {
    let mut root = empty_object();
    let pairs: &[(&str, &str, &str)] = &[
        ("TASK_LLM_PROVIDER", "llm", "provider"),
        ("TASK_LLM_API_KEY", "llm", "api_key"),
        ("TASK_LLM_DEADLINE_MS", "llm", "deadline_ms"),
        ("TASK_LLM_MAX_CONCURRENCY", "llm", "max_concurrency"),
        ("TASK_SPLIT_TARGET_MINUTES", "split", "target_minutes"),
        ("TASK_SPLIT_FORCE_SPLIT_SCOPE", "split", "force_split_scope"),
        ("TASK_RUNTIME_HANDLER_QUEUE", "runtime", "handler_queue"),
        (
            "TASK_RUNTIME_DEFAULT_DEADLINE_MS",
            "runtime",
            "default_deadline_ms",
        ),
    ];
    for (env_key, section, field) in pairs {
        if let Ok(raw) = std::env::var(env_key) {
            let value = parse_env_value(&raw);
            let section_entry = root
                .as_object_mut()
                .unwrap()
                .entry(section.to_string())
                .or_insert_with(empty_object);
            section_entry
                .as_object_mut()
                .unwrap()
                .insert(field.to_string(), value);
        }
    }
    root
}

fn parse_env_value(raw: &str) -> Value {
    if let Ok(n) = raw.parse::<u64>() {
        return json!(n);
    }
    json!(raw)
}

impl ConfigStore {
    /// Loads config from an optional JSON file plus environment overrides.
    pub async fn load(file_path: Option<&Path>) -> anyhow::Result<Self> {
        let file = match file_path {
            Some(path) if path.exists() => {
                let raw = fs::read_to_string(path).await?;
                serde_json::from_str(&raw).unwrap_or_else(|_| empty_object())
            }
            _ => empty_object(),
        };
        Ok(Self {
            file_path: file_path.map(|p| p.to_path_buf()),
            layers: Arc::new(RwLock::new(ConfigLayers {
                file,
                env: env_layer(),
                runtime: empty_object(),
            })),
        })
    }

    pub fn in_memory(seed: AppConfig) -> Self {
        let file = serde_json::to_value(seed).unwrap_or_else(|_| empty_object());
        Self {
            file_path: None,
            layers: Arc::new(RwLock::new(ConfigLayers {
                file,
                env: empty_object(),
                runtime: empty_object(),
            })),
        }
    }

    pub async fn get(&self) -> AppConfig {
        let merged = self.effective_value().await;
        serde_json::from_value(merged).unwrap_or_default()
    }

    pub async fn effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = serde_json::to_value(AppConfig::default()).unwrap_or_else(|_| empty_object());
        deep_merge(&mut merged, &layers.file);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        merged
    }

    /// Applies a runtime override (e.g. a per-call config tweak in tests)
    /// without touching the on-disk file.
    pub async fn patch_runtime(&self, patch: Value) {
        let mut layers = self.layers.write().await;
        deep_merge(&mut layers.runtime, &patch);
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_apply_when_no_file_or_env() {
        let store = ConfigStore::load(None).await.unwrap();
        let config = store.get().await;
        assert_eq!(config.llm.provider, LlmProvider::None);
        assert_eq!(config.split.target_minutes, 4);
        assert_eq!(config.runtime.handler_queue, 64);
    }

    #[tokio::test]
    async fn runtime_override_takes_precedence_over_defaults() {
        let store = ConfigStore::load(None).await.unwrap();
        store
            .patch_runtime(json!({"split": {"target_minutes": 3}}))
            .await;
        let config = store.get().await;
        assert_eq!(config.split.target_minutes, 3);
    }
}
