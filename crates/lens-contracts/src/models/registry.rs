use indexmap::IndexMap;

pub const VISION: &str = "vision";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub label: String,
    pub capabilities: Vec<String>,
    pub max_output_tokens: Option<u32>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

/// Known chat models in preference order; the first vision model is the
/// default.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str,
                      provider: &str,
                      label: &str,
                      capabilities: &[&str],
                      max_output_tokens: Option<u32>| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: provider.to_string(),
                label: label.to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
                max_output_tokens,
            },
        );
    };

    insert(
        "claude-3-opus-20240229",
        "anthropic",
        "Claude 3 Opus",
        &["text", VISION],
        Some(4096),
    );
    insert(
        "claude-3-sonnet-20240229",
        "anthropic",
        "Claude 3 Sonnet",
        &["text", VISION],
        Some(4096),
    );
    insert(
        "claude-3-haiku-20240307",
        "anthropic",
        "Claude 3 Haiku",
        &["text", VISION],
        Some(4096),
    );
    insert(
        "dryrun-vision-1",
        "dryrun",
        "Offline echo",
        &["text", VISION],
        None,
    );

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_lists_claude_models_before_dryrun() {
        let registry = ModelRegistry::new(None);
        assert_eq!(
            registry.list().map(|model| model.name.as_str()).collect::<Vec<_>>(),
            vec![
                "claude-3-opus-20240229",
                "claude-3-sonnet-20240229",
                "claude-3-haiku-20240307",
                "dryrun-vision-1",
            ]
        );
        assert!(registry.list().all(|model| model.supports(VISION)));
    }

    #[test]
    fn lookup_by_name_exposes_provider_and_output_cap() {
        let registry = ModelRegistry::new(None);
        let haiku = registry.get("claude-3-haiku-20240307").unwrap();
        assert_eq!(haiku.provider, "anthropic");
        assert_eq!(haiku.max_output_tokens, Some(4096));
        assert!(!haiku.supports("image"));
        assert_eq!(
            registry.get("dryrun-vision-1").map(|model| model.provider.as_str()),
            Some("dryrun")
        );
        assert!(registry.get("missing").is_none());
    }
}
