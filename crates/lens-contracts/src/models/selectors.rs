use std::fmt;

use super::registry::{ModelRegistry, ModelSpec, VISION};

/// Why the selected model is not the one that was asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    NotRequested,
    Unknown(String),
    CannotReadImages(String),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRequested => f.write_str("No model specified; using default."),
            Self::Unknown(name) => write!(f, "Unknown model '{name}'; using default."),
            Self::CannotReadImages(name) => {
                write!(f, "Model '{name}' cannot read images; using default.")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<FallbackReason>,
}

/// Picks the model for image questions. Every turn carries an image, so only
/// vision-capable models qualify; the first one in the registry is the default.
#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    pub fn select_vision(&self, requested: Option<&str>) -> Result<ModelSelection, String> {
        let requested = requested
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        let fallback_reason = match requested.as_deref() {
            None => FallbackReason::NotRequested,
            Some(name) => match self.registry.get(name) {
                Some(model) if model.supports(VISION) => {
                    return Ok(ModelSelection {
                        model: model.clone(),
                        requested,
                        fallback_reason: None,
                    });
                }
                Some(_) => FallbackReason::CannotReadImages(name.to_string()),
                None => FallbackReason::Unknown(name.to_string()),
            },
        };

        let model = self
            .registry
            .list()
            .find(|model| model.supports(VISION))
            .cloned()
            .ok_or_else(|| "No vision-capable model is registered.".to_string())?;
        Ok(ModelSelection {
            model,
            requested,
            fallback_reason: Some(fallback_reason),
        })
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;

    fn model(name: &str, capabilities: &[&str]) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            provider: "dryrun".to_string(),
            label: name.to_string(),
            capabilities: capabilities.iter().map(|item| item.to_string()).collect(),
            max_output_tokens: None,
        }
    }

    fn registry(models: Vec<ModelSpec>) -> ModelRegistry {
        let mut map = IndexMap::new();
        for model in models {
            map.insert(model.name.clone(), model);
        }
        ModelRegistry::new(Some(map))
    }

    #[test]
    fn known_vision_model_is_selected_as_requested() {
        let selection = ModelSelector::new(None)
            .select_vision(Some(" claude-3-haiku-20240307 "))
            .unwrap();
        assert_eq!(selection.model.name, "claude-3-haiku-20240307");
        assert_eq!(selection.requested.as_deref(), Some("claude-3-haiku-20240307"));
        assert_eq!(selection.fallback_reason, None);
    }

    #[test]
    fn unknown_model_falls_back_to_first_vision_model() {
        let selection = ModelSelector::new(Some(registry(vec![
            model("text-only", &["text"]),
            model("eyes", &["text", VISION]),
        ])))
        .select_vision(Some("missing"))
        .unwrap();
        assert_eq!(selection.model.name, "eyes");
        assert_eq!(selection.requested.as_deref(), Some("missing"));
        assert_eq!(
            selection.fallback_reason.map(|reason| reason.to_string()),
            Some("Unknown model 'missing'; using default.".to_string())
        );
    }

    #[test]
    fn text_only_model_is_refused_for_images() {
        let selection = ModelSelector::new(Some(registry(vec![
            model("text-only", &["text"]),
            model("eyes", &[VISION]),
        ])))
        .select_vision(Some("text-only"))
        .unwrap();
        assert_eq!(selection.model.name, "eyes");
        assert_eq!(
            selection.fallback_reason,
            Some(FallbackReason::CannotReadImages("text-only".to_string()))
        );
    }

    #[test]
    fn blank_request_uses_default_with_explanation() {
        let selection = ModelSelector::new(None).select_vision(Some("  ")).unwrap();
        assert_eq!(selection.model.name, "claude-3-opus-20240229");
        assert_eq!(selection.requested, None);
        assert_eq!(
            selection.fallback_reason.map(|reason| reason.to_string()),
            Some("No model specified; using default.".to_string())
        );
    }

    #[test]
    fn registry_without_vision_models_is_an_error() {
        let err = ModelSelector::new(Some(registry(vec![model("text-only", &["text"])])))
            .select_vision(Some("claude-3-opus-20240229"))
            .err()
            .unwrap_or_default();
        assert_eq!(err, "No vision-capable model is registered.");
    }
}
