use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use lens_contracts::models::ModelSelector;

pub const DEFAULT_MAX_TOKENS: u32 = 1000;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_LOG_FILTER: &str = "warn";
pub const MISSING_API_KEY_MESSAGE: &str =
    "Missing ANTHROPIC_API_KEY. Please add it to a .env file (see .env.example).";

/// Values given on the command line; they win over every other source.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub api_key: Option<String>,
    pub api_base: Option<String>,
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f64,
    pub timeout: Duration,
    pub system_prompt: Option<String>,
    pub log_filter: String,
}

impl AppConfig {
    /// Layers flags over the process environment over the `.env` file.
    pub fn load(overrides: &ConfigOverrides, env_file: &Path) -> Result<Self> {
        let dotenv = parse_dotenv(env_file);
        Self::from_sources(overrides, |key| env::var(key).ok(), &dotenv)
    }

    pub fn from_sources(
        overrides: &ConfigOverrides,
        process_env: impl Fn(&str) -> Option<String>,
        dotenv: &HashMap<String, String>,
    ) -> Result<Self> {
        let lookup = |key: &str| -> Option<String> {
            process_env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .or_else(|| {
                    dotenv
                        .get(key)
                        .map(|value| value.trim().to_string())
                        .filter(|value| !value.is_empty())
                })
        };

        let max_tokens = match overrides.max_tokens {
            Some(value) => value,
            None => parse_number("LENS_MAX_TOKENS", lookup("LENS_MAX_TOKENS"))?
                .unwrap_or(DEFAULT_MAX_TOKENS),
        };
        if max_tokens == 0 {
            bail!("max tokens must be greater than zero");
        }
        let temperature = match overrides.temperature {
            Some(value) => value,
            None => parse_number("LENS_TEMPERATURE", lookup("LENS_TEMPERATURE"))?
                .unwrap_or(DEFAULT_TEMPERATURE),
        };
        if !(0.0..=1.0).contains(&temperature) {
            bail!("temperature must be between 0.0 and 1.0 (got {temperature})");
        }
        let timeout_secs = parse_number("LENS_TIMEOUT_SECS", lookup("LENS_TIMEOUT_SECS"))?
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        Ok(Self {
            api_key: lookup("ANTHROPIC_API_KEY"),
            api_base: lookup("ANTHROPIC_API_BASE"),
            model: non_empty(overrides.model.as_deref()).or_else(|| lookup("LENS_MODEL")),
            max_tokens,
            temperature,
            timeout: Duration::from_secs(timeout_secs),
            system_prompt: non_empty(overrides.system_prompt.as_deref())
                .or_else(|| lookup("LENS_SYSTEM_PROMPT")),
            log_filter: lookup("LENS_LOG").unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
        })
    }

    /// The key is only optional when the session starts on an offline model.
    pub fn ensure_credentials(&self, selector: &ModelSelector) -> Result<()> {
        if self.api_key.is_some() {
            return Ok(());
        }
        let offline = selector
            .select_vision(self.model.as_deref())
            .map(|selection| selection.model.provider == "dryrun")
            .unwrap_or(false);
        if offline {
            return Ok(());
        }
        bail!(MISSING_API_KEY_MESSAGE);
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn parse_number<T>(key: &str, raw: Option<String>) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value = raw
        .parse::<T>()
        .with_context(|| format!("invalid {key} value '{raw}'"))?;
    Ok(Some(value))
}

/// Reads `KEY=value` lines. A missing file is an empty map.
pub fn parse_dotenv(path: &Path) -> HashMap<String, String> {
    let content = std::fs::read_to_string(path).unwrap_or_default();
    let mut vars = HashMap::new();
    for raw_line in content.lines() {
        let mut line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(stripped) = line.strip_prefix("export ") {
            line = stripped.trim();
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        vars.insert(key.to_string(), unquote(value.trim()));
    }
    vars
}

fn unquote(value: &str) -> String {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn dotenv_handles_export_quotes_and_comments() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join(".env");
        std::fs::write(
            &path,
            "# credentials\nexport ANTHROPIC_API_KEY=\"sk-test\"\nLENS_MODEL='claude-3-haiku-20240307'\n\nBROKEN\n=nokey\nLENS_SYSTEM_PROMPT = Be brief.\n",
        )?;
        let vars = parse_dotenv(&path);
        assert_eq!(vars.len(), 3);
        assert_eq!(vars["ANTHROPIC_API_KEY"], "sk-test");
        assert_eq!(vars["LENS_MODEL"], "claude-3-haiku-20240307");
        assert_eq!(vars["LENS_SYSTEM_PROMPT"], "Be brief.");
        assert!(parse_dotenv(&temp.path().join("missing.env")).is_empty());
        Ok(())
    }

    #[test]
    fn defaults_apply_without_sources() -> Result<()> {
        let config = AppConfig::from_sources(&ConfigOverrides::default(), no_env, &HashMap::new())?;
        assert_eq!(config.api_key, None);
        assert_eq!(config.model, None);
        assert_eq!(config.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(config.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(config.log_filter, "warn");
        Ok(())
    }

    #[test]
    fn flags_beat_env_which_beats_dotenv() -> Result<()> {
        let mut dotenv = HashMap::new();
        dotenv.insert("ANTHROPIC_API_KEY".to_string(), "from-file".to_string());
        dotenv.insert("LENS_MODEL".to_string(), "claude-3-sonnet-20240229".to_string());
        dotenv.insert("LENS_MAX_TOKENS".to_string(), "300".to_string());
        let process_env = |key: &str| match key {
            "ANTHROPIC_API_KEY" => Some("from-env".to_string()),
            "LENS_MODEL" => Some("claude-3-haiku-20240307".to_string()),
            "LENS_TEMPERATURE" => Some("  ".to_string()),
            _ => None,
        };
        let overrides = ConfigOverrides {
            model: Some("claude-3-opus-20240229".to_string()),
            ..ConfigOverrides::default()
        };
        let config = AppConfig::from_sources(&overrides, process_env, &dotenv)?;
        assert_eq!(config.api_key.as_deref(), Some("from-env"));
        assert_eq!(config.model.as_deref(), Some("claude-3-opus-20240229"));
        assert_eq!(config.max_tokens, 300);
        assert_eq!(config.temperature, DEFAULT_TEMPERATURE);
        Ok(())
    }

    #[test]
    fn invalid_numbers_are_reported_with_key() {
        let process_env = |key: &str| (key == "LENS_MAX_TOKENS").then(|| "lots".to_string());
        let err = AppConfig::from_sources(&ConfigOverrides::default(), process_env, &HashMap::new())
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid LENS_MAX_TOKENS value 'lots'");

        let overrides = ConfigOverrides {
            temperature: Some(1.5),
            ..ConfigOverrides::default()
        };
        assert!(AppConfig::from_sources(&overrides, no_env, &HashMap::new()).is_err());
    }

    #[test]
    fn missing_key_is_fatal_unless_model_is_offline() -> Result<()> {
        let selector = ModelSelector::new(None);
        let config = AppConfig::from_sources(&ConfigOverrides::default(), no_env, &HashMap::new())?;
        let err = config.ensure_credentials(&selector).unwrap_err();
        assert_eq!(err.to_string(), MISSING_API_KEY_MESSAGE);

        let offline = AppConfig {
            model: Some("dryrun-vision-1".to_string()),
            ..config
        };
        offline.ensure_credentials(&selector)?;
        Ok(())
    }
}
