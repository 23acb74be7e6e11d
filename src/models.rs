//! Mapping of client-supplied model ids onto Gemini model ids.
//!
//! Clients written against `OpenAI` often hardcode ids like `gpt-4o`. Those are
//! resolved through the `[models]` config table: exact aliases first, then
//! prefix rules that send every matching id to the default model. Anything
//! else passes through unchanged.

use crate::config::ModelsConfig;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct ModelResolver {
    default_model: String,
    rewrite_prefixes: Vec<String>,
    aliases: HashMap<String, String>,
}

impl ModelResolver {
    pub fn new(config: &ModelsConfig) -> Self {
        Self {
            default_model: config.default.clone(),
            rewrite_prefixes: config.rewrite_prefixes.clone(),
            aliases: config.aliases.clone(),
        }
    }

    /// The Gemini model id to call for `requested`.
    #[must_use]
    pub fn resolve(&self, requested: &str) -> String {
        let requested = requested.trim();
        let requested = requested.strip_prefix("models/").unwrap_or(requested);

        if let Some(target) = self.aliases.get(requested) {
            return target.clone();
        }

        if requested.is_empty()
            || self
                .rewrite_prefixes
                .iter()
                .any(|prefix| requested.starts_with(prefix.as_str()))
        {
            return self.default_model.clone();
        }

        requested.to_string()
    }
}

impl Default for ModelResolver {
    fn default() -> Self {
        Self::new(&ModelsConfig::default())
    }
}
