use indexmap::IndexMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub capabilities: Vec<String>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

/// Catalog of remote model endpoints. Insertion order is preference order:
/// `by_capability` returns the fallback sequence exactly as registered.
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

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, capabilities: &[&str]| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
            },
        );
    };

    // Text endpoints, fastest first.
    insert("facebook/opt-350m", &["text"]);
    insert("gpt2", &["text"]);
    insert("EleutherAI/gpt-neo-125M", &["text"]);
    insert("google/flan-t5-small", &["text"]);

    // Image endpoints.
    insert("stabilityai/stable-diffusion-2-1", &["image"]);
    insert("CompVis/stable-diffusion-v1-4", &["image"]);
    insert("runwayml/stable-diffusion-v1-5", &["image"]);

    map
}

#[cfg(test)]
mod tests {
    use super::ModelRegistry;

    #[test]
    fn default_text_candidates_keep_registration_order() {
        let registry = ModelRegistry::new(None);
        let names: Vec<String> = registry
            .by_capability("text")
            .into_iter()
            .map(|model| model.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "facebook/opt-350m",
                "gpt2",
                "EleutherAI/gpt-neo-125M",
                "google/flan-t5-small",
            ]
        );
    }

    #[test]
    fn default_image_candidates_keep_registration_order() {
        let registry = ModelRegistry::new(None);
        let names: Vec<String> = registry
            .by_capability("image")
            .into_iter()
            .map(|model| model.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "stabilityai/stable-diffusion-2-1",
                "CompVis/stable-diffusion-v1-4",
                "runwayml/stable-diffusion-v1-5",
            ]
        );
    }

    #[test]
    fn ensure_checks_capability() {
        let registry = ModelRegistry::new(None);
        assert!(registry.ensure("gpt2", "text").is_some());
        assert!(registry.ensure("gpt2", "image").is_none());
        assert!(registry.ensure("missing", "text").is_none());
    }
}
