use super::registry::ModelRegistry;

/// Ordered fallback sequence for one generation task. The list is fixed at
/// planning time and consumed strictly front to back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePlan {
    pub models: Vec<String>,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CandidatePlanner {
    pub registry: ModelRegistry,
}

impl CandidatePlanner {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    /// Builds the candidate list for a capability. A requested model that
    /// supports the capability moves to the front; the registry defaults
    /// follow in registration order. An unknown request degrades to the
    /// defaults with an explanation instead of failing.
    pub fn plan(&self, requested: Option<&str>, capability: &str) -> Result<CandidatePlan, String> {
        let defaults: Vec<String> = self
            .registry
            .by_capability(capability)
            .into_iter()
            .map(|model| model.name)
            .collect();

        let (head, requested_text, fallback_reason) = match requested {
            Some(requested_value) if self.registry.ensure(requested_value, capability).is_some() => {
                (
                    Some(requested_value.to_string()),
                    Some(requested_value.to_string()),
                    None,
                )
            }
            Some(requested_value) => (
                None,
                Some(requested_value.to_string()),
                Some(format!(
                    "Requested model '{requested_value}' unavailable for capability '{capability}'."
                )),
            ),
            None => (None, None, None),
        };

        let mut models = Vec::with_capacity(defaults.len() + 1);
        if let Some(head) = head {
            models.push(head);
        }
        for name in defaults {
            if !models.contains(&name) {
                models.push(name);
            }
        }
        if models.is_empty() {
            return Err(format!(
                "No models available for capability '{capability}'."
            ));
        }

        Ok(CandidatePlan {
            models,
            requested: requested_text,
            fallback_reason,
        })
    }
}
