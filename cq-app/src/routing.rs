use std::collections::HashMap;

const CODING_HINTS: &[&str] = &[
    "code", "function", "bug", "compile", "refactor", "debug", "implement", "test", "script",
    "rust", "python", "javascript", "typescript", "api", "stack trace", "error message",
];

const REASONING_HINTS: &[&str] = &[
    "why", "explain", "prove", "reason", "step by step", "analyze", "compare", "trade-off",
    "design", "plan",
];

const VISION_HINTS: &[&str] = &["image", "picture", "photo", "screenshot", "diagram", "chart"];

/// Picks which model a turn targets. A user-selected model is fixed;
/// otherwise lightweight keyword scoring of the prompt chooses between the
/// configured defaults. Also owns the ordered fallback list consulted on
/// model-not-found errors and the context-window cache.
#[derive(Debug, Clone)]
pub struct ModelRouter {
    default_model: String,
    coding_model: Option<String>,
    reasoning_model: Option<String>,
    vision_model: Option<String>,
    fallback_models: Vec<String>,
    context_windows: HashMap<String, u32>,
}

impl ModelRouter {
    pub fn new(
        default_model: String,
        coding_model: Option<String>,
        reasoning_model: Option<String>,
        vision_model: Option<String>,
        fallback_models: Vec<String>,
    ) -> Self {
        Self {
            default_model,
            coding_model,
            reasoning_model,
            vision_model,
            fallback_models,
            context_windows: HashMap::new(),
        }
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn cache_context_windows(&mut self, models: &[cq_llm::ModelInfo]) {
        for model in models {
            if let Some(len) = model.context_length {
                self.context_windows.insert(model.id.clone(), len);
            }
        }
    }

    pub fn context_window(&self, model: &str) -> Option<u32> {
        self.context_windows.get(model).copied()
    }

    /// Resolve the model for one turn. `override_model` wins outright.
    pub fn resolve(&self, prompt: &str, override_model: Option<&str>, has_image: bool) -> String {
        if let Some(model) = override_model {
            return model.to_string();
        }

        let lowered = prompt.to_lowercase();
        if has_image {
            if let Some(model) = &self.vision_model {
                return model.clone();
            }
        }

        let coding = score(&lowered, CODING_HINTS);
        let reasoning = score(&lowered, REASONING_HINTS);
        let vision = score(&lowered, VISION_HINTS);

        let best = coding.max(reasoning).max(vision);
        if best == 0 {
            return self.default_model.clone();
        }
        let candidate = if best == coding {
            self.coding_model.as_ref()
        } else if best == reasoning {
            self.reasoning_model.as_ref()
        } else {
            self.vision_model.as_ref()
        };
        candidate.cloned().unwrap_or_else(|| self.default_model.clone())
    }

    /// Next fallback not yet attempted, in configured order.
    pub fn next_fallback(&self, attempted: &[String]) -> Option<String> {
        self.fallback_models
            .iter()
            .find(|m| !attempted.contains(m))
            .cloned()
    }
}

fn score(prompt: &str, hints: &[&str]) -> usize {
    hints.iter().filter(|h| prompt.contains(*h)).count()
}
