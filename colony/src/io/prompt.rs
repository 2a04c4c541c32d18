//! Prompt builders for the Transform role's effector calls.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

const TRANSFORM_TEMPLATE: &str = include_str!("prompts/transform.md");
const REPAIR_TEMPLATE: &str = include_str!("prompts/repair.md");

pub const TRANSFORM_SYSTEM_PROMPT: &str = "You are a legacy-code migration expert. \
     Convert the full file while preserving semantics.";

/// Validated high-confidence example sharing a pattern with the target.
#[derive(Debug, Clone, Serialize)]
pub struct FewShotExample {
    pub file_id: String,
    pub patterns: Vec<String>,
    pub content: String,
}

/// Inputs for the main transform prompt.
#[derive(Debug, Clone)]
pub struct TransformPromptInputs<'a> {
    pub file_id: &'a str,
    pub patterns: &'a [String],
    pub source: &'a str,
    pub examples: &'a [FewShotExample],
    pub retry_context: Option<String>,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("transform", TRANSFORM_TEMPLATE)
            .context("register transform template")?;
        env.add_template("repair", REPAIR_TEMPLATE)
            .context("register repair template")?;
        Ok(Self { env })
    }

    pub fn render_transform(&self, inputs: &TransformPromptInputs<'_>) -> Result<String> {
        let template = self.env.get_template("transform").context("load template")?;
        let rendered = template
            .render(context! {
                file_id => inputs.file_id,
                patterns => inputs.patterns,
                source => inputs.source,
                examples => inputs.examples,
                retry_context => inputs.retry_context.as_deref().filter(|s| !s.is_empty()),
            })
            .context("render transform prompt")?;
        Ok(rendered)
    }

    pub fn render_repair(&self, file_id: &str, content: &str, error: &str) -> Result<String> {
        let template = self.env.get_template("repair").context("load template")?;
        let rendered = template
            .render(context! {
                file_id => file_id,
                content => content,
                error => error,
            })
            .context("render repair prompt")?;
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_prompt_includes_patterns_and_source() {
        let engine = PromptEngine::new().expect("engine");
        let prompt = engine
            .render_transform(&TransformPromptInputs {
                file_id: "a.py",
                patterns: &["xrange".to_string(), "print_statement".to_string()],
                source: "for i in xrange(3): pass",
                examples: &[],
                retry_context: None,
            })
            .expect("render");
        assert!(prompt.contains("File: a.py"));
        assert!(prompt.contains("xrange, print_statement"));
        assert!(prompt.contains("for i in xrange(3): pass"));
        assert!(!prompt.contains("Few-shot examples"));
        assert!(!prompt.contains("Retry context"));
    }

    #[test]
    fn transform_prompt_renders_examples_and_retry_context() {
        let engine = PromptEngine::new().expect("engine");
        let examples = vec![FewShotExample {
            file_id: "done.py".to_string(),
            patterns: vec!["xrange".to_string()],
            content: "for i in range(3): pass".to_string(),
        }];
        let prompt = engine
            .render_transform(&TransformPromptInputs {
                file_id: "a.py",
                patterns: &["xrange".to_string()],
                source: "src",
                examples: &examples,
                retry_context: Some("- import broke".to_string()),
            })
            .expect("render");
        assert!(prompt.contains("Example file: done.py"));
        assert!(prompt.contains("for i in range(3): pass"));
        assert!(prompt.contains("Retry context from previous failures:"));
        assert!(prompt.contains("- import broke"));
    }

    #[test]
    fn repair_prompt_quotes_the_compiler_error() {
        let engine = PromptEngine::new().expect("engine");
        let prompt = engine
            .render_repair("a.py", "def f(:", "invalid syntax (line 1)")
            .expect("render");
        assert!(prompt.contains("Compiler error: invalid syntax (line 1)"));
        assert!(prompt.contains("def f(:"));
    }
}
