//! Minijinja environment for resource templates.

use base64::Engine as _;
use minijinja::{Environment, UndefinedBehavior};

use crate::Error;

/// Template engine wrapping a configured minijinja environment.
///
/// Undefined variables are strict errors so a values document missing a key
/// fails the render instead of materializing half-formed resources.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Create an engine with strict undefined handling and base64 filters.
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_filter("b64encode", b64encode);
        env.add_filter("b64decode", b64decode);
        Self { env }
    }

    /// Render a template string against the given context.
    pub fn render(&self, template: &str, ctx: minijinja::Value) -> Result<String, Error> {
        self.env
            .render_str(template, ctx)
            .map_err(|e| Error::render(format!("render template: {e}")))
    }
}

fn b64encode(value: String) -> String {
    base64::engine::general_purpose::STANDARD.encode(value.as_bytes())
}

fn b64decode(value: String) -> Result<String, minijinja::Error> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(value.as_bytes())
        .map_err(|e| {
            minijinja::Error::new(
                minijinja::ErrorKind::InvalidOperation,
                format!("invalid base64: {e}"),
            )
        })?;
    String::from_utf8(bytes).map_err(|e| {
        minijinja::Error::new(
            minijinja::ErrorKind::InvalidOperation,
            format!("decoded base64 is not utf-8: {e}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::context;

    #[test]
    fn renders_context_values() {
        let engine = TemplateEngine::new();
        let out = engine
            .render("name: {{ claim.id }}", context! { claim => context! { id => "ab12cd34" } })
            .unwrap();
        assert_eq!(out, "name: ab12cd34");
    }

    #[test]
    fn undefined_variables_are_errors() {
        let engine = TemplateEngine::new();
        let err = engine.render("{{ missing }}", context! {}).unwrap_err();
        assert!(err.to_string().contains("render template"));
    }

    #[test]
    fn base64_filters_round_trip() {
        let engine = TemplateEngine::new();
        let encoded = engine
            .render("{{ secret | b64encode }}", context! { secret => "hunter2" })
            .unwrap();
        let decoded = engine
            .render("{{ blob | b64decode }}", context! { blob => encoded })
            .unwrap();
        assert_eq!(decoded, "hunter2");
    }
}
