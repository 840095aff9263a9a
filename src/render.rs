//! Template rendering: `{{ variable }}` substitution over lead data.
//!
//! The renderer sits behind a trait so richer engines can slot in without
//! touching the generator.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::error::RenderError;
use crate::model::{Lead, RenderedContent, Template};

/// Renders a template for one lead.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &Template, lead: &Lead) -> Result<RenderedContent, RenderError>;
}

static VARIABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").unwrap());

/// Substitutes `{{ field }}` placeholders with lead fields and attributes.
///
/// Unknown variables render as the empty string; personalization gaps should
/// not block a whole wave.
#[derive(Debug, Default, Clone, Copy)]
pub struct VariableRenderer;

impl VariableRenderer {
    fn substitute(&self, input: &str, lead: &Lead) -> String {
        VARIABLE
            .replace_all(input, |caps: &Captures<'_>| {
                match lead.attribute(&caps[1]) {
                    Some(value) => value_text(&value),
                    None => {
                        tracing::debug!(lead = %lead.id, variable = &caps[1], "Unresolved template variable");
                        String::new()
                    }
                }
            })
            .into_owned()
    }
}

impl TemplateRenderer for VariableRenderer {
    fn render(&self, template: &Template, lead: &Lead) -> Result<RenderedContent, RenderError> {
        Ok(RenderedContent {
            subject: template
                .subject
                .as_deref()
                .map(|s| self.substitute(s, lead)),
            body: self.substitute(&template.body, lead),
            meta: None,
        })
    }
}

/// String form of a JSON value for message bodies. Strings lose their quotes;
/// null renders empty.
fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn lead() -> Lead {
        Lead::new(Uuid::new_v4())
            .with_email("ada@example.com")
            .with_attribute("first_name", json!("Ada"))
            .with_attribute("score", json!(92))
    }

    #[test]
    fn substitutes_fields_and_attributes() {
        let template = Template::new(
            Uuid::new_v4(),
            "welcome",
            crate::model::Channel::Email,
            "Hi {{ first_name }}, your score is {{score}}.",
        )
        .with_subject("Welcome {{first_name}}");

        let rendered = VariableRenderer.render(&template, &lead()).unwrap();
        assert_eq!(rendered.subject.as_deref(), Some("Welcome Ada"));
        assert_eq!(rendered.body, "Hi Ada, your score is 92.");
    }

    #[test]
    fn unknown_variables_render_empty() {
        let template = Template::new(
            Uuid::new_v4(),
            "welcome",
            crate::model::Channel::Email,
            "Hi {{ nickname }}!",
        );
        let rendered = VariableRenderer.render(&template, &lead()).unwrap();
        assert_eq!(rendered.body, "Hi !");
    }

    #[test]
    fn fixed_fields_resolve() {
        let template = Template::new(
            Uuid::new_v4(),
            "contact",
            crate::model::Channel::Email,
            "Sent to {{ email }} ({{ status }})",
        );
        let rendered = VariableRenderer.render(&template, &lead()).unwrap();
        assert_eq!(rendered.body, "Sent to ada@example.com (open)");
    }

    #[test]
    fn text_without_placeholders_is_untouched() {
        let template = Template::new(
            Uuid::new_v4(),
            "plain",
            crate::model::Channel::Sms,
            "Flat 20% off this week only.",
        );
        let rendered = VariableRenderer.render(&template, &lead()).unwrap();
        assert_eq!(rendered.body, "Flat 20% off this week only.");
    }
}
