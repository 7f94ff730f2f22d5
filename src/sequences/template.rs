use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::models::{Contact, Enrollment, SequenceStep};

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").expect("placeholder pattern is valid")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("unknown template variable `{0}`")]
    UnknownVariable(String),
    #[error("template renders to an empty message")]
    EmptyTemplate,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct RenderedMessage {
    pub body: String,
    pub subject: Option<String>,
}

/// Substitutes `{{variable}}` placeholders from the contact and the
/// enrollment metadata. Contact fields win over metadata keys of the same name.
pub fn render_step(
    step: &SequenceStep,
    contact: &Contact,
    enrollment: &Enrollment,
) -> Result<RenderedMessage, RenderError> {
    let variables = variables(contact, enrollment);
    let body = substitute(&step.template, &variables)?;
    if body.trim().is_empty() {
        return Err(RenderError::EmptyTemplate);
    }
    let subject = step
        .subject
        .as_deref()
        .map(|subject| substitute(subject, &variables))
        .transpose()?;
    Ok(RenderedMessage { body, subject })
}

fn variables(contact: &Contact, enrollment: &Enrollment) -> HashMap<String, String> {
    let mut variables = HashMap::new();
    if let Value::Object(metadata) = &enrollment.metadata {
        for (key, value) in metadata {
            let rendered = match value {
                Value::String(text) => text.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            variables.insert(key.clone(), rendered);
        }
    }

    let name = contact.name.trim().to_string();
    let first_name = name.split_whitespace().next().unwrap_or_default().to_string();
    let fields = [
        ("name", name),
        ("first_name", first_name),
        ("phone", contact.phone.clone().unwrap_or_default()),
        ("email", contact.email.clone().unwrap_or_default()),
    ];
    for (key, value) in fields {
        for prefix in ["", "customer.", "contact."] {
            variables.insert(format!("{prefix}{key}"), value.clone());
        }
    }
    variables
}

fn substitute(template: &str, variables: &HashMap<String, String>) -> Result<String, RenderError> {
    let mut missing = None;
    let rendered = PLACEHOLDER.replace_all(template, |captures: &Captures<'_>| {
        let key = &captures[1];
        match variables.get(key) {
            Some(value) => value.clone(),
            None => {
                missing.get_or_insert_with(|| key.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(key) => Err(RenderError::UnknownVariable(key)),
        None => Ok(rendered.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequences::models::{Channel, EnrollmentStatus};
    use chrono::{Duration, Utc};
    use serde_json::json;
    use uuid::Uuid;

    fn contact() -> Contact {
        Contact {
            id: Uuid::nil(),
            name: "Grace Hopper".into(),
            phone: Some("+15550123".into()),
            email: Some("grace@example.com".into()),
        }
    }

    fn enrollment(metadata: Value) -> Enrollment {
        Enrollment {
            id: Uuid::nil(),
            contact_id: Uuid::nil(),
            sequence_id: Uuid::nil(),
            enrolled_at: Utc::now(),
            current_step_index: 0,
            enrollment_status: EnrollmentStatus::Active,
            step_anchor_at: Utc::now(),
            stop_reason: None,
            metadata,
            updated_at: Utc::now(),
        }
    }

    fn step(template: &str, subject: Option<&str>) -> SequenceStep {
        SequenceStep {
            sequence_id: Uuid::nil(),
            step_index: 0,
            wait_offset: Duration::zero(),
            channel: Channel::Email,
            template: template.into(),
            subject: subject.map(str::to_string),
        }
    }

    #[test]
    fn substitutes_contact_and_metadata_variables() {
        let rendered = render_step(
            &step(
                "Hi {{ first_name }}, your showing at {{address}} is confirmed. -- {{customer.name}}",
                Some("Update for {{name}}"),
            ),
            &contact(),
            &enrollment(json!({"address": "12 Elm St"})),
        )
        .unwrap();
        assert_eq!(
            rendered.body,
            "Hi Grace, your showing at 12 Elm St is confirmed. -- Grace Hopper"
        );
        assert_eq!(rendered.subject.as_deref(), Some("Update for Grace Hopper"));
    }

    #[test]
    fn contact_fields_take_precedence_over_metadata() {
        let rendered = render_step(
            &step("{{name}}", None),
            &contact(),
            &enrollment(json!({"name": "someone else"})),
        )
        .unwrap();
        assert_eq!(rendered.body, "Grace Hopper");
    }

    #[test]
    fn unknown_variable_fails_render() {
        let err = render_step(
            &step("Hello {{nickname}}", None),
            &contact(),
            &enrollment(json!({})),
        )
        .unwrap_err();
        assert_eq!(err, RenderError::UnknownVariable("nickname".into()));
    }

    #[test]
    fn blank_output_fails_render() {
        let err = render_step(&step("   ", None), &contact(), &enrollment(Value::Null)).unwrap_err();
        assert_eq!(err, RenderError::EmptyTemplate);
    }
}
