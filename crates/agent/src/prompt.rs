use cadence_core::domain::lead::Lead;
use serde::Serialize;
use tera::{Context, Tera};
use thiserror::Error;

const INITIAL_TEMPLATE: &str = "initial_email";
const FOLLOW_UP_TEMPLATE: &str = "follow_up_email";
const CLASSIFY_TEMPLATE: &str = "classify_reply";

const INITIAL_PROMPT: &str = r#"You are writing a short, professional B2B cold outreach email.

Lead information:
- First name: {{ first_name }}
- Last name: {{ last_name }}
- Company: {{ company }}
- Email: {{ email }}
{% if industry %}- Industry: {{ industry }}
{% endif %}
Instructions:
1. {% if first_name %}Open with "Hi {{ first_name }},"{% else %}Open with "Hi," and no name{% endif %}.
2. Do not use placeholders such as [First Name].
3. Write only the email body, no subject line.
4. Ask whether they are the right person, or who at {{ company }} handles operations.
5. End with a single clear request for a short intro call.
{% if sender_name %}6. Sign as {{ sender_name }}.
{% endif %}Keep it under 200 words.
"#;

const FOLLOW_UP_PROMPT: &str = r#"You are writing follow-up #{{ follow_up_number }} to a B2B outreach email that got no reply.

Lead information:
- First name: {{ first_name }}
- Company: {{ company }}
{% if industry %}- Industry: {{ industry }}
{% endif %}
Instructions:
1. {% if first_name %}Open with "Hi {{ first_name }},"{% else %}Open with "Hi,"{% endif %}.
2. Briefly reference the earlier note without repeating it.
3. Write only the email body, no subject line.
{% if sender_name %}4. Sign as {{ sender_name }}.
{% endif %}Keep it under 120 words.
"#;

const CLASSIFY_PROMPT: &str = r#"Classify this email reply clearly into one category:
- interested
- not interested
- unsubscribe
- unclear

Reply ONLY with the category.

Email:
{{ text }}
"#;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt template error: {0}")]
    Template(#[from] tera::Error),
}

/// Lead facts a generation prompt may reference, with placeholder names already dropped.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PromptContext {
    pub first_name: String,
    pub last_name: String,
    pub company: String,
    pub email: String,
    pub industry: Option<String>,
    pub sender_name: Option<String>,
    pub follow_up_number: u32,
}

impl PromptContext {
    pub const FALLBACK_COMPANY: &'static str = "your company";

    pub fn for_lead(lead: &Lead, sender_name: Option<&str>) -> Self {
        let real = |value: Option<&str>| {
            value
                .map(str::trim)
                .filter(|value| {
                    !value.is_empty()
                        && !value.eq_ignore_ascii_case("unknown")
                        && !value.eq_ignore_ascii_case("none")
                })
                .unwrap_or_default()
                .to_string()
        };
        let company = real(lead.company.as_deref());

        Self {
            first_name: lead.greeting_name().unwrap_or_default().to_string(),
            last_name: real(lead.last_name.as_deref()),
            company: if company.is_empty() { Self::FALLBACK_COMPANY.to_string() } else { company },
            email: lead.email.clone(),
            industry: lead.industry.clone().filter(|value| !value.trim().is_empty()),
            sender_name: sender_name.map(str::to_string),
            follow_up_number: lead.sequence_step.saturating_sub(1),
        }
    }
}

pub struct PromptRenderer {
    tera: Tera,
}

impl PromptRenderer {
    pub fn new() -> Result<Self, PromptError> {
        let mut tera = Tera::default();
        tera.autoescape_on(Vec::new());
        tera.add_raw_template(INITIAL_TEMPLATE, INITIAL_PROMPT)?;
        tera.add_raw_template(FOLLOW_UP_TEMPLATE, FOLLOW_UP_PROMPT)?;
        tera.add_raw_template(CLASSIFY_TEMPLATE, CLASSIFY_PROMPT)?;
        Ok(Self { tera })
    }

    pub fn initial_email(&self, context: &PromptContext) -> Result<String, PromptError> {
        Ok(self.tera.render(INITIAL_TEMPLATE, &Context::from_serialize(context)?)?)
    }

    pub fn follow_up_email(&self, context: &PromptContext) -> Result<String, PromptError> {
        Ok(self.tera.render(FOLLOW_UP_TEMPLATE, &Context::from_serialize(context)?)?)
    }

    pub fn classify_reply(&self, text: &str) -> Result<String, PromptError> {
        let mut context = Context::new();
        context.insert("text", text);
        Ok(self.tera.render(CLASSIFY_TEMPLATE, &context)?)
    }
}

#[cfg(test)]
mod tests {
    use cadence_core::chrono::Utc;
    use cadence_core::domain::lead::{Lead, LeadId};

    use super::{PromptContext, PromptRenderer};

    fn lead() -> Lead {
        let mut lead = Lead::new(LeadId("L-1".to_string()), "ada@acme.io", Utc::now());
        lead.first_name = Some("Ada".to_string());
        lead.last_name = Some("UNKNOWN".to_string());
        lead.industry = Some("Woodworking".to_string());
        lead
    }

    #[test]
    fn placeholder_names_and_missing_company_are_normalized() {
        let context = PromptContext::for_lead(&lead(), None);
        assert_eq!(context.first_name, "Ada");
        assert_eq!(context.last_name, "");
        assert_eq!(context.company, "your company");
    }

    #[test]
    fn initial_prompt_uses_lead_facts() {
        let renderer = PromptRenderer::new().expect("templates");
        let prompt = renderer
            .initial_email(&PromptContext::for_lead(&lead(), Some("Sam from Cadence")))
            .expect("render");

        assert!(prompt.contains("Open with \"Hi Ada,\""));
        assert!(prompt.contains("- Industry: Woodworking"));
        assert!(prompt.contains("Sign as Sam from Cadence."));
        assert!(!prompt.contains("{{"));
    }

    #[test]
    fn nameless_leads_get_a_bare_greeting() {
        let mut lead = lead();
        lead.first_name = Some("None".to_string());
        lead.sequence_step = 3;
        let renderer = PromptRenderer::new().expect("templates");
        let prompt =
            renderer.follow_up_email(&PromptContext::for_lead(&lead, None)).expect("render");

        assert!(prompt.starts_with("You are writing follow-up #2"));
        assert!(prompt.contains("Open with \"Hi,\""));
    }

    #[test]
    fn classification_prompt_embeds_reply_text() {
        let renderer = PromptRenderer::new().expect("templates");
        let prompt = renderer.classify_reply("Please take me off your list").expect("render");
        assert!(prompt.starts_with("Classify this email reply clearly into one category"));
        assert!(prompt.contains("Please take me off your list"));
    }
}
