use std::time::Duration;

use async_trait::async_trait;
use cadence_core::config::SmtpConfig;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use secrecy::ExposeSecret;
use thiserror::Error;

const IMPLICIT_TLS_PORT: u16 = 465;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundEmail {
    pub to: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub text_body: String,
    pub html_body: Option<String>,
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid address `{address}`: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("could not build message: {0}")]
    Build(String),
    #[error("smtp transport error: {0}")]
    Transport(String),
    #[error("smtp sending is disabled")]
    Disabled,
}

impl MailError {
    /// Whether another attempt could succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<(), MailError>;
}

pub fn from_config(config: &SmtpConfig) -> Result<Box<dyn MailTransport>, MailError> {
    if !config.enabled {
        return Ok(Box::new(DisabledMailTransport));
    }
    Ok(Box::new(SmtpMailTransport::new(config)?))
}

pub struct SmtpMailTransport {
    from: Mailbox,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailTransport {
    pub fn new(config: &SmtpConfig) -> Result<Self, MailError> {
        let from = mailbox(&config.from_address, config.from_name.as_deref())?;

        let builder = if is_local_relay(&config.host) {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        } else if config.port == IMPLICIT_TLS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|error| MailError::Transport(error.to_string()))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|error| MailError::Transport(error.to_string()))?
        };

        let mut builder =
            builder.port(config.port).timeout(Some(Duration::from_secs(config.timeout_secs)));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder
                .credentials(Credentials::new(username.clone(), password.expose_secret().to_string()));
        }

        Ok(Self { from, mailer: builder.build() })
    }
}

fn is_local_relay(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

fn mailbox(address: &str, name: Option<&str>) -> Result<Mailbox, MailError> {
    let parsed = address.trim().parse().map_err(|error: lettre::address::AddressError| {
        MailError::InvalidAddress { address: address.to_string(), reason: error.to_string() }
    })?;
    let name = name.map(str::trim).filter(|name| !name.is_empty()).map(str::to_string);
    Ok(Mailbox::new(name, parsed))
}

/// Assembles the MIME message: plain text, or text plus HTML alternative.
pub fn build_message(from: &Mailbox, email: &OutboundEmail) -> Result<Message, MailError> {
    let to = mailbox(&email.to, email.to_name.as_deref())?;
    let builder = Message::builder().from(from.clone()).to(to).subject(email.subject.clone());

    let message = match &email.html_body {
        Some(html) => builder.multipart(MultiPart::alternative_plain_html(
            email.text_body.clone(),
            html.clone(),
        )),
        None => builder.header(ContentType::TEXT_PLAIN).body(email.text_body.clone()),
    };
    message.map_err(|error| MailError::Build(error.to_string()))
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn send(&self, email: &OutboundEmail) -> Result<(), MailError> {
        let message = build_message(&self.from, email)?;
        self.mailer.send(message).await.map_err(|error| MailError::Transport(error.to_string()))?;
        tracing::info!(event_name = "mail.sent", recipient = %email.to, "email handed to relay");
        Ok(())
    }
}

/// Used when SMTP is switched off. Every send is refused.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledMailTransport;

#[async_trait]
impl MailTransport for DisabledMailTransport {
    async fn send(&self, email: &OutboundEmail) -> Result<(), MailError> {
        tracing::warn!(event_name = "mail.disabled", recipient = %email.to, "smtp disabled; send refused");
        Err(MailError::Disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::{build_message, mailbox, DisabledMailTransport, MailError, MailTransport, OutboundEmail};

    fn email(to: &str) -> OutboundEmail {
        OutboundEmail {
            to: to.to_string(),
            to_name: Some("Ada Lovelace".to_string()),
            subject: "Quick introduction for Acme".to_string(),
            text_body: "Hi Ada,\n\nShort note.".to_string(),
            html_body: None,
        }
    }

    #[test]
    fn plain_and_alternative_messages_build() {
        let from = mailbox("outreach@cadence.test", Some("Cadence")).expect("from");

        let plain = build_message(&from, &email("ada@acme.io")).expect("plain message");
        let rendered = String::from_utf8(plain.formatted()).expect("utf8");
        assert!(rendered.contains("Subject: Quick introduction for Acme"));
        assert!(rendered.contains("text/plain"));

        let mut rich = email("ada@acme.io");
        rich.html_body = Some("<p>Short note.</p>".to_string());
        let rendered = String::from_utf8(build_message(&from, &rich).expect("html").formatted())
            .expect("utf8");
        assert!(rendered.contains("multipart/alternative"));
    }

    #[test]
    fn malformed_recipients_are_not_retryable() {
        let from = mailbox("outreach@cadence.test", None).expect("from");
        let error = build_message(&from, &email("not-an-address")).expect_err("invalid");
        assert!(matches!(error, MailError::InvalidAddress { .. }));
        assert!(!error.is_retryable());
    }

    #[tokio::test]
    async fn disabled_transport_refuses_sends() {
        let error = DisabledMailTransport.send(&email("ada@acme.io")).await.expect_err("disabled");
        assert!(matches!(error, MailError::Disabled));
        assert!(MailError::Transport("timeout".to_string()).is_retryable());
    }
}
