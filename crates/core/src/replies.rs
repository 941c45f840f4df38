//! Inbound reply triage and classification rules.

use crate::domain::lead::LeadStatus;
use crate::domain::reply::{InboundMessage, ReplyClass};
use crate::lifecycle::LeadEvent;

/// Lead statuses a reply may be attributed to.
pub const MATCHABLE_STATUSES: [LeadStatus; 5] = [
    LeadStatus::Contacted,
    LeadStatus::FollowUp,
    LeadStatus::Replied,
    LeadStatus::Interested,
    LeadStatus::NotInterested,
];

/// Bodies shorter than this are not worth a classification call.
pub const MIN_CLASSIFIABLE_BODY_LEN: usize = 10;

const OUT_OF_OFFICE_MARKERS: [&str; 5] =
    ["out of office", "automatic reply", "auto-reply", "away from my desk", "on vacation"];
const BOUNCE_SENDERS: [&str; 2] = ["mailer-daemon", "postmaster"];
const BOUNCE_MARKERS: [&str; 3] = ["delivery failed", "undelivered", "user unknown"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Triage {
    OutOfOffice,
    /// Delivery failure notice, with any addresses found in the body.
    Bounce { recipients: Vec<String> },
    Reply,
}

pub fn triage(message: &InboundMessage) -> Triage {
    if is_out_of_office(&message.subject, &message.body) {
        return Triage::OutOfOffice;
    }
    if is_bounce(&message.from_email, &message.body) {
        return Triage::Bounce { recipients: bounce_recipients(&message.body) };
    }
    Triage::Reply
}

pub fn is_out_of_office(subject: &str, body: &str) -> bool {
    let subject = subject.to_lowercase();
    let body = body.to_lowercase();
    OUT_OF_OFFICE_MARKERS.iter().any(|marker| subject.contains(marker) || body.contains(marker))
}

pub fn is_bounce(from_email: &str, body: &str) -> bool {
    let from = from_email.to_lowercase();
    if BOUNCE_SENDERS.iter().any(|sender| from.contains(sender)) {
        return true;
    }
    let body = body.to_lowercase();
    BOUNCE_MARKERS.iter().any(|marker| body.contains(marker))
}

/// Email-looking tokens in a bounce body, lowercased and deduplicated in order.
pub fn bounce_recipients(body: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    let tokens = body.split(|c: char| c.is_whitespace() || "<>()[];,:\"'".contains(c));
    for token in tokens {
        let candidate = token.trim_matches('.').to_ascii_lowercase();
        let Some((local, domain)) = candidate.split_once('@') else {
            continue;
        };
        if local.is_empty() || !domain.contains('.') {
            continue;
        }
        if BOUNCE_SENDERS.iter().any(|sender| local.contains(sender)) {
            continue;
        }
        if !found.contains(&candidate) {
            found.push(candidate);
        }
    }
    found
}

/// Lowercased bare address; accepts `Name <addr>` forms.
pub fn normalize_sender(raw: &str) -> String {
    let raw = raw.trim();
    let address = match (raw.rfind('<'), raw.rfind('>')) {
        (Some(open), Some(close)) if open < close => &raw[open + 1..close],
        _ => raw,
    };
    address.trim().to_ascii_lowercase()
}

/// Maps free-form model output onto a reply class. Opt-outs win over everything else,
/// and negative interest wins over positive.
pub fn normalize_classification(raw: &str) -> ReplyClass {
    let text = raw.trim().to_lowercase().replace(['_', '-'], " ");
    if text.contains("unsubscribe") || text.contains("remove") {
        return ReplyClass::Unsubscribe;
    }
    if text.contains("not interested") || text.contains("no interest") || text.contains("uninterested")
    {
        return ReplyClass::NotInterested;
    }
    if text.contains("interested") {
        return ReplyClass::Interested;
    }
    ReplyClass::Unclear
}

pub fn is_classifiable(body: &str) -> bool {
    body.trim().chars().count() > MIN_CLASSIFIABLE_BODY_LEN
}

pub fn lead_event_for(class: ReplyClass) -> LeadEvent {
    match class {
        ReplyClass::Interested => LeadEvent::MarkedInterested,
        ReplyClass::NotInterested => LeadEvent::MarkedNotInterested,
        ReplyClass::Unsubscribe => LeadEvent::Unsubscribed,
        ReplyClass::Unclear => LeadEvent::ReplyReceived,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{
        bounce_recipients, is_classifiable, lead_event_for, normalize_classification,
        normalize_sender, triage, Triage,
    };
    use crate::domain::reply::{InboundMessage, ReplyClass};
    use crate::lifecycle::LeadEvent;

    fn message(from: &str, subject: &str, body: &str) -> InboundMessage {
        InboundMessage {
            from_email: from.to_string(),
            to_email: None,
            subject: subject.to_string(),
            body: body.to_string(),
            message_id: None,
            in_reply_to: None,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn out_of_office_is_detected_in_subject_or_body() {
        assert_eq!(
            triage(&message("ada@acme.io", "Automatic reply: Quick intro", "")),
            Triage::OutOfOffice
        );
        assert_eq!(
            triage(&message("ada@acme.io", "Re: intro", "I am On Vacation until Monday")),
            Triage::OutOfOffice
        );
    }

    #[test]
    fn bounces_are_detected_by_sender_or_body() {
        let notice = message(
            "MAILER-DAEMON@mx.acme.io",
            "Undeliverable",
            "Delivery to <grace@navy.mil> failed permanently.",
        );
        assert_eq!(
            triage(&notice),
            Triage::Bounce { recipients: vec!["grace@navy.mil".to_string()] }
        );

        let by_body = message("relay@acme.io", "Notice", "550 user unknown: ada@acme.io.");
        assert_eq!(triage(&by_body), Triage::Bounce { recipients: vec!["ada@acme.io".to_string()] });
    }

    #[test]
    fn bounce_recipients_skip_daemon_addresses_and_duplicates() {
        let body = "From postmaster@mx.io: ada@acme.io, ADA@acme.io; bob@host";
        assert_eq!(bounce_recipients(body), vec!["ada@acme.io".to_string()]);
    }

    #[test]
    fn ordinary_reply_passes_triage() {
        assert_eq!(triage(&message("ada@acme.io", "Re: intro", "Sounds good")), Triage::Reply);
    }

    #[test]
    fn classification_normalisation_prefers_opt_outs_then_negatives() {
        assert_eq!(normalize_classification("Interested"), ReplyClass::Interested);
        assert_eq!(normalize_classification("not interested."), ReplyClass::NotInterested);
        assert_eq!(normalize_classification("not_interested"), ReplyClass::NotInterested);
        assert_eq!(normalize_classification("UNSUBSCRIBE"), ReplyClass::Unsubscribe);
        assert_eq!(normalize_classification("please remove me"), ReplyClass::Unsubscribe);
        assert_eq!(normalize_classification("unclear"), ReplyClass::Unclear);
        assert_eq!(normalize_classification(""), ReplyClass::Unclear);
    }

    #[test]
    fn sender_normalisation_strips_display_names() {
        assert_eq!(normalize_sender(" Ada Lovelace <Ada@Acme.IO> "), "ada@acme.io");
        assert_eq!(normalize_sender("GRACE@navy.mil"), "grace@navy.mil");
    }

    #[test]
    fn short_bodies_are_not_classified() {
        assert!(!is_classifiable("ok thanks"));
        assert!(is_classifiable("Yes, let's talk next week."));
    }

    #[test]
    fn reply_classes_map_to_lead_events() {
        assert_eq!(lead_event_for(ReplyClass::Interested), LeadEvent::MarkedInterested);
        assert_eq!(lead_event_for(ReplyClass::Unsubscribe), LeadEvent::Unsubscribed);
        assert_eq!(lead_event_for(ReplyClass::Unclear), LeadEvent::ReplyReceived);
    }
}
