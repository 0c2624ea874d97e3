//! Customer acknowledgment emails.
//!
//! Sent after a ticket is created and after a reply escalates one. The body
//! comes from the tenant's template when set, otherwise the built-in
//! default. Template substitution is a closed set of placeholders; anything
//! else in the template passes through untouched. A send failure is logged
//! and swallowed: the ticket mutation already committed and an
//! acknowledgment is not worth failing the message over.

use tracing::warn;

use crate::mailbox::{MailboxSource, OutboundMessage};
use crate::store::TenantRecord;
use crate::tickets::model::{Ticket, strip_reply_prefixes};

const DEFAULT_TEMPLATE: &str = "Hello {{customerName}},\n\n\
Thank you for contacting {{companyName}}. We have received your request \
\"{{subject}}\" and created ticket {{ticketNumber}} for it. Our team will \
get back to you as soon as possible.\n\n\
Please keep {{ticketNumber}} in the subject line when replying.";

const PORTAL_LINE: &str = "\n\nYou can follow progress at {{portalUrl}}.";

/// Substitute the known placeholders. Unknown `{{...}}` sequences are left
/// as-is so a typo in a tenant template shows up in the mail instead of
/// vanishing silently.
pub fn render_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}

/// Portal link for a ticket, when the tenant's portal is enabled and has a
/// base URL. The public token gates access; the link needs no login.
pub fn portal_url(tenant: &TenantRecord, ticket: &Ticket) -> Option<String> {
    if !tenant.portal_enabled {
        return None;
    }
    let base = tenant.portal_base_url.as_deref()?;
    Some(format!(
        "{}/tickets/{}",
        base.trim_end_matches('/'),
        ticket.public_token
    ))
}

/// Build the acknowledgment for a ticket. The subject embeds the ticket
/// number so a plain reply-all from the customer resolves by reference.
pub fn build_acknowledgment(tenant: &TenantRecord, ticket: &Ticket) -> OutboundMessage {
    let customer = ticket
        .sender_name
        .as_deref()
        .unwrap_or(&ticket.sender_email);
    let portal = portal_url(tenant, ticket);

    let mut template = tenant
        .ack_template
        .clone()
        .unwrap_or_else(|| DEFAULT_TEMPLATE.to_string());
    if tenant.ack_template.is_none() && portal.is_some() {
        template.push_str(PORTAL_LINE);
    }

    let portal_value = portal.unwrap_or_default();
    let values = [
        ("customerName", customer),
        ("companyName", tenant.name.as_str()),
        ("subject", ticket.subject.as_str()),
        ("ticketNumber", ticket.number.as_str()),
        ("portalUrl", portal_value.as_str()),
    ];

    OutboundMessage {
        to: ticket.sender_email.clone(),
        subject: format!(
            "Re: {} [{}]",
            strip_reply_prefixes(&ticket.subject),
            ticket.number
        ),
        body: render_template(&template, &values),
        in_reply_to: Some(ticket.external_message_id.clone()),
    }
}

/// Send the acknowledgment through the tenant's mailbox. Failures are
/// logged, never propagated.
pub async fn dispatch_acknowledgment(
    source: &mut dyn MailboxSource,
    tenant: &TenantRecord,
    ticket: &Ticket,
) {
    let message = build_acknowledgment(tenant, ticket);
    if let Err(e) = source.send(&message).await {
        warn!(
            ticket = %ticket.number,
            to = %message.to,
            error = %e,
            "Acknowledgment send failed"
        );
    }
}
