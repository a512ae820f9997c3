use mailparse::{DispositionType, MailAddr, MailHeaderMap, ParsedMail, addrparse_header};
use tracing::warn;

use tempbox_core::Mail;

use super::IngestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextKind {
    Plain,
    Html,
}

/// A leaf MIME part as seen by ingestion. A part is inline when its
/// disposition says so, or when it is `text/*` and not marked as an
/// attachment; everything else is an attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MimePart {
    Inline { content_type: String, body: String },
    Attachment { filename: String },
}

/// Classifies a raw `Content-Type` value by its media type prefix,
/// ignoring case and any trailing parameters.
pub fn classify_content_type(content_type: &str) -> Option<TextKind> {
    let value = content_type.trim_start();
    if has_prefix_ignore_case(value, "text/html") {
        Some(TextKind::Html)
    } else if has_prefix_ignore_case(value, "text/plain") {
        Some(TextKind::Plain)
    } else {
        None
    }
}

fn has_prefix_ignore_case(value: &str, prefix: &str) -> bool {
    value
        .as_bytes()
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix.as_bytes()))
}

/// Parses one raw RFC 5322 message. Malformed parts are logged and skipped;
/// only a message that cannot be parsed at all is an error.
pub fn parse_message(raw: &[u8]) -> Result<Mail, IngestError> {
    let parsed =
        mailparse::parse_mail(raw).map_err(|err| IngestError::PartParse(err.to_string()))?;
    let mut mail = Mail {
        from: first_address(&parsed, "From").unwrap_or_default(),
        to: first_address(&parsed, "To").unwrap_or_default(),
        timestamp: header_timestamp(&parsed),
        subject: parsed
            .headers
            .get_first_value("Subject")
            .unwrap_or_default(),
        ..Mail::default()
    };

    let mut parts = Vec::new();
    collect_parts(&parsed, &mut parts);
    for part in parts {
        match part {
            Ok(MimePart::Inline { content_type, body }) => {
                match classify_content_type(&content_type) {
                    Some(TextKind::Html) => mail.html_text.push(body),
                    Some(TextKind::Plain) => mail.plain_text.push(body),
                    None => {}
                }
            }
            Ok(MimePart::Attachment { filename }) => mail.attachments.push(filename),
            Err(err) => warn!(
                to = %mail.to,
                subject = %mail.subject,
                error = %err,
                "skipping malformed MIME part"
            ),
        }
    }
    Ok(mail)
}

fn collect_parts(parsed: &ParsedMail, out: &mut Vec<Result<MimePart, IngestError>>) {
    if parsed.subparts.is_empty() {
        out.push(leaf_part(parsed));
        return;
    }
    for part in &parsed.subparts {
        collect_parts(part, out);
    }
}

fn leaf_part(part: &ParsedMail) -> Result<MimePart, IngestError> {
    let disposition = part.get_content_disposition();
    // mailparse reports a missing header as inline, so look at the header itself.
    let explicit_inline = matches!(disposition.disposition, DispositionType::Inline)
        && part.headers.get_first_header("Content-Disposition").is_some();
    let attachment_disposition = matches!(disposition.disposition, DispositionType::Attachment);
    let is_text = has_prefix_ignore_case(&part.ctype.mimetype, "text/");
    if !explicit_inline && (attachment_disposition || !is_text) {
        let filename = disposition
            .params
            .get("filename")
            .cloned()
            .or_else(|| part.ctype.params.get("name").cloned())
            .unwrap_or_default();
        return Ok(MimePart::Attachment { filename });
    }
    // A part without the header is text/plain; mailparse fills that default in.
    let content_type = part
        .headers
        .get_first_value("Content-Type")
        .unwrap_or_else(|| part.ctype.mimetype.clone());
    let body = part
        .get_body()
        .map_err(|err| IngestError::PartParse(format!("{}: {}", content_type, err)))?;
    Ok(MimePart::Inline { content_type, body })
}

fn first_address(parsed: &ParsedMail, name: &str) -> Option<String> {
    let header = parsed.headers.get_first_header(name)?;
    let list = addrparse_header(header).ok()?;
    list.iter().find_map(|addr| match addr {
        MailAddr::Single(info) => Some(info.addr.trim().to_string()),
        MailAddr::Group(group) => group.addrs.first().map(|info| info.addr.trim().to_string()),
    })
}

fn header_timestamp(parsed: &ParsedMail) -> i64 {
    parsed
        .headers
        .get_first_value("Date")
        .and_then(|date| mailparse::dateparse(&date).ok())
        .unwrap_or(0)
}
