use core_model::{NewMessage, RawMessage};

const ORIGINAL_MESSAGE_MARKER: &str = "-----Original Message-----";

/// Why a raw record was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoCharset,
    EmptyBody,
    NoMessageId,
}

/// Turns a raw record into a storable message, or says why it cannot be
/// stored.
pub fn sanitize(raw: RawMessage) -> Result<NewMessage, SkipReason> {
    if raw.charset.is_none() {
        return Err(SkipReason::NoCharset);
    }
    let body = match raw.body {
        Some(body) if !body.is_empty() => body,
        _ => return Err(SkipReason::EmptyBody),
    };
    let message_id = raw
        .message_id
        .as_deref()
        .and_then(strip_angle_brackets)
        .ok_or(SkipReason::NoMessageId)?;
    Ok(NewMessage {
        message_id,
        in_reply_to: raw.in_reply_to.as_deref().and_then(strip_angle_brackets),
        subject: raw.subject.unwrap_or_default(),
        sent_from: raw
            .sent_from
            .as_deref()
            .and_then(strip_angle_brackets)
            .unwrap_or_default(),
        date: raw.date,
        body: remove_quoted_reply(&body),
    })
}

/// Drops quoted lines and everything from an original-message marker on.
pub fn remove_quoted_reply(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.eq_ignore_ascii_case(ORIGINAL_MESSAGE_MARKER) {
            break;
        }
        if !trimmed.starts_with('>') {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Trims and removes one pair of surrounding `<` `>`. Blank results are
/// `None`.
pub fn strip_angle_brackets(value: &str) -> Option<String> {
    let trimmed = value.trim();
    let inner = trimmed
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(trimmed)
        .trim();
    (!inner.is_empty()).then(|| inner.to_string())
}
