// Message template rendering
//
// Templates are raw SIP text with `[keyword]` placeholders. Rendering trims
// leading indentation from every line and normalizes line endings to CRLF.
// `[len]` is filled last, once the body size is known.

use std::net::SocketAddr;

use crate::data_source::VariableRow;
use crate::sip::generate_branch;
use crate::sip::message::SipMessage;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    #[error("template references field {index} but the row has {available} fields")]
    MissingField { index: usize, available: usize },
}

/// A recognized placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Keyword {
    Field(usize),
    CallId,
    CallNumber,
    Cseq,
    Branch,
    LocalIp,
    LocalPort,
    RemoteIp,
    RemotePort,
    MediaIp,
    MediaPort,
    Transport,
    Len,
    /// `[last_Via:]`: the named header lines of the last received message.
    LastHeader(String),
}

impl Keyword {
    pub fn parse(name: &str) -> Option<Keyword> {
        if let Some(n) = name.strip_prefix("field") {
            return n.parse().ok().map(Keyword::Field);
        }
        if let Some(header) = name.strip_prefix("last_") {
            let header = header.strip_suffix(':').unwrap_or(header);
            if header.is_empty() {
                return None;
            }
            return Some(Keyword::LastHeader(header.to_string()));
        }
        let kw = match name {
            "call_id" => Keyword::CallId,
            "call_number" => Keyword::CallNumber,
            "cseq" => Keyword::Cseq,
            "branch" => Keyword::Branch,
            "local_ip" => Keyword::LocalIp,
            "local_port" => Keyword::LocalPort,
            "remote_ip" => Keyword::RemoteIp,
            "remote_port" => Keyword::RemotePort,
            "media_ip" => Keyword::MediaIp,
            "media_port" => Keyword::MediaPort,
            "transport" => Keyword::Transport,
            "len" => Keyword::Len,
            _ => return None,
        };
        Some(kw)
    }
}

/// Everything a template can pull from while rendering one message.
#[derive(Debug, Clone)]
pub struct RenderContext<'a> {
    pub call_id: &'a str,
    pub call_number: u64,
    pub cseq: u32,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub media: SocketAddr,
    pub row: &'a VariableRow,
    pub last_message: Option<&'a SipMessage>,
}

/// Whether bracketed text looks like a placeholder rather than literal
/// content such as an IPv6 reference `[::1]`.
fn is_placeholder_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ':')
}

/// Yield `(start, end, name)` for each placeholder; `start..end` spans the brackets.
fn placeholders(text: &str) -> Vec<(usize, usize, &str)> {
    let mut found = Vec::new();
    let mut pos = 0;
    while let Some(open) = text[pos..].find('[') {
        let start = pos + open;
        let Some(close) = text[start + 1..].find(|c: char| c == ']' || c == '[' || c == '\n') else {
            break;
        };
        let end = start + 1 + close;
        if text.as_bytes()[end] != b']' {
            pos = end;
            continue;
        }
        let name = &text[start + 1..end];
        if is_placeholder_name(name) {
            found.push((start, end + 1, name));
        }
        pos = end + 1;
    }
    found
}

/// Check that every placeholder in the template is a known keyword.
pub fn validate(template: &str) -> Result<(), String> {
    for (_, _, name) in placeholders(template) {
        if Keyword::parse(name).is_none() {
            return Err(format!("unknown template keyword '[{}]'", name));
        }
    }
    Ok(())
}

/// Largest `[fieldN]` index the template references, if any.
pub fn max_field_index(template: &str) -> Option<usize> {
    placeholders(template)
        .into_iter()
        .filter_map(|(_, _, name)| match Keyword::parse(name) {
            Some(Keyword::Field(n)) => Some(n),
            _ => None,
        })
        .max()
}

/// Method token of the start line, or `None` for a response template.
pub fn request_method(template: &str) -> Option<&str> {
    let first = template.trim_start().split_whitespace().next()?;
    if first.starts_with("SIP/") {
        None
    } else {
        Some(first)
    }
}

/// Trim indentation and split into header lines and body lines at the first blank line.
fn split_sections(template: &str) -> (Vec<&str>, Vec<&str>) {
    let lines: Vec<&str> = template
        .trim()
        .lines()
        .map(|l| l.trim_start().trim_end_matches(['\r', ' ', '\t']))
        .collect();

    match lines.iter().position(|l| l.is_empty()) {
        Some(i) => (lines[..i].to_vec(), lines[i + 1..].to_vec()),
        None => (lines, Vec::new()),
    }
}

fn write_last_header(out: &mut String, name: &str, last: Option<&SipMessage>) {
    let Some(msg) = last else { return };
    let mut first = true;
    for h in msg
        .headers()
        .entries()
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case(name))
    {
        if !first {
            out.push_str("\r\n");
        }
        out.push_str(&h.name);
        out.push_str(": ");
        out.push_str(&h.value);
        first = false;
    }
}

fn substitute(
    text: &str,
    ctx: &RenderContext<'_>,
    method: &str,
    body_len: Option<usize>,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(text.len() + 64);
    let mut last = 0;
    for (start, end, name) in placeholders(text) {
        let Some(kw) = Keyword::parse(name) else {
            continue;
        };
        // First pass fills everything but [len]; second pass fills only [len].
        if (kw == Keyword::Len) != body_len.is_some() {
            continue;
        }
        out.push_str(&text[last..start]);
        last = end;
        match kw {
            Keyword::Field(n) => {
                let value = ctx.row.field(n).ok_or(TemplateError::MissingField {
                    index: n,
                    available: ctx.row.fields.len(),
                })?;
                out.push_str(value);
            }
            Keyword::CallId => out.push_str(ctx.call_id),
            Keyword::CallNumber => {
                out.push_str(itoa::Buffer::new().format(ctx.call_number));
            }
            Keyword::Cseq => out.push_str(itoa::Buffer::new().format(ctx.cseq)),
            Keyword::Branch => out.push_str(&generate_branch(ctx.call_id, ctx.cseq, method)),
            Keyword::LocalIp => out.push_str(&ctx.local.ip().to_string()),
            Keyword::LocalPort => out.push_str(itoa::Buffer::new().format(ctx.local.port())),
            Keyword::RemoteIp => out.push_str(&ctx.remote.ip().to_string()),
            Keyword::RemotePort => out.push_str(itoa::Buffer::new().format(ctx.remote.port())),
            Keyword::MediaIp => out.push_str(&ctx.media.ip().to_string()),
            Keyword::MediaPort => out.push_str(itoa::Buffer::new().format(ctx.media.port())),
            Keyword::Transport => out.push_str("UDP"),
            Keyword::Len => out.push_str(itoa::Buffer::new().format(body_len.unwrap_or(0))),
            Keyword::LastHeader(header) => write_last_header(&mut out, &header, ctx.last_message),
        }
    }
    out.push_str(&text[last..]);
    Ok(out)
}

/// Render a template into wire-ready bytes.
///
/// Header lines that expand to nothing (an absent `[last_X:]`) are dropped so
/// they cannot end the header block early.
pub fn render(template: &str, ctx: &RenderContext<'_>) -> Result<Vec<u8>, TemplateError> {
    let method = request_method(template).unwrap_or("");
    let (head, body) = split_sections(template);

    let mut head_lines = Vec::with_capacity(head.len());
    for line in head {
        let filled = substitute(line, ctx, method, None)?;
        if !filled.is_empty() {
            head_lines.push(filled);
        }
    }

    let mut body_out = String::new();
    for line in body {
        body_out.push_str(&substitute(line, ctx, method, None)?);
        body_out.push_str("\r\n");
    }

    let mut out = String::with_capacity(template.len() + body_out.len() + 128);
    for line in head_lines {
        out.push_str(&substitute(&line, ctx, method, Some(body_out.len()))?);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out.push_str(&body_out);
    Ok(out.into_bytes())
}
