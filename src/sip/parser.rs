// SIP message parser using nom combinators

use nom::{
    bytes::complete::{tag, take_until, take_while1},
    character::complete::{digit1, space0, space1},
    IResult,
};
use std::fmt;

use super::message::{Headers, Method, SipMessage, SipRequest, SipResponse};

/// Parse error with descriptive messages
#[derive(Debug, Clone, PartialEq)]
pub struct SipParseError {
    pub message: String,
}

impl fmt::Display for SipParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP parse error: {}", self.message)
    }
}

impl std::error::Error for SipParseError {}

impl SipParseError {
    pub fn new(message: impl Into<String>) -> Self {
        SipParseError {
            message: message.into(),
        }
    }
}

/// Parse a SIP message from raw bytes.
///
/// A first line starting with "SIP/" is a status line, anything else is a
/// request line.
pub fn parse_sip_message(input: &[u8]) -> Result<SipMessage, SipParseError> {
    if input.is_empty() {
        return Err(SipParseError::new("empty input"));
    }

    if input.starts_with(b"SIP/") {
        parse_response(input)
    } else {
        parse_request(input)
    }
}

fn crlf(input: &[u8]) -> IResult<&[u8], &[u8]> {
    tag(b"\r\n")(input)
}

/// METHOD SP Request-URI SP SIP-Version CRLF
fn parse_request_line(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8], &[u8])> {
    let (input, method) = take_while1(|b: u8| b.is_ascii_alphabetic())(input)?;
    let (input, _) = space1(input)?;
    let (input, uri) = take_while1(|b: u8| b != b' ' && b != b'\r' && b != b'\n')(input)?;
    let (input, _) = space1(input)?;
    let (input, version) = take_until("\r\n")(input)?;
    let (input, _) = crlf(input)?;
    Ok((input, (method, uri, version)))
}

/// SIP-Version SP Status-Code SP Reason-Phrase CRLF
fn parse_status_line(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8], &[u8])> {
    let (input, version) = take_while1(|b: u8| b != b' ' && b != b'\r' && b != b'\n')(input)?;
    let (input, _) = space1(input)?;
    let (input, status_code) = digit1(input)?;
    let (input, _) = space0(input)?;
    let (input, reason) = take_until("\r\n")(input)?;
    let (input, _) = crlf(input)?;
    Ok((input, (version, status_code, reason)))
}

/// Header-Name: Header-Value CRLF
fn parse_header_line(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8])> {
    let (input, name) = take_while1(|b: u8| b != b':' && b != b'\r' && b != b'\n')(input)?;
    let (input, _) = tag(b":")(input)?;
    let (input, _) = space0(input)?;
    let (input, value) = take_until("\r\n")(input)?;
    let (input, _) = crlf(input)?;
    Ok((input, (name, value)))
}

/// Parse headers up to and including the empty line.
fn parse_headers(mut input: &[u8]) -> IResult<&[u8], Vec<(&[u8], &[u8])>> {
    let mut headers = Vec::new();
    loop {
        if input.starts_with(b"\r\n") {
            let (remaining, _) = crlf(input)?;
            return Ok((remaining, headers));
        }
        let (remaining, header) = parse_header_line(input)?;
        headers.push(header);
        input = remaining;
    }
}

fn utf8<'a>(bytes: &'a [u8], what: &str) -> Result<&'a str, SipParseError> {
    std::str::from_utf8(bytes).map_err(|_| SipParseError::new(format!("invalid UTF-8 in {}", what)))
}

fn build_headers(raw: &[(&[u8], &[u8])]) -> Result<Headers, SipParseError> {
    let mut headers = Headers::new();
    for (name_bytes, value_bytes) in raw {
        let name = utf8(name_bytes, "header name")?.trim();
        let value = utf8(value_bytes, "header value")?.trim().to_string();
        headers.add(name, value);
    }
    Ok(headers)
}

fn parse_request(input: &[u8]) -> Result<SipMessage, SipParseError> {
    let (remaining, (method_bytes, uri_bytes, version_bytes)) = parse_request_line(input)
        .map_err(|e| SipParseError::new(format!("invalid request line: {}", e)))?;

    let method = Method::parse(utf8(method_bytes, "method")?);
    let request_uri = utf8(uri_bytes, "request URI")?.to_string();
    let version = utf8(version_bytes, "SIP version")?.to_string();
    if !version.starts_with("SIP/") {
        return Err(SipParseError::new(format!("invalid SIP version: {}", version)));
    }

    let (remaining, raw_headers) = parse_headers(remaining)
        .map_err(|e| SipParseError::new(format!("invalid headers: {}", e)))?;
    let headers = build_headers(&raw_headers)?;
    let body = parse_body(remaining, &headers)?;

    Ok(SipMessage::Request(SipRequest {
        method,
        request_uri,
        version,
        headers,
        body,
    }))
}

fn parse_response(input: &[u8]) -> Result<SipMessage, SipParseError> {
    let (remaining, (version_bytes, status_bytes, reason_bytes)) = parse_status_line(input)
        .map_err(|e| SipParseError::new(format!("invalid status line: {}", e)))?;

    let version = utf8(version_bytes, "SIP version")?.to_string();
    let status_str = utf8(status_bytes, "status code")?;
    let status_code: u16 = status_str
        .parse()
        .map_err(|_| SipParseError::new(format!("invalid status code: {}", status_str)))?;
    if !(100..=699).contains(&status_code) {
        return Err(SipParseError::new(format!("status code out of range: {}", status_code)));
    }
    let reason_phrase = utf8(reason_bytes, "reason phrase")?.to_string();

    let (remaining, raw_headers) = parse_headers(remaining)
        .map_err(|e| SipParseError::new(format!("invalid headers: {}", e)))?;
    let headers = build_headers(&raw_headers)?;
    let body = parse_body(remaining, &headers)?;

    Ok(SipMessage::Response(SipResponse {
        version,
        status_code,
        reason_phrase,
        headers,
        body,
    }))
}

/// Parse the message body based on Content-Length header
fn parse_body(remaining: &[u8], headers: &Headers) -> Result<Option<Vec<u8>>, SipParseError> {
    let content_length = headers
        .get("Content-Length")
        .map(|v| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| SipParseError::new(format!("invalid Content-Length: {}", v)))
        })
        .transpose()?;

    match content_length {
        Some(0) => Ok(None),
        Some(len) => {
            if remaining.len() < len {
                Err(SipParseError::new(format!(
                    "body too short: expected {} bytes, got {}",
                    len,
                    remaining.len()
                )))
            } else {
                Ok(Some(remaining[..len].to_vec()))
            }
        }
        None if remaining.is_empty() => Ok(None),
        None => Ok(Some(remaining.to_vec())),
    }
}
