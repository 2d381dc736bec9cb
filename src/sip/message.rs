// SIP message data model

use std::fmt;

use smallvec::SmallVec;

/// SIP method types
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Update,
    Info,
    Prack,
    Other(String),
}

impl Method {
    pub fn parse(token: &str) -> Self {
        match token {
            "REGISTER" => Method::Register,
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "OPTIONS" => Method::Options,
            "UPDATE" => Method::Update,
            "INFO" => Method::Info,
            "PRACK" => Method::Prack,
            other => Method::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Options => "OPTIONS",
            Method::Update => "UPDATE",
            Method::Info => "INFO",
            Method::Prack => "PRACK",
            Method::Other(s) => s.as_str(),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single SIP header (name-value pair)
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Collection of SIP headers in arrival order.
///
/// Typical messages carry fewer than a dozen headers, so entries stay inline.
/// The Call-ID position is cached because the transport routes every inbound
/// datagram by it.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: SmallVec<[Header; 12]>,
    call_id_idx: Option<usize>,
}

impl PartialEq for Headers {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

/// Compact header forms from RFC 3261 section 7.3.3
fn expand_compact(name: &str) -> &str {
    match name {
        "i" | "I" => "Call-ID",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "v" | "V" => "Via",
        "m" | "M" => "Contact",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        _ => name,
    }
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header value; compact names are stored in their long form.
    pub fn add(&mut self, name: &str, value: String) {
        let name = expand_compact(name);
        if self.call_id_idx.is_none() && name.eq_ignore_ascii_case("call-id") {
            self.call_id_idx = Some(self.entries.len());
        }
        self.entries.push(Header {
            name: name.to_string(),
            value,
        });
    }

    /// Get the first header value matching the name (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = expand_compact(name);
        if name.eq_ignore_ascii_case("call-id") {
            return self
                .call_id_idx
                .map(|idx| self.entries[idx].value.as_str());
        }
        self.entries
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Get all header values matching the name (case-insensitive)
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        let name = expand_compact(name);
        self.entries
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
            .collect()
    }

    pub fn entries(&self) -> &[Header] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// SIP request message
#[derive(Debug, Clone, PartialEq)]
pub struct SipRequest {
    pub method: Method,
    pub request_uri: String,
    pub version: String,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

/// SIP response message
#[derive(Debug, Clone, PartialEq)]
pub struct SipResponse {
    pub version: String,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

/// Top-level SIP message enum
#[derive(Debug, Clone, PartialEq)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(req) => &req.headers,
            SipMessage::Response(resp) => &resp.headers,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers().get("Call-ID")
    }

    /// Short human-readable label, e.g. `INVITE` or `180 Ringing`.
    pub fn summary(&self) -> String {
        match self {
            SipMessage::Request(req) => req.method.to_string(),
            SipMessage::Response(resp) => format!("{} {}", resp.status_code, resp.reason_phrase),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parse_known_and_other() {
        assert_eq!(Method::parse("INVITE"), Method::Invite);
        assert_eq!(Method::parse("PRACK"), Method::Prack);
        assert_eq!(
            Method::parse("SUBSCRIBE"),
            Method::Other("SUBSCRIBE".to_string())
        );
    }

    #[test]
    fn test_method_display_matches_token() {
        for token in ["REGISTER", "INVITE", "ACK", "BYE", "CANCEL", "NOTIFY"] {
            assert_eq!(Method::parse(token).to_string(), token);
        }
    }

    #[test]
    fn test_headers_get_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.add("Call-ID", "abc@host".to_string());
        headers.add("CSeq", "1 INVITE".to_string());
        assert_eq!(headers.get("call-id"), Some("abc@host"));
        assert_eq!(headers.get("CSEQ"), Some("1 INVITE"));
        assert_eq!(headers.get("Contact"), None);
    }

    #[test]
    fn test_headers_compact_form_is_expanded() {
        let mut headers = Headers::new();
        headers.add("i", "compact@host".to_string());
        headers.add("v", "SIP/2.0/UDP a".to_string());
        headers.add("v", "SIP/2.0/UDP b".to_string());
        assert_eq!(headers.get("Call-ID"), Some("compact@host"));
        assert_eq!(headers.get_all("Via"), vec!["SIP/2.0/UDP a", "SIP/2.0/UDP b"]);
        assert_eq!(headers.entries()[0].name, "Call-ID");
    }

    #[test]
    fn test_headers_first_call_id_wins() {
        let mut headers = Headers::new();
        headers.add("Call-ID", "first".to_string());
        headers.add("Call-ID", "second".to_string());
        assert_eq!(headers.get("Call-ID"), Some("first"));
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_message_summary() {
        let resp = SipMessage::Response(SipResponse {
            version: "SIP/2.0".to_string(),
            status_code: 180,
            reason_phrase: "Ringing".to_string(),
            headers: Headers::new(),
            body: None,
        });
        assert_eq!(resp.summary(), "180 Ringing");

        let req = SipMessage::Request(SipRequest {
            method: Method::Bye,
            request_uri: "sip:a@b".to_string(),
            version: "SIP/2.0".to_string(),
            headers: Headers::new(),
            body: None,
        });
        assert_eq!(req.summary(), "BYE");
        assert_eq!(req.call_id(), None);
    }
}
