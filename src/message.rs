//! SIP message grammar (RFC 3261 subset): tolerant line-based parsing and
//! serialization with an authoritative Content-Length.

use crate::error::{Error, Result};

pub const SIP_VERSION: &str = "SIP/2.0";

#[derive(Debug, Clone, PartialEq)]
pub enum StartLine {
    Request { method: String, uri: String },
    Response { status: u16, reason: String },
}

/// Ordered header multimap. Names compare case-insensitively but keep the
/// spelling they were inserted with; duplicate names keep append order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for a name, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Replace the first occurrence in place (dropping any later
    /// duplicates), or append when the name is absent.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(index) => {
                self.entries[index].1 = value;
                let mut i = index + 1;
                while i < self.entries.len() {
                    if self.entries[i].0.eq_ignore_ascii_case(name) {
                        self.entries.remove(i);
                    } else {
                        i += 1;
                    }
                }
            }
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SipMessage {
    pub start: StartLine,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Raw wire form as received; kept for the SIP trace log only.
    pub raw: String,
}

impl SipMessage {
    pub fn request(method: &str, uri: &str) -> SipMessage {
        SipMessage {
            start: StartLine::Request {
                method: method.to_string(),
                uri: uri.to_string(),
            },
            headers: Headers::default(),
            body: Vec::new(),
            raw: String::new(),
        }
    }

    pub fn response(status: u16, reason: &str) -> SipMessage {
        SipMessage {
            start: StartLine::Response {
                status,
                reason: reason.to_string(),
            },
            headers: Headers::default(),
            body: Vec::new(),
            raw: String::new(),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    pub fn method(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { status, .. } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }

    pub fn reason(&self) -> &str {
        match &self.start {
            StartLine::Response { reason, .. } => reason,
            StartLine::Request { .. } => "",
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    /// `(sequence, method)` from the CSeq header.
    pub fn cseq(&self) -> Option<(u32, String)> {
        let value = self.header("CSeq")?;
        let mut parts = value.split_whitespace();
        let sequence = parts.next()?.parse().ok()?;
        let method = parts.next()?.to_string();
        Some((sequence, method))
    }

    /// First line of the raw form, for one-line log output.
    pub fn summary(&self) -> String {
        match &self.start {
            StartLine::Request { method, uri } => format!("{} {}", method, uri),
            StartLine::Response { status, reason } => format!("{} {}", status, reason),
        }
    }

    /// Parse one whole message. Tolerant: lines end in CRLF but a bare LF is
    /// accepted, header values are trimmed, unknown content is kept as-is.
    pub fn parse(data: &[u8]) -> Result<SipMessage> {
        let header_end = find_crlf_crlf(data);
        let (header_region, body_region) = match header_end {
            Some(end) => (&data[..end], &data[end + 4..]),
            None => (data, &data[data.len()..]),
        };
        let header_text = std::str::from_utf8(header_region)
            .map_err(|_| Error::Parse("message headers are not UTF-8".to_string()))?;

        let mut lines = header_text.split('\n').map(|l| l.trim_end_matches('\r'));
        let start_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| Error::Parse("empty message".to_string()))?;

        let start = if let Some(rest) = start_line.strip_prefix(SIP_VERSION) {
            let mut parts = rest.trim_start().splitn(2, ' ');
            let status = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::Parse(format!("bad status line '{}'", start_line)))?;
            let reason = parts.next().unwrap_or("").trim().to_string();
            StartLine::Response { status, reason }
        } else {
            let mut parts = start_line.split_whitespace();
            let method = parts
                .next()
                .ok_or_else(|| Error::Parse("empty request line".to_string()))?
                .to_string();
            let uri = parts
                .next()
                .ok_or_else(|| Error::Parse(format!("request line '{}' has no URI", start_line)))?
                .to_string();
            StartLine::Request { method, uri }
        };

        let mut headers = Headers::default();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.append(name.trim(), value.trim());
            }
        }

        // Content-Length is authoritative on stream transports; datagrams
        // fall back to "rest of the packet".
        let body = match headers.get("Content-Length").and_then(|v| v.parse().ok()) {
            Some(length) => body_region[..body_region.len().min(length)].to_vec(),
            None => body_region.to_vec(),
        };

        Ok(SipMessage {
            start,
            headers,
            body,
            raw: String::from_utf8_lossy(data).into_owned(),
        })
    }

    /// Serialize for the wire. Headers go out in insertion order; the
    /// Content-Length value is always computed from the body, replacing any
    /// stored value in place (or appended last when absent).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut text = String::with_capacity(256 + self.body.len());
        match &self.start {
            StartLine::Request { method, uri } => {
                text.push_str(method);
                text.push(' ');
                text.push_str(uri);
                text.push(' ');
                text.push_str(SIP_VERSION);
            }
            StartLine::Response { status, reason } => {
                text.push_str(SIP_VERSION);
                text.push(' ');
                text.push_str(&status.to_string());
                text.push(' ');
                text.push_str(reason);
            }
        }
        text.push_str("\r\n");

        let mut wrote_length = false;
        for (name, value) in self.headers.iter() {
            text.push_str(name);
            text.push_str(": ");
            if name.eq_ignore_ascii_case("Content-Length") {
                text.push_str(&self.body.len().to_string());
                wrote_length = true;
            } else {
                text.push_str(value);
            }
            text.push_str("\r\n");
        }
        if !wrote_length {
            text.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        text.push_str("\r\n");

        let mut bytes = text.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

pub(crate) fn find_crlf_crlf(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &[u8] = b"INVITE sip:100@pbx.example.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP 192.0.2.10:5060;branch=z9hG4bK776asdhds\r\n\
        Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKnashds8\r\n\
        Max-Forwards: 70\r\n\
        From: <sip:7001@pbx.example.com>;tag=1928301774\r\n\
        To: <sip:100@pbx.example.com>\r\n\
        Call-ID: a84b4c76e66710\r\n\
        CSeq: 314159 INVITE\r\n\
        Content-Type: application/sdp\r\n\
        Content-Length: 4\r\n\
        \r\n\
        v=0\n";

    #[test]
    fn parses_request() {
        let msg = SipMessage::parse(INVITE).unwrap();
        assert!(msg.is_request());
        assert_eq!(msg.method(), Some("INVITE"));
        assert_eq!(msg.call_id(), Some("a84b4c76e66710"));
        assert_eq!(msg.cseq(), Some((314159, "INVITE".to_string())));
        assert_eq!(msg.headers.get_all("Via").len(), 2);
        assert_eq!(msg.body, b"v=0\n");
    }

    #[test]
    fn parses_response_and_case_insensitive_lookup() {
        let data = b"SIP/2.0 180 Ringing\r\n\
            via: SIP/2.0/UDP 192.0.2.10:5060;branch=z9hG4bK776\r\n\
            to: <sip:100@pbx.example.com>;tag=8321234356\r\n\
            CALL-ID: a84b4c76e66710\r\n\
            CSeq: 1 INVITE\r\n\
            Content-Length: 0\r\n\r\n";
        let msg = SipMessage::parse(data).unwrap();
        assert_eq!(msg.status(), Some(180));
        assert_eq!(msg.reason(), "Ringing");
        assert_eq!(msg.header("To"), Some("<sip:100@pbx.example.com>;tag=8321234356"));
        assert_eq!(msg.header("Call-Id"), Some("a84b4c76e66710"));
    }

    #[test]
    fn reserialization_preserves_order_and_body() {
        let msg = SipMessage::parse(INVITE).unwrap();
        let bytes = msg.to_bytes();
        let again = SipMessage::parse(&bytes).unwrap();
        assert_eq!(again.start, msg.start);
        assert_eq!(again.body, msg.body);
        let original: Vec<(String, String)> = msg
            .headers
            .iter()
            .map(|(n, v)| (n.to_lowercase(), v.to_string()))
            .collect();
        let reparsed: Vec<(String, String)> = again
            .headers
            .iter()
            .map(|(n, v)| (n.to_lowercase(), v.to_string()))
            .collect();
        assert_eq!(original, reparsed);
    }

    #[test]
    fn content_length_is_computed_not_trusted() {
        let mut msg = SipMessage::request("INFO", "sip:100@pbx.example.com");
        msg.headers.append("Call-ID", "x");
        msg.headers.append("Content-Length", "9999");
        msg.body = b"Signal=5\r\nDuration=160\r\n".to_vec();
        let text = String::from_utf8(msg.to_bytes()).unwrap();
        assert!(text.contains("Content-Length: 24\r\n"));
        assert!(!text.contains("9999"));
    }

    #[test]
    fn body_without_content_length_is_remainder() {
        let data = b"MESSAGE sip:x SIP/2.0\r\nCall-ID: y\r\n\r\nhello";
        let msg = SipMessage::parse(data).unwrap();
        assert_eq!(msg.body, b"hello");
    }

    #[test]
    fn rejects_garbage() {
        assert!(SipMessage::parse(b"\r\n\r\n").is_err());
        assert!(SipMessage::parse(b"INVITE\r\n\r\n").is_err());
        assert!(SipMessage::parse(b"SIP/2.0 abc\r\n\r\n").is_err());
    }
}
