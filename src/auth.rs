//! HTTP Digest authentication for SIP (RFC 2617 MD5). Only `algorithm=MD5`
//! without qop is required by the registrars we target; `qop=auth` is
//! honored when the challenge asks for it.

use crate::error::{Error, Result};
use md5::compute as md5_compute;

#[derive(Debug, Clone, PartialEq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
    pub opaque: Option<String>,
}

/// Split a comma-separated parameter list, honoring quoted values (a
/// `qop="auth,auth-int"` value contains a comma).
fn split_params(input: &str) -> Vec<&str> {
    let mut params = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in input.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                params.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    params.push(&input[start..]);
    params
}

/// Parse a `WWW-Authenticate` / `Proxy-Authenticate` header value.
pub fn parse_challenge(value: &str) -> Result<DigestChallenge> {
    let trimmed = value.trim();
    let rest = trimmed
        .strip_prefix("Digest ")
        .or_else(|| trimmed.strip_prefix("digest "))
        .ok_or_else(|| Error::Auth(format!("unsupported challenge scheme in '{}'", value)))?;

    let mut realm = None;
    let mut nonce = None;
    let mut algorithm = None;
    let mut qop = None;
    let mut opaque = None;
    for param in split_params(rest) {
        if let Some((name, raw)) = param.split_once('=') {
            let parsed = raw.trim().trim_matches('"').to_string();
            match name.trim().to_ascii_lowercase().as_str() {
                "realm" => realm = Some(parsed),
                "nonce" => nonce = Some(parsed),
                "algorithm" => algorithm = Some(parsed),
                "qop" => qop = Some(parsed),
                "opaque" => opaque = Some(parsed),
                _ => {}
            }
        }
    }

    Ok(DigestChallenge {
        realm: realm.ok_or_else(|| Error::Auth("challenge has no realm".to_string()))?,
        nonce: nonce.ok_or_else(|| Error::Auth("challenge has no nonce".to_string()))?,
        algorithm,
        qop,
        opaque,
    })
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5_compute(input.as_bytes()))
}

/// The digest response hash. `qop` carries `(nc, cnonce)` when the
/// challenge requested quality of protection.
fn digest_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    qop: Option<(&str, &str)>,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", username, realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    match qop {
        Some((nc, cnonce)) => md5_hex(&format!(
            "{}:{}:{}:{}:auth:{}",
            ha1, nonce, nc, cnonce, ha2
        )),
        None => md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

impl DigestChallenge {
    fn wants_qop_auth(&self) -> bool {
        self.qop
            .as_deref()
            .map(|qop| qop.split(',').any(|q| q.trim() == "auth"))
            .unwrap_or(false)
    }

    /// Build the `Authorization` header value for a request. The `uri`
    /// must be the exact request-URI of the resent request.
    pub fn authorization(&self, username: &str, password: &str, method: &str, uri: &str) -> String {
        let algorithm = self.algorithm.as_deref().unwrap_or("MD5");
        let mut header;
        if self.wants_qop_auth() {
            let nc = "00000001";
            let cnonce = uuid::Uuid::new_v4().simple().to_string();
            let response = digest_response(
                username,
                &self.realm,
                password,
                method,
                uri,
                &self.nonce,
                Some((nc, &cnonce)),
            );
            header = format!(
                "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm={}, qop=auth, nc={}, cnonce=\"{}\"",
                username, self.realm, self.nonce, uri, response, algorithm, nc, cnonce
            );
        } else {
            let response = digest_response(
                username,
                &self.realm,
                password,
                method,
                uri,
                &self.nonce,
                None,
            );
            header = format!(
                "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm={}",
                username, self.realm, self.nonce, uri, response, algorithm
            );
        }
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_asterisk_style_challenge() {
        let challenge =
            parse_challenge("Digest realm=\"asterisk\", nonce=\"abc123\", algorithm=MD5").unwrap();
        assert_eq!(challenge.realm, "asterisk");
        assert_eq!(challenge.nonce, "abc123");
        assert_eq!(challenge.algorithm.as_deref(), Some("MD5"));
        assert_eq!(challenge.qop, None);
    }

    #[test]
    fn parses_qop_with_embedded_comma() {
        let challenge = parse_challenge(
            "Digest realm=\"pbx\", nonce=\"n1\", qop=\"auth,auth-int\", opaque=\"xyz\"",
        )
        .unwrap();
        assert!(challenge.wants_qop_auth());
        assert_eq!(challenge.opaque.as_deref(), Some("xyz"));
    }

    #[test]
    fn rejects_basic_scheme() {
        assert!(parse_challenge("Basic realm=\"pbx\"").is_err());
    }

    #[test]
    fn rfc2617_vector_without_qop() {
        // RFC 2069-style response for the classic RFC 2617 example inputs.
        let response = digest_response(
            "Mufasa",
            "testrealm@host.com",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            None,
        );
        assert_eq!(response, "670fd8c2df070c60b045671b8b24ff02");
    }

    #[test]
    fn rfc2617_vector_with_qop_auth() {
        let response = digest_response(
            "Mufasa",
            "testrealm@host.com",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            Some(("00000001", "0a4f113b")),
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn register_challenge_round_trip() {
        let challenge = parse_challenge("Digest realm=\"asterisk\", nonce=\"abc123\"").unwrap();
        let header = challenge.authorization("u", "p", "REGISTER", "sip:pbx");
        let expected = digest_response("u", "asterisk", "p", "REGISTER", "sip:pbx", "abc123", None);
        assert!(header.contains(&format!("response=\"{}\"", expected)));
        assert!(header.contains("uri=\"sip:pbx\""));
        assert!(header.contains("algorithm=MD5"));
    }
}
