//! Minimal SDP (RFC 4566) support: exactly what offer/answer for a single
//! audio stream needs, nothing more.

use crate::error::{Error, Result};
use crate::rtp;

/// One `m=` block and the attributes that followed it.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaDescription {
    pub kind: String,
    pub port: u16,
    /// Payload types in offer order; the first is the negotiated preference.
    pub payload_types: Vec<u8>,
    /// `c=` inside the media block, overriding the session connection.
    pub connection: Option<String>,
    pub rtpmaps: Vec<(u8, String)>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionDescription {
    /// Session-level `c=IN IP4 <ip>`.
    pub connection: Option<String>,
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    pub fn audio(&self) -> Option<&MediaDescription> {
        self.media.iter().find(|m| m.kind == "audio")
    }

    /// `(ip, port, payload type)` for the first audio stream. The payload
    /// type is the first entry of the m-line list, defaulting to PCMU.
    pub fn audio_endpoint(&self) -> Result<(String, u16, u8)> {
        let media = self
            .audio()
            .ok_or_else(|| Error::Parse("no audio media in SDP".to_string()))?;
        let ip = media
            .connection
            .as_deref()
            .or(self.connection.as_deref())
            .ok_or_else(|| Error::Parse("no connection address in SDP".to_string()))?;
        let pt = media.payload_types.first().copied().unwrap_or(rtp::PT_PCMU);
        Ok((ip.to_string(), media.port, pt))
    }
}

/// Parse `type=value` lines. Unknown types are skipped; `c=` and `a=rtpmap`
/// lines after an `m=` line attach to that media block.
pub fn parse(text: &str) -> Result<SessionDescription> {
    let mut session = SessionDescription::default();
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.len() < 2 || line.as_bytes()[1] != b'=' {
            continue;
        }
        let value = &line[2..];
        match line.as_bytes()[0] {
            b'c' => {
                // c=IN IP4 <address>
                let ip = value.split_whitespace().nth(2).map(str::to_string);
                match session.media.last_mut() {
                    Some(media) => media.connection = ip,
                    None => session.connection = ip,
                }
            }
            b'm' => {
                // m=<kind> <port> RTP/AVP <pt> <pt> ...
                let mut parts = value.split_whitespace();
                let kind = parts
                    .next()
                    .ok_or_else(|| Error::Parse("empty m= line".to_string()))?
                    .to_string();
                let port = parts
                    .next()
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(|| Error::Parse(format!("bad media port in '{}'", line)))?;
                parts.next(); // proto, assumed RTP/AVP
                let payload_types = parts.filter_map(|pt| pt.parse().ok()).collect();
                session.media.push(MediaDescription {
                    kind,
                    port,
                    payload_types,
                    connection: None,
                    rtpmaps: Vec::new(),
                });
            }
            b'a' => {
                if let Some(rest) = value.strip_prefix("rtpmap:") {
                    let mut parts = rest.split_whitespace();
                    let pt = parts.next().and_then(|p| p.parse().ok());
                    let name = parts.next();
                    if let (Some(pt), Some(name), Some(media)) =
                        (pt, name, session.media.last_mut())
                    {
                        media.rtpmaps.push((pt, name.to_string()));
                    }
                }
            }
            _ => {}
        }
    }
    Ok(session)
}

fn codec_name(pt: u8) -> &'static str {
    match pt {
        rtp::PT_PCMA => "PCMA",
        _ => "PCMU",
    }
}

/// Offer advertising PCMU, PCMA and telephone-event, `sendrecv` only.
pub fn build_offer(user: &str, session_id: u64, local_ip: &str, rtp_port: u16) -> String {
    format!(
        "v=0\r\n\
         o={user} {sid} {sid} IN IP4 {ip}\r\n\
         s=softphone-core\r\n\
         c=IN IP4 {ip}\r\n\
         t=0 0\r\n\
         m=audio {port} RTP/AVP 0 8 101\r\n\
         a=rtpmap:0 PCMU/8000\r\n\
         a=rtpmap:8 PCMA/8000\r\n\
         a=rtpmap:101 telephone-event/8000\r\n\
         a=fmtp:101 0-16\r\n\
         a=ptime:20\r\n\
         a=sendrecv\r\n",
        user = user,
        sid = session_id,
        ip = local_ip,
        port = rtp_port,
    )
}

/// Pick the payload type the answer echoes: the first PT of the offer's
/// audio m-line that we actually speak, defaulting to PCMU.
pub fn answer_payload_type(offer: &SessionDescription) -> u8 {
    offer
        .audio()
        .map(|m| m.payload_types.as_slice())
        .unwrap_or(&[])
        .iter()
        .copied()
        .find(|&pt| pt == rtp::PT_PCMU || pt == rtp::PT_PCMA)
        .unwrap_or(rtp::PT_PCMU)
}

/// Answer echoing the first common payload type from the offer.
pub fn build_answer(
    user: &str,
    session_id: u64,
    local_ip: &str,
    rtp_port: u16,
    offer: &SessionDescription,
) -> String {
    let pt = answer_payload_type(offer);
    format!(
        "v=0\r\n\
         o={user} {sid} {sid} IN IP4 {ip}\r\n\
         s=softphone-core\r\n\
         c=IN IP4 {ip}\r\n\
         t=0 0\r\n\
         m=audio {port} RTP/AVP {pt} 101\r\n\
         a=rtpmap:{pt} {name}/8000\r\n\
         a=rtpmap:101 telephone-event/8000\r\n\
         a=fmtp:101 0-16\r\n\
         a=ptime:20\r\n\
         a=sendrecv\r\n",
        user = user,
        sid = session_id,
        ip = local_ip,
        port = rtp_port,
        pt = pt,
        name = codec_name(pt),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_remote_offer() {
        let sdp = "v=0\r\n\
                   o=root 123 456 IN IP4 192.168.1.1\r\n\
                   s=Test\r\n\
                   c=IN IP4 192.168.1.100\r\n\
                   t=0 0\r\n\
                   m=audio 12345 RTP/AVP 0 8 101\r\n\
                   a=rtpmap:0 PCMU/8000\r\n\
                   a=rtpmap:8 PCMA/8000\r\n";
        let session = parse(sdp).unwrap();
        let (ip, port, pt) = session.audio_endpoint().unwrap();
        assert_eq!(ip, "192.168.1.100");
        assert_eq!(port, 12345);
        assert_eq!(pt, 0);
        assert_eq!(
            session.audio().unwrap().rtpmaps,
            vec![(0, "PCMU/8000".to_string()), (8, "PCMA/8000".to_string())]
        );
    }

    #[test]
    fn media_connection_overrides_session() {
        let sdp = "v=0\r\n\
                   c=IN IP4 10.0.0.1\r\n\
                   m=audio 4000 RTP/AVP 8\r\n\
                   c=IN IP4 203.0.113.5\r\n";
        let session = parse(sdp).unwrap();
        let (ip, port, pt) = session.audio_endpoint().unwrap();
        assert_eq!(ip, "203.0.113.5");
        assert_eq!(port, 4000);
        assert_eq!(pt, 8);
    }

    #[test]
    fn offer_line_set() {
        let offer = build_offer("7001", 1700000000, "192.0.2.10", 40000);
        let lines: Vec<&str> = offer.split("\r\n").filter(|l| !l.is_empty()).collect();
        assert_eq!(lines[0], "v=0");
        assert_eq!(lines[1], "o=7001 1700000000 1700000000 IN IP4 192.0.2.10");
        assert_eq!(lines[3], "c=IN IP4 192.0.2.10");
        assert_eq!(lines[4], "t=0 0");
        assert_eq!(lines[5], "m=audio 40000 RTP/AVP 0 8 101");
        assert!(lines.contains(&"a=ptime:20"));
        assert!(lines.contains(&"a=sendrecv"));
        assert!(lines.contains(&"a=fmtp:101 0-16"));
    }

    #[test]
    fn answer_echoes_first_common_payload_type() {
        let offer = parse(
            "v=0\r\nc=IN IP4 10.0.0.1\r\nm=audio 4000 RTP/AVP 8 0 101\r\n",
        )
        .unwrap();
        let answer = build_answer("7001", 1, "192.0.2.10", 40002, &offer);
        assert!(answer.contains("m=audio 40002 RTP/AVP 8 101\r\n"));
        assert!(answer.contains("a=rtpmap:8 PCMA/8000\r\n"));

        // An offer with no codec we speak falls back to PCMU.
        let odd = parse("v=0\r\nc=IN IP4 10.0.0.1\r\nm=audio 4000 RTP/AVP 96\r\n").unwrap();
        assert_eq!(answer_payload_type(&odd), 0);
    }
}
