use serde::{Deserialize, Serialize};

/// SIP transport selected for the whole UA. Exactly one is in use at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
}

impl Transport {
    /// Uppercase token used in the Via header.
    pub fn via_token(self) -> &'static str {
        match self {
            Transport::Udp => "UDP",
            Transport::Tcp => "TCP",
            Transport::Tls => "TLS",
        }
    }

    /// Lowercase form for the `transport=` URI parameter on Contact.
    pub fn uri_param(self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
            Transport::Tls => "tls",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Transport::Udp | Transport::Tcp => 5060,
            Transport::Tls => 5061,
        }
    }
}

/// Account settings handed over by the shell. The shell is responsible for
/// persisting these; the core only reads them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub transport: Transport,
    pub extension: String,
    pub password: String,
    #[serde(default, rename = "displayName")]
    pub display_name: String,
}

impl Config {
    /// Port the UA actually dials. A TLS account still configured with the
    /// plain-SIP default 5060 is silently rewritten to 5061.
    pub fn effective_port(&self) -> u16 {
        match self.port {
            None => self.transport.default_port(),
            Some(5060) if self.transport == Transport::Tls => 5061,
            Some(port) => port,
        }
    }

    /// Address-of-record, `sip:extension@server`.
    pub fn aor(&self) -> String {
        format!("sip:{}@{}", self.extension, self.server)
    }

    /// Request-URI for REGISTER.
    pub fn registrar_uri(&self) -> String {
        format!("sip:{}", self.server)
    }

    /// From/To identity, with the display name when one is configured.
    pub fn identity(&self) -> String {
        if self.display_name.is_empty() {
            format!("<{}>", self.aor())
        } else {
            format!("\"{}\" <{}>", self.display_name, self.aor())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            server: "pbx.example.com".to_string(),
            port: None,
            transport: Transport::Udp,
            extension: "7001".to_string(),
            password: "secret".to_string(),
            display_name: String::new(),
        }
    }

    #[test]
    fn default_ports_per_transport() {
        let mut config = base();
        assert_eq!(config.effective_port(), 5060);
        config.transport = Transport::Tls;
        assert_eq!(config.effective_port(), 5061);
    }

    #[test]
    fn tls_rewrites_legacy_5060() {
        let mut config = base();
        config.transport = Transport::Tls;
        config.port = Some(5060);
        assert_eq!(config.effective_port(), 5061);
        config.port = Some(5070);
        assert_eq!(config.effective_port(), 5070);
    }

    #[test]
    fn identity_with_display_name() {
        let mut config = base();
        assert_eq!(config.identity(), "<sip:7001@pbx.example.com>");
        config.display_name = "Front Desk".to_string();
        assert_eq!(
            config.identity(),
            "\"Front Desk\" <sip:7001@pbx.example.com>"
        );
    }

    #[test]
    fn config_from_shell_json() {
        let json = r#"{
            "server": "pbx.example.com",
            "transport": "tls",
            "extension": "7001",
            "password": "secret",
            "displayName": "Front Desk"
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.transport, Transport::Tls);
        assert_eq!(config.effective_port(), 5061);
        assert_eq!(config.display_name, "Front Desk");
    }
}
