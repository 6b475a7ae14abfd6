//! Proxy parser module for turning untrusted strings into typed endpoints

use crate::proxy::models::{CandidateBatch, Endpoint, ParseError, Transport};
use crate::Result;
use std::fs;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::Path;

/// Proxy parser for parsing endpoints from strings and files
pub struct ProxyParser;

impl ProxyParser {
    /// Parse a single endpoint
    ///
    /// Supports formats:
    /// - IP:PORT (takes `default_transport`)
    /// - scheme://IP:PORT, scheme one of http, https, socks4, socks5
    pub fn parse_endpoint(
        input: &str,
        default_transport: Transport,
    ) -> Result<Endpoint, ParseError> {
        let input = input.trim();
        let (transport, address) = match input.split_once("://") {
            Some((scheme, rest)) => (scheme.parse::<Transport>()?, rest),
            None => (default_transport, input),
        };
        let address = address.strip_suffix('/').unwrap_or(address);

        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| ParseError::Malformed(input.to_string()))?;

        let host: Ipv4Addr = host
            .parse()
            .map_err(|_| ParseError::InvalidHost(input.to_string()))?;
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::InvalidPort(input.to_string()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| ParseError::InvalidPort(input.to_string()))?;

        Ok(Endpoint::new(host, port, transport))
    }

    /// Parse a single candidate line, skipping blanks and `#` comments
    pub fn parse_line(
        line: &str,
        default_transport: Transport,
    ) -> Option<Result<Endpoint, ParseError>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        Some(Self::parse_endpoint(line, default_transport))
    }

    /// Build a batch from raw strings. Any malformed entry rejects the batch.
    pub fn parse_batch<I, S>(
        inputs: I,
        default_transport: Transport,
    ) -> Result<CandidateBatch, ParseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut batch = CandidateBatch::new();
        for input in inputs {
            batch.insert(Self::parse_endpoint(input.as_ref(), default_transport)?);
        }
        Ok(batch)
    }

    /// Parse a multi-line candidate list; errors carry the 1-based line number
    pub fn parse_string(
        content: &str,
        default_transport: Transport,
    ) -> Result<CandidateBatch, ParseError> {
        let mut batch = CandidateBatch::new();
        for (idx, line) in content.lines().enumerate() {
            match Self::parse_line(line, default_transport) {
                Some(Ok(endpoint)) => {
                    batch.insert(endpoint);
                }
                Some(Err(e)) => {
                    return Err(ParseError::Line {
                        line: idx + 1,
                        source: Box::new(e),
                    })
                }
                None => {}
            }
        }
        Ok(batch)
    }

    /// Parse a candidate list from a file
    pub fn parse_file<P: AsRef<Path>>(
        path: P,
        default_transport: Transport,
    ) -> Result<CandidateBatch> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        Self::parse_string(&content, default_transport)
            .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))
    }

    /// Save endpoints in canonical `transport://host:port` form, one per line
    pub fn save_to_file<'a, P, I>(endpoints: I, path: P) -> Result<usize>
    where
        P: AsRef<Path>,
        I: IntoIterator<Item = &'a Endpoint>,
    {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = std::io::BufWriter::new(fs::File::create(path)?);
        let mut written = 0;
        for endpoint in endpoints {
            writeln!(file, "{}", endpoint)?;
            written += 1;
        }
        file.flush()?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_format() {
        let endpoint = ProxyParser::parse_endpoint("192.168.1.1:8080", Transport::Socks4).unwrap();
        assert_eq!(endpoint.host, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(endpoint.port, 8080);
        assert_eq!(endpoint.transport, Transport::Socks4);
    }

    #[test]
    fn test_parse_url_format_http() {
        let endpoint =
            ProxyParser::parse_endpoint("http://10.0.0.1:3128", Transport::Socks5).unwrap();
        assert_eq!(endpoint.transport, Transport::Http);
        assert_eq!(endpoint.to_string(), "http://10.0.0.1:3128");
    }

    #[test]
    fn test_parse_url_format_socks5_trailing_slash() {
        let endpoint =
            ProxyParser::parse_endpoint(" socks5://192.168.1.1:1080/ ", Transport::Http).unwrap();
        assert_eq!(endpoint.port, 1080);
        assert_eq!(endpoint.transport, Transport::Socks5);
    }

    #[test]
    fn test_parse_https_alias() {
        let endpoint =
            ProxyParser::parse_endpoint("https://1.2.3.4:443", Transport::Socks5).unwrap();
        assert_eq!(endpoint.transport, Transport::Http);
        assert_eq!(endpoint.to_string(), "http://1.2.3.4:443");
    }

    #[test]
    fn test_parse_port_bounds() {
        assert_eq!(
            ProxyParser::parse_endpoint("1.2.3.4:0", Transport::Http).unwrap().port,
            0
        );
        assert_eq!(
            ProxyParser::parse_endpoint("1.2.3.4:65535", Transport::Http).unwrap().port,
            65535
        );
        assert!(matches!(
            ProxyParser::parse_endpoint("1.2.3.4:65536", Transport::Http),
            Err(ParseError::InvalidPort(_))
        ));
        assert!(matches!(
            ProxyParser::parse_endpoint("1.2.3.4:+80", Transport::Http),
            Err(ParseError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_parse_invalid_format() {
        assert!(matches!(
            ProxyParser::parse_endpoint("invalid", Transport::Http),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(
            ProxyParser::parse_endpoint("999.1.1.1:80", Transport::Http),
            Err(ParseError::InvalidHost(_))
        ));
        assert!(matches!(
            ProxyParser::parse_endpoint("example.com:80", Transport::Http),
            Err(ParseError::InvalidHost(_))
        ));
        assert!(matches!(
            ProxyParser::parse_endpoint("ftp://1.2.3.4:21", Transport::Http),
            Err(ParseError::UnknownTransport(_))
        ));
    }

    #[test]
    fn test_parse_line_skips_comments() {
        assert!(ProxyParser::parse_line("", Transport::Http).is_none());
        assert!(ProxyParser::parse_line("   ", Transport::Http).is_none());
        assert!(ProxyParser::parse_line("# This is a comment", Transport::Http).is_none());
        assert!(ProxyParser::parse_line("1.2.3.4:80", Transport::Http).is_some());
    }

    #[test]
    fn test_parse_string_dedups() {
        let content = r#"
192.168.1.1:8080
# This is a comment
http://192.168.1.1:8080
socks5://192.168.1.1:8080
10.0.0.1:3128
"#;
        let batch = ProxyParser::parse_string(content, Transport::Http).unwrap();
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn test_parse_string_reports_line() {
        let content = "1.2.3.4:80\nnot-a-proxy\n";
        let err = ProxyParser::parse_string(content, Transport::Http).unwrap_err();
        assert!(matches!(err, ParseError::Line { line: 2, .. }));
        assert!(err.to_string().starts_with("line 2:"));
    }

    #[test]
    fn test_parse_batch_rejects_malformed() {
        let inputs = ["1.1.1.1:80", "socks4://2.2.2.2:1080"];
        let ok = ProxyParser::parse_batch(inputs, Transport::Http).unwrap();
        assert_eq!(ok.len(), 2);
        assert!(ProxyParser::parse_batch(["1.1.1.1:80", "oops"], Transport::Http).is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip_file() {
        let path = std::env::temp_dir().join(format!("proxy-sieve-{}.txt", uuid::Uuid::new_v4()));
        let inputs = ["1.1.1.1:80", "socks5://2.2.2.2:1080"];
        let batch = ProxyParser::parse_batch(inputs, Transport::Http).unwrap();
        let written = ProxyParser::save_to_file(batch.iter(), &path).unwrap();
        assert_eq!(written, 2);

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("http://1.1.1.1:80\n"));
        assert!(content.contains("socks5://2.2.2.2:1080\n"));

        let loaded = ProxyParser::parse_file(&path, Transport::Socks4).unwrap();
        assert_eq!(loaded.len(), 2);
        fs::remove_file(path).ok();
    }
}
