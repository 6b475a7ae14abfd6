//! Pulls `host:port` endpoints out of arbitrary text (HTML pages, raw lists, JSON dumps)

use crate::proxy::models::{CandidateBatch, Endpoint, Transport};
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::Ipv4Addr;

/// IPv4:port with range-checked octets. The first octet excludes 0.
static IP_PORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    let first = r"(?:25[0-5]|2[0-4]\d|1\d{2}|[1-9]\d|[1-9])";
    let octet = r"(?:25[0-5]|2[0-4]\d|1\d{2}|[1-9]\d|\d)";
    let port = r"(?:6553[0-5]|655[0-2]\d|65[0-4]\d{2}|6[0-4]\d{3}|[1-5]\d{4}|[1-9]\d{1,3}|\d)";
    Regex::new(&format!(
        r"(?:^|[^\d.])({first}\.{octet}\.{octet}\.{octet}):({port})(?:\D|$)"
    ))
    .expect("Invalid IP:PORT regex")
});

/// Extract every distinct endpoint found in `text`, tagged with `transport`
pub fn extract_endpoints(text: &str, transport: Transport) -> CandidateBatch {
    let mut batch = CandidateBatch::new();
    let mut pos = 0;
    // Matches consume one delimiter on each side, so resume right after the
    // port to let `1.1.1.1:80,2.2.2.2:80` yield both entries.
    while let Some(caps) = IP_PORT_REGEX.captures_at(text, pos) {
        let (Some(host), Some(port)) = (caps.get(1), caps.get(2)) else {
            break;
        };
        pos = port.end();
        let parsed = (
            host.as_str().parse::<Ipv4Addr>(),
            port.as_str().parse::<u16>(),
        );
        if let (Ok(host), Ok(port)) = parsed {
            batch.insert(Endpoint::new(host, port, transport));
        }
    }
    batch
}
