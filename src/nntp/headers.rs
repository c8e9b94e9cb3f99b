//! Article normalisation (§4.5 step 1): unfold header continuation lines,
//! split header block from body, and generate a message-id for local POSTs
//! that omit one.

use std::collections::BTreeMap;

use uuid::Uuid;

pub struct ParsedHeaders {
    /// Insertion-ordered so `Newsgroups:`/`References:` render back the way
    /// they arrived; lookups are still case-insensitive.
    pub order: Vec<String>,
    pub map: BTreeMap<String, String>,
}

impl ParsedHeaders {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }
}

/// Split `raw` into (headers, body) on the first blank line, unfolding any
/// continuation lines (leading whitespace) into the prior header's value.
pub fn parse_headers(raw: &[u8]) -> (ParsedHeaders, Vec<u8>) {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text.split("\r\n");
    let mut order = Vec::new();
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    let mut last_key: Option<String> = None;

    let mut consumed_header_bytes = 0usize;
    let mut header_lines: Vec<&str> = Vec::new();
    for line in lines.by_ref() {
        consumed_header_bytes += line.len() + 2;
        if line.is_empty() {
            break;
        }
        header_lines.push(line);
    }

    for line in header_lines {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(key) = &last_key {
                if let Some(v) = map.get_mut(key) {
                    v.push(' ');
                    v.push_str(line.trim());
                }
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            let key = name.trim().to_ascii_lowercase();
            let value = value.trim().to_string();
            order.push(name.trim().to_string());
            map.insert(key.clone(), value);
            last_key = Some(key);
        }
    }

    let body_start = consumed_header_bytes.min(raw.len());
    let body = raw[body_start..].to_vec();

    (ParsedHeaders { order, map }, body)
}

/// A generated message-id for local POSTs that arrive without one, per the
/// configured hostname (§9: hostname must be set before any POST runs).
pub fn generate_message_id(hostname: &str) -> String {
    format!("<{}@{}>", Uuid::new_v4(), hostname)
}

/// Parse a `Newsgroups:` header value (`comp.a, comp.b`) into group names.
pub fn parse_newsgroups(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_headers_and_body_and_unfolds() {
        let raw = b"Subject: hello\r\n world\r\nFrom: a@b\r\n\r\nbody line\r\n";
        let (headers, body) = parse_headers(raw);
        assert_eq!(headers.get("subject"), Some("hello world"));
        assert_eq!(headers.get("from"), Some("a@b"));
        assert_eq!(body, b"body line\r\n".to_vec());
    }

    #[test]
    fn generated_message_id_uses_hostname() {
        let id = generate_message_id("news.example.org");
        assert!(id.ends_with("@news.example.org>"));
        assert!(id.starts_with('<'));
    }

    #[test]
    fn parses_comma_separated_newsgroups() {
        assert_eq!(
            parse_newsgroups("comp.a,  comp.b ,comp.c"),
            vec!["comp.a", "comp.b", "comp.c"]
        );
    }
}
