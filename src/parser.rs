use crate::model::{Protocol, ProxyEndpoint, Security};
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
    #[error("malformed link: {0}")]
    MalformedUri(&'static str),
    #[error("invalid vmess payload: {0}")]
    InvalidPayload(String),
}

/// Canonical endpoint descriptor decoded from a share-link.
#[derive(Debug, Clone)]
pub struct ParsedLink {
    pub protocol: Protocol,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub credential: Option<String>,
    pub security: Option<Security>,
    pub sni: Option<String>,
    pub transport: Option<String>,
    pub params: HashMap<String, String>,
    pub raw_link: String,
}

impl ParsedLink {
    pub fn into_endpoint(self, id: u64) -> ProxyEndpoint {
        let now = Utc::now();
        ProxyEndpoint {
            id,
            name: self.name,
            raw_link: self.raw_link,
            protocol: self.protocol,
            host: self.host,
            port: self.port,
            credential: self.credential,
            security: self.security,
            sni: self.sni,
            transport: self.transport,
            params: self.params,
            enabled: true,
            group_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

pub fn parse_link(link: &str) -> Result<ParsedLink, ParseError> {
    let link = link.trim();
    let scheme = link
        .split_once("://")
        .map(|(s, _)| s.to_ascii_lowercase())
        .unwrap_or_default();

    match scheme.as_str() {
        "vless" => parse_vless(link),
        "vmess" => parse_vmess(link),
        "trojan" => parse_trojan(link),
        "" => Err(ParseError::UnsupportedScheme("unknown".into())),
        other => Err(ParseError::UnsupportedScheme(other.into())),
    }
}

// ---------------- vless ----------------

fn parse_vless(link: &str) -> Result<ParsedLink, ParseError> {
    let url = Url::parse(link).map_err(|_| ParseError::MalformedUri("not a valid URL"))?;
    let (credential, host, port) = authority_parts(&url)?;
    let params = query_map(&url);

    let security = security_from(params.get("security"));
    let sni = params.get("sni").cloned();
    let transport = params.get("type").cloned();
    let name = display_name(url.fragment(), &host);

    Ok(ParsedLink {
        protocol: Protocol::Vless,
        name,
        host,
        port,
        credential: Some(credential),
        security,
        sni,
        transport,
        params,
        raw_link: link.to_string(),
    })
}

// ---------------- vmess ----------------

fn parse_vmess(link: &str) -> Result<ParsedLink, ParseError> {
    let rest = &link["vmess://".len()..];
    let authority_end = rest
        .find(|c| c == '/' || c == '?' || c == '#')
        .unwrap_or(rest.len());
    let authority = &rest[..authority_end];

    if authority.is_empty() {
        return Err(ParseError::MalformedUri("empty vmess payload"));
    }
    if !authority.contains('@') {
        return parse_vmess_legacy(link, authority, rest);
    }

    // Modern form mirrors the vless/trojan shape.
    let url = Url::parse(link).map_err(|_| ParseError::MalformedUri("not a valid URL"))?;
    let (credential, host, port) = authority_parts(&url)?;
    let params = query_map(&url);

    let mut security = security_from(params.get("security"));
    if security.is_none() {
        // Many vmess links only carry a legacy tls flag.
        if params.get("tls").is_some_and(|flag| is_truthy(flag)) {
            security = Some(Security::Tls);
        }
    }
    let sni = params.get("sni").or_else(|| params.get("host")).cloned();
    let transport = params
        .get("type")
        .or_else(|| params.get("net"))
        .cloned()
        .or_else(|| Some("tcp".to_string()));
    let name = display_name(url.fragment(), &host);

    Ok(ParsedLink {
        protocol: Protocol::Vmess,
        name,
        host,
        port,
        credential: Some(credential),
        security,
        sni,
        transport,
        params,
        raw_link: link.to_string(),
    })
}

/// Legacy form: the authority is a base64 blob decoding to a JSON object.
fn parse_vmess_legacy(
    link: &str,
    authority: &str,
    rest: &str,
) -> Result<ParsedLink, ParseError> {
    let data = decode_vmess_payload(authority)?;
    let get = |key: &str| data.get(key).and_then(scalar_string);

    let host = get("add").ok_or(ParseError::MalformedUri("missing address"))?;
    let port: u16 = get("port")
        .and_then(|p| p.trim().parse().ok())
        .ok_or(ParseError::MalformedUri("bad port"))?;
    let credential = get("id")
        .or_else(|| get("uuid"))
        .filter(|u| !u.is_empty())
        .ok_or(ParseError::MalformedUri("missing id/uuid"))?;

    let fragment = rest.find('#').map(|i| &rest[i + 1..]);
    let name = get("ps")
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| display_name(fragment, &host));

    let transport = get("net")
        .or_else(|| get("type"))
        .filter(|n| !n.is_empty())
        .or_else(|| Some("tcp".to_string()));

    let tls_flag = get("tls")
        .or_else(|| get("security"))
        .unwrap_or_default()
        .to_lowercase();
    let security = match tls_flag.as_str() {
        "tls" => Some(Security::Tls),
        "reality" => Some(Security::Reality),
        _ => None,
    };

    let sni = get("sni").or_else(|| get("host")).filter(|s| !s.is_empty());

    let mut params = HashMap::new();
    for (key, value) in &data {
        if let Some(text) = scalar_string(value) {
            params.insert(key.clone(), text);
        }
    }

    Ok(ParsedLink {
        protocol: Protocol::Vmess,
        name,
        host,
        port,
        credential: Some(credential),
        security,
        sni,
        transport,
        params,
        raw_link: link.to_string(),
    })
}

fn decode_vmess_payload(payload: &str) -> Result<serde_json::Map<String, Value>, ParseError> {
    let trimmed = payload.trim();
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);

    let mut padded = trimmed.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }

    let bytes = URL_SAFE
        .decode(&padded)
        .or_else(|_| STANDARD.decode(&padded))
        .map_err(|e| ParseError::InvalidPayload(format!("base64 decode failed ({e})")))?;
    let text = String::from_utf8_lossy(&bytes);

    let value: Value = serde_json::from_str(&text)
        .map_err(|e| ParseError::InvalidPayload(format!("JSON decode failed ({e})")))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ParseError::InvalidPayload("JSON must be an object".into())),
    }
}

// ---------------- trojan ----------------

fn parse_trojan(link: &str) -> Result<ParsedLink, ParseError> {
    let url = Url::parse(link).map_err(|_| ParseError::MalformedUri("not a valid URL"))?;
    let (password, host, port) = authority_parts(&url)?;
    let mut params = query_map(&url);

    let security = security_from(params.get("security"));
    let sni = params.get("sni").cloned();
    let transport = params
        .get("type")
        .or_else(|| params.get("net"))
        .cloned()
        .or_else(|| Some("tcp".to_string()));
    let name = display_name(url.fragment(), &host);

    // The password rides along in the parameter map for downstream config
    // synthesis, same key the engine schema expects.
    params.insert("password".to_string(), password.clone());

    Ok(ParsedLink {
        protocol: Protocol::Trojan,
        name,
        host,
        port,
        credential: Some(password),
        security,
        sni,
        transport,
        params,
        raw_link: link.to_string(),
    })
}

// ---------------- shared pieces ----------------

/// userinfo@host:port, all three required.
fn authority_parts(url: &Url) -> Result<(String, String, u16), ParseError> {
    let userinfo = url.username();
    if userinfo.is_empty() {
        return Err(ParseError::MalformedUri("missing userinfo"));
    }
    let host = url
        .host_str()
        .ok_or(ParseError::MalformedUri("missing host or port"))?
        .to_string();
    let port = url
        .port()
        .ok_or(ParseError::MalformedUri("missing host or port"))?;
    Ok((userinfo.to_string(), host, port))
}

/// Query parameters with the first value per key kept.
fn query_map(url: &Url) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (key, value) in url.query_pairs() {
        map.entry(key.into_owned()).or_insert_with(|| value.into_owned());
    }
    map
}

fn security_from(value: Option<&String>) -> Option<Security> {
    match value.map(|v| v.to_lowercase()).as_deref() {
        Some("tls") => Some(Security::Tls),
        Some("reality") => Some(Security::Reality),
        _ => None,
    }
}

fn is_truthy(flag: &str) -> bool {
    !matches!(flag.to_lowercase().as_str(), "" | "0" | "false" | "none")
}

/// Display name: decoded fragment, else host, else a literal fallback.
fn display_name(fragment: Option<&str>, host: &str) -> String {
    if let Some(fragment) = fragment.filter(|f| !f.is_empty()) {
        return urlencoding::decode(fragment)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| fragment.to_string());
    }
    if host.is_empty() {
        "unnamed".to_string()
    } else {
        host.to_string()
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vless_with_tls() {
        let parsed = parse_link("vless://u@h:443?security=tls&sni=example.com#MyNode").unwrap();
        assert_eq!(parsed.protocol, Protocol::Vless);
        assert_eq!(parsed.host, "h");
        assert_eq!(parsed.port, 443);
        assert_eq!(parsed.credential.as_deref(), Some("u"));
        assert_eq!(parsed.security, Some(Security::Tls));
        assert_eq!(parsed.sni.as_deref(), Some("example.com"));
        assert_eq!(parsed.name, "MyNode");
    }

    #[test]
    fn vless_without_userinfo_is_rejected() {
        let err = parse_link("vless://host:443").unwrap_err();
        assert!(matches!(err, ParseError::MalformedUri(_)));
    }

    #[test]
    fn vless_name_falls_back_to_host() {
        let parsed = parse_link("vless://u@node.example.com:443").unwrap();
        assert_eq!(parsed.name, "node.example.com");
    }

    #[test]
    fn percent_encoded_fragment_is_decoded() {
        let parsed = parse_link("vless://u@h:443#My%20Node").unwrap();
        assert_eq!(parsed.name, "My Node");
    }

    #[test]
    fn duplicate_query_keys_keep_first_value() {
        let parsed = parse_link("vless://u@h:443?type=ws&type=grpc").unwrap();
        assert_eq!(parsed.transport.as_deref(), Some("ws"));
        assert_eq!(parsed.params.get("type").map(String::as_str), Some("ws"));
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let err = parse_link("ssr://whatever").unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedScheme(s) if s == "ssr"));
    }

    #[test]
    fn trojan_injects_password_param() {
        let parsed = parse_link("trojan://secret@h:8443?sni=cdn.example.com#T").unwrap();
        assert_eq!(parsed.protocol, Protocol::Trojan);
        assert_eq!(parsed.credential.as_deref(), Some("secret"));
        assert_eq!(parsed.params.get("password").map(String::as_str), Some("secret"));
        assert_eq!(parsed.transport.as_deref(), Some("tcp"));
    }

    #[test]
    fn trojan_without_password_is_rejected() {
        assert!(parse_link("trojan://h:8443").is_err());
    }

    #[test]
    fn legacy_vmess_payload_is_decoded() {
        let payload = STANDARD.encode(r#"{"add":"h","port":"443","id":"u","ps":"N"}"#);
        let parsed = parse_link(&format!("vmess://{payload}")).unwrap();
        assert_eq!(parsed.protocol, Protocol::Vmess);
        assert_eq!(parsed.host, "h");
        assert_eq!(parsed.port, 443);
        assert_eq!(parsed.credential.as_deref(), Some("u"));
        assert_eq!(parsed.name, "N");
        assert_eq!(parsed.transport.as_deref(), Some("tcp"));
        assert_eq!(parsed.security, None);
    }

    #[test]
    fn legacy_vmess_unpadded_payload_is_repadded() {
        let payload = STANDARD
            .encode(r#"{"add":"h","port":443,"id":"u","net":"ws","tls":"tls"}"#)
            .trim_end_matches('=')
            .to_string();
        let parsed = parse_link(&format!("vmess://{payload}/")).unwrap();
        assert_eq!(parsed.port, 443);
        assert_eq!(parsed.transport.as_deref(), Some("ws"));
        assert_eq!(parsed.security, Some(Security::Tls));
    }

    #[test]
    fn legacy_vmess_garbage_is_invalid_payload() {
        let err = parse_link("vmess://not-base64!!!").unwrap_err();
        assert!(matches!(err, ParseError::InvalidPayload(_)));

        let not_json = STANDARD.encode("plain text");
        let err = parse_link(&format!("vmess://{not_json}")).unwrap_err();
        assert!(matches!(err, ParseError::InvalidPayload(_)));
    }

    #[test]
    fn legacy_vmess_requires_id() {
        let payload = STANDARD.encode(r#"{"add":"h","port":"443"}"#);
        let err = parse_link(&format!("vmess://{payload}")).unwrap_err();
        assert!(matches!(err, ParseError::MalformedUri(_)));
    }

    #[test]
    fn modern_vmess_implies_tls_from_legacy_flag() {
        let parsed = parse_link("vmess://u@h:443?tls=1&host=cdn.example.com").unwrap();
        assert_eq!(parsed.security, Some(Security::Tls));
        assert_eq!(parsed.sni.as_deref(), Some("cdn.example.com"));
        assert_eq!(parsed.transport.as_deref(), Some("tcp"));
    }

    #[test]
    fn modern_vmess_falsy_tls_flag_stays_plain() {
        let parsed = parse_link("vmess://u@h:443?tls=none").unwrap();
        assert_eq!(parsed.security, None);
    }

    #[test]
    fn modern_vmess_transport_falls_back_through_net() {
        let parsed = parse_link("vmess://u@h:443?net=grpc").unwrap();
        assert_eq!(parsed.transport.as_deref(), Some("grpc"));
    }
}
