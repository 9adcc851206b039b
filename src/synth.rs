use crate::convert;
use crate::model::{Protocol, ProxyEndpoint};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("engine config only implemented for vless/vmess, got: {0}")]
    UnsupportedProtocol(String),
    #[error("endpoint has no credential (required for vless/vmess)")]
    MissingCredential,
    #[error("failed to build engine config from raw link: {0}")]
    Conversion(String),
}

const ENGINE_LOG_LEVEL: &str = "warning";

/// Builds the engine configuration document for one endpoint, with the SOCKS
/// inbound on `socks_port`. Trojan links and grpc transports are not modeled
/// field-by-field: the whole document is derived from the literal link text
/// (with an HTTP companion inbound on `socks_port + 1`) to preserve whatever
/// provider-specific parameters the link carries.
pub fn build_config(endpoint: &ProxyEndpoint, socks_port: u16) -> Result<Value, ConfigError> {
    let raw = endpoint.raw_link.trim();
    if raw.starts_with("trojan://") || declares_grpc(endpoint) {
        return convert::config_from_link(raw, socks_port, socks_port + 1)
            .map_err(ConfigError::Conversion);
    }

    match endpoint.protocol {
        Protocol::Vless | Protocol::Vmess => {}
        other => return Err(ConfigError::UnsupportedProtocol(other.to_string())),
    }
    let credential = endpoint
        .credential
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or(ConfigError::MissingCredential)?;

    let params = &endpoint.params;
    let network = resolve_transport(endpoint);
    let security = resolve_security(endpoint);
    let sni = endpoint
        .sni
        .clone()
        .or_else(|| params.get("sni").cloned())
        .or_else(|| params.get("host").cloned())
        .unwrap_or_else(|| endpoint.host.clone());

    let mut stream = Map::new();
    stream.insert("network".into(), json!(network));

    match security.as_str() {
        "reality" => {
            stream.insert("security".into(), json!("reality"));
            stream.insert(
                "realitySettings".into(),
                json!({
                    "show": false,
                    "fingerprint": params.get("fp").cloned().unwrap_or_else(|| "firefox".into()),
                    "serverName": sni,
                    "publicKey": params.get("pbk"),
                    "shortId": params.get("sid").cloned().unwrap_or_default(),
                    "spiderX": params.get("spx").cloned().unwrap_or_default(),
                }),
            );
        }
        "tls" => {
            let mut tls = Map::new();
            tls.insert("serverName".into(), json!(sni));
            tls.insert(
                "allowInsecure".into(),
                json!(params
                    .get("allowInsecure")
                    .is_some_and(|v| v.to_lowercase() == "true")),
            );
            if let Some(alpn) = params.get("alpn") {
                let list: Vec<&str> = alpn
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect();
                tls.insert("alpn".into(), json!(list));
            }
            if let Some(fp) = params.get("fp") {
                tls.insert("fingerprint".into(), json!(fp));
            }
            stream.insert("security".into(), json!("tls"));
            stream.insert("tlsSettings".into(), Value::Object(tls));
        }
        _ => {
            stream.insert("security".into(), json!(""));
        }
    }

    if network == "xhttp" {
        let mut xhttp = Map::new();
        if let Some(path) = params.get("path").filter(|p| !p.is_empty()) {
            xhttp.insert("path".into(), json!(path));
        }
        if let Some(mode) = params.get("mode").filter(|m| !m.is_empty()) {
            xhttp.insert("mode".into(), json!(mode));
        }
        if let Some(host) = host_header(params) {
            xhttp.insert("host".into(), json!(host));
        }
        if !xhttp.is_empty() {
            stream.insert("xhttpSettings".into(), Value::Object(xhttp));
        }
    }

    if network == "ws" {
        let mut headers = Map::new();
        if let Some(host) = host_header(params) {
            headers.insert("Host".into(), json!(host));
        }
        stream.insert(
            "wsSettings".into(),
            json!({
                "path": params.get("path").cloned().unwrap_or_else(|| "/".into()),
                "headers": headers,
            }),
        );
    }

    let tag = format!("healthcheck-{}", endpoint.id);
    let user = match endpoint.protocol {
        Protocol::Vless => json!({
            "id": credential,
            "encryption": params.get("encryption").cloned().unwrap_or_else(|| "none".into()),
            "flow": params.get("flow").cloned().unwrap_or_default(),
        }),
        _ => json!({
            "id": credential,
            "alterId": legacy_alter_id(params),
            "security": params.get("scy").cloned().unwrap_or_else(|| "auto".into()),
        }),
    };

    let outbound = json!({
        "tag": tag,
        "protocol": endpoint.protocol.as_str(),
        "settings": {
            "vnext": [{
                "address": endpoint.host,
                "port": endpoint.port,
                "users": [user],
            }],
        },
        "streamSettings": Value::Object(stream),
    });

    Ok(json!({
        "log": { "loglevel": ENGINE_LOG_LEVEL },
        "inbounds": [{
            "listen": "127.0.0.1",
            "port": socks_port,
            "protocol": "socks",
            "settings": { "udp": false, "ip": "127.0.0.1" },
        }],
        "outbounds": [outbound],
    }))
}

fn declares_grpc(endpoint: &ProxyEndpoint) -> bool {
    resolve_transport(endpoint) == "grpc"
}

fn resolve_transport(endpoint: &ProxyEndpoint) -> String {
    endpoint
        .transport
        .clone()
        .or_else(|| endpoint.params.get("type").cloned())
        .or_else(|| endpoint.params.get("net").cloned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "tcp".into())
        .to_lowercase()
}

fn resolve_security(endpoint: &ProxyEndpoint) -> String {
    let mut security = endpoint
        .security
        .map(|s| s.as_str().to_string())
        .or_else(|| endpoint.params.get("security").cloned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "none".into())
        .to_lowercase();

    // Links that only carry a legacy truthy tls flag still mean tls.
    if security == "none" {
        let flag = endpoint
            .params
            .get("tls")
            .map(|f| f.to_lowercase())
            .unwrap_or_default();
        if !matches!(flag.as_str(), "" | "0" | "false" | "none") {
            security = "tls".into();
        }
    }
    security
}

fn host_header(params: &HashMap<String, String>) -> Option<&String> {
    params
        .get("host")
        .or_else(|| params.get("Host"))
        .or_else(|| params.get("authority"))
        .filter(|h| !h.is_empty())
}

fn legacy_alter_id(params: &HashMap<String, String>) -> i64 {
    for key in ["aid", "alterId"] {
        if let Some(value) = params.get(key) {
            return value.trim().parse().unwrap_or(0);
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_link;

    fn endpoint(link: &str) -> ProxyEndpoint {
        parse_link(link).unwrap().into_endpoint(7)
    }

    #[test]
    fn reality_endpoint_gets_reality_block_and_no_ws() {
        let config = build_config(
            &endpoint("vless://u@h:443?security=reality&sni=site.com&pbk=PUBKEY&fp=chrome&type=tcp"),
            10800,
        )
        .unwrap();

        let stream = &config["outbounds"][0]["streamSettings"];
        assert_eq!(stream["security"], "reality");
        assert_eq!(stream["network"], "tcp");
        assert_eq!(stream["realitySettings"]["publicKey"], "PUBKEY");
        assert_eq!(stream["realitySettings"]["serverName"], "site.com");
        assert_eq!(stream["realitySettings"]["fingerprint"], "chrome");
        assert_eq!(stream["realitySettings"]["shortId"], "");
        assert!(stream.get("wsSettings").is_none());
    }

    #[test]
    fn reality_fingerprint_defaults_to_firefox() {
        let config =
            build_config(&endpoint("vless://u@h:443?security=reality&pbk=K"), 10800).unwrap();
        let reality = &config["outbounds"][0]["streamSettings"]["realitySettings"];
        assert_eq!(reality["fingerprint"], "firefox");
        // sni falls back to the endpoint host.
        assert_eq!(reality["serverName"], "h");
    }

    #[test]
    fn ws_transport_embeds_path_and_host_header() {
        let config = build_config(
            &endpoint("vless://u@h:443?type=ws&path=%2Fchat&host=cdn.example.com&security=tls"),
            10800,
        )
        .unwrap();

        let stream = &config["outbounds"][0]["streamSettings"];
        assert_eq!(stream["wsSettings"]["path"], "/chat");
        assert_eq!(stream["wsSettings"]["headers"]["Host"], "cdn.example.com");
        assert_eq!(stream["tlsSettings"]["serverName"], "cdn.example.com");
    }

    #[test]
    fn ws_path_defaults_to_root() {
        let config = build_config(&endpoint("vless://u@h:443?type=ws"), 10800).unwrap();
        let ws = &config["outbounds"][0]["streamSettings"]["wsSettings"];
        assert_eq!(ws["path"], "/");
        assert!(ws["headers"].as_object().unwrap().is_empty());
    }

    #[test]
    fn xhttp_block_only_carries_present_keys() {
        let config =
            build_config(&endpoint("vless://u@h:443?type=xhttp&mode=auto"), 10800).unwrap();
        let xhttp = &config["outbounds"][0]["streamSettings"]["xhttpSettings"];
        assert_eq!(xhttp["mode"], "auto");
        assert!(xhttp.get("path").is_none());
        assert!(xhttp.get("host").is_none());
    }

    #[test]
    fn xhttp_block_omitted_when_empty() {
        let config = build_config(&endpoint("vless://u@h:443?type=xhttp"), 10800).unwrap();
        let stream = &config["outbounds"][0]["streamSettings"];
        assert!(stream.get("xhttpSettings").is_none());
        assert_eq!(stream["network"], "xhttp");
    }

    #[test]
    fn tls_settings_parse_alpn_and_allow_insecure() {
        let config = build_config(
            &endpoint("vless://u@h:443?security=tls&alpn=h2,%20http%2F1.1&allowInsecure=true"),
            10800,
        )
        .unwrap();
        let tls = &config["outbounds"][0]["streamSettings"]["tlsSettings"];
        assert_eq!(tls["alpn"], json!(["h2", "http/1.1"]));
        assert_eq!(tls["allowInsecure"], true);
    }

    #[test]
    fn legacy_tls_flag_implies_tls() {
        // The vless parser leaves security unset for a bare tls=1 parameter;
        // resolution happens here.
        let config = build_config(&endpoint("vless://u@h:443?tls=1"), 10800).unwrap();
        let stream = &config["outbounds"][0]["streamSettings"];
        assert_eq!(stream["security"], "tls");
        assert!(stream.get("tlsSettings").is_some());
    }

    #[test]
    fn vless_outbound_defaults() {
        let config = build_config(&endpoint("vless://u@h:443"), 10800).unwrap();
        let user = &config["outbounds"][0]["settings"]["vnext"][0]["users"][0];
        assert_eq!(user["id"], "u");
        assert_eq!(user["encryption"], "none");
        assert_eq!(user["flow"], "");
        assert_eq!(config["outbounds"][0]["tag"], "healthcheck-7");
        assert_eq!(config["inbounds"][0]["port"], 10800);
        assert_eq!(config["inbounds"][0]["protocol"], "socks");
    }

    #[test]
    fn vmess_alter_id_parsing() {
        let config = build_config(&endpoint("vmess://u@h:443?aid=4&scy=aes-128-gcm"), 10800).unwrap();
        let user = &config["outbounds"][0]["settings"]["vnext"][0]["users"][0];
        assert_eq!(user["alterId"], 4);
        assert_eq!(user["security"], "aes-128-gcm");

        // Non-numeric and absent both collapse to 0, cipher defaults to auto.
        let config = build_config(&endpoint("vmess://u@h:443?aid=x"), 10800).unwrap();
        let user = &config["outbounds"][0]["settings"]["vnext"][0]["users"][0];
        assert_eq!(user["alterId"], 0);
        assert_eq!(user["security"], "auto");
    }

    #[test]
    fn missing_credential_is_rejected() {
        let mut e = endpoint("vless://u@h:443");
        e.credential = None;
        assert!(matches!(
            build_config(&e, 10800),
            Err(ConfigError::MissingCredential)
        ));
    }

    #[test]
    fn trojan_link_is_delegated_to_the_converter() {
        let config = build_config(
            &endpoint("trojan://pw@h:8443?security=tls&sni=site.com#T"),
            10800,
        )
        .unwrap();

        let inbounds = config["inbounds"].as_array().unwrap();
        assert_eq!(inbounds.len(), 2);
        assert_eq!(inbounds[0]["port"], 10800);
        assert_eq!(inbounds[1]["port"], 10801);
        assert_eq!(inbounds[1]["protocol"], "http");
        assert_eq!(config["outbounds"][0]["protocol"], "trojan");
    }

    #[test]
    fn grpc_transport_is_delegated_to_the_converter() {
        let config = build_config(
            &endpoint("vless://u@h:443?type=grpc&serviceName=svc&security=tls"),
            10800,
        )
        .unwrap();
        let stream = &config["outbounds"][0]["streamSettings"];
        assert_eq!(stream["network"], "grpc");
        assert_eq!(stream["grpcSettings"]["serviceName"], "svc");
        assert_eq!(config["inbounds"].as_array().unwrap().len(), 2);
    }
}
