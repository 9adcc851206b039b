//! Raw-link config conversion.
//!
//! Trojan and grpc share-links are turned into a full engine document straight
//! from the literal link text: every query parameter the provider put on the
//! link flows into the stream settings without going through the parsed
//! endpoint fields. The document carries two inbounds, SOCKS on `socks_port`
//! and a plain HTTP companion on `http_port`.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use url::Url;

pub fn config_from_link(link: &str, socks_port: u16, http_port: u16) -> Result<Value, String> {
    let url = Url::parse(link.trim()).map_err(|e| format!("unparseable link: {e}"))?;
    let scheme = url.scheme().to_lowercase();

    let userinfo = url.username();
    if userinfo.is_empty() {
        return Err("link has no userinfo".into());
    }
    let credential = urlencoding::decode(userinfo)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| userinfo.to_string());
    let host = url.host_str().ok_or("link has no host")?.to_string();
    let port = url.port().ok_or("link has no port")?;

    let mut query = HashMap::new();
    for (key, value) in url.query_pairs() {
        query
            .entry(key.into_owned())
            .or_insert_with(|| value.into_owned());
    }

    let network = query
        .get("type")
        .or_else(|| query.get("net"))
        .cloned()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "tcp".into())
        .to_lowercase();
    // Trojan is TLS-carried unless the link says otherwise.
    let default_security = if scheme == "trojan" { "tls" } else { "none" };
    let security = query
        .get("security")
        .cloned()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default_security.into())
        .to_lowercase();
    let sni = query
        .get("sni")
        .or_else(|| query.get("host"))
        .cloned()
        .unwrap_or_else(|| host.clone());

    let mut stream = Map::new();
    stream.insert("network".into(), json!(network));
    match security.as_str() {
        "reality" => {
            stream.insert("security".into(), json!("reality"));
            stream.insert(
                "realitySettings".into(),
                json!({
                    "show": false,
                    "fingerprint": query.get("fp").cloned().unwrap_or_else(|| "firefox".into()),
                    "serverName": sni,
                    "publicKey": query.get("pbk"),
                    "shortId": query.get("sid").cloned().unwrap_or_default(),
                    "spiderX": query.get("spx").cloned().unwrap_or_default(),
                }),
            );
        }
        "tls" => {
            stream.insert("security".into(), json!("tls"));
            let mut tls = Map::new();
            tls.insert("serverName".into(), json!(sni));
            tls.insert(
                "allowInsecure".into(),
                json!(query
                    .get("allowInsecure")
                    .is_some_and(|v| v.to_lowercase() == "true")),
            );
            if let Some(fp) = query.get("fp") {
                tls.insert("fingerprint".into(), json!(fp));
            }
            if let Some(alpn) = query.get("alpn") {
                let list: Vec<&str> = alpn
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect();
                tls.insert("alpn".into(), json!(list));
            }
            stream.insert("tlsSettings".into(), Value::Object(tls));
        }
        _ => {
            stream.insert("security".into(), json!(""));
        }
    }

    match network.as_str() {
        "grpc" => {
            stream.insert(
                "grpcSettings".into(),
                json!({
                    "serviceName": query
                        .get("serviceName")
                        .or_else(|| query.get("path"))
                        .cloned()
                        .unwrap_or_default(),
                    "multiMode": query.get("mode").map(String::as_str) == Some("multi"),
                }),
            );
        }
        "ws" => {
            let mut headers = Map::new();
            if let Some(h) = query.get("host").filter(|h| !h.is_empty()) {
                headers.insert("Host".into(), json!(h));
            }
            stream.insert(
                "wsSettings".into(),
                json!({
                    "path": query.get("path").cloned().unwrap_or_else(|| "/".into()),
                    "headers": headers,
                }),
            );
        }
        _ => {}
    }

    let outbound = match scheme.as_str() {
        "trojan" => json!({
            "tag": "proxy",
            "protocol": "trojan",
            "settings": {
                "servers": [{
                    "address": host,
                    "port": port,
                    "password": credential,
                }],
            },
            "streamSettings": Value::Object(stream),
        }),
        "vless" => json!({
            "tag": "proxy",
            "protocol": "vless",
            "settings": {
                "vnext": [{
                    "address": host,
                    "port": port,
                    "users": [{
                        "id": credential,
                        "encryption": query.get("encryption").cloned().unwrap_or_else(|| "none".into()),
                        "flow": query.get("flow").cloned().unwrap_or_default(),
                    }],
                }],
            },
            "streamSettings": Value::Object(stream),
        }),
        "vmess" => json!({
            "tag": "proxy",
            "protocol": "vmess",
            "settings": {
                "vnext": [{
                    "address": host,
                    "port": port,
                    "users": [{
                        "id": credential,
                        "alterId": query.get("aid").and_then(|a| a.trim().parse::<i64>().ok()).unwrap_or(0),
                        "security": query.get("scy").cloned().unwrap_or_else(|| "auto".into()),
                    }],
                }],
            },
            "streamSettings": Value::Object(stream),
        }),
        other => return Err(format!("cannot convert scheme: {other}")),
    };

    Ok(json!({
        "log": { "loglevel": "warning" },
        "inbounds": [
            {
                "listen": "127.0.0.1",
                "port": socks_port,
                "protocol": "socks",
                "settings": { "udp": false, "ip": "127.0.0.1" },
            },
            {
                "listen": "127.0.0.1",
                "port": http_port,
                "protocol": "http",
                "settings": {},
            },
        ],
        "outbounds": [outbound],
    }))
}
