// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use serde::Serialize;

use crate::parsers::http2::CompletedStream;

/// One 5G Service-Based-Architecture request/response pair, classified
/// from a completed HTTP/2 stream.
#[derive(Debug, Clone, Serialize)]
pub struct SbaInteraction {
    /// Service name from the path, e.g. `nudm-ueau`.
    pub service: String,
    /// Network function type inferred from the service prefix.
    pub nf_type: String,
    /// HTTP method.
    pub api: String,
    /// Resource tail after `/<service>/<version>/`.
    pub resource: String,
    pub status: Option<u16>,
    pub latency_ms: Option<i64>,
    pub request_body: Option<serde_json::Value>,
    pub response_body: Option<serde_json::Value>,
}

/// SBA paths look like `/n<service>/<version>/<resource>`.
pub fn is_sba_path(path: &str) -> bool {
    let mut chars = path.chars();
    chars.next() == Some('/') && chars.next() == Some('n')
}

pub fn service_name(path: &str) -> Option<&str> {
    let rest = path.strip_prefix('/')?;
    let service = rest.split('/').next()?;
    (!service.is_empty()).then_some(service)
}

pub fn infer_nf_type(service: &str) -> &'static str {
    for (prefix, nf) in [
        ("namf", "AMF"),
        ("nudm", "UDM"),
        ("nsmf", "SMF"),
        ("nausf", "AUSF"),
        ("nnrf", "NRF"),
        ("nnef", "NEF"),
        ("npcf", "PCF"),
        ("nupf", "UPF"),
    ] {
        if service.starts_with(prefix) {
            return nf;
        }
    }
    "Unknown-NF"
}

/// Classifies a completed stream; `None` when it is not an SBA call.
pub fn classify(stream: &CompletedStream) -> Option<SbaInteraction> {
    let method = stream.method.as_deref()?;
    let path = stream.path.as_deref()?;
    if !is_sba_path(path) {
        return None;
    }
    let service = service_name(path)?;

    // Resource tail: skip service and version segments.
    let resource = path
        .splitn(4, '/')
        .nth(3)
        .unwrap_or_default()
        .to_string();

    let latency_ms = match (stream.request_at, stream.response_at) {
        (Some(req), Some(resp)) => Some((resp - req).num_milliseconds()),
        _ => None,
    };

    Some(SbaInteraction {
        service: service.to_string(),
        nf_type: infer_nf_type(service).to_string(),
        api: method.to_string(),
        resource,
        status: stream.status,
        latency_ms,
        request_body: parse_json_body(&stream.request_headers, &stream.request_body),
        response_body: parse_json_body(&stream.response_headers, &stream.response_body),
    })
}

fn parse_json_body(
    headers: &std::collections::BTreeMap<String, String>,
    body: &[u8],
) -> Option<serde_json::Value> {
    if body.is_empty() {
        return None;
    }
    let is_json = headers
        .get("content-type")
        .map(|ct| ct.contains("json"))
        // SBA bodies default to JSON when the header is absent.
        .unwrap_or(true);
    if !is_json {
        return None;
    }
    serde_json::from_slice(body).ok()
}
