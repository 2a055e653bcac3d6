//! RTSP wire-text types: responses, server-initiated requests, and the
//! small header grammars the client needs (auth challenges, Transport
//! parameters, RTP-Info).

use std::collections::HashMap;

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Default, Clone)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn push(&mut self, name: String, value: String) {
        self.0.push((name, value));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// An RTSP response with its body already drained from the connection.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn cseq(&self) -> Option<u32> {
        self.headers.get("CSeq")?.trim().parse().ok()
    }
}

/// A request initiated by the server (e.g. ANNOUNCE); the client only ever
/// inspects or discards these.
#[derive(Debug)]
pub struct RtspRequest {
    pub method: String,
    pub uri: String,
    pub headers: Headers,
}

/// Parses an RTSP version token such as `RTSP/1.0`. Versions without a minor
/// number are rejected.
pub fn parse_rtsp_version(token: &str) -> Option<(u8, u8)> {
    let rest = token.strip_prefix("RTSP/")?;
    let (major, minor) = rest.split_once('.')?;
    if major.len() != 1 || minor.len() != 1 {
        return None;
    }
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Parses a comma-separated list of `key=value` / `key="value"` pairs, the
/// shape of `WWW-Authenticate` challenge parameters. Whitespace-tolerant;
/// bare keys map to an empty value.
pub fn parse_auth_fields(value: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let mut rest = value.trim_start();
    while !rest.is_empty() {
        match rest.find(['=', ',']) {
            Some(i) if rest.as_bytes()[i] == b'=' => {
                let key = rest[..i].trim();
                let after = rest[i + 1..].trim_start();
                let val;
                if let Some(quoted) = after.strip_prefix('"') {
                    match quoted.find('"') {
                        Some(q) => {
                            val = &quoted[..q];
                            rest = quoted[q + 1..]
                                .trim_start()
                                .trim_start_matches(',')
                                .trim_start();
                        }
                        None => {
                            val = quoted;
                            rest = "";
                        }
                    }
                } else {
                    match after.find(',') {
                        Some(c) => {
                            val = after[..c].trim_end();
                            rest = after[c + 1..].trim_start();
                        }
                        None => {
                            val = after.trim_end();
                            rest = "";
                        }
                    }
                }
                if !key.is_empty() {
                    fields.insert(key.to_string(), val.to_string());
                }
            }
            Some(i) => {
                let key = rest[..i].trim();
                if !key.is_empty() {
                    fields.insert(key.to_string(), String::new());
                }
                rest = rest[i + 1..].trim_start();
            }
            None => {
                let key = rest.trim();
                if !key.is_empty() {
                    fields.insert(key.to_string(), String::new());
                }
                rest = "";
            }
        }
    }
    fields
}

/// Extracts the `interleaved=lo-hi` channel pair from a `Transport` header.
pub fn parse_interleaved(transport: &str) -> Option<(u8, u8)> {
    for param in transport.split(';') {
        let (name, value) = match param.split_once('=') {
            Some(pair) => pair,
            None => continue,
        };
        if name.trim() != "interleaved" {
            continue;
        }
        let (lo, hi) = value.split_once('-')?;
        return Some((lo.trim().parse().ok()?, hi.trim().parse().ok()?));
    }
    None
}

/// The session id is the first `;`-separated token of the `Session` header.
pub fn parse_session_id(value: &str) -> &str {
    value.split(';').next().unwrap_or("").trim()
}

/// One stream entry of a PLAY response's `RTP-Info` header.
#[derive(Debug, PartialEq, Eq)]
pub struct RtpInfoEntry {
    pub url: Option<String>,
    pub rtptime: Option<i64>,
}

pub fn parse_rtp_info(value: &str) -> Vec<RtpInfoEntry> {
    value
        .split(',')
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| {
            let mut url = None;
            let mut rtptime = None;
            for param in entry.split(';') {
                if let Some((key, val)) = param.split_once('=') {
                    match key.trim() {
                        "url" => url = Some(val.trim().to_string()),
                        "rtptime" => rtptime = val.trim().parse().ok(),
                        _ => {}
                    }
                }
            }
            RtpInfoEntry { url, rtptime }
        })
        .collect()
}
