//! HTTP Digest session (RFC 2617 / RFC 7616)
//!
//! A [`DigestSession`] keeps the cookie jar and the last digest challenge for
//! one appliance. A 401 carrying a fresh challenge is retried exactly once;
//! a second 401 is reported as an authentication failure.

use crate::error::{EngineError, Result};
use crate::http::{HttpRequest, HttpResponse, Transport};
use md5::Md5;
use regex::Regex;
use reqwest::Method;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

/// Connection parameters for one appliance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_https: bool,
}

impl Credentials {
    /// `scheme://host[:port]`, port omitted when it is the scheme default
    pub fn base_url(&self) -> String {
        let host = self.host.trim().trim_end_matches('/');
        if host.contains("://") {
            return host.to_string();
        }

        let (scheme, default_port) = if self.use_https {
            ("https", 443)
        } else {
            ("http", 80)
        };
        if self.port == default_port || self.port == 0 {
            format!("{}://{}", scheme, host)
        } else {
            format!("{}://{}:{}", scheme, host, self.port)
        }
    }
}

/// Hash algorithm announced in a challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
}

impl Algorithm {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "" | "MD5" => Some(Self::Md5),
            "MD5-SESS" => Some(Self::Md5Sess),
            "SHA-256" => Some(Self::Sha256),
            "SHA-256-SESS" => Some(Self::Sha256Sess),
            _ => None,
        }
    }

    fn is_session(self) -> bool {
        matches!(self, Self::Md5Sess | Self::Sha256Sess)
    }

    fn hash(self, data: &str) -> String {
        match self {
            Self::Md5 | Self::Md5Sess => hex(&Md5::digest(data.as_bytes())),
            Self::Sha256 | Self::Sha256Sess => hex(&Sha256::digest(data.as_bytes())),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Server-issued digest challenge plus the client's nonce counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    /// Raw qop list as offered, e.g. `auth,auth-int`
    pub qop: Option<String>,
    pub algorithm: String,
    /// Last nonce count sent under this challenge
    pub nc: u32,
}

fn challenge_param_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([A-Za-z0-9_-]+)\s*=\s*(?:"((?:[^"\\]|\\.)*)"|([^\s,]*))"#).expect("valid regex")
    })
}

impl DigestChallenge {
    /// Parse a `WWW-Authenticate: Digest ...` value; other schemes yield `None`
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(char::is_whitespace)?;
        if !scheme.eq_ignore_ascii_case("digest") {
            return None;
        }

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut qop = None;
        let mut algorithm = None;

        for caps in challenge_param_regex().captures_iter(params) {
            let value = match caps.get(2) {
                Some(quoted) => unescape(quoted.as_str()),
                None => caps.get(3).map(|m| m.as_str().to_string()).unwrap_or_default(),
            };
            match caps[1].to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "qop" => qop = Some(value),
                "algorithm" => algorithm = Some(value),
                _ => {}
            }
        }

        Some(Self {
            realm: realm.unwrap_or_default(),
            nonce: nonce?,
            opaque,
            qop: qop.filter(|q| !q.trim().is_empty()),
            algorithm: algorithm.unwrap_or_else(|| "MD5".to_string()),
            nc: 0,
        })
    }

    /// The qop this client answers with: `auth` when offered, else `auth-int`
    pub fn selected_qop(&self) -> Option<&'static str> {
        let offered: Vec<String> = self
            .qop
            .as_deref()?
            .split(',')
            .map(|q| q.trim().to_ascii_lowercase())
            .collect();

        if offered.iter().any(|q| q == "auth") {
            Some("auth")
        } else if offered.iter().any(|q| q == "auth-int") {
            Some("auth-int")
        } else {
            None
        }
    }
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Everything that feeds one digest `response` value
#[derive(Debug, Clone)]
pub struct DigestInput<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub realm: &'a str,
    pub nonce: &'a str,
    pub nc: u32,
    pub cnonce: &'a str,
    pub qop: Option<&'a str>,
    pub method: &'a str,
    pub uri: &'a str,
    pub algorithm: Algorithm,
    /// Request body, only hashed for `auth-int`
    pub body: &'a str,
}

/// Compute the digest `response` field
pub fn compute_response(input: &DigestInput<'_>) -> String {
    let alg = input.algorithm;

    let mut ha1 = alg.hash(&format!("{}:{}:{}", input.username, input.realm, input.password));
    if alg.is_session() {
        ha1 = alg.hash(&format!("{}:{}:{}", ha1, input.nonce, input.cnonce));
    }

    let ha2 = match input.qop {
        Some("auth-int") => alg.hash(&format!(
            "{}:{}:{}",
            input.method,
            input.uri,
            alg.hash(input.body)
        )),
        _ => alg.hash(&format!("{}:{}", input.method, input.uri)),
    };

    match input.qop {
        Some(qop) => alg.hash(&format!(
            "{}:{}:{:08x}:{}:{}:{}",
            ha1, input.nonce, input.nc, input.cnonce, qop, ha2
        )),
        None => alg.hash(&format!("{}:{}:{}", ha1, input.nonce, ha2)),
    }
}

fn new_cnonce() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Authenticated HTTP exchanges against one appliance
pub struct DigestSession {
    transport: Arc<dyn Transport>,
    credentials: Credentials,
    cookies: BTreeMap<String, String>,
    challenge: Option<DigestChallenge>,
}

impl DigestSession {
    pub fn new(transport: Arc<dyn Transport>, credentials: Credentials) -> Self {
        Self {
            transport,
            credentials,
            cookies: BTreeMap::new(),
            challenge: None,
        }
    }

    pub fn base_url(&self) -> String {
        self.credentials.base_url()
    }

    #[cfg(test)]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Send a request, answering one digest challenge if the appliance asks
    pub async fn request(
        &mut self,
        method: Method,
        path: &str,
        headers: &[(String, String)],
        body: Option<String>,
    ) -> Result<HttpResponse> {
        let first = self.send_once(&method, path, headers, body.clone()).await?;
        if first.status != 401 {
            return Ok(first);
        }

        let challenge = first
            .headers_all("www-authenticate")
            .find_map(DigestChallenge::parse)
            .ok_or_else(|| {
                EngineError::Authentication("401 without a Digest challenge".to_string())
            })?;

        tracing::debug!(
            "Digest challenge received (realm '{}', qop {:?}, algorithm {})",
            challenge.realm,
            challenge.qop,
            challenge.algorithm
        );
        self.challenge = Some(challenge);

        let retry = self.send_once(&method, path, headers, body).await?;
        if retry.status == 401 {
            // Drop the rejected challenge so the next call starts clean
            self.challenge = None;
            return Err(EngineError::Authentication(format!(
                "credentials rejected for user '{}'",
                self.credentials.username
            )));
        }

        Ok(retry)
    }

    async fn send_once(
        &mut self,
        method: &Method,
        path: &str,
        headers: &[(String, String)],
        body: Option<String>,
    ) -> Result<HttpResponse> {
        let mut all_headers = headers.to_vec();

        if !self.cookies.is_empty() {
            let cookie = self
                .cookies
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("; ");
            all_headers.push(("Cookie".to_string(), cookie));
        }

        if let Some(auth) = self.authorization(method.as_str(), path, body.as_deref().unwrap_or(""))? {
            all_headers.push(("Authorization".to_string(), auth));
        }

        let request = HttpRequest {
            method: method.clone(),
            url: format!("{}{}", self.base_url(), path),
            headers: all_headers,
            body,
        };

        let response = self.transport.send(request).await?;
        self.merge_cookies(&response);
        Ok(response)
    }

    /// Build the Authorization header for the cached challenge, bumping nc
    fn authorization(&mut self, method: &str, uri: &str, body: &str) -> Result<Option<String>> {
        let Some(challenge) = self.challenge.as_mut() else {
            return Ok(None);
        };

        let algorithm = Algorithm::parse(&challenge.algorithm).ok_or_else(|| {
            EngineError::Authentication(format!(
                "unsupported digest algorithm '{}'",
                challenge.algorithm
            ))
        })?;
        let qop = challenge.selected_qop();
        let cnonce = new_cnonce();
        if qop.is_some() {
            challenge.nc += 1;
        }

        let response = compute_response(&DigestInput {
            username: &self.credentials.username,
            password: &self.credentials.password,
            realm: &challenge.realm,
            nonce: &challenge.nonce,
            nc: challenge.nc,
            cnonce: &cnonce,
            qop,
            method,
            uri,
            algorithm,
            body,
        });

        let mut parts = vec![
            format!("username={}", quote(&self.credentials.username)),
            format!("realm={}", quote(&challenge.realm)),
            format!("nonce={}", quote(&challenge.nonce)),
            format!("uri={}", quote(uri)),
            format!("algorithm={}", challenge.algorithm),
            format!("response={}", quote(&response)),
        ];
        if let Some(opaque) = &challenge.opaque {
            parts.push(format!("opaque={}", quote(opaque)));
        }
        if let Some(qop) = qop {
            parts.push(format!("qop={}", qop));
            parts.push(format!("nc={:08x}", challenge.nc));
            parts.push(format!("cnonce={}", quote(&cnonce)));
        }

        Ok(Some(format!("Digest {}", parts.join(", "))))
    }

    /// Last write wins; `Max-Age=0` removes the cookie
    fn merge_cookies(&mut self, response: &HttpResponse) {
        for raw in response.headers_all("set-cookie") {
            let mut attrs = raw.split(';');
            let Some((name, value)) = attrs.next().and_then(|pair| pair.split_once('=')) else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }

            let expired = attrs.any(|a| {
                a.split_once('=')
                    .map(|(k, v)| k.trim().eq_ignore_ascii_case("max-age") && v.trim() == "0")
                    .unwrap_or(false)
            });

            if expired {
                self.cookies.remove(name);
            } else {
                self.cookies
                    .insert(name.to_string(), value.trim().trim_matches('"').to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::ScriptedTransport;

    const CHALLENGE: &str = r#"Digest realm="engine@appliance", qop="auth", nonce="n0nce", opaque="0paque""#;

    fn creds() -> Credentials {
        Credentials {
            host: "10.0.0.5".into(),
            port: 80,
            username: "admin".into(),
            password: "secret".into(),
            use_https: false,
        }
    }

    fn session(transport: &Arc<ScriptedTransport>) -> DigestSession {
        DigestSession::new(transport.clone(), creds())
    }

    fn auth_param<'a>(header: &'a str, key: &str) -> Option<&'a str> {
        header
            .trim_start_matches("Digest ")
            .split(", ")
            .find_map(|p| p.strip_prefix(&format!("{}=", key)))
            .map(|v| v.trim_matches('"'))
    }

    #[test]
    fn test_rfc2617_vector() {
        let response = compute_response(&DigestInput {
            username: "Mufasa",
            password: "Circle Of Life",
            realm: "testrealm@host.com",
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            nc: 1,
            cnonce: "0a4f113b",
            qop: Some("auth"),
            method: "GET",
            uri: "/dir/index.html",
            algorithm: Algorithm::Md5,
            body: "",
        });
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_rfc7616_vectors() {
        let mut input = DigestInput {
            username: "Mufasa",
            password: "Circle of Life",
            realm: "http-auth@example.org",
            nonce: "7ypf/xlj9XXwfDPEoM4URrv/xwf94BcCAzFZH4GiTo0v",
            nc: 1,
            cnonce: "f2/wE4q74E6zIJEtWaHKaf5wv/H5QzzpXusqGemxURZJ",
            qop: Some("auth"),
            method: "GET",
            uri: "/dir/index.html",
            algorithm: Algorithm::Md5,
            body: "",
        };
        assert_eq!(compute_response(&input), "8ca523f5e9506fed4657c9700eebdbec");

        input.algorithm = Algorithm::Sha256;
        assert_eq!(
            compute_response(&input),
            "753927fa0e85d155564e2e272a28d1802ca10daf4496794697cf8db5856cb6c1"
        );
    }

    #[test]
    fn test_response_without_qop_is_deterministic() {
        let input = DigestInput {
            username: "admin",
            password: "secret",
            realm: "r",
            nonce: "n",
            nc: 0,
            cnonce: "ignored",
            qop: None,
            method: "GET",
            uri: "/",
            algorithm: Algorithm::Md5,
            body: "",
        };
        let ha1 = Algorithm::Md5.hash("admin:r:secret");
        let ha2 = Algorithm::Md5.hash("GET:/");
        let expected = Algorithm::Md5.hash(&format!("{}:n:{}", ha1, ha2));
        assert_eq!(compute_response(&input), expected);
    }

    #[test]
    fn test_session_variant_rehashes_ha1() {
        let base = DigestInput {
            username: "u",
            password: "p",
            realm: "r",
            nonce: "n",
            nc: 1,
            cnonce: "c",
            qop: Some("auth"),
            method: "POST",
            uri: "/x",
            algorithm: Algorithm::Md5Sess,
            body: "",
        };
        let ha1 = Algorithm::Md5.hash(&format!("{}:n:c", Algorithm::Md5.hash("u:r:p")));
        let ha2 = Algorithm::Md5.hash("POST:/x");
        let expected = Algorithm::Md5.hash(&format!("{}:n:00000001:c:auth:{}", ha1, ha2));
        assert_eq!(compute_response(&base), expected);
    }

    #[test]
    fn test_parse_challenge() {
        let c = DigestChallenge::parse(
            r#"Digest realm="a \"quoted\" realm", nonce="abc", qop="auth,auth-int", stale=FALSE, algorithm=MD5-sess"#,
        )
        .unwrap();
        assert_eq!(c.realm, r#"a "quoted" realm"#);
        assert_eq!(c.nonce, "abc");
        assert_eq!(c.opaque, None);
        assert_eq!(c.algorithm, "MD5-sess");
        assert_eq!(c.selected_qop(), Some("auth"));
        assert_eq!(c.nc, 0);

        let c = DigestChallenge::parse(r#"digest nonce="x""#).unwrap();
        assert_eq!(c.algorithm, "MD5");
        assert_eq!(c.selected_qop(), None);

        assert!(DigestChallenge::parse(r#"Basic realm="x""#).is_none());
        assert!(DigestChallenge::parse(r#"Digest realm="no nonce""#).is_none());
    }

    #[test]
    fn test_base_url() {
        let mut c = creds();
        assert_eq!(c.base_url(), "http://10.0.0.5");
        c.port = 8080;
        assert_eq!(c.base_url(), "http://10.0.0.5:8080");
        c.use_https = true;
        c.port = 443;
        assert_eq!(c.base_url(), "https://10.0.0.5");
    }

    #[tokio::test]
    async fn test_challenge_then_counter_increments() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(401, &[("WWW-Authenticate", CHALLENGE)], "");
        for _ in 0..3 {
            transport.reply(200, &[], "ok");
        }

        let mut s = session(&transport);
        for _ in 0..3 {
            let resp = s.request(Method::GET, "/profile.html", &[], None).await.unwrap();
            assert_eq!(resp.status, 200);
        }

        let sent = transport.sent();
        assert_eq!(sent.len(), 4);
        assert!(sent[0].header("Authorization").is_none());

        let counters: Vec<_> = sent[1..]
            .iter()
            .map(|r| auth_param(r.header("Authorization").unwrap(), "nc").unwrap().to_string())
            .collect();
        assert_eq!(counters, ["00000001", "00000002", "00000003"]);

        let auth = sent[1].header("Authorization").unwrap();
        assert_eq!(auth_param(auth, "uri"), Some("/profile.html"));
        assert_eq!(auth_param(auth, "opaque"), Some("0paque"));
        assert_eq!(auth_param(auth, "username"), Some("admin"));
        assert_ne!(
            auth_param(sent[1].header("Authorization").unwrap(), "cnonce"),
            auth_param(sent[2].header("Authorization").unwrap(), "cnonce")
        );
    }

    #[tokio::test]
    async fn test_new_nonce_resets_counter() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(401, &[("WWW-Authenticate", CHALLENGE)], "");
        transport.reply(200, &[], "");
        transport.reply(200, &[], "");
        transport.reply(
            401,
            &[("WWW-Authenticate", r#"Digest realm="engine@appliance", qop="auth", nonce="fresh""#)],
            "",
        );
        transport.reply(200, &[], "");

        let mut s = session(&transport);
        for _ in 0..3 {
            s.request(Method::GET, "/", &[], None).await.unwrap();
        }

        let sent = transport.sent();
        let last = sent.last().unwrap().header("Authorization").unwrap();
        assert_eq!(auth_param(last, "nonce"), Some("fresh"));
        assert_eq!(auth_param(last, "nc"), Some("00000001"));
    }

    #[tokio::test]
    async fn test_second_401_is_authentication_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(401, &[("WWW-Authenticate", CHALLENGE)], "");
        transport.reply(401, &[("WWW-Authenticate", CHALLENGE)], "");
        transport.reply(200, &[], "never reached");

        let mut s = session(&transport);
        let err = s.request(Method::GET, "/", &[], None).await.unwrap_err();
        assert!(matches!(err, EngineError::Authentication(_)));
        assert_eq!(transport.sent().len(), 2);
        assert_eq!(transport.pending(), 1);
    }

    #[tokio::test]
    async fn test_401_without_digest_is_authentication_error() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(401, &[("WWW-Authenticate", r#"Basic realm="x""#)], "");

        let mut s = session(&transport);
        let err = s.request(Method::GET, "/", &[], None).await.unwrap_err();
        assert!(matches!(err, EngineError::Authentication(_)));
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_cookies_merged_before_retry() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(
            401,
            &[
                ("WWW-Authenticate", CHALLENGE),
                ("Set-Cookie", "sid=first; Path=/; HttpOnly"),
            ],
            "",
        );
        transport.reply(200, &[("Set-Cookie", "sid=second"), ("Set-Cookie", "lang=en")], "");
        transport.reply(200, &[("Set-Cookie", "lang=gone; Max-Age=0")], "");
        transport.reply(200, &[], "");

        let mut s = session(&transport);
        s.request(Method::GET, "/", &[], None).await.unwrap();
        assert_eq!(s.cookie("sid"), Some("second"));
        assert_eq!(s.cookie("lang"), Some("en"));

        s.request(Method::GET, "/", &[], None).await.unwrap();
        assert_eq!(s.cookie("lang"), None);
        s.request(Method::GET, "/", &[], None).await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent[1].header("Cookie"), Some("sid=first"));
        assert_eq!(sent[2].header("Cookie"), Some("lang=en; sid=second"));
        assert_eq!(sent[3].header("Cookie"), Some("sid=second"));
    }

    #[tokio::test]
    async fn test_transport_failure_passes_through() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.fail(EngineError::Connectivity("connection refused".into()));

        let mut s = session(&transport);
        let err = s.request(Method::GET, "/", &[], None).await.unwrap_err();
        assert_eq!(err, EngineError::Connectivity("connection refused".into()));
    }

    #[tokio::test]
    async fn test_unsupported_algorithm() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.reply(
            401,
            &[("WWW-Authenticate", r#"Digest realm="r", nonce="n", algorithm=SHA-512"#)],
            "",
        );

        let mut s = session(&transport);
        let err = s.request(Method::GET, "/", &[], None).await.unwrap_err();
        assert!(matches!(err, EngineError::Authentication(_)));
    }
}
