//! Draft-cavage HTTP Signatures as used between ActivityPub servers
//!
//! The signed header set is `(request-target) host date` plus `digest`
//! whenever the request carries a body.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::{RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256};

use super::resolver::IdentityResolver;
use crate::data::RemoteAccount;
use crate::error::AppError;

const DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Result of checking a signed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureVerdict {
    Valid,
    /// Signature bytes do not verify, or the Date is outside the skew window
    SignatureInvalid,
    /// Public key could not be fetched or parsed
    KeyUnresolvable,
    /// Body hash differs from the Digest header
    DigestMismatch,
    /// Signature/Date/Digest header missing or unparsable
    MalformedHeader,
}

impl SignatureVerdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, SignatureVerdict::Valid)
    }
}

impl fmt::Display for SignatureVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SignatureVerdict::Valid => "valid",
            SignatureVerdict::SignatureInvalid => "signature invalid",
            SignatureVerdict::KeyUnresolvable => "key unresolvable",
            SignatureVerdict::DigestMismatch => "digest mismatch",
            SignatureVerdict::MalformedHeader => "malformed header",
        };
        f.write_str(label)
    }
}

/// Signature, Date and Digest values for an outgoing request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    pub signature: String,
    pub date: String,
    /// Present when a body was signed
    pub digest: Option<String>,
    /// `host[:port]` that went into the signing string
    pub host: String,
}

/// Sign a request for `url` with the RSA key behind `key_id`
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    sign_request_at(method, url, body, private_key_pem, key_id, Utc::now())
}

/// `sign_request` with an explicit Date
pub fn sign_request_at(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
    now: DateTime<Utc>,
) -> Result<SignatureHeaders, AppError> {
    use rsa::pkcs8::DecodePrivateKey;
    use rsa::signature::{RandomizedSigner, SignatureEncoding};

    let target = url::Url::parse(url)
        .map_err(|error| AppError::Validation(format!("Cannot sign {}: {}", url, error)))?;
    let host = host_header_value(&target)?;
    let request_target = request_target(method, &path_and_query(&target));
    let date = now.format(DATE_FORMAT).to_string();
    let digest = body.map(generate_digest);

    let mut covered = vec!["(request-target)", "host", "date"];
    if digest.is_some() {
        covered.push("digest");
    }
    let signing_string = build_signing_string(covered.as_slice(), |name| -> Result<String, AppError> {
        Ok(match name {
            "(request-target)" => request_target.clone(),
            "host" => host.clone(),
            "date" => date.clone(),
            _ => digest.clone().unwrap_or_default(),
        })
    })?;

    let private_key = rsa::RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|error| AppError::Validation(format!("Unusable private key: {}", error)))?;
    let signed = rsa::pkcs1v15::SigningKey::<Sha256>::new_unprefixed(private_key)
        .sign_with_rng(&mut rand::thread_rng(), signing_string.as_bytes());

    let signature = [
        ("keyId", key_id.to_string()),
        ("algorithm", "rsa-sha256".to_string()),
        ("headers", covered.join(" ")),
        ("signature", BASE64.encode(signed.to_bytes())),
    ]
    .iter()
    .map(|(field, value)| format!("{}=\"{}\"", field, value))
    .collect::<Vec<_>>()
    .join(",");

    Ok(SignatureHeaders {
        signature,
        date,
        digest,
        host,
    })
}

fn path_and_query(url: &url::Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

fn request_target(method: &str, path: &str) -> String {
    format!("{} {}", method.to_ascii_lowercase(), path)
}

/// `host[:port]` as a client would send it
fn host_header_value(url: &url::Url) -> Result<String, AppError> {
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation(format!("{} has no host", url)))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// One `name: value` line per covered header, in the order given
fn build_signing_string<E>(
    covered: &[impl AsRef<str>],
    mut value_of: impl FnMut(&str) -> Result<String, E>,
) -> Result<String, E> {
    let mut lines = Vec::with_capacity(covered.len());
    for name in covered {
        let name = name.as_ref();
        lines.push(format!("{}: {}", name, value_of(name)?));
    }
    Ok(lines.join("\n"))
}

/// Verify an HTTP request signature against a known public key
///
/// `path` is the request path including any query string.
pub fn verify_signature(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
    max_skew_secs: i64,
) -> SignatureVerdict {
    verify_signature_at(
        method,
        path,
        headers,
        body,
        public_key_pem,
        max_skew_secs,
        Utc::now(),
    )
}

/// `verify_signature` against an explicit clock
pub fn verify_signature_at(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
    max_skew_secs: i64,
    now: DateTime<Utc>,
) -> SignatureVerdict {
    let request = InboundRequest {
        method,
        path,
        headers,
        body,
    };
    match request.check(public_key_pem, max_skew_secs, now) {
        Ok(()) => SignatureVerdict::Valid,
        Err(verdict) => verdict,
    }
}

struct InboundRequest<'a> {
    method: &'a str,
    path: &'a str,
    headers: &'a http::HeaderMap,
    body: Option<&'a [u8]>,
}

impl InboundRequest<'_> {
    fn header(&self, name: &str) -> Result<&str, SignatureVerdict> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .ok_or(SignatureVerdict::MalformedHeader)
    }

    fn check(
        &self,
        public_key_pem: &str,
        max_skew_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<(), SignatureVerdict> {
        let parsed = parse_signature_header(self.header("signature")?)
            .map_err(|_| SignatureVerdict::MalformedHeader)?;
        if !matches!(parsed.algorithm.as_str(), "rsa-sha256" | "hs2019") {
            return Err(SignatureVerdict::MalformedHeader);
        }

        let covers = |name: &str| parsed.headers.iter().any(|h| h == name);
        let mut required = vec!["(request-target)", "host", "date"];
        if self.body.is_some() {
            required.push("digest");
        }
        if !required.into_iter().all(covers) {
            return Err(SignatureVerdict::MalformedHeader);
        }

        if !date_within_skew(self.header("date")?, max_skew_secs, now)
            .map_err(|_| SignatureVerdict::MalformedHeader)?
        {
            return Err(SignatureVerdict::SignatureInvalid);
        }

        if let Some(body) = self.body {
            if !digest_matches(self.header("digest")?, body) {
                return Err(SignatureVerdict::DigestMismatch);
            }
        }

        let signing_string = build_signing_string(parsed.headers.as_slice(), |name| match name {
            "(request-target)" => Ok(request_target(self.method, self.path)),
            name => self.header(name).map(str::to_string),
        })?;

        let signature_bytes = BASE64
            .decode(&parsed.signature)
            .map_err(|_| SignatureVerdict::MalformedHeader)?;
        let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
            .map_err(|_| SignatureVerdict::SignatureInvalid)?;
        let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
            .map_err(|_| SignatureVerdict::KeyUnresolvable)?;

        rsa::pkcs1v15::VerifyingKey::<Sha256>::new_unprefixed(public_key)
            .verify(signing_string.as_bytes(), &signature)
            .map_err(|_| SignatureVerdict::SignatureInvalid)
    }
}

/// Whether an RFC 2822 `Date` is within `max_skew_secs` of `now`
fn date_within_skew(
    date: &str,
    max_skew_secs: i64,
    now: DateTime<Utc>,
) -> Result<bool, chrono::ParseError> {
    let date = DateTime::parse_from_rfc2822(date)?;
    Ok((now.timestamp() - date.timestamp()).abs() <= max_skew_secs)
}

/// Accepts `SHA-256=<b64>` among possibly several comma-separated digests
fn digest_matches(header: &str, body: &[u8]) -> bool {
    let expected = BASE64.encode(Sha256::digest(body));
    header.split(',').any(|entry| {
        entry
            .trim()
            .split_once('=')
            .is_some_and(|(algorithm, value)| {
                algorithm.eq_ignore_ascii_case("sha-256") && value == expected
            })
    })
}

/// keyId of the request's Signature header
pub fn extract_signature_key_id(headers: &http::HeaderMap) -> Result<String, AppError> {
    let header = headers
        .get("signature")
        .and_then(|value| value.to_str().ok())
        .ok_or(AppError::InvalidSignature(SignatureVerdict::MalformedHeader))?;
    Ok(parse_signature_header(header)?.key_id)
}

#[derive(Debug, Clone)]
pub struct ParsedSignature {
    pub key_id: String,
    pub algorithm: String,
    /// Covered header names, lowercased
    pub headers: Vec<String>,
    /// Base64
    pub signature: String,
}

/// Parse `keyId="...",algorithm="...",headers="...",signature="..."`
///
/// Unknown fields are skipped. A missing algorithm reads as hs2019.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let fields: HashMap<&str, &str> = header
        .split(',')
        .filter_map(|part| part.split_once('='))
        .map(|(field, value)| (field.trim(), value.trim().trim_matches('"')))
        .collect();
    let field = |name: &str| {
        fields
            .get(name)
            .map(|value| value.to_string())
            .ok_or(AppError::InvalidSignature(SignatureVerdict::MalformedHeader))
    };

    Ok(ParsedSignature {
        key_id: field("keyId")?,
        algorithm: field("algorithm").unwrap_or_else(|_| "hs2019".to_string()),
        headers: field("headers")?
            .split_whitespace()
            .map(str::to_ascii_lowercase)
            .collect(),
        signature: field("signature")?,
    })
}

/// `SHA-256=<base64 of the body hash>`
pub fn generate_digest(body: &[u8]) -> String {
    format!("SHA-256={}", BASE64.encode(Sha256::digest(body)))
}

/// Verifies inbound requests, resolving keys through the identity resolver
pub struct SignatureVerifier {
    resolver: Arc<IdentityResolver>,
    max_skew_secs: i64,
}

impl SignatureVerifier {
    pub fn new(resolver: Arc<IdentityResolver>, max_skew_secs: i64) -> Self {
        Self {
            resolver,
            max_skew_secs,
        }
    }

    /// Verify a request and return the signing actor
    ///
    /// A cached key that fails to verify is refreshed once, so a remote key
    /// rotation does not lock the sender out for the cache lifetime. A stale
    /// Date fails with any key and never triggers the refresh.
    pub async fn verify_request(
        &self,
        method: &str,
        path: &str,
        headers: &http::HeaderMap,
        body: Option<&[u8]>,
    ) -> Result<RemoteAccount, AppError> {
        let key_id = extract_signature_key_id(headers)?;

        let (account, fetched) = self
            .resolver
            .resolve_key(&key_id)
            .await
            .map_err(|error| AppError::KeyUnresolvable(format!("{}: {}", key_id, error)))?;

        let verdict = self.check(method, path, headers, body, &account);
        if verdict.is_valid() {
            return Ok(account);
        }

        let stale = !self.date_is_fresh(headers);
        if verdict != SignatureVerdict::SignatureInvalid || fetched || stale {
            return Err(verdict_error(verdict, &key_id));
        }

        tracing::debug!(key_id = %key_id, "Cached key failed verification; refreshing actor");
        let refreshed = self
            .resolver
            .refresh_actor(&account.actor_uri)
            .await
            .map_err(|error| AppError::KeyUnresolvable(format!("{}: {}", key_id, error)))?;

        match self.check(method, path, headers, body, &refreshed) {
            SignatureVerdict::Valid => Ok(refreshed),
            verdict => Err(verdict_error(verdict, &key_id)),
        }
    }

    fn date_is_fresh(&self, headers: &http::HeaderMap) -> bool {
        headers
            .get("date")
            .and_then(|value| value.to_str().ok())
            .and_then(|date| date_within_skew(date, self.max_skew_secs, Utc::now()).ok())
            .unwrap_or(false)
    }

    fn check(
        &self,
        method: &str,
        path: &str,
        headers: &http::HeaderMap,
        body: Option<&[u8]>,
        account: &RemoteAccount,
    ) -> SignatureVerdict {
        verify_signature(
            method,
            path,
            headers,
            body,
            &account.public_key_pem,
            self.max_skew_secs,
        )
    }
}

fn verdict_error(verdict: SignatureVerdict, key_id: &str) -> AppError {
    match verdict {
        SignatureVerdict::KeyUnresolvable => {
            AppError::KeyUnresolvable(format!("unusable public key for {}", key_id))
        }
        verdict => AppError::InvalidSignature(verdict),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::keys::KeyPair;
    use http::{HeaderMap, HeaderValue};

    const SKEW: i64 = 300;

    fn generate_test_keypair() -> (String, String) {
        let pair = KeyPair::generate(1024).unwrap();
        (pair.private_key_pem, pair.public_key_pem)
    }

    fn headers_for(signed: SignatureHeaders) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let mut set = |name: &'static str, value: &str| {
            headers.insert(name, HeaderValue::from_str(value).unwrap());
        };
        set("host", &signed.host);
        set("date", &signed.date);
        set("signature", &signed.signature);
        if let Some(digest) = &signed.digest {
            set("digest", digest);
        }
        headers
    }

    /// Signed headers plus the path a server would see
    fn build_signed_header_map(
        method: &str,
        url: &str,
        body: Option<&[u8]>,
        private_key_pem: &str,
    ) -> (HeaderMap, String) {
        let signed = sign_request(
            method,
            url,
            body,
            private_key_pem,
            "https://remote.example/users/alice#main-key",
        )
        .unwrap();
        let path = path_and_query(&url::Url::parse(url).unwrap());
        (headers_for(signed), path)
    }

    #[test]
    fn verify_signature_accepts_valid_signed_request() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let (headers, path) = build_signed_header_map(
            "POST",
            "https://remote.example/inbox?foo=bar",
            Some(body),
            &private_key_pem,
        );

        let verdict = verify_signature("POST", &path, &headers, Some(body), &public_key_pem, SKEW);
        assert_eq!(verdict, SignatureVerdict::Valid);
    }

    #[test]
    fn verify_signature_accepts_signed_get_without_digest() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let (headers, path) = build_signed_header_map(
            "GET",
            "http://127.0.0.1:8080/users/alice",
            None,
            &private_key_pem,
        );

        assert_eq!(headers.get("host").unwrap(), "127.0.0.1:8080");
        let verdict = verify_signature("GET", &path, &headers, None, &public_key_pem, SKEW);
        assert_eq!(verdict, SignatureVerdict::Valid);
    }

    #[test]
    fn tampering_with_any_signed_part_invalidates() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let body = br#"{"type":"Create"}"#;
        let (headers, path) = build_signed_header_map(
            "POST",
            "https://remote.example/inbox",
            Some(body),
            &private_key_pem,
        );

        let mut wrong_host = headers.clone();
        wrong_host.insert("host", HeaderValue::from_static("evil.example"));
        assert_eq!(
            verify_signature("POST", &path, &wrong_host, Some(body), &public_key_pem, SKEW),
            SignatureVerdict::SignatureInvalid
        );

        let mut shifted_date = headers.clone();
        let other_date = (Utc::now() - chrono::Duration::seconds(5))
            .format(DATE_FORMAT)
            .to_string();
        shifted_date.insert("date", HeaderValue::from_str(&other_date).unwrap());
        assert_ne!(
            verify_signature("POST", &path, &shifted_date, Some(body), &public_key_pem, SKEW),
            SignatureVerdict::Valid
        );

        let mut wrong_digest = headers.clone();
        wrong_digest.insert(
            "digest",
            HeaderValue::from_str(&generate_digest(b"other")).unwrap(),
        );
        assert_eq!(
            verify_signature("POST", &path, &wrong_digest, Some(body), &public_key_pem, SKEW),
            SignatureVerdict::DigestMismatch
        );

        assert_eq!(
            verify_signature(
                "POST",
                &path,
                &headers,
                Some(br#"{"type":"Delete"}"#),
                &public_key_pem,
                SKEW
            ),
            SignatureVerdict::DigestMismatch
        );

        assert_eq!(
            verify_signature("POST", "/other", &headers, Some(body), &public_key_pem, SKEW),
            SignatureVerdict::SignatureInvalid
        );
    }

    #[test]
    fn verify_signature_rejects_wrong_key() {
        let (private_key_pem, _) = generate_test_keypair();
        let (_, other_public) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let (headers, path) = build_signed_header_map(
            "POST",
            "https://remote.example/inbox",
            Some(body),
            &private_key_pem,
        );

        assert_eq!(
            verify_signature("POST", &path, &headers, Some(body), &other_public, SKEW),
            SignatureVerdict::SignatureInvalid
        );
        assert_eq!(
            verify_signature("POST", &path, &headers, Some(body), "garbage", SKEW),
            SignatureVerdict::KeyUnresolvable
        );
    }

    #[test]
    fn verify_signature_rejects_stale_date() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let signed_at = Utc::now() - chrono::Duration::minutes(10);
        let signed = sign_request_at(
            "POST",
            "https://remote.example/inbox",
            Some(body),
            &private_key_pem,
            "https://remote.example/users/alice#main-key",
            signed_at,
        )
        .unwrap();

        let headers = headers_for(signed);

        assert_eq!(
            verify_signature("POST", "/inbox", &headers, Some(body), &public_key_pem, SKEW),
            SignatureVerdict::SignatureInvalid
        );
        assert_eq!(
            verify_signature_at(
                "POST",
                "/inbox",
                &headers,
                Some(body),
                &public_key_pem,
                SKEW,
                signed_at
            ),
            SignatureVerdict::Valid
        );
    }

    #[test]
    fn verify_signature_rejects_missing_headers_as_malformed() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let (headers, path) = build_signed_header_map(
            "POST",
            "https://remote.example/inbox",
            Some(body),
            &private_key_pem,
        );

        for name in ["date", "digest", "signature"] {
            let mut stripped = headers.clone();
            stripped.remove(name);
            assert_eq!(
                verify_signature("POST", &path, &stripped, Some(body), &public_key_pem, SKEW),
                SignatureVerdict::MalformedHeader,
                "missing {name}"
            );
        }
    }

    #[test]
    fn verify_signature_rejects_when_date_not_in_signed_headers() {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let (mut headers, path) = build_signed_header_map(
            "POST",
            "https://remote.example/inbox",
            Some(body),
            &private_key_pem,
        );

        let original = headers.get("signature").unwrap().to_str().unwrap();
        let without_date = original.replace("host date digest", "host digest");
        assert_ne!(original, without_date);
        headers.insert("signature", HeaderValue::from_str(&without_date).unwrap());

        assert_eq!(
            verify_signature("POST", &path, &headers, Some(body), &public_key_pem, SKEW),
            SignatureVerdict::MalformedHeader
        );
    }

    #[tokio::test]
    async fn verifier_refreshes_rotated_key_but_not_for_stale_date() {
        use crate::data::{EntityId, FederationStore, MemoryStore};
        use crate::federation::fetch::RemoteFetcher;
        use crate::federation::keys::LocalSigner;
        use crate::federation::test_support::{remote_actor_document, spawn_remote};
        use axum::{Json, Router, routing::get};
        use std::sync::atomic::{AtomicUsize, Ordering};

        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let fetches = Arc::new(AtomicUsize::new(0));
        let base = Arc::new(std::sync::Mutex::new(String::new()));
        let (route_base, route_fetches) = (base.clone(), fetches.clone());
        let pem = public_key_pem.clone();
        let app = Router::new().route(
            "/users/bob",
            get(move || {
                route_fetches.fetch_add(1, Ordering::SeqCst);
                let doc = remote_actor_document(&route_base.lock().unwrap(), "bob", &pem);
                async move { Json(doc) }
            }),
        );
        let addr = spawn_remote(app).await;
        let remote_base = format!("http://{addr}");
        *base.lock().unwrap() = remote_base.clone();

        // Cached copy still carries the key from before a rotation
        let (_, old_public_key_pem) = generate_test_keypair();
        let actor_uri = format!("{remote_base}/users/bob");
        let key_id = format!("{actor_uri}#main-key");
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_remote_account(&RemoteAccount {
                id: EntityId::new().0,
                username: "bob".to_string(),
                domain: addr.ip().to_string(),
                inbox_uri: format!("{actor_uri}/inbox"),
                public_key_id: key_id.clone(),
                actor_uri: actor_uri.clone(),
                display_name: None,
                summary: None,
                outbox_uri: None,
                public_key_pem: old_public_key_pem,
                last_fetched_at: Utc::now(),
            })
            .await
            .unwrap();
        let local = KeyPair::generate(1024).unwrap();
        let resolver = Arc::new(IdentityResolver::new(
            store.clone(),
            RemoteFetcher::new(reqwest::Client::new(), true),
            LocalSigner {
                actor_uri: "https://fedi.example/actor".to_string(),
                key_id: "https://fedi.example/actor#main-key".to_string(),
                private_key_pem: local.private_key_pem,
            },
            chrono::Duration::hours(24),
        ));
        let verifier = SignatureVerifier::new(resolver, SKEW);
        let body = br#"{"type":"Follow"}"#;
        let signed_headers = |at: DateTime<Utc>| {
            headers_for(
                sign_request_at(
                    "POST",
                    "https://fedi.example/inbox",
                    Some(body),
                    &private_key_pem,
                    &key_id,
                    at,
                )
                .unwrap(),
            )
        };

        let stale = signed_headers(Utc::now() - chrono::Duration::minutes(10));
        assert!(matches!(
            verifier.verify_request("POST", "/inbox", &stale, Some(body)).await,
            Err(AppError::InvalidSignature(SignatureVerdict::SignatureInvalid))
        ));
        assert_eq!(fetches.load(Ordering::SeqCst), 0);

        let fresh = signed_headers(Utc::now());
        let signer = verifier
            .verify_request("POST", "/inbox", &fresh, Some(body))
            .await
            .unwrap();
        assert_eq!(signer.actor_uri, actor_uri);
        assert_eq!(signer.public_key_pem, public_key_pem);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn header_parsing_tolerates_order_padding_and_missing_algorithm() {
        let parsed = parse_signature_header(
            r#"signature="ZmFrZQ==", headers="(request-target) Host Date", keyId="https://remote.example/actor#main-key""#,
        )
        .unwrap();
        assert_eq!(parsed.key_id, "https://remote.example/actor#main-key");
        assert_eq!(parsed.algorithm, "hs2019");
        assert_eq!(parsed.headers, vec!["(request-target)", "host", "date"]);
        assert_eq!(parsed.signature, "ZmFrZQ==");

        let mut headers = HeaderMap::new();
        headers.insert("signature", HeaderValue::from_static(r#"keyId="k",headers="date",signature="c2ln""#));
        assert_eq!(extract_signature_key_id(&headers).unwrap(), "k");

        assert!(parse_signature_header(r#"algorithm="rsa-sha256""#).is_err());
        assert!(extract_signature_key_id(&HeaderMap::new()).is_err());
    }
}
