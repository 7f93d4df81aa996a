//! Outbound HTTP fetches of remote ActivityPub documents
//!
//! Every URL is checked against loopback/private address ranges before the
//! request is made, unless the fetcher was built with `allow_private_hosts`.

use std::net::IpAddr;

use super::keys::LocalSigner;
use super::signature::sign_request;
use crate::error::AppError;

pub const ACTIVITY_JSON_ACCEPT: &str = "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Federation(format!("Failed to resolve host {}: {}", host, e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Validation(format!(
                "Remote host is not allowed: {}",
                host
            )));
        }
    }

    if !resolved_any {
        return Err(AppError::Federation(format!(
            "No DNS records for host {}",
            host
        )));
    }

    Ok(())
}

/// Extract the lowercase host from an actor URL or key id.
pub fn extract_actor_domain(actor_or_key_id: &str) -> Result<String, AppError> {
    let actor_url = actor_or_key_id.split('#').next().unwrap_or(actor_or_key_id);
    let parsed = url::Url::parse(actor_url)
        .map_err(|e| AppError::Validation(format!("Invalid actor URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported actor URL scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in actor URL".to_string()))?
        .to_ascii_lowercase();

    Ok(match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

/// HTTP client wrapper for remote document fetches
#[derive(Clone)]
pub struct RemoteFetcher {
    http_client: reqwest::Client,
    allow_private_hosts: bool,
}

impl RemoteFetcher {
    pub fn new(http_client: reqwest::Client, allow_private_hosts: bool) -> Self {
        Self {
            http_client,
            allow_private_hosts,
        }
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    /// Reject non-HTTP(S) URLs, user info, and private destinations
    pub async fn validate_url(&self, url: &url::Url) -> Result<(), AppError> {
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(AppError::Validation(
                "Remote URL must use http or https".to_string(),
            ));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(AppError::Validation(
                "Remote URL must not include user info".to_string(),
            ));
        }

        let host = url
            .host_str()
            .ok_or_else(|| AppError::Validation("Remote URL must include a host".to_string()))?;

        if self.allow_private_hosts {
            return Ok(());
        }

        if is_disallowed_host(host) {
            return Err(AppError::Validation(format!(
                "Remote host is not allowed: {}",
                host
            )));
        }

        let port = url.port_or_known_default().ok_or_else(|| {
            AppError::Validation("Remote URL must include a known default port".to_string())
        })?;
        validate_resolved_host_ips(host, port).await
    }

    /// GET a JSON document, optionally signed as a local actor
    pub async fn get_json(
        &self,
        url: &str,
        accept: &str,
        signer: Option<&LocalSigner>,
    ) -> Result<serde_json::Value, AppError> {
        let parsed = url::Url::parse(url)
            .map_err(|e| AppError::Validation(format!("Invalid URL {}: {}", url, e)))?;
        self.validate_url(&parsed).await?;

        let mut request = self.http_client.get(parsed).header("Accept", accept);

        if let Some(signer) = signer {
            let signed = sign_request("GET", url, None, &signer.private_key_pem, &signer.key_id)?;
            request = request
                .header("Date", signed.date)
                .header("Signature", signed.signature);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::Federation(format!("Fetch failed for {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(AppError::Federation(format!(
                "Fetch failed for {}: HTTP {}",
                url,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to decode {}: {}", url, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher(allow_private_hosts: bool) -> RemoteFetcher {
        RemoteFetcher::new(reqwest::Client::new(), allow_private_hosts)
    }

    #[tokio::test]
    async fn validate_url_rejects_localhost() {
        let url = url::Url::parse("https://localhost/users/alice").unwrap();
        assert!(matches!(
            fetcher(false).validate_url(&url).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn validate_url_rejects_private_ip() {
        let url = url::Url::parse("http://192.168.1.10/users/alice").unwrap();
        assert!(matches!(
            fetcher(false).validate_url(&url).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn validate_url_allows_private_hosts_when_configured() {
        let url = url::Url::parse("http://127.0.0.1:3000/users/alice").unwrap();
        assert!(fetcher(true).validate_url(&url).await.is_ok());
    }

    #[tokio::test]
    async fn validate_url_rejects_user_info_and_other_schemes() {
        for raw in ["ftp://example.com/actor", "https://user:pw@example.com/actor"] {
            let url = url::Url::parse(raw).unwrap();
            assert!(fetcher(true).validate_url(&url).await.is_err(), "{raw}");
        }
    }

    #[test]
    fn extract_actor_domain_strips_fragment_and_keeps_port() {
        assert_eq!(
            extract_actor_domain("https://Example.com/users/alice#main-key").unwrap(),
            "example.com"
        );
        assert_eq!(
            extract_actor_domain("http://127.0.0.1:4000/users/alice").unwrap(),
            "127.0.0.1:4000"
        );
    }
}
