//! WebFinger protocol implementation
//!
//! Used to discover ActivityPub actor URIs from `user@domain` handles and to
//! answer discovery requests for local accounts.

use serde::{Deserialize, Serialize};

use super::fetch::RemoteFetcher;
use crate::error::AppError;

const JRD_ACCEPT: &str = "application/jrd+json, application/json";

/// Resolve `user@domain` to an ActivityPub actor URI
///
/// # Errors
/// `NotFederated` when no endpoint answers with an ActivityPub `self` link.
pub async fn resolve_webfinger(
    fetcher: &RemoteFetcher,
    username: &str,
    domain: &str,
) -> Result<String, AppError> {
    if username.is_empty() || domain.is_empty() {
        return Err(AppError::Validation(
            "Handle must look like user@domain".to_string(),
        ));
    }

    let resource = format!("acct:{}@{}", username, domain);
    let webfinger_urls = webfinger_urls_for_domain(domain, &resource)?;
    let mut last_error = None;

    for webfinger_url in webfinger_urls {
        let document = match fetcher.get_json(webfinger_url.as_str(), JRD_ACCEPT, None).await {
            Ok(document) => document,
            Err(error) => {
                tracing::debug!(url = %webfinger_url, %error, "WebFinger attempt failed");
                last_error = Some(error.to_string());
                continue;
            }
        };

        if let Some(actor_uri) = extract_actor_uri_from_webfinger(&document) {
            return Ok(actor_uri);
        }

        last_error = Some(format!(
            "{} did not include an ActivityPub self link",
            webfinger_url
        ));
    }

    Err(AppError::NotFederated(format!(
        "webfinger resolution failed for {}: {}",
        resource,
        last_error.unwrap_or_else(|| "no endpoint".to_string())
    )))
}

fn webfinger_urls_for_domain(domain: &str, resource: &str) -> Result<Vec<url::Url>, AppError> {
    url::Url::parse(&format!("http://{}", domain))
        .map_err(|error| AppError::Validation(format!("Invalid domain {}: {}", domain, error)))?;

    let schemes: &[&str] = match extract_explicit_port_from_domain(domain) {
        Some(80) => &["http"],
        Some(443) | None => &["https"],
        Some(_) => &["https", "http"],
    };

    schemes
        .iter()
        .map(|scheme| {
            let mut url =
                url::Url::parse(&format!("{}://{}/.well-known/webfinger", scheme, domain))
                    .map_err(|error| {
                        AppError::Validation(format!(
                            "Failed to build WebFinger URL for {}: {}",
                            domain, error
                        ))
                    })?;
            url.query_pairs_mut().append_pair("resource", resource);
            Ok(url)
        })
        .collect()
}

fn extract_explicit_port_from_domain(domain: &str) -> Option<u16> {
    let domain = domain.trim();

    if let Some(rest) = domain.strip_prefix('[') {
        let (_, tail) = rest.split_once(']')?;
        return tail.strip_prefix(':')?.parse::<u16>().ok();
    }

    let (host_part, port_str) = domain.rsplit_once(':')?;
    if host_part.is_empty() || host_part.contains(':') {
        return None;
    }

    port_str.parse::<u16>().ok()
}

fn extract_actor_uri_from_webfinger(webfinger: &serde_json::Value) -> Option<String> {
    webfinger
        .get("links")?
        .as_array()?
        .iter()
        .find_map(|link| {
            if link.get("rel").and_then(|value| value.as_str())? != "self" {
                return None;
            }
            let link_type = link.get("type").and_then(|value| value.as_str())?;
            if !is_supported_webfinger_link_type(link_type) {
                return None;
            }
            link.get("href")
                .and_then(|value| value.as_str())
                .map(ToString::to_string)
        })
}

fn is_supported_webfinger_link_type(link_type: &str) -> bool {
    let normalized = link_type.trim().to_ascii_lowercase();
    normalized.contains("activity+json")
        || (normalized.contains("ld+json") && normalized.contains("activitystreams"))
}

/// Split `acct:user@domain`, `@user@domain` or `user@domain`
pub fn parse_acct_resource(resource: &str) -> Option<(String, String)> {
    let trimmed = resource.trim();
    let handle = trimmed.strip_prefix("acct:").unwrap_or(trimmed);
    let handle = handle.strip_prefix('@').unwrap_or(handle);
    let (username, domain) = handle.split_once('@')?;
    if username.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }
    Some((username.to_string(), domain.to_ascii_lowercase()))
}

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

/// Generate WebFinger response for a local account.
///
/// # Arguments
/// * `username` - Local username
/// * `domain` - Instance domain
/// * `actor_uri` - Canonical actor URI of the account
pub fn generate_webfinger_response(
    username: &str,
    domain: &str,
    actor_uri: &str,
) -> WebFingerResponse {
    WebFingerResponse {
        subject: format!("acct:{}@{}", username, domain),
        aliases: Some(vec![actor_uri.to_string()]),
        links: vec![
            WebFingerLink {
                rel: "self".to_string(),
                link_type: Some("application/activity+json".to_string()),
                href: Some(actor_uri.to_string()),
            },
            WebFingerLink {
                rel: "http://webfinger.net/rel/profile-page".to_string(),
                link_type: Some("text/html".to_string()),
                href: Some(actor_uri.to_string()),
            },
        ],
    }
}
