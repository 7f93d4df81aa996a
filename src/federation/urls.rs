//! Canonical URLs for local ActivityPub objects

/// Builds and recognizes URLs under this instance's base URL
#[derive(Debug, Clone)]
pub struct LocalUrls {
    base_url: String,
    domain: String,
}

impl LocalUrls {
    pub fn new(base_url: &str, domain: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            domain: domain.to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn actor(&self, username: &str) -> String {
        format!("{}/users/{}", self.base_url, username)
    }

    pub fn inbox(&self, username: &str) -> String {
        format!("{}/inbox", self.actor(username))
    }

    pub fn outbox(&self, username: &str) -> String {
        format!("{}/outbox", self.actor(username))
    }

    pub fn followers(&self, username: &str) -> String {
        format!("{}/followers", self.actor(username))
    }

    pub fn following(&self, username: &str) -> String {
        format!("{}/following", self.actor(username))
    }

    pub fn shared_inbox(&self) -> String {
        format!("{}/inbox", self.base_url)
    }

    /// Service actor used for relay subscriptions and signed fetches
    pub fn instance_actor(&self) -> String {
        format!("{}/actor", self.base_url)
    }

    pub fn key_id(actor_uri: &str) -> String {
        format!("{}#main-key", actor_uri)
    }

    pub fn note(&self, note_id: &str) -> String {
        format!("{}/notes/{}", self.base_url, note_id)
    }

    pub fn note_replies(&self, note_id: &str) -> String {
        format!("{}/replies", self.note(note_id))
    }

    pub fn tag(&self, name: &str) -> String {
        format!("{}/tags/{}", self.base_url, urlencoding::encode(name))
    }

    /// Fresh id for an outgoing activity
    pub fn new_activity(&self) -> String {
        format!("{}/activities/{}", self.base_url, ulid::Ulid::new())
    }

    pub fn is_local(&self, uri: &str) -> bool {
        uri == self.base_url
            || uri
                .strip_prefix(&self.base_url)
                .is_some_and(|rest| rest.starts_with('/') || rest.starts_with('#'))
    }

    /// `alice` for `<base>/users/alice`
    pub fn username_from_actor<'a>(&self, actor_uri: &'a str) -> Option<&'a str> {
        let rest = actor_uri
            .strip_prefix(self.base_url.as_str())?
            .strip_prefix("/users/")?;
        (!rest.is_empty() && !rest.contains('/') && !rest.contains('#')).then_some(rest)
    }

    /// Note id for `<base>/notes/<id>`
    pub fn note_id_from_uri<'a>(&self, uri: &'a str) -> Option<&'a str> {
        let rest = uri
            .strip_prefix(self.base_url.as_str())?
            .strip_prefix("/notes/")?;
        (!rest.is_empty() && !rest.contains('/')).then_some(rest)
    }
}
