//! Conversation threads across servers
//!
//! Replies to a URI are gathered from local notes and from remote `Create`
//! activities. When the same object exists both as a local note and as an
//! activity row, the local note wins.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::urls::LocalUrls;
use crate::data::{Activity, FederationStore, Note};
use crate::error::AppError;

/// One post in a thread view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadNode {
    pub uri: String,
    pub author_uri: Option<String>,
    pub content: Option<String>,
    pub in_reply_to_uri: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub local: bool,
    /// Placeholder for a parent that no longer exists
    pub deleted: bool,
}

impl ThreadNode {
    fn placeholder(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
            author_uri: None,
            content: None,
            in_reply_to_uri: None,
            created_at: None,
            local: false,
            deleted: true,
        }
    }

    fn from_activity(activity: Activity) -> Option<Self> {
        Some(Self {
            uri: activity.object_uri?,
            author_uri: Some(activity.actor_uri),
            content: activity.content,
            in_reply_to_uri: activity.in_reply_to_uri,
            created_at: Some(activity.created_at),
            local: false,
            deleted: false,
        })
    }
}

/// A post and its direct replies, oldest first
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Thread {
    pub parent: ThreadNode,
    pub replies: Vec<ThreadNode>,
}

pub struct ThreadResolver {
    store: Arc<dyn FederationStore>,
    urls: LocalUrls,
}

impl ThreadResolver {
    pub fn new(store: Arc<dyn FederationStore>, urls: LocalUrls) -> Self {
        Self { store, urls }
    }

    /// Parent and replies for `uri`
    ///
    /// # Errors
    /// `NotFound` when neither the parent nor any reply is known.
    pub async fn resolve_thread(&self, uri: &str) -> Result<Thread, AppError> {
        let mut authors = HashMap::new();
        let mut replies = Vec::new();
        let mut seen = HashSet::new();

        for note in self.store.list_local_replies(uri).await? {
            let node = self.local_node(note, &mut authors).await?;
            if seen.insert(node.uri.clone()) {
                replies.push(node);
            }
        }

        for activity in self.store.list_remote_replies(uri).await? {
            let Some(node) = ThreadNode::from_activity(activity) else {
                continue;
            };
            // A copy of one of our own notes that came back through a relay
            if self.urls.is_local(&node.uri) || seen.contains(&node.uri) {
                continue;
            }
            seen.insert(node.uri.clone());
            replies.push(node);
        }

        replies.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.uri.cmp(&b.uri))
        });

        let parent = match self.find_post(uri, &mut authors).await? {
            Some(parent) => parent,
            None if !replies.is_empty() => ThreadNode::placeholder(uri),
            None => return Err(AppError::NotFound),
        };

        Ok(Thread { parent, replies })
    }

    async fn find_post(
        &self,
        uri: &str,
        authors: &mut HashMap<String, Option<String>>,
    ) -> Result<Option<ThreadNode>, AppError> {
        if let Some(note) = self.store.get_note_by_uri(uri).await? {
            return Ok(Some(self.local_node(note, authors).await?));
        }

        Ok(self
            .store
            .get_activity_by_object_uri(uri)
            .await?
            .filter(|activity| !activity.local)
            .and_then(ThreadNode::from_activity))
    }

    async fn local_node(
        &self,
        note: Note,
        authors: &mut HashMap<String, Option<String>>,
    ) -> Result<ThreadNode, AppError> {
        let author_uri = match authors.get(&note.account_id) {
            Some(author) => author.clone(),
            None => {
                let author = self
                    .store
                    .get_local_account(&note.account_id)
                    .await?
                    .map(|account| self.urls.actor(&account.username));
                authors.insert(note.account_id.clone(), author.clone());
                author
            }
        };

        Ok(ThreadNode {
            uri: note.uri,
            author_uri,
            content: Some(note.content),
            in_reply_to_uri: note.in_reply_to_uri,
            created_at: Some(note.created_at),
            local: true,
            deleted: false,
        })
    }
}
