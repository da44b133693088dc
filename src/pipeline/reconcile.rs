//! Dedup/merge of discovered sources into canonical feed records.

use std::sync::Arc;

use crate::directory::DiscoveredSource;
use crate::storage::{Feed, FeedStore, NewFeed, StoreError};

/// How a source was mapped onto its feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A record for the URL already existed and was reused as-is
    Existing,
    /// A new record was created for the URL
    Created,
    /// The create lost a race with another writer; the winner's record was used
    Raced,
}

/// Maps each [`DiscoveredSource`] to exactly one persisted [`Feed`].
///
/// A persisted record always wins over the discovered data, even when the
/// directory reports different fields: the record carries conditional-fetch
/// validators that a rebuild from discovery data would throw away.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn FeedStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn FeedStore>) -> Self {
        Self { store }
    }

    /// Resolve a source to its canonical feed.
    pub async fn reconcile(&self, source: &DiscoveredSource) -> Result<Feed, StoreError> {
        self.reconcile_with_resolution(source)
            .await
            .map(|(feed, _)| feed)
    }

    /// Like [`reconcile`](Self::reconcile), also reporting how the feed was
    /// resolved.
    pub async fn reconcile_with_resolution(
        &self,
        source: &DiscoveredSource,
    ) -> Result<(Feed, Resolution), StoreError> {
        if let Some(existing) = self.store.by_url(&source.url).await? {
            tracing::trace!(feed_id = existing.id, url = %source.url, "Source already known");
            return Ok((existing, Resolution::Existing));
        }

        let new_feed = NewFeed {
            url: source.url.clone(),
            title: source.title.clone(),
            author: source.author.clone(),
        };
        match self.store.create(&new_feed).await {
            Ok(id) => {
                // Read back to pick up store-assigned defaults.
                let feed = self.store.by_id(id).await?.ok_or(StoreError::NotFound(id))?;
                tracing::debug!(feed_id = id, url = %source.url, "New feed discovered");
                Ok((feed, Resolution::Created))
            }
            Err(StoreError::DuplicateUrl(url)) => {
                let feed = self.store.by_url(&url).await?.ok_or_else(|| {
                    StoreError::Unavailable(sqlx::Error::RowNotFound)
                })?;
                tracing::debug!(feed_id = feed.id, url = %url, "Feed created concurrently, reusing");
                Ok((feed, Resolution::Raced))
            }
            Err(e) => Err(e),
        }
    }
}
