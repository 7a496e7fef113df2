//! Cursor-following enumeration of Graph collections
//!
//! Two modes over the same page fetch:
//! - [`Paginator`] follows `@odata.nextLink` until it is absent
//! - [`DeltaPaginator`] follows delta pages until the terminal page hands
//!   back an `@odata.deltaLink`, which is the cursor for the next
//!   incremental pass
//!
//! Both are single-use: build a fresh one to enumerate again.

use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use async_stream::try_stream;
use futures::stream::Stream;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::trace;

use crate::error::{MigrationError, Result};
use crate::graph::GraphClient;
use crate::rate_limiter::ServiceClass;

/// One page of a Graph collection
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
    #[serde(rename = "@odata.nextLink", default)]
    pub next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink", default)]
    pub delta_link: Option<String>,
}

/// Page-link mode enumeration
pub struct Paginator<T> {
    client: Arc<GraphClient>,
    class: ServiceClass,
    next: Option<String>,
    pages_fetched: u64,
    _item: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned + Send + 'static> Paginator<T> {
    /// Start at the first page of `url`
    pub fn new(client: Arc<GraphClient>, class: ServiceClass, url: impl Into<String>) -> Self {
        Self {
            client,
            class,
            next: Some(url.into()),
            pages_fetched: 0,
            _item: PhantomData,
        }
    }

    /// Fetch the next page, or `None` once the collection is exhausted
    pub async fn next_page(&mut self) -> Result<Option<Page<T>>> {
        let Some(url) = self.next.take() else {
            return Ok(None);
        };

        let page: Page<T> = self.client.get_json(self.class, &url).await?;
        self.pages_fetched += 1;
        self.next = page.next_link.clone();

        trace!(
            "Fetched page {} with {} items, more: {}",
            self.pages_fetched,
            page.value.len(),
            self.next.is_some()
        );
        Ok(Some(page))
    }

    /// Link to the page after the last one fetched
    pub fn next_link(&self) -> Option<&str> {
        self.next.as_deref()
    }

    pub fn pages_fetched(&self) -> u64 {
        self.pages_fetched
    }

    /// All items across all pages as one lazy sequence
    pub fn into_stream(mut self) -> Pin<Box<dyn Stream<Item = Result<T>> + Send>> {
        Box::pin(try_stream! {
            while let Some(page) = self.next_page().await? {
                for item in page.value {
                    yield item;
                }
            }
        })
    }

    /// Drain every page into memory; for small collections only
    pub async fn collect_all(mut self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while let Some(page) = self.next_page().await? {
            items.extend(page.value);
        }
        Ok(items)
    }
}

/// Position after a delta page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaCursor {
    /// More pages in this pass
    Next(String),
    /// Pass complete; store this for the next incremental run
    Delta(String),
}

#[derive(Debug, Clone)]
pub struct DeltaPage<T> {
    pub items: Vec<T>,
    pub cursor: DeltaCursor,
}

/// Delta mode enumeration
pub struct DeltaPaginator<T> {
    client: Arc<GraphClient>,
    class: ServiceClass,
    next: Option<String>,
    delta_link: Option<String>,
    pages_fetched: u64,
    _item: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned + Send + 'static> DeltaPaginator<T> {
    /// Start a full pass at the collection's delta endpoint
    pub fn start(client: Arc<GraphClient>, class: ServiceClass, delta_url: impl Into<String>) -> Self {
        Self::resume(client, class, delta_url)
    }

    /// Continue from a stored next link or delta link
    pub fn resume(client: Arc<GraphClient>, class: ServiceClass, link: impl Into<String>) -> Self {
        Self {
            client,
            class,
            next: Some(link.into()),
            delta_link: None,
            pages_fetched: 0,
            _item: PhantomData,
        }
    }

    pub async fn next_page(&mut self) -> Result<Option<DeltaPage<T>>> {
        let Some(url) = self.next.take() else {
            return Ok(None);
        };

        let page: Page<T> = self.client.get_json(self.class, &url).await?;
        self.pages_fetched += 1;

        let cursor = match (page.next_link, page.delta_link) {
            (Some(next), _) => {
                self.next = Some(next.clone());
                DeltaCursor::Next(next)
            }
            (None, Some(delta)) => {
                self.delta_link = Some(delta.clone());
                DeltaCursor::Delta(delta)
            }
            (None, None) => {
                return Err(MigrationError::InvalidResponse(
                    "Delta page carries neither nextLink nor deltaLink".to_string(),
                ))
            }
        };

        Ok(Some(DeltaPage {
            items: page.value,
            cursor,
        }))
    }

    /// Delta link of the finished pass, once the terminal page was fetched
    pub fn delta_link(&self) -> Option<&str> {
        self.delta_link.as_deref()
    }

    pub fn pages_fetched(&self) -> u64 {
        self.pages_fetched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use crate::client::{RetryPolicy, RetryingClient};
    use crate::graph::{GraphRequest, GraphResponse, GraphTransport};
    use crate::rate_limiter::TenantRateLimiter;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use serde_json::{json, Value};
    use std::collections::HashMap;

    /// Serves canned bodies by exact URL
    struct PagesTransport(HashMap<String, Value>);

    #[async_trait]
    impl GraphTransport for PagesTransport {
        async fn send(&self, request: GraphRequest) -> Result<GraphResponse> {
            let (status, body) = match self.0.get(&request.url) {
                Some(body) => (200, body.to_string()),
                None => (404, String::new()),
            };
            Ok(GraphResponse {
                status,
                headers: Vec::new(),
                body: Bytes::from(body),
            })
        }
    }

    fn client(pages: Vec<(&str, Value)>) -> Arc<GraphClient> {
        let pages = pages
            .into_iter()
            .map(|(url, body)| (format!("https://graph.test{}", url), body))
            .collect();
        Arc::new(GraphClient::new(
            "tenant",
            "https://graph.test",
            Arc::new(StaticToken::new("t")),
            Arc::new(PagesTransport(pages)),
            RetryingClient::new(TenantRateLimiter::new(), RetryPolicy::default()),
        ))
    }

    fn three_pages() -> Vec<(&'static str, Value)> {
        vec![
            ("/items", json!({"value": [1, 2], "@odata.nextLink": "https://graph.test/items?p=2"})),
            ("/items?p=2", json!({"value": [3], "@odata.nextLink": "https://graph.test/items?p=3"})),
            ("/items?p=3", json!({"value": [4, 5]})),
        ]
    }

    #[tokio::test]
    async fn test_pages_follow_next_links() {
        let mut paginator: Paginator<u32> = Paginator::new(client(three_pages()), ServiceClass::General, "/items");

        let first = paginator.next_page().await.unwrap().unwrap();
        assert_eq!(first.value, vec![1, 2]);
        assert_eq!(paginator.next_link(), Some("https://graph.test/items?p=2"));

        paginator.next_page().await.unwrap().unwrap();
        paginator.next_page().await.unwrap().unwrap();
        assert!(paginator.next_page().await.unwrap().is_none());
        assert_eq!(paginator.pages_fetched(), 3);
    }

    #[tokio::test]
    async fn test_stream_yields_all_items_in_order() {
        let paginator: Paginator<u32> = Paginator::new(client(three_pages()), ServiceClass::General, "/items");
        let items: Vec<u32> = paginator
            .into_stream()
            .map(|item| item.unwrap())
            .collect()
            .await;
        assert_eq!(items, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_collect_all_surfaces_errors() {
        let mut pages = three_pages();
        pages.pop();
        let paginator: Paginator<u32> = Paginator::new(client(pages), ServiceClass::General, "/items");
        assert!(matches!(
            paginator.collect_all().await,
            Err(MigrationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delta_pass_ends_with_delta_link() {
        let client = client(vec![
            ("/delta", json!({"value": [1], "@odata.nextLink": "https://graph.test/delta?skip=1"})),
            ("/delta?skip=1", json!({"value": [2], "@odata.deltaLink": "https://graph.test/delta?token=abc"})),
            ("/delta?token=abc", json!({"value": [], "@odata.deltaLink": "https://graph.test/delta?token=def"})),
        ]);

        let mut paginator: DeltaPaginator<u32> = DeltaPaginator::start(client.clone(), ServiceClass::Mail, "/delta");
        let page = paginator.next_page().await.unwrap().unwrap();
        assert_eq!(page.cursor, DeltaCursor::Next("https://graph.test/delta?skip=1".to_string()));
        let page = paginator.next_page().await.unwrap().unwrap();
        assert_eq!(page.cursor, DeltaCursor::Delta("https://graph.test/delta?token=abc".to_string()));
        assert!(paginator.next_page().await.unwrap().is_none());
        assert_eq!(paginator.delta_link(), Some("https://graph.test/delta?token=abc"));

        // Resuming from the stored delta link sees only changes since
        let mut resumed: DeltaPaginator<u32> =
            DeltaPaginator::resume(client, ServiceClass::Mail, "https://graph.test/delta?token=abc");
        let page = resumed.next_page().await.unwrap().unwrap();
        assert!(page.items.is_empty());
        assert_eq!(resumed.delta_link(), Some("https://graph.test/delta?token=def"));
    }

    #[tokio::test]
    async fn test_delta_page_without_links_is_invalid() {
        let client = client(vec![("/delta", json!({"value": [1]}))]);
        let mut paginator: DeltaPaginator<u32> = DeltaPaginator::start(client, ServiceClass::Mail, "/delta");
        assert!(matches!(
            paginator.next_page().await,
            Err(MigrationError::InvalidResponse(_))
        ));
    }
}
