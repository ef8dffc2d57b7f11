//! Upstream order API adapter: envelope parsing, the paginated fetch loop
//! and record normalization.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ordersync_core::{RawOrder, Secret};
use ordersync_storage::{HttpError, HttpFetcher};
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod normalize;

pub use normalize::{normalize, normalize_all, order_code, resolve_status, resolve_type};

pub const CRATE_NAME: &str = "ordersync-adapters";

pub const ORDERS_PATH: &str = "/api/get_orders";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("upstream returned http {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unexpected upstream response: {0}")]
    UpstreamFormat(String),
}

impl From<HttpError> for FetchError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Request(e) => FetchError::Transport(e.to_string()),
            HttpError::HttpStatus { status, url } => FetchError::HttpStatus { status, url },
        }
    }
}

/// Retrieves the raw body of one page of orders.
#[async_trait]
pub trait PageTransport: Send + Sync {
    async fn get_orders_page(
        &self,
        base_endpoint: &str,
        credential: &Secret,
        page: u32,
    ) -> Result<Vec<u8>, FetchError>;
}

#[async_trait]
impl PageTransport for HttpFetcher {
    async fn get_orders_page(
        &self,
        base_endpoint: &str,
        credential: &Secret,
        page: u32,
    ) -> Result<Vec<u8>, FetchError> {
        let url = format!("{}{ORDERS_PATH}", base_endpoint.trim_end_matches('/'));
        let body = self
            .get(
                &url,
                &[
                    ("user_api_hash", credential.expose().to_string()),
                    ("page", page.to_string()),
                ],
            )
            .await?;
        Ok(body)
    }
}

#[derive(Debug, Deserialize)]
struct OrdersEnvelope {
    items: OrdersItems,
}

#[derive(Debug, Deserialize)]
struct OrdersItems {
    data: Vec<JsonValue>,
    #[serde(default, deserialize_with = "lenient_page_count")]
    last_page: Option<u32>,
    #[serde(default)]
    next_page_url: Option<JsonValue>,
}

fn lenient_page_count<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

/// One accepted page of the `items` envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrdersPage {
    pub orders: Vec<RawOrder>,
    /// Entries in `items.data` before malformed ones were dropped.
    pub listed: usize,
    pub last_page: Option<u32>,
    /// False when `next_page_url` is absent, null or blank.
    pub has_next: bool,
}

pub fn parse_orders_page(body: &[u8]) -> Result<OrdersPage, FetchError> {
    let envelope: OrdersEnvelope = serde_json::from_slice(body)
        .map_err(|e| FetchError::UpstreamFormat(format!("orders envelope: {e}")))?;
    let items = envelope.items;
    let listed = items.data.len();

    let mut orders = Vec::with_capacity(listed);
    for entry in items.data {
        match serde_json::from_value::<RawOrder>(entry) {
            Ok(order) => orders.push(order),
            Err(err) => warn!(error = %err, "skipping order without a usable id"),
        }
    }

    let has_next = match items.next_page_url {
        Some(JsonValue::String(s)) => !s.trim().is_empty(),
        Some(JsonValue::Null) | None => false,
        Some(_) => true,
    };

    Ok(OrdersPage {
        orders,
        listed,
        last_page: items.last_page,
        has_next,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct PaginationPolicy {
    /// Pause between consecutive page requests.
    pub page_delay: Duration,
    pub max_pages: u32,
}

impl Default for PaginationPolicy {
    fn default() -> Self {
        Self {
            page_delay: Duration::from_millis(200),
            max_pages: 500,
        }
    }
}

/// Why pagination ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EmptyPage,
    LastPageReached,
    NoNextPage,
    PageCap,
    Failed(FetchError),
}

/// Single termination predicate for the pagination loop; `None` means
/// request the next page.
pub fn stop_reason(
    page: u32,
    outcome: &Result<OrdersPage, FetchError>,
    policy: &PaginationPolicy,
) -> Option<StopReason> {
    let accepted = match outcome {
        Err(err) => return Some(StopReason::Failed(err.clone())),
        Ok(accepted) => accepted,
    };

    if accepted.listed == 0 {
        Some(StopReason::EmptyPage)
    } else if accepted.last_page.is_some_and(|last| page >= last) {
        Some(StopReason::LastPageReached)
    } else if !accepted.has_next {
        Some(StopReason::NoNextPage)
    } else if page >= policy.max_pages {
        Some(StopReason::PageCap)
    } else {
        None
    }
}

/// Everything one pagination run accepted.
#[derive(Debug, Clone)]
pub struct FetchedOrders {
    /// Unique by id, first occurrence wins, in upstream order.
    pub orders: Vec<RawOrder>,
    pub pages_fetched: u32,
    pub duplicates: usize,
    pub stop: StopReason,
}

impl FetchedOrders {
    /// Pagination ended on an error after at least one accepted page.
    pub fn truncated(&self) -> bool {
        matches!(self.stop, StopReason::Failed(_))
    }
}

/// Paginated retrieval of all orders, each page attempted exactly once.
#[derive(Clone)]
pub struct RecordFetcher {
    transport: Arc<dyn PageTransport>,
    policy: PaginationPolicy,
}

impl RecordFetcher {
    pub fn new(transport: Arc<dyn PageTransport>, policy: PaginationPolicy) -> Self {
        Self { transport, policy }
    }

    /// Pages 1.. until the first stop signal. A failing page ends the run
    /// and keeps the pages already accepted; it is only an error when
    /// nothing was accepted before it.
    pub async fn fetch_all(
        &self,
        credential: &Secret,
        base_endpoint: &str,
    ) -> Result<FetchedOrders, FetchError> {
        let mut orders = Vec::new();
        let mut seen = HashSet::new();
        let mut duplicates = 0usize;
        let mut pages_fetched = 0u32;
        let mut page = 1u32;

        let stop = loop {
            let outcome = match self
                .transport
                .get_orders_page(base_endpoint, credential, page)
                .await
            {
                Ok(body) => parse_orders_page(&body),
                Err(err) => Err(err),
            };

            if let Ok(accepted) = &outcome {
                pages_fetched += 1;
                for order in &accepted.orders {
                    if seen.insert(order.id) {
                        orders.push(order.clone());
                    } else {
                        duplicates += 1;
                    }
                }
                info!(page, records = accepted.listed, last_page = ?accepted.last_page, "fetched page");
            }

            if let Some(reason) = stop_reason(page, &outcome, &self.policy) {
                break reason;
            }

            page += 1;
            if !self.policy.page_delay.is_zero() {
                tokio::time::sleep(self.policy.page_delay).await;
            }
        };

        if let StopReason::Failed(err) = &stop {
            if orders.is_empty() {
                return Err(err.clone());
            }
            warn!(page, error = %err, kept = orders.len(), "pagination truncated; keeping earlier pages");
        } else {
            debug!(page, reason = ?stop, "pagination finished");
        }
        if duplicates > 0 {
            debug!(duplicates, "dropped orders repeated across pages");
        }

        Ok(FetchedOrders {
            orders,
            pages_fetched,
            duplicates,
            stop,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    /// Serves canned page bodies; pages without an entry fail with a transport error.
    struct ScriptedTransport {
        pages: HashMap<u32, Result<String, FetchError>>,
        requested: Mutex<Vec<u32>>,
    }

    impl ScriptedTransport {
        fn new(pages: Vec<(u32, Result<String, FetchError>)>) -> Arc<Self> {
            Arc::new(Self {
                pages: pages.into_iter().collect(),
                requested: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PageTransport for ScriptedTransport {
        async fn get_orders_page(
            &self,
            _base_endpoint: &str,
            _credential: &Secret,
            page: u32,
        ) -> Result<Vec<u8>, FetchError> {
            self.requested.lock().await.push(page);
            match self.pages.get(&page) {
                Some(Ok(body)) => Ok(body.clone().into_bytes()),
                Some(Err(err)) => Err(err.clone()),
                None => Err(FetchError::Transport(format!("no page {page}"))),
            }
        }
    }

    fn page_body(ids: &[u64], last_page: Option<u32>, next: Option<&str>) -> String {
        let data: Vec<_> = ids
            .iter()
            .map(|id| serde_json::json!({"id": id, "client_name": format!("client {id}")}))
            .collect();
        let mut items = serde_json::json!({ "data": data });
        if let Some(last) = last_page {
            items["last_page"] = serde_json::json!(last);
        }
        items["next_page_url"] = match next {
            Some(url) => serde_json::json!(url),
            None => JsonValue::Null,
        };
        serde_json::json!({ "items": items }).to_string()
    }

    fn fetcher(transport: Arc<ScriptedTransport>) -> RecordFetcher {
        RecordFetcher::new(
            transport,
            PaginationPolicy {
                page_delay: Duration::ZERO,
                max_pages: 50,
            },
        )
    }

    fn ids(fetched: &FetchedOrders) -> Vec<u64> {
        fetched.orders.iter().map(|o| o.id).collect()
    }

    #[tokio::test]
    async fn stops_at_declared_last_page() {
        let transport = ScriptedTransport::new(vec![
            (1, Ok(page_body(&[1, 2], Some(2), Some("p2")))),
            (2, Ok(page_body(&[3], Some(2), Some("p3")))),
            (3, Ok(page_body(&[4], Some(2), None))),
        ]);
        let fetched = fetcher(transport.clone())
            .fetch_all(&Secret::new("t"), "https://upstream")
            .await
            .unwrap();
        assert_eq!(ids(&fetched), vec![1, 2, 3]);
        assert_eq!(fetched.stop, StopReason::LastPageReached);
        assert_eq!(*transport.requested.lock().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn stops_when_next_pointer_is_null() {
        let transport = ScriptedTransport::new(vec![
            (1, Ok(page_body(&[1], None, Some("p2")))),
            (2, Ok(page_body(&[2], None, None))),
        ]);
        let fetched = fetcher(transport)
            .fetch_all(&Secret::new("t"), "https://upstream")
            .await
            .unwrap();
        assert_eq!(ids(&fetched), vec![1, 2]);
        assert_eq!(fetched.stop, StopReason::NoNextPage);
    }

    #[tokio::test]
    async fn stops_on_empty_page() {
        let transport = ScriptedTransport::new(vec![
            (1, Ok(r#"{"items":{"data":[{"id":1}],"next_page_url":"p2"}}"#.to_string())),
            (2, Ok(r#"{"items":{"data":[],"next_page_url":"p3"}}"#.to_string())),
        ]);
        let fetched = fetcher(transport)
            .fetch_all(&Secret::new("t"), "https://upstream")
            .await
            .unwrap();
        assert_eq!(ids(&fetched), vec![1]);
        assert_eq!(fetched.stop, StopReason::EmptyPage);
        assert_eq!(fetched.pages_fetched, 2);
    }

    #[tokio::test]
    async fn failure_on_page_three_keeps_pages_one_and_two() {
        let transport = ScriptedTransport::new(vec![
            (1, Ok(page_body(&[1, 2], Some(5), Some("p2")))),
            (2, Ok(page_body(&[3, 4], Some(5), Some("p3")))),
            (
                3,
                Err(FetchError::HttpStatus {
                    status: 502,
                    url: "https://upstream/api/get_orders".into(),
                }),
            ),
            (4, Ok(page_body(&[7], Some(5), Some("p5")))),
            (5, Ok(page_body(&[8], Some(5), None))),
        ]);
        let fetched = fetcher(transport.clone())
            .fetch_all(&Secret::new("t"), "https://upstream")
            .await
            .unwrap();
        assert_eq!(ids(&fetched), vec![1, 2, 3, 4]);
        assert!(fetched.truncated());
        assert_eq!(*transport.requested.lock().await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn malformed_envelope_truncates_like_a_transport_failure() {
        let transport = ScriptedTransport::new(vec![
            (1, Ok(page_body(&[1], Some(3), Some("p2")))),
            (2, Ok(r#"{"orders":[]}"#.to_string())),
        ]);
        let fetched = fetcher(transport)
            .fetch_all(&Secret::new("t"), "https://upstream")
            .await
            .unwrap();
        assert_eq!(ids(&fetched), vec![1]);
        assert!(matches!(fetched.stop, StopReason::Failed(FetchError::UpstreamFormat(_))));
    }

    #[tokio::test]
    async fn failure_on_first_page_is_an_error() {
        let transport = ScriptedTransport::new(vec![(
            1,
            Err(FetchError::Transport("connection refused".into())),
        )]);
        let err = fetcher(transport)
            .fetch_all(&Secret::new("t"), "https://upstream")
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::Transport("connection refused".into()));
    }

    #[tokio::test]
    async fn repeated_ids_across_pages_are_kept_once() {
        let transport = ScriptedTransport::new(vec![
            (1, Ok(page_body(&[10, 9], Some(2), Some("p2")))),
            (2, Ok(page_body(&[9, 8], Some(2), None))),
        ]);
        let fetched = fetcher(transport)
            .fetch_all(&Secret::new("t"), "https://upstream")
            .await
            .unwrap();
        assert_eq!(ids(&fetched), vec![10, 9, 8]);
        assert_eq!(fetched.duplicates, 1);
    }

    #[tokio::test]
    async fn page_cap_bounds_an_endless_upstream() {
        let pages = (1..=10u32)
            .map(|p| (p, Ok(page_body(&[u64::from(p)], None, Some("more")))))
            .collect();
        let transport = ScriptedTransport::new(pages);
        let fetched = RecordFetcher::new(
            transport,
            PaginationPolicy {
                page_delay: Duration::ZERO,
                max_pages: 3,
            },
        )
        .fetch_all(&Secret::new("t"), "https://upstream")
        .await
        .unwrap();
        assert_eq!(ids(&fetched), vec![1, 2, 3]);
        assert_eq!(fetched.stop, StopReason::PageCap);
    }

    #[test]
    fn missing_next_key_ends_pagination_before_last_page() {
        let page = parse_orders_page(br#"{"items":{"data":[{"id":1}],"last_page":"4"}}"#).unwrap();
        assert!(!page.has_next);
        assert_eq!(page.last_page, Some(4));
        let policy = PaginationPolicy::default();
        assert_eq!(stop_reason(1, &Ok(page), &policy), Some(StopReason::NoNextPage));
    }

    #[test]
    fn blank_next_pointer_ends_pagination() {
        let page = parse_orders_page(br#"{"items":{"data":[{"id":1}],"next_page_url":"  "}}"#).unwrap();
        assert!(!page.has_next);
        let page = parse_orders_page(br#"{"items":{"data":[{"id":1}],"next_page_url":"p2"}}"#).unwrap();
        assert!(page.has_next);
    }

    #[tokio::test]
    async fn envelope_without_any_pointer_fetches_one_page() {
        let transport = ScriptedTransport::new(vec![
            (1, Ok(r#"{"items":{"data":[{"id":1},{"id":2}],"last_page":5}}"#.to_string())),
            (2, Ok(r#"{"items":{"data":[{"id":3}],"last_page":5}}"#.to_string())),
        ]);
        let fetched = fetcher(transport.clone())
            .fetch_all(&Secret::new("t"), "https://upstream")
            .await
            .unwrap();
        assert_eq!(ids(&fetched), vec![1, 2]);
        assert_eq!(fetched.stop, StopReason::NoNextPage);
        assert_eq!(*transport.requested.lock().await, vec![1]);
    }

    #[test]
    fn entries_without_ids_are_dropped_but_still_count_as_listed() {
        let page = parse_orders_page(br#"{"items":{"data":[{"id":1},{"client_name":"x"}]}}"#).unwrap();
        assert_eq!(page.orders.len(), 1);
        assert_eq!(page.listed, 2);
    }

    #[test]
    fn missing_data_key_is_a_format_error() {
        assert!(matches!(
            parse_orders_page(br#"{"items":{"rows":[]}}"#),
            Err(FetchError::UpstreamFormat(_))
        ));
        assert!(matches!(
            parse_orders_page(b"<html>maintenance</html>"),
            Err(FetchError::UpstreamFormat(_))
        ));
    }
}
