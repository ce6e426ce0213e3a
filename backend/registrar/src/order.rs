//! Payment orders: identifiers, lifecycle, and order initiation against the gateway.
//!
//! Initiation runs strictly in this order:
//!
//! 1. reuse the draft's order identifier (it was minted, or recovered on resume,
//!    before any gateway traffic),
//! 2. persist the registration with the backend unless that already happened,
//! 3. ask the gateway collaborator for an order,
//! 4. pull the gateway order id and redirect token out of the response,
//! 5. only then hand back the launch URL.
//!
//! A response without both values is a hard failure whatever its HTTP status.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};
use url::Url;

use crate::backend::Backend;
use crate::config::Config;
use crate::db;
use crate::draft::RegistrationDraft;
use crate::errors::{PortalError, Result};

const ORDER_ID_RANDOM_BYTES: usize = 5;
const ORDER_ID_MAX_LEN: usize = 35;
/// An attempt claim older than this is considered dead and may be taken over.
const ATTEMPT_LEASE_SECS: i64 = 120;

// ─────────────────────────────────────────────────────────
// Identifiers and lifecycle
// ─────────────────────────────────────────────────────────

/// Merchant-side order identifier. Uppercase ASCII alphanumeric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct OrderId(String);

impl OrderId {
    /// `prefix` followed by ten random uppercase hex characters.
    pub fn generate(prefix: &str) -> Self {
        let bytes: [u8; ORDER_ID_RANDOM_BYTES] = rand::random();
        Self(format!("{prefix}{}", hex::encode_upper(bytes)))
    }

    /// Accepts identifiers echoed back by the gateway or typed into a URL.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let valid = !raw.is_empty()
            && raw.len() <= ORDER_ID_MAX_LEN
            && raw.chars().all(|c| c.is_ascii_alphanumeric());
        valid.then(|| Self(raw.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created locally, gateway not contacted yet (or contact in progress).
    Pending,
    /// Gateway order exists and the registrant was sent to the launch page.
    Redirected,
    Verified,
    Failed,
    /// Redirected but no callback ever arrived.
    Abandoned,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Redirected => "redirected",
            Self::Verified => "verified",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Verified, _) => false,
            (Pending, Redirected | Failed | Verified) => true,
            (Redirected, Verified | Failed | Abandoned | Pending) => true,
            // A retry after a failure, or a callback that shows up late.
            (Failed | Abandoned, Pending | Verified) => true,
            (Abandoned, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The portal's transient view of one payment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct PaymentOrder {
    pub order_id: OrderId,
    pub registration_id: Option<String>,
    pub gateway_order_id: Option<String>,
    pub amount: String,
    pub currency: String,
    pub status: OrderStatus,
    pub failure_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl PaymentOrder {
    pub fn new(order_id: OrderId, amount: &str, currency: &str) -> Self {
        let now = Utc::now().timestamp();
        Self {
            order_id,
            registration_id: None,
            gateway_order_id: None,
            amount: amount.to_string(),
            currency: currency.to_string(),
            status: OrderStatus::Pending,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Move an order to `next`, rejecting transitions the lifecycle does not allow.
pub async fn transition(
    pool: &SqlitePool,
    order_id: &OrderId,
    next: OrderStatus,
    reason: Option<&str>,
) -> Result<PaymentOrder> {
    let current = db::get_order(pool, order_id)
        .await?
        .ok_or_else(|| PortalError::NotFound(format!("order {order_id}")))?;

    if current.status == next {
        return Ok(current);
    }
    if !current.status.can_transition_to(next) {
        return Err(PortalError::Transition {
            order_id: order_id.clone(),
            from: current.status,
            to: next,
        });
    }

    db::set_order_status(pool, order_id, next, reason).await?;
    info!(order_id = %order_id, from = %current.status, to = %next, "Order status changed");

    Ok(PaymentOrder {
        status: next,
        failure_reason: reason.map(String::from),
        updated_at: Utc::now().timestamp(),
        ..current
    })
}

// ─────────────────────────────────────────────────────────
// Gateway request / response shapes
// ─────────────────────────────────────────────────────────

/// Body of `POST /{gateway}/orders`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderRequest {
    pub orderid: String,
    pub amount: String,
    pub currency: String,
    /// Return URL invoked by the gateway after payment.
    pub ru: String,
    pub itemcode: String,
    pub additional_info: BTreeMap<String, String>,
}

impl OrderRequest {
    pub fn new(config: &Config, order_id: &OrderId, registration_id: &str) -> Self {
        let additional_info = BTreeMap::from([
            ("purpose".to_string(), config.payment_purpose.clone()),
            ("registration_id".to_string(), registration_id.to_string()),
        ]);
        Self {
            orderid: order_id.to_string(),
            amount: config.registration_fee.clone(),
            currency: config.currency_code.clone(),
            ru: config.return_url(),
            itemcode: config.item_code.clone(),
            additional_info,
        }
    }
}

/// Where in the creation response the redirect token was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenLocation {
    /// `links: [{ parameters: { rdata } }, ...]`; the first link carrying it wins.
    LinkParameters,
    /// `links: { rdata }` or `links: { parameters: { rdata } }`.
    LinkObject,
    /// `rdata` at the top level.
    TopLevel,
}

impl TokenLocation {
    pub const PRIORITY: [TokenLocation; 3] =
        [Self::LinkParameters, Self::LinkObject, Self::TopLevel];

    fn extract(self, body: &Value) -> Option<String> {
        match self {
            Self::LinkParameters => body
                .get("links")?
                .as_array()?
                .iter()
                .find_map(|link| non_empty(link.get("parameters")?.get("rdata")?)),
            Self::LinkObject => {
                let links = body.get("links").filter(|l| l.is_object())?;
                links
                    .get("rdata")
                    .and_then(non_empty)
                    .or_else(|| non_empty(links.get("parameters")?.get("rdata")?))
            }
            Self::TopLevel => non_empty(body.get("rdata")?),
        }
    }
}

/// Candidate locations of the gateway order id, most specific first.
const GATEWAY_ORDER_ID_PATHS: &[&[&str]] = &[&["bdorderid"], &["orderid"], &["data", "bdorderid"]];

/// Everything needed to send the registrant to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayOrder {
    pub gateway_order_id: String,
    pub redirect_token: String,
    pub token_location: TokenLocation,
}

/// Pull the gateway order id and redirect token out of a creation response.
pub fn parse_creation_response(body: &Value) -> Result<GatewayOrder> {
    let gateway_order_id = GATEWAY_ORDER_ID_PATHS
        .iter()
        .find_map(|path| non_empty(lookup_path(body, path)?));

    let token = TokenLocation::PRIORITY
        .iter()
        .find_map(|location| location.extract(body).map(|token| (token, *location)));

    match (gateway_order_id, token) {
        (Some(gateway_order_id), Some((redirect_token, token_location))) => Ok(GatewayOrder {
            gateway_order_id,
            redirect_token,
            token_location,
        }),
        (None, Some(_)) => Err(PortalError::OrderCreation(
            "gateway order id missing from creation response".to_string(),
        )),
        (Some(_), None) => Err(PortalError::OrderCreation(
            "redirect token missing from creation response".to_string(),
        )),
        (None, None) => Err(PortalError::OrderCreation(
            "gateway order id and redirect token missing from creation response".to_string(),
        )),
    }
}

fn lookup_path<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.get(key))
}

fn non_empty(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

/// `{backend}/{gateway}/launch?bdorderid=..&rdata=..`
pub fn launch_url(config: &Config, order: &GatewayOrder) -> Result<Url> {
    let base = format!(
        "{}/{}/launch",
        config.backend_url.trim_end_matches('/'),
        config.gateway
    );
    let mut url = Url::parse(&base)
        .map_err(|e| PortalError::Config(format!("Invalid launch URL {base}: {e}")))?;
    url.query_pairs_mut()
        .append_pair("bdorderid", &order.gateway_order_id)
        .append_pair("rdata", &order.redirect_token);
    Ok(url)
}

// ─────────────────────────────────────────────────────────
// Initiation
// ─────────────────────────────────────────────────────────

/// Result of a successful initiation: where to navigate next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub order_id: OrderId,
    pub registration_id: String,
    pub gateway_order: GatewayOrder,
    pub url: Url,
}

/// Start (or restart) a payment attempt for an already validated draft.
///
/// Any failure marks the order `failed` with the reason and is returned to
/// the caller; nothing is retried here.
pub async fn initiate(
    pool: &SqlitePool,
    backend: &dyn Backend,
    config: &Config,
    order_id: &OrderId,
    draft: &RegistrationDraft,
) -> Result<Launch> {
    let order = begin_attempt(pool, config, order_id).await?;

    match attempt(pool, backend, config, &order, draft).await {
        Ok(launch) => {
            db::set_gateway_order_id(pool, order_id, &launch.gateway_order.gateway_order_id)
                .await?;
            transition(pool, order_id, OrderStatus::Redirected, None).await?;
            info!(
                order_id = %order_id,
                gateway_order_id = %launch.gateway_order.gateway_order_id,
                "Payment order created, redirecting to gateway"
            );
            Ok(launch)
        }
        Err(e) => {
            warn!(order_id = %order_id, "Payment initiation failed: {e}");
            let reason = e.to_string();
            if let Err(mark_err) =
                transition(pool, order_id, OrderStatus::Failed, Some(&reason)).await
            {
                warn!(order_id = %order_id, "Could not mark order failed: {mark_err}");
            }
            Err(e)
        }
    }
}

/// Create the order if needed and claim it for this attempt, rewinding a
/// failed, abandoned or redirected order to `pending`. Never mints a new
/// identifier. Concurrent submits for one order get exactly one claim.
async fn begin_attempt(
    pool: &SqlitePool,
    config: &Config,
    order_id: &OrderId,
) -> Result<PaymentOrder> {
    let fresh = PaymentOrder::new(
        order_id.clone(),
        &config.registration_fee,
        &config.currency_code,
    );
    if db::insert_order(pool, &fresh).await? {
        info!(order_id = %order_id, "Payment order created locally");
    }

    let now = Utc::now().timestamp();
    if !db::claim_attempt(pool, order_id, now, now - ATTEMPT_LEASE_SECS).await? {
        let current = db::get_order(pool, order_id).await?;
        if current.map(|o| o.status) == Some(OrderStatus::Verified) {
            return Err(PortalError::AlreadyPaid(order_id.clone()));
        }
        warn!(order_id = %order_id, "Payment attempt already in progress");
        return Err(PortalError::OrderCreation(
            "another payment attempt for this order is in progress".to_string(),
        ));
    }

    let order = db::get_order(pool, order_id)
        .await?
        .ok_or_else(|| PortalError::NotFound(format!("order {order_id}")))?;
    debug!(order_id = %order_id, "Payment attempt claimed");
    Ok(order)
}

async fn attempt(
    pool: &SqlitePool,
    backend: &dyn Backend,
    config: &Config,
    order: &PaymentOrder,
    draft: &RegistrationDraft,
) -> Result<Launch> {
    let registration_id = match &order.registration_id {
        Some(id) => id.clone(),
        None => {
            let id = backend.register(&order.order_id, draft).await?;
            db::set_registration_id(pool, &order.order_id, &id).await?;
            info!(order_id = %order.order_id, registration_id = %id, "Registration persisted");
            id
        }
    };

    let request = OrderRequest::new(config, &order.order_id, &registration_id);
    let response = backend.create_order(&request).await?;
    let gateway_order = parse_creation_response(&response)?;
    let url = launch_url(config, &gateway_order)?;

    Ok(Launch {
        order_id: order.order_id.clone(),
        registration_id,
        gateway_order,
        url,
    })
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;
    use crate::draft::tests::valid_draft;
    use serde_json::json;

    async fn setup() -> (SqlitePool, FakeBackend, Config) {
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        (pool, FakeBackend::default(), Config::for_tests("http://backend.test/api"))
    }

    #[test]
    fn generated_ids_are_uppercase_alphanumeric_and_distinct() {
        let a = OrderId::generate("PU");
        let b = OrderId::generate("PU");
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 12);
        assert!(a.as_str().starts_with("PU"));
        assert!(a
            .as_str()
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        assert_eq!(OrderId::parse(a.as_str()), Some(a));
    }

    #[test]
    fn parse_rejects_non_alphanumeric() {
        assert_eq!(OrderId::parse("pu12ab").unwrap().as_str(), "PU12AB");
        assert!(OrderId::parse("").is_none());
        assert!(OrderId::parse("PU-12").is_none());
        assert!(OrderId::parse("PU12'; DROP").is_none());
    }

    #[test]
    fn verified_is_terminal() {
        for next in [
            OrderStatus::Pending,
            OrderStatus::Redirected,
            OrderStatus::Failed,
            OrderStatus::Abandoned,
        ] {
            assert!(!OrderStatus::Verified.can_transition_to(next));
        }
        assert!(OrderStatus::Failed.can_transition_to(OrderStatus::Pending));
        assert!(OrderStatus::Abandoned.can_transition_to(OrderStatus::Verified));
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Abandoned));
    }

    #[test]
    fn token_found_in_link_array() {
        let body = json!({
            "bdorderid": "BD123",
            "links": [
                { "href": "https://gw/status", "rel": "self" },
                { "href": "https://gw/pay", "parameters": { "mercid": "M1", "rdata": "RD-xyz" } }
            ]
        });
        let order = parse_creation_response(&body).unwrap();
        assert_eq!(order.gateway_order_id, "BD123");
        assert_eq!(order.redirect_token, "RD-xyz");
        assert_eq!(order.token_location, TokenLocation::LinkParameters);
    }

    #[test]
    fn token_found_at_top_level_or_link_object() {
        let top = json!({ "orderid": "BD9", "rdata": "RD-top" });
        let order = parse_creation_response(&top).unwrap();
        assert_eq!(order.token_location, TokenLocation::TopLevel);
        assert_eq!(order.gateway_order_id, "BD9");

        let object = json!({ "data": { "bdorderid": "BD7" }, "links": { "rdata": "RD-obj" } });
        let order = parse_creation_response(&object).unwrap();
        assert_eq!(order.token_location, TokenLocation::LinkObject);
        assert_eq!(order.gateway_order_id, "BD7");
    }

    #[test]
    fn empty_token_falls_through_to_next_location() {
        let body = json!({
            "bdorderid": "BD1",
            "links": [{ "parameters": { "rdata": "" } }],
            "rdata": "RD-fallback"
        });
        let order = parse_creation_response(&body).unwrap();
        assert_eq!(order.redirect_token, "RD-fallback");
    }

    #[test]
    fn missing_values_are_hard_failures() {
        let no_token = json!({ "bdorderid": "BD1", "links": [{ "href": "x" }] });
        assert!(matches!(
            parse_creation_response(&no_token),
            Err(PortalError::OrderCreation(msg)) if msg.contains("redirect token")
        ));

        let no_id = json!({ "rdata": "RD" });
        assert!(matches!(
            parse_creation_response(&no_id),
            Err(PortalError::OrderCreation(msg)) if msg.contains("gateway order id")
        ));
    }

    #[test]
    fn launch_url_carries_both_parameters() {
        let config = Config::for_tests("http://backend.test/api/");
        let order = GatewayOrder {
            gateway_order_id: "BD 1".to_string(),
            redirect_token: "a+b/c=".to_string(),
            token_location: TokenLocation::TopLevel,
        };
        let url = launch_url(&config, &order).unwrap();
        assert_eq!(url.path(), "/api/billdesk/launch");
        let pairs: BTreeMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["bdorderid"], "BD 1");
        assert_eq!(pairs["rdata"], "a+b/c=");
    }

    #[test]
    fn order_request_carries_registration_metadata() {
        let config = Config::for_tests("http://backend.test");
        let order_id = OrderId::parse("PU0011223344").unwrap();
        let request = OrderRequest::new(&config, &order_id, "REG-9");
        assert_eq!(request.orderid, "PU0011223344");
        assert_eq!(request.ru, "http://portal.test/payment/callback");
        assert_eq!(request.additional_info["registration_id"], "REG-9");
        assert_eq!(request.additional_info["purpose"], config.payment_purpose);
    }

    #[tokio::test]
    async fn initiate_registers_then_redirects() {
        let (pool, backend, config) = setup().await;
        let order_id = OrderId::generate("PU");

        let launch = initiate(&pool, &backend, &config, &order_id, &valid_draft())
            .await
            .unwrap();

        assert_eq!(launch.order_id, order_id);
        assert_eq!(backend.registration_count(), 1);
        let request = backend.last_order_request().unwrap();
        assert_eq!(request.orderid, order_id.as_str());
        assert_eq!(request.additional_info["registration_id"], launch.registration_id);

        let stored = db::get_order(&pool, &order_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Redirected);
        assert_eq!(
            stored.gateway_order_id.as_deref(),
            Some(launch.gateway_order.gateway_order_id.as_str())
        );
        assert!(launch.url.as_str().contains("rdata="));
    }

    #[tokio::test]
    async fn missing_redirect_token_aborts_without_navigation() {
        let (pool, backend, config) = setup().await;
        *backend.creation_response.lock().unwrap() = Some(json!({ "bdorderid": "BD1" }));
        let order_id = OrderId::generate("PU");

        let err = initiate(&pool, &backend, &config, &order_id, &valid_draft())
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::OrderCreation(_)));

        let stored = db::get_order(&pool, &order_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Failed);
        assert!(stored.gateway_order_id.is_none());
        assert!(stored.failure_reason.unwrap().contains("redirect token"));
    }

    #[tokio::test]
    async fn retry_reuses_order_id_and_registration() {
        let (pool, backend, config) = setup().await;
        *backend.create_order_failure.lock().unwrap() = Some((502, "gateway down".to_string()));
        let order_id = OrderId::generate("PU");

        assert!(initiate(&pool, &backend, &config, &order_id, &valid_draft())
            .await
            .is_err());

        *backend.create_order_failure.lock().unwrap() = None;
        let launch = initiate(&pool, &backend, &config, &order_id, &valid_draft())
            .await
            .unwrap();

        assert_eq!(launch.order_id, order_id);
        assert_eq!(backend.registration_count(), 1);
        assert_eq!(backend.order_requests.lock().unwrap().len(), 2);
        assert!(backend
            .order_requests
            .lock()
            .unwrap()
            .iter()
            .all(|r| r.orderid == order_id.as_str()));
    }

    #[tokio::test]
    async fn verified_order_cannot_be_paid_again() {
        let (pool, backend, config) = setup().await;
        let order_id = OrderId::generate("PU");
        initiate(&pool, &backend, &config, &order_id, &valid_draft())
            .await
            .unwrap();
        transition(&pool, &order_id, OrderStatus::Verified, None)
            .await
            .unwrap();

        let err = initiate(&pool, &backend, &config, &order_id, &valid_draft())
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::AlreadyPaid(_)));
        assert_eq!(backend.order_requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn generated_id_round_trips_through_lookup() {
        let (pool, backend, config) = setup().await;
        let order_id = OrderId::generate("PU");
        initiate(&pool, &backend, &config, &order_id, &valid_draft())
            .await
            .unwrap();

        let details = backend.fetch_order(&order_id).await.unwrap().unwrap();
        assert_eq!(details.transaction_info.order_id.as_deref(), Some(order_id.as_str()));
    }

    #[tokio::test]
    async fn concurrent_submits_register_once() {
        let (pool, backend, config) = setup().await;
        let order_id = OrderId::generate("PU");
        let draft = valid_draft();

        let (first, second) = tokio::join!(
            initiate(&pool, &backend, &config, &order_id, &draft),
            initiate(&pool, &backend, &config, &order_id, &draft),
        );

        for result in [&first, &second] {
            assert!(
                matches!(result, Ok(_) | Err(PortalError::OrderCreation(_))),
                "unexpected outcome: {result:?}"
            );
        }
        assert!(first.is_ok() || second.is_ok());
        assert_eq!(backend.registration_count(), 1);

        let stored = db::get_order(&pool, &order_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Redirected);
    }

    #[tokio::test]
    async fn claimed_attempt_blocks_a_second_submit() {
        let (pool, backend, config) = setup().await;
        let order_id = OrderId::generate("PU");
        db::insert_order(
            &pool,
            &PaymentOrder::new(order_id.clone(), &config.registration_fee, &config.currency_code),
        )
        .await
        .unwrap();
        let now = Utc::now().timestamp();
        assert!(db::claim_attempt(&pool, &order_id, now, now - ATTEMPT_LEASE_SECS)
            .await
            .unwrap());

        let err = initiate(&pool, &backend, &config, &order_id, &valid_draft())
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::OrderCreation(_)));
        assert_eq!(backend.registration_count(), 0);

        // The in-flight attempt is untouched by the rejected one.
        let stored = db::get_order(&pool, &order_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Pending);
        assert!(stored.failure_reason.is_none());
    }
}
