//! Payment callback reconciliation.
//!
//! The gateway sends the registrant back to `/payment/callback` with the
//! order identifier and a transaction-response token, under whichever
//! parameter names that integration path happens to use. The reconciler asks
//! the backend to verify the transaction and maps the answer to exactly one
//! terminal route:
//!
//! ```text
//! verifying ──┬── success ──────────► /success
//!             ├── failed  ──────────► /cancel
//!             └── unknown ──────────► /cancel
//! ```
//!
//! Verification is issued at most once per callback request and is bounded
//! by a timeout. Reloading the callback page runs a fresh verification; the
//! backend treats it as a query, and the local audit row is upserted. Once an
//! order is verified, or a token has a recorded success or failure, that
//! outcome decides the route whatever a later verification says.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::config::RouteDelays;
use crate::db;
use crate::errors::PortalError;
use crate::order::{self, OrderId, OrderStatus};

/// Parameter names that may carry the order identifier, in priority order.
pub const ORDER_ID_PARAMS: &[&str] = &["orderid", "orderId", "order"];
/// Parameter names that may carry the transaction-response token.
pub const TRANSACTION_PARAMS: &[&str] = &["transaction_response", "trx", "rdata"];

/// Gateway authorization code for a captured payment.
pub const AUTH_STATUS_SUCCESS: &str = "0300";
pub const AUTH_STATUS_FAILURE: &str = "0399";
pub const AUTH_STATUS_PENDING: &str = "0002";

// ─────────────────────────────────────────────────────────
// Callback parameters
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub order_id: Option<OrderId>,
    pub transaction_response: Option<String>,
}

impl CallbackParams {
    /// Parse a raw query string. The first non-empty value among the known
    /// aliases wins.
    pub fn from_query(query: &str) -> Self {
        let pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        let first = |names: &[&str]| {
            names.iter().find_map(|name| {
                pairs
                    .iter()
                    .find(|(key, value)| key == name && !value.trim().is_empty())
                    .map(|(_, value)| value.trim().to_string())
            })
        };

        Self {
            order_id: first(ORDER_ID_PARAMS).and_then(|raw| OrderId::parse(&raw)),
            transaction_response: first(TRANSACTION_PARAMS),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Verification contract
// ─────────────────────────────────────────────────────────

/// Body of `POST /verify-payment`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationRequest {
    pub orderid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_response: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationResponse {
    pub success: bool,
    pub status: Option<String>,
    #[serde(alias = "authStatus")]
    pub auth_status: Option<String>,
    #[serde(alias = "transactionid")]
    pub transaction_id: Option<String>,
    #[serde(alias = "transaction_error_desc")]
    pub error_description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Pending,
    Unknown,
}

impl VerificationResponse {
    fn status_is(&self, expected: &str) -> bool {
        self.status
            .as_deref()
            .is_some_and(|s| s.trim().eq_ignore_ascii_case(expected))
    }

    fn auth_is(&self, expected: &str) -> bool {
        self.auth_status.as_deref().map(str::trim) == Some(expected)
    }

    /// `success` must be set, and either field may confirm it; the gateway
    /// does not populate them consistently.
    pub fn classify(&self) -> Outcome {
        if self.success && (self.status_is("success") || self.auth_is(AUTH_STATUS_SUCCESS)) {
            Outcome::Success
        } else if self.status_is("pending") || self.auth_is(AUTH_STATUS_PENDING) {
            Outcome::Pending
        } else if !self.success || self.status_is("failure") || self.auth_is(AUTH_STATUS_FAILURE)
        {
            Outcome::Failure
        } else {
            Outcome::Unknown
        }
    }

    /// Both fields present but disagreeing about success.
    pub fn has_conflict(&self) -> bool {
        match (&self.status, &self.auth_status) {
            (Some(_), Some(_)) => self.status_is("success") != self.auth_is(AUTH_STATUS_SUCCESS),
            _ => false,
        }
    }
}

/// What the portal concluded about one callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationResult {
    pub order_id: OrderId,
    pub outcome: Outcome,
    pub transaction_id: Option<String>,
    pub status_code: Option<String>,
    pub error_description: Option<String>,
}

impl ReconciliationResult {
    fn from_response(order_id: &OrderId, response: &VerificationResponse) -> Self {
        Self {
            order_id: order_id.clone(),
            outcome: response.classify(),
            transaction_id: response.transaction_id.clone(),
            status_code: response
                .auth_status
                .clone()
                .or_else(|| response.status.clone()),
            error_description: response.error_description.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Routing
// ─────────────────────────────────────────────────────────

/// Where a callback ended up. The verifying phase is the in-flight
/// verification call itself and is never returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilerState {
    Success,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalRoute {
    Success,
    Cancel,
}

impl TerminalRoute {
    pub fn path(self, order_id: Option<&OrderId>) -> String {
        let base = match self {
            Self::Success => "/success",
            Self::Cancel => "/cancel",
        };
        match order_id {
            Some(id) => format!("{base}?orderid={id}"),
            None => base.to_string(),
        }
    }
}

/// Terminal state of one callback, with the message to display meanwhile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackOutcome {
    pub order_id: Option<OrderId>,
    pub state: ReconcilerState,
    pub message: &'static str,
    pub route: TerminalRoute,
    pub delay: Duration,
    pub result: Option<ReconciliationResult>,
}

impl CallbackOutcome {
    pub fn redirect_path(&self) -> String {
        self.route.path(self.order_id.as_ref())
    }
}

// ─────────────────────────────────────────────────────────
// Reconciler
// ─────────────────────────────────────────────────────────

pub struct Reconciler<'a> {
    pub pool: &'a SqlitePool,
    pub backend: &'a dyn Backend,
    pub delays: RouteDelays,
    pub timeout: Duration,
}

impl Reconciler<'_> {
    pub async fn reconcile(&self, params: CallbackParams) -> CallbackOutcome {
        let Some(order_id) = params.order_id else {
            info!("Payment callback without an order identifier");
            return CallbackOutcome {
                order_id: None,
                state: ReconcilerState::Unknown,
                message: "No order information found in callback URL.",
                route: TerminalRoute::Cancel,
                delay: Duration::from_millis(self.delays.missing_params_ms),
                result: None,
            };
        };
        let transaction_ref = params.transaction_response.as_deref();
        let settled = self.settled_outcome(&order_id, transaction_ref).await;

        let request = VerificationRequest {
            orderid: order_id.to_string(),
            transaction_response: params.transaction_response.clone(),
        };
        let verification = self.backend.verify_payment(&request);
        let response = match tokio::time::timeout(self.timeout, verification).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return self.verification_error(order_id, settled, e),
            Err(_) => {
                let e = PortalError::VerificationTimeout(self.timeout.as_secs());
                return self.verification_error(order_id, settled, e);
            }
        };

        if response.has_conflict() {
            warn!(
                order_id = %order_id,
                status = ?response.status,
                auth_status = ?response.auth_status,
                "Verification status fields disagree"
            );
        }

        let fresh = ReconciliationResult::from_response(&order_id, &response);
        info!(order_id = %order_id, outcome = ?fresh.outcome, "Payment verification completed");

        let result = match settled {
            Some(outcome) => {
                if outcome != fresh.outcome {
                    warn!(
                        order_id = %order_id,
                        settled = ?outcome,
                        fresh = ?fresh.outcome,
                        "Verification disagrees with the settled outcome, keeping it"
                    );
                }
                ReconciliationResult { outcome, ..fresh }
            }
            None => fresh,
        };

        if let Err(e) = db::record_reconciliation(self.pool, &result, transaction_ref).await {
            error!(order_id = %order_id, "Could not record reconciliation: {e}");
        }
        if settled.is_none() {
            self.apply_to_order(&result).await;
        }

        self.terminal(order_id, result.outcome, Some(result))
    }

    /// A definitive outcome already reached for this callback: the order was
    /// verified, or this transaction token was recorded as success or failure.
    async fn settled_outcome(
        &self,
        order_id: &OrderId,
        transaction_ref: Option<&str>,
    ) -> Option<Outcome> {
        match db::get_order(self.pool, order_id).await {
            Ok(Some(order)) if order.status == OrderStatus::Verified => {
                return Some(Outcome::Success)
            }
            Ok(_) => {}
            Err(e) => warn!(order_id = %order_id, "Could not load order before verifying: {e}"),
        }
        match db::get_reconciliation(self.pool, order_id, transaction_ref).await {
            Ok(previous) => previous.filter(|o| matches!(o, Outcome::Success | Outcome::Failure)),
            Err(e) => {
                warn!(order_id = %order_id, "Could not load previous reconciliation: {e}");
                None
            }
        }
    }

    fn terminal(
        &self,
        order_id: OrderId,
        outcome: Outcome,
        result: Option<ReconciliationResult>,
    ) -> CallbackOutcome {
        let (state, message, route, delay) = match outcome {
            Outcome::Success => (
                ReconcilerState::Success,
                "Payment verified successfully. Redirecting...",
                TerminalRoute::Success,
                self.delays.success_ms,
            ),
            Outcome::Failure => (
                ReconcilerState::Failed,
                "Payment failed or pending. Redirecting to cancellation page...",
                TerminalRoute::Cancel,
                self.delays.failure_ms,
            ),
            Outcome::Pending | Outcome::Unknown => (
                ReconcilerState::Unknown,
                "Payment failed or pending. Redirecting to cancellation page...",
                TerminalRoute::Cancel,
                self.delays.failure_ms,
            ),
        };

        CallbackOutcome {
            order_id: Some(order_id),
            state,
            message,
            route,
            delay: Duration::from_millis(delay),
            result,
        }
    }

    fn verification_error(
        &self,
        order_id: OrderId,
        settled: Option<Outcome>,
        e: PortalError,
    ) -> CallbackOutcome {
        error!(order_id = %order_id, "Payment verification error: {e}");
        if let Some(outcome) = settled {
            return self.terminal(order_id, outcome, None);
        }
        CallbackOutcome {
            order_id: Some(order_id),
            state: ReconcilerState::Unknown,
            message: "Verification failed. Redirecting to cancellation page...",
            route: TerminalRoute::Cancel,
            delay: Duration::from_millis(self.delays.error_ms),
            result: None,
        }
    }

    /// Reflect a definitive outcome on the local order. Pending and unknown
    /// answers leave it alone so the sweeper or a later callback decides.
    async fn apply_to_order(&self, result: &ReconciliationResult) {
        let order_id = &result.order_id;
        let next = match result.outcome {
            Outcome::Success => OrderStatus::Verified,
            Outcome::Failure => OrderStatus::Failed,
            Outcome::Pending | Outcome::Unknown => return,
        };

        let reason = result
            .error_description
            .clone()
            .unwrap_or_else(|| "Payment was not completed".to_string());
        let reason = (next == OrderStatus::Failed).then_some(reason.as_str());

        match order::transition(self.pool, order_id, next, reason).await {
            Ok(_) => {}
            Err(PortalError::NotFound(_)) => {
                warn!(order_id = %order_id, "Callback for an order this portal did not create");
            }
            Err(e) => warn!(order_id = %order_id, "Order not updated after callback: {e}"),
        }

        if next == OrderStatus::Verified {
            match db::clear_draft(self.pool, order_id).await {
                Ok(true) => debug!(order_id = %order_id, "Draft snapshot cleared"),
                Ok(false) => {}
                Err(e) => warn!(order_id = %order_id, "Could not clear draft snapshot: {e}"),
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;
    use crate::draft::DraftSnapshot;
    use crate::order::PaymentOrder;

    fn reconciler<'a>(pool: &'a SqlitePool, backend: &'a FakeBackend) -> Reconciler<'a> {
        Reconciler {
            pool,
            backend,
            delays: RouteDelays::default(),
            timeout: Duration::from_millis(200),
        }
    }

    async fn redirected_order(pool: &SqlitePool) -> OrderId {
        let order_id = OrderId::generate("PU");
        let mut order = PaymentOrder::new(order_id.clone(), "300.00", "356");
        order.status = OrderStatus::Redirected;
        db::insert_order(pool, &order).await.unwrap();
        order_id
    }

    fn respond(backend: &FakeBackend, body: serde_json::Value) {
        *backend.verification.lock().unwrap() = Some(serde_json::from_value(body).unwrap());
    }

    #[test]
    fn params_accept_every_alias() {
        let p = CallbackParams::from_query("orderId=pu1a2b&trx=TOKEN");
        assert_eq!(p.order_id.unwrap().as_str(), "PU1A2B");
        assert_eq!(p.transaction_response.as_deref(), Some("TOKEN"));

        let p = CallbackParams::from_query("order=PU9&rdata=R%2BD");
        assert_eq!(p.order_id.unwrap().as_str(), "PU9");
        assert_eq!(p.transaction_response.as_deref(), Some("R+D"));

        let p = CallbackParams::from_query("orderid=&orderId=PU7&transaction_response=T");
        assert_eq!(p.order_id.unwrap().as_str(), "PU7");
    }

    #[test]
    fn classification_rules() {
        let r = |v: serde_json::Value| -> VerificationResponse { serde_json::from_value(v).unwrap() };

        assert_eq!(r(serde_json::json!({"success": true, "status": "success"})).classify(), Outcome::Success);
        assert_eq!(r(serde_json::json!({"success": true, "auth_status": "0300"})).classify(), Outcome::Success);
        assert_eq!(r(serde_json::json!({"success": false, "status": "success"})).classify(), Outcome::Failure);
        assert_eq!(r(serde_json::json!({"success": true, "auth_status": "0002"})).classify(), Outcome::Pending);
        assert_eq!(r(serde_json::json!({"success": true, "auth_status": "0399"})).classify(), Outcome::Failure);
        assert_eq!(r(serde_json::json!({"success": true})).classify(), Outcome::Unknown);
    }

    #[test]
    fn conflict_only_when_both_fields_present() {
        let conflicting = VerificationResponse {
            success: true,
            status: Some("success".to_string()),
            auth_status: Some("0399".to_string()),
            ..Default::default()
        };
        assert!(conflicting.has_conflict());
        assert_eq!(conflicting.classify(), Outcome::Success);

        let partial = VerificationResponse {
            success: true,
            auth_status: Some("0300".to_string()),
            ..Default::default()
        };
        assert!(!partial.has_conflict());
    }

    #[tokio::test]
    async fn missing_order_id_routes_to_cancel_without_verifying() {
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        let backend = FakeBackend::default();

        let outcome = reconciler(&pool, &backend)
            .reconcile(CallbackParams::from_query("trx=ONLY-A-TOKEN"))
            .await;

        assert_eq!(outcome.route, TerminalRoute::Cancel);
        assert_eq!(outcome.redirect_path(), "/cancel");
        assert_eq!(outcome.delay, Duration::from_millis(3000));
        assert_eq!(backend.verify_call_count(), 0);
    }

    #[tokio::test]
    async fn success_status_routes_to_success_and_clears_draft() {
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        let backend = FakeBackend::default();
        let order_id = redirected_order(&pool).await;
        db::save_draft(&pool, &order_id, &DraftSnapshot::default(), chrono::Duration::hours(1))
            .await
            .unwrap();
        respond(&backend, serde_json::json!({"success": true, "status": "success"}));

        let outcome = reconciler(&pool, &backend)
            .reconcile(CallbackParams::from_query(&format!("orderid={order_id}")))
            .await;

        assert_eq!(outcome.route, TerminalRoute::Success);
        assert_eq!(outcome.redirect_path(), format!("/success?orderid={order_id}"));
        assert_eq!(outcome.delay, Duration::from_millis(1200));
        let order = db::get_order(&pool, &order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Verified);
        assert!(db::load_draft(&pool, &order_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn auth_status_alone_routes_to_success() {
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        let backend = FakeBackend::default();
        let order_id = redirected_order(&pool).await;
        respond(&backend, serde_json::json!({"success": true, "auth_status": "0300"}));

        let outcome = reconciler(&pool, &backend)
            .reconcile(CallbackParams::from_query(&format!("orderid={order_id}&transaction_response=JWS")))
            .await;

        assert_eq!(outcome.state, ReconcilerState::Success);
        let request = backend.last_verification_request().unwrap();
        assert_eq!(request.transaction_response.as_deref(), Some("JWS"));
    }

    #[tokio::test]
    async fn failure_marks_order_failed_with_reason() {
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        let backend = FakeBackend::default();
        let order_id = redirected_order(&pool).await;
        respond(
            &backend,
            serde_json::json!({"success": false, "auth_status": "0399", "transaction_error_desc": "Card declined"}),
        );

        let outcome = reconciler(&pool, &backend)
            .reconcile(CallbackParams::from_query(&format!("orderid={order_id}")))
            .await;

        assert_eq!(outcome.state, ReconcilerState::Failed);
        assert_eq!(outcome.route, TerminalRoute::Cancel);
        let order = db::get_order(&pool, &order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
        assert_eq!(order.failure_reason.as_deref(), Some("Card declined"));
    }

    #[tokio::test]
    async fn pending_leaves_order_untouched() {
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        let backend = FakeBackend::default();
        let order_id = redirected_order(&pool).await;
        respond(&backend, serde_json::json!({"success": true, "status": "pending"}));

        let outcome = reconciler(&pool, &backend)
            .reconcile(CallbackParams::from_query(&format!("orderid={order_id}")))
            .await;

        assert_eq!(outcome.route, TerminalRoute::Cancel);
        assert_eq!(outcome.result.unwrap().outcome, Outcome::Pending);
        let order = db::get_order(&pool, &order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Redirected);
    }

    #[tokio::test]
    async fn backend_error_and_timeout_route_to_cancel() {
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        let backend = FakeBackend::default();
        let order_id = redirected_order(&pool).await;
        let query = format!("orderid={order_id}");

        *backend.verify_down.lock().unwrap() = true;
        let outcome = reconciler(&pool, &backend)
            .reconcile(CallbackParams::from_query(&query))
            .await;
        assert_eq!(outcome.route, TerminalRoute::Cancel);
        assert_eq!(outcome.delay, Duration::from_millis(2000));

        *backend.verify_down.lock().unwrap() = false;
        *backend.verify_delay.lock().unwrap() = Some(Duration::from_secs(5));
        respond(&backend, serde_json::json!({"success": true, "status": "success"}));
        let outcome = reconciler(&pool, &backend)
            .reconcile(CallbackParams::from_query(&query))
            .await;
        assert_eq!(outcome.route, TerminalRoute::Cancel);
        assert!(outcome.result.is_none());

        let order = db::get_order(&pool, &order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Redirected);
    }

    #[tokio::test]
    async fn repeated_callback_is_idempotent() {
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        let backend = FakeBackend::default();
        let order_id = redirected_order(&pool).await;
        respond(&backend, serde_json::json!({"success": true, "auth_status": "0300", "transactionid": "TX77"}));
        let query = format!("orderid={order_id}&transaction_response=JWS");

        let first = reconciler(&pool, &backend)
            .reconcile(CallbackParams::from_query(&query))
            .await;
        let second = reconciler(&pool, &backend)
            .reconcile(CallbackParams::from_query(&query))
            .await;

        assert_eq!(first.route, second.route);
        assert_eq!(first.state, ReconcilerState::Success);
        assert_eq!(backend.verify_call_count(), 2);
        assert_eq!(backend.registration_count(), 0);
        assert_eq!(db::count_reconciliations(&pool, &order_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reload_after_verified_payment_still_routes_to_success() {
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        let backend = FakeBackend::default();
        let order_id = redirected_order(&pool).await;
        let query = format!("orderid={order_id}&transaction_response=JWS");

        respond(&backend, serde_json::json!({"success": true, "status": "success"}));
        let first = reconciler(&pool, &backend)
            .reconcile(CallbackParams::from_query(&query))
            .await;
        assert_eq!(first.route, TerminalRoute::Success);

        respond(&backend, serde_json::json!({"success": true, "status": "pending"}));
        let second = reconciler(&pool, &backend)
            .reconcile(CallbackParams::from_query(&query))
            .await;
        assert_eq!(second.route, TerminalRoute::Success);
        assert_eq!(second.result.unwrap().outcome, Outcome::Success);

        // Same answer when the reload arrives without the token.
        let third = reconciler(&pool, &backend)
            .reconcile(CallbackParams::from_query(&format!("orderid={order_id}")))
            .await;
        assert_eq!(third.route, TerminalRoute::Success);

        let order = db::get_order(&pool, &order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Verified);
        assert_eq!(
            db::get_reconciliation(&pool, &order_id, Some("JWS")).await.unwrap(),
            Some(Outcome::Success)
        );
    }

    #[tokio::test]
    async fn verified_order_survives_a_verification_outage() {
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        let backend = FakeBackend::default();
        let order_id = redirected_order(&pool).await;
        let query = format!("orderid={order_id}");

        respond(&backend, serde_json::json!({"success": true, "auth_status": "0300"}));
        reconciler(&pool, &backend)
            .reconcile(CallbackParams::from_query(&query))
            .await;

        *backend.verify_down.lock().unwrap() = true;
        let outcome = reconciler(&pool, &backend)
            .reconcile(CallbackParams::from_query(&query))
            .await;
        assert_eq!(outcome.route, TerminalRoute::Success);
        assert_eq!(outcome.delay, Duration::from_millis(1200));
    }

    #[tokio::test]
    async fn recorded_failure_is_kept_for_the_same_token() {
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        let backend = FakeBackend::default();
        let order_id = redirected_order(&pool).await;
        let query = format!("orderid={order_id}&transaction_response=JWS");

        respond(&backend, serde_json::json!({"success": false, "auth_status": "0399"}));
        reconciler(&pool, &backend)
            .reconcile(CallbackParams::from_query(&query))
            .await;

        respond(&backend, serde_json::json!({"success": true, "status": "pending"}));
        let outcome = reconciler(&pool, &backend)
            .reconcile(CallbackParams::from_query(&query))
            .await;
        assert_eq!(outcome.state, ReconcilerState::Failed);
        let order = db::get_order(&pool, &order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
    }
}
