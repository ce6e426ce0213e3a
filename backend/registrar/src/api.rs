//! Axum handlers for the registration portal.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, RawQuery, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::backend::Backend;
use crate::callback::{CallbackParams, ReconcilerState, Reconciler, TerminalRoute};
use crate::config::Config;
use crate::db;
use crate::draft::{DraftField, DraftSnapshot, FieldErrors, FieldUpdate};
use crate::errors::{PortalError, Result};
use crate::lookup::{self, OrderDetails, ResumeSource};
use crate::order::{self, OrderId};

pub struct AppState {
    pub pool: SqlitePool,
    pub backend: Arc<dyn Backend>,
    pub config: Config,
}

impl AppState {
    fn draft_ttl(&self) -> Duration {
        Duration::hours(self.config.draft_ttl_hours)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/", get(open_form))
        .route("/drafts/:orderid", patch(update_draft))
        .route("/drafts/:orderid/submit", post(submit_draft))
        .route("/payment/callback", get(payment_callback))
        .route("/success", get(success))
        .route("/cancel", get(cancel))
        .route("/orders/:orderid/form.txt", get(form_document))
        .route("/orders/:orderid/receipt.txt", get(receipt_document))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct FormView {
    pub order_id: OrderId,
    pub source: ResumeSource,
    /// Field values; document contents are replaced by a short summary.
    pub draft: BTreeMap<DraftField, Value>,
    pub errors: FieldErrors,
    pub plausibly_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_failure: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

impl FormView {
    fn new(order_id: OrderId, source: ResumeSource, snapshot: &DraftSnapshot) -> Self {
        Self {
            order_id,
            source,
            draft: snapshot.draft.summary(),
            errors: snapshot.errors.clone(),
            plausibly_complete: snapshot.draft.is_plausibly_complete(),
            previous_failure: None,
            notice: None,
        }
    }
}

#[derive(Serialize)]
pub struct CallbackView {
    pub order_id: Option<OrderId>,
    pub state: ReconcilerState,
    pub message: &'static str,
    pub route: TerminalRoute,
    pub redirect_to: String,
    pub redirect_after_ms: u64,
}

#[derive(Serialize)]
pub struct SuccessView {
    pub order_id: Option<OrderId>,
    pub payment_succeeded: bool,
    pub message: &'static str,
    pub details: Option<OrderDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

#[derive(Serialize)]
pub struct CancelView {
    pub order_id: Option<OrderId>,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub retry_url: String,
}

#[derive(Deserialize)]
pub struct FormQuery {
    pub orderid: Option<String>,
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

fn parse_order_id(raw: &str) -> Result<OrderId> {
    OrderId::parse(raw).ok_or_else(|| PortalError::NotFound(format!("order {raw}")))
}

async fn load_snapshot(pool: &SqlitePool, order_id: &OrderId) -> Result<DraftSnapshot> {
    db::load_draft(pool, order_id)
        .await?
        .ok_or_else(|| PortalError::NotFound(format!("draft for order {order_id}")))
}

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /?orderid=`
///
/// Without an identifier a new one is minted with an empty draft; with one
/// the earlier attempt is resumed.
pub async fn open_form(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FormQuery>,
) -> Result<Json<FormView>> {
    let requested = query.orderid.filter(|raw| !raw.trim().is_empty());

    let Some(raw) = requested else {
        let order_id = OrderId::generate(&state.config.order_id_prefix);
        let snapshot = DraftSnapshot::default();
        db::save_draft(&state.pool, &order_id, &snapshot, state.draft_ttl()).await?;
        info!(order_id = %order_id, "New registration draft");
        return Ok(Json(FormView::new(order_id, ResumeSource::Fresh, &snapshot)));
    };

    let order_id = parse_order_id(raw.trim())?;
    let resumed = lookup::resume(
        &state.pool,
        state.backend.as_ref(),
        &state.config,
        &order_id,
    )
    .await?;

    let mut view = FormView::new(resumed.order_id, resumed.source, &resumed.snapshot);
    view.previous_failure = resumed.previous_failure;
    view.notice = resumed.notice;
    Ok(Json(view))
}

/// `PATCH /drafts/:orderid`
pub async fn update_draft(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
    Json(update): Json<FieldUpdate>,
) -> Result<Json<FormView>> {
    let order_id = parse_order_id(&raw)?;
    let mut snapshot = load_snapshot(&state.pool, &order_id).await?;
    snapshot.apply(update)?;
    db::save_draft(&state.pool, &order_id, &snapshot, state.draft_ttl()).await?;
    Ok(Json(FormView::new(order_id, ResumeSource::Local, &snapshot)))
}

/// `POST /drafts/:orderid/submit`
///
/// Runs the authoritative validation and, when clean, hands the registrant
/// to the gateway with a `303 See Other`.
pub async fn submit_draft(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> Result<Redirect> {
    let order_id = parse_order_id(&raw)?;
    let mut snapshot = load_snapshot(&state.pool, &order_id).await?;

    let errors = snapshot.draft.full_validate(state.backend.as_ref()).await;
    if !errors.is_empty() {
        info!(order_id = %order_id, fields = errors.len(), "Submission rejected");
        snapshot.errors = errors.clone();
        db::save_draft(&state.pool, &order_id, &snapshot, state.draft_ttl()).await?;
        return Err(PortalError::Validation(errors));
    }
    if !snapshot.errors.is_empty() {
        snapshot.errors = FieldErrors::default();
        db::save_draft(&state.pool, &order_id, &snapshot, state.draft_ttl()).await?;
    }

    let launch = order::initiate(
        &state.pool,
        state.backend.as_ref(),
        &state.config,
        &order_id,
        &snapshot.draft,
    )
    .await?;
    Ok(Redirect::to(launch.url.as_str()))
}

/// `GET /payment/callback`
pub async fn payment_callback(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
) -> Response {
    let params = CallbackParams::from_query(query.as_deref().unwrap_or_default());
    let reconciler = Reconciler {
        pool: &state.pool,
        backend: state.backend.as_ref(),
        delays: state.config.delays,
        timeout: state.config.verify_timeout(),
    };
    let outcome = reconciler.reconcile(params).await;
    let redirect_to = outcome.redirect_path();
    let delay_ms = outcome.delay.as_millis() as u64;

    let view = CallbackView {
        order_id: outcome.order_id,
        state: outcome.state,
        message: outcome.message,
        route: outcome.route,
        redirect_to: redirect_to.clone(),
        redirect_after_ms: delay_ms,
    };

    let mut response = Json(view).into_response();
    let refresh = format!("{}; url={redirect_to}", delay_ms.div_ceil(1000));
    match HeaderValue::from_str(&refresh) {
        Ok(value) => {
            response
                .headers_mut()
                .insert(HeaderName::from_static("refresh"), value);
        }
        Err(e) => warn!("Could not build refresh header: {e}"),
    }
    response
}

const PAID_MESSAGE: &str = "Payment successful! Your registration has been completed.";

/// `GET /success?orderid=` (or `?order=`)
pub async fn success(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
) -> Json<SuccessView> {
    let params = CallbackParams::from_query(query.as_deref().unwrap_or_default());

    let Some(order_id) = params.order_id else {
        return Json(SuccessView {
            order_id: None,
            payment_succeeded: true,
            message: PAID_MESSAGE,
            details: None,
            notice: None,
        });
    };

    let receipt = lookup::receipt(&state.pool, state.backend.as_ref(), &order_id).await;
    let message = if receipt.payment_succeeded {
        PAID_MESSAGE
    } else {
        "We could not confirm a payment for this order. Please retry from the registration form."
    };
    Json(SuccessView {
        order_id: Some(receipt.order_id),
        payment_succeeded: receipt.payment_succeeded,
        message,
        details: receipt.details,
        notice: receipt.notice,
    })
}

/// `GET /cancel?orderid=`
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
) -> Json<CancelView> {
    let params = CallbackParams::from_query(query.as_deref().unwrap_or_default());
    let failure_reason = match &params.order_id {
        Some(order_id) => match db::get_order(&state.pool, order_id).await {
            Ok(order) => order.and_then(|o| o.failure_reason),
            Err(e) => {
                warn!(order_id = %order_id, "Could not load order for cancel view: {e}");
                None
            }
        },
        None => None,
    };
    let retry_url = match &params.order_id {
        Some(order_id) => format!("/?orderid={order_id}"),
        None => "/".to_string(),
    };

    Json(CancelView {
        order_id: params.order_id,
        message: "Your payment was cancelled. Please try again.",
        failure_reason,
        retry_url,
    })
}

fn plain_text(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

/// `GET /orders/:orderid/form.txt`
pub async fn form_document(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> Result<Response> {
    let order_id = parse_order_id(&raw)?;
    let details = lookup::details(state.backend.as_ref(), &order_id).await?;
    Ok(plain_text(lookup::render_form_summary(&order_id, &details)))
}

/// `GET /orders/:orderid/receipt.txt`
pub async fn receipt_document(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> Result<Response> {
    let order_id = parse_order_id(&raw)?;
    let details = lookup::details(state.backend.as_ref(), &order_id).await?;
    Ok(plain_text(lookup::render_receipt(&order_id, &details)))
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
