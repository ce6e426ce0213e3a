//! Status and lookup: consolidated order view, resume after a failed payment,
//! and the printable registration summary and receipt.

use std::fmt::Write as _;

use chrono::Duration;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::backend::Backend;
use crate::config::Config;
use crate::db;
use crate::draft::{DraftSnapshot, RegistrationDraft};
use crate::errors::{PortalError, Result};
use crate::order::{OrderId, OrderStatus, PaymentOrder};

// ─────────────────────────────────────────────────────────
// Consolidated order view (`GET /orders/{orderid}`)
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonalInfo {
    pub name: Option<String>,
    pub date_of_birth: Option<String>,
    pub gender: Option<String>,
    pub guardian_name: Option<String>,
    pub nationality: Option<String>,
    pub religion: Option<String>,
    pub email: Option<String>,
    pub mobile_number: Option<String>,
    pub place_of_birth: Option<String>,
    pub community: Option<String>,
    pub mother_tongue: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcademicInfo {
    pub degree_name: Option<String>,
    pub university_name: Option<String>,
    pub degree_pattern: Option<String>,
    pub convocation_year: Option<String>,
    pub university_register_no: Option<String>,
    pub is_registered_graduate: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdditionalInfo {
    pub lunch_preference: Option<String>,
    pub companion_option: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionInfo {
    #[serde(alias = "orderid")]
    pub order_id: Option<String>,
    #[serde(alias = "transactionid")]
    pub transaction_id: Option<String>,
    pub amount: Option<String>,
    pub currency: Option<String>,
    pub status: Option<String>,
    pub auth_status: Option<String>,
    #[serde(alias = "transaction_date")]
    pub paid_at: Option<String>,
    #[serde(alias = "transaction_error_desc")]
    pub error_description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderMetadata {
    #[serde(alias = "id", deserialize_with = "string_or_number")]
    pub registration_id: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderDetails {
    pub personal_info: PersonalInfo,
    pub academic_info: AcademicInfo,
    pub additional_info: AdditionalInfo,
    pub transaction_info: TransactionInfo,
    pub metadata: OrderMetadata,
}

/// Previously submitted draft as returned by `GET /payment/student/{orderid}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentRecord {
    #[serde(flatten)]
    pub draft: RegistrationDraft,
    #[serde(default, alias = "transaction_error_desc")]
    pub failure_reason: Option<String>,
    #[serde(default, alias = "payment_status")]
    pub status: Option<String>,
    /// Set once the earlier submission was registered with the backend.
    #[serde(default, alias = "id", deserialize_with = "string_or_number")]
    pub registration_id: Option<String>,
}

/// Backend identifiers arrive as strings or bare numbers.
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

impl StudentRecord {
    fn is_paid(&self) -> bool {
        self.status
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("success") || s.eq_ignore_ascii_case("paid"))
            .unwrap_or(false)
    }
}

// ─────────────────────────────────────────────────────────
// Resume
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeSource {
    /// Snapshot held by this portal.
    Local,
    /// Re-fetched from the backend's record of the earlier submission.
    Backend,
    /// Nothing known about the order; the identifier is kept, the form starts empty.
    Fresh,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeState {
    pub order_id: OrderId,
    pub snapshot: DraftSnapshot,
    pub source: ResumeSource,
    pub previous_failure: Option<String>,
    pub notice: Option<String>,
}

/// Rebuild the form for a registrant returning with a known order identifier.
/// The identifier is always kept so the next attempt reuses it. A registration
/// the backend already holds is remembered on the local order so the next
/// attempt does not register again.
pub async fn resume(
    pool: &SqlitePool,
    backend: &dyn Backend,
    config: &Config,
    order_id: &OrderId,
) -> Result<ResumeState> {
    let order = db::get_order(pool, order_id).await?;
    if order.as_ref().map(|o| o.status) == Some(OrderStatus::Verified) {
        return Err(PortalError::AlreadyPaid(order_id.clone()));
    }
    let local_failure = order.and_then(|o| o.failure_reason);

    let mut state = ResumeState {
        order_id: order_id.clone(),
        snapshot: DraftSnapshot::default(),
        source: ResumeSource::Fresh,
        previous_failure: local_failure,
        notice: None,
    };

    if let Some(snapshot) = db::load_draft(pool, order_id).await? {
        state.snapshot = snapshot;
        state.source = ResumeSource::Local;
    } else {
        match backend.fetch_student(order_id).await {
            Ok(Some(record)) => {
                if record.is_paid() {
                    return Err(PortalError::AlreadyPaid(order_id.clone()));
                }
                state.snapshot.draft.prefill_from(&record.draft);
                if let Some(registration_id) = record.registration_id.as_deref() {
                    adopt_registration(pool, config, order_id, registration_id).await?;
                }
                state.previous_failure = record.failure_reason.or(state.previous_failure);
                state.source = ResumeSource::Backend;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(order_id = %order_id, "Could not load previous submission: {e}");
                state.notice = Some(
                    "Your previous details could not be loaded. Please fill in the form again."
                        .to_string(),
                );
            }
        }
        let ttl = Duration::hours(config.draft_ttl_hours);
        db::save_draft(pool, order_id, &state.snapshot, ttl).await?;
    }

    info!(order_id = %order_id, source = ?state.source, "Draft resumed");
    Ok(state)
}

async fn adopt_registration(
    pool: &SqlitePool,
    config: &Config,
    order_id: &OrderId,
    registration_id: &str,
) -> Result<()> {
    let mut order = PaymentOrder::new(
        order_id.clone(),
        &config.registration_fee,
        &config.currency_code,
    );
    order.registration_id = Some(registration_id.to_string());
    if !db::insert_order(pool, &order).await? {
        db::set_registration_id(pool, order_id, registration_id).await?;
    }
    info!(order_id = %order_id, registration_id, "Adopted existing registration");
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Receipt / confirmation
// ─────────────────────────────────────────────────────────

/// Confirmation shown on the success route. `payment_succeeded` comes from the
/// local order and holds even when the details could not be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub order_id: OrderId,
    pub payment_succeeded: bool,
    pub details: Option<OrderDetails>,
    pub notice: Option<String>,
}

pub fn details_unavailable_notice(order_id: &OrderId) -> String {
    format!(
        "We could not load your registration details right now. \
         Please keep your order ID {order_id} for reference."
    )
}

/// Build the confirmation. A local order that is not verified is reported as
/// unpaid; an order this portal never saw is trusted to the gateway's redirect.
pub async fn receipt(pool: &SqlitePool, backend: &dyn Backend, order_id: &OrderId) -> Receipt {
    let payment_succeeded = match db::get_order(pool, order_id).await {
        Ok(Some(order)) => order.status == OrderStatus::Verified,
        Ok(None) => true,
        Err(e) => {
            warn!(order_id = %order_id, "Could not read local order for receipt: {e}");
            true
        }
    };
    if !payment_succeeded {
        warn!(order_id = %order_id, "Success page requested for an unverified order");
    }

    let (details, notice) = match backend.fetch_order(order_id).await {
        Ok(Some(details)) => (Some(details), None),
        Ok(None) => {
            warn!(order_id = %order_id, "Order not found for receipt");
            (None, Some(details_unavailable_notice(order_id)))
        }
        Err(e) => {
            warn!(order_id = %order_id, "Receipt lookup failed: {e}");
            (None, Some(details_unavailable_notice(order_id)))
        }
    };

    Receipt {
        order_id: order_id.clone(),
        payment_succeeded,
        details,
        notice,
    }
}

/// Fetch details for a printable document; absence is an error here.
pub async fn details(backend: &dyn Backend, order_id: &OrderId) -> Result<OrderDetails> {
    backend
        .fetch_order(order_id)
        .await?
        .ok_or_else(|| PortalError::NotFound(format!("order {order_id}")))
}

// ─────────────────────────────────────────────────────────
// Printable documents
// ─────────────────────────────────────────────────────────

fn line(out: &mut String, label: &str, value: Option<&str>) {
    let value = value.filter(|v| !v.trim().is_empty()).unwrap_or("-");
    let _ = writeln!(out, "{label:<28}: {value}");
}

fn heading(out: &mut String, title: &str) {
    let _ = writeln!(out, "\n{title}\n{}", "-".repeat(title.len()));
}

fn yes_no(flag: Option<bool>) -> Option<&'static str> {
    flag.map(|f| if f { "Yes" } else { "No" })
}

/// Plain-text registration form summary.
pub fn render_form_summary(order_id: &OrderId, d: &OrderDetails) -> String {
    let mut out = String::from("GRADUATION REGISTRATION FORM\n");
    line(&mut out, "Order ID", Some(order_id.as_str()));
    line(&mut out, "Registration ID", d.metadata.registration_id.as_deref());
    line(&mut out, "Submitted", d.metadata.created_at.as_deref());

    let p = &d.personal_info;
    heading(&mut out, "Personal details");
    line(&mut out, "Name", p.name.as_deref());
    line(&mut out, "Date of birth", p.date_of_birth.as_deref());
    line(&mut out, "Gender", p.gender.as_deref());
    line(&mut out, "Guardian name", p.guardian_name.as_deref());
    line(&mut out, "Nationality", p.nationality.as_deref());
    line(&mut out, "Religion", p.religion.as_deref());
    line(&mut out, "Community", p.community.as_deref());
    line(&mut out, "Mother tongue", p.mother_tongue.as_deref());
    line(&mut out, "Place of birth", p.place_of_birth.as_deref());
    line(&mut out, "Email", p.email.as_deref());
    line(&mut out, "Mobile number", p.mobile_number.as_deref());

    let a = &d.academic_info;
    heading(&mut out, "Academic details");
    line(&mut out, "Degree", a.degree_name.as_deref());
    line(&mut out, "University", a.university_name.as_deref());
    line(&mut out, "Degree pattern", a.degree_pattern.as_deref());
    line(&mut out, "Convocation year", a.convocation_year.as_deref());
    line(&mut out, "University register number", a.university_register_no.as_deref());
    line(&mut out, "Registered graduate", yes_no(a.is_registered_graduate));

    let x = &d.additional_info;
    heading(&mut out, "Convocation day");
    line(&mut out, "Lunch preference", x.lunch_preference.as_deref());
    line(&mut out, "Companion option", x.companion_option.as_deref());

    out
}

/// Plain-text payment receipt.
pub fn render_receipt(order_id: &OrderId, d: &OrderDetails) -> String {
    let t = &d.transaction_info;
    let mut out = String::from("PAYMENT RECEIPT\n");
    line(&mut out, "Order ID", Some(order_id.as_str()));
    line(&mut out, "Registration ID", d.metadata.registration_id.as_deref());
    line(&mut out, "Name", d.personal_info.name.as_deref());
    line(&mut out, "Transaction ID", t.transaction_id.as_deref());
    let amount = t
        .amount
        .as_deref()
        .map(|amount| match t.currency.as_deref() {
            Some(currency) => format!("{amount} ({currency})"),
            None => amount.to_string(),
        });
    line(&mut out, "Amount", amount.as_deref());
    line(&mut out, "Status", t.status.as_deref());
    line(&mut out, "Paid at", t.paid_at.as_deref());
    out
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
