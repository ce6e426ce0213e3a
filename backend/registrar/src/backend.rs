//! Backend collaborator client.
//!
//! The registration backend owns the durable records: registrations, payment
//! orders at the gateway, verification, and the consolidated order view.
//! [`Backend`] is the port the workflows talk to; [`HttpBackend`] is the
//! reqwest adapter used in production.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::callback::{VerificationRequest, VerificationResponse};
use crate::draft::RegistrationDraft;
use crate::errors::{PortalError, Result};
use crate::lookup::{OrderDetails, StudentRecord};
use crate::order::{OrderId, OrderRequest};

#[async_trait]
pub trait Backend: Send + Sync {
    /// `GET /check-email`: `true` when the address is already registered.
    async fn check_email(&self, email: &str) -> Result<bool>;

    /// `GET /check-register-no`: `true` when the number is already registered.
    async fn check_register_no(&self, register_no: &str) -> Result<bool>;

    /// `POST /register`: persist a draft, returning the registration id.
    async fn register(&self, order_id: &OrderId, draft: &RegistrationDraft) -> Result<String>;

    /// `POST /{gateway}/orders`: raw creation response; its shape varies.
    async fn create_order(&self, request: &OrderRequest) -> Result<Value>;

    /// `POST /verify-payment`: a query-or-confirm call, safe to repeat.
    async fn verify_payment(&self, request: &VerificationRequest) -> Result<VerificationResponse>;

    /// `GET /orders/{orderid}`: `None` when the backend has no such order.
    async fn fetch_order(&self, order_id: &OrderId) -> Result<Option<OrderDetails>>;

    /// `GET /payment/student/{orderid}`: previously submitted draft fields.
    async fn fetch_student(&self, order_id: &OrderId) -> Result<Option<StudentRecord>>;
}

#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    gateway: String,
}

#[derive(Debug, Deserialize)]
struct ExistsResponse {
    #[serde(default)]
    exists: bool,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    id: Value,
}

#[derive(Serialize)]
struct RegisterBody<'a> {
    orderid: &'a str,
    #[serde(flatten)]
    draft: &'a RegistrationDraft,
}

impl HttpBackend {
    pub fn new(client: Client, base_url: &str, gateway: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            gateway: gateway.trim_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get_exists(&self, path: &str, key: &str, value: &str) -> Result<bool> {
        let resp = self
            .client
            .get(self.url(path))
            .query(&[(key, value)])
            .send()
            .await?;
        let body: ExistsResponse = read_json(resp).await?;
        Ok(body.exists)
    }

    async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let resp = self.client.get(self.url(path)).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        read_json(resp).await.map(Some)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn check_email(&self, email: &str) -> Result<bool> {
        self.get_exists("/check-email", "email", email).await
    }

    async fn check_register_no(&self, register_no: &str) -> Result<bool> {
        self.get_exists("/check-register-no", "university_register_no", register_no)
            .await
    }

    async fn register(&self, order_id: &OrderId, draft: &RegistrationDraft) -> Result<String> {
        let resp = self
            .client
            .post(self.url("/register"))
            .json(&RegisterBody {
                orderid: order_id.as_str(),
                draft,
            })
            .send()
            .await?;
        let body: RegisterResponse = read_json(resp).await?;
        match body.id {
            Value::String(s) if !s.trim().is_empty() => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(PortalError::Backend {
                status: 200,
                message: format!("register returned an unusable id: {other}"),
            }),
        }
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<Value> {
        let url = self.url(&format!("/{}/orders", self.gateway));
        debug!(order_id = %request.orderid, "Creating gateway order");
        let resp = self.client.post(url).json(request).send().await?;
        read_json(resp).await
    }

    async fn verify_payment(&self, request: &VerificationRequest) -> Result<VerificationResponse> {
        let resp = self
            .client
            .post(self.url("/verify-payment"))
            .json(request)
            .send()
            .await?;
        read_json(resp).await
    }

    async fn fetch_order(&self, order_id: &OrderId) -> Result<Option<OrderDetails>> {
        self.get_optional(&format!("/orders/{order_id}")).await
    }

    async fn fetch_student(&self, order_id: &OrderId) -> Result<Option<StudentRecord>> {
        self.get_optional(&format!("/payment/student/{order_id}"))
            .await
    }
}

/// Decode a 2xx body, or turn anything else into [`PortalError::Backend`]
/// carrying the backend's `error` message when it sent one.
async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| {
                v.get("error")
                    .or_else(|| v.get("message"))
                    .and_then(|m| m.as_str())
                    .map(String::from)
            })
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
        return Err(PortalError::Backend {
            status: status.as_u16(),
            message,
        });
    }
    let body = resp.bytes().await?;
    Ok(serde_json::from_slice(&body)?)
}

// ─────────────────────────────────────────────────────────
// In-process fake for workflow tests
// ─────────────────────────────────────────────────────────


// ─────────────────────────────────────────────────────────
// Unit tests (against a local axum stand-in for the backend)
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Path, Query},
        http::StatusCode as AxumStatus,
        routing::{get, post},
        Json, Router,
    };
    use serde_json::json;
    use std::collections::HashMap;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn backend() -> HttpBackend {
        let router = Router::new()
            .route(
                "/check-email",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    Json(json!({ "exists": q.get("email").map(String::as_str) == Some("taken@example.edu") }))
                }),
            )
            .route(
                "/register",
                post(|Json(body): Json<Value>| async move {
                    assert!(body.get("orderid").is_some());
                    assert!(body.get("mobile_number").is_some());
                    Json(json!({ "id": 42 }))
                }),
            )
            .route(
                "/billdesk/orders",
                post(|| async {
                    (
                        AxumStatus::BAD_GATEWAY,
                        Json(json!({ "error": "merchant not configured" })),
                    )
                }),
            )
            .route(
                "/verify-payment",
                post(|Json(body): Json<Value>| async move {
                    assert!(body.get("transaction_response").is_none());
                    Json(json!({ "success": true, "auth_status": "0300", "transactionid": "TX1" }))
                }),
            )
            .route(
                "/orders/:id",
                get(|Path(id): Path<String>| async move {
                    if id == "PUKNOWN" {
                        Ok(Json(json!({
                            "transaction_info": { "orderid": "PUKNOWN", "status": "success" },
                            "metadata": { "id": "REG7", "created_at": "2024-03-01T10:00:00Z" }
                        })))
                    } else {
                        Err(AxumStatus::NOT_FOUND)
                    }
                }),
            );
        let base = serve(router).await;
        HttpBackend::new(Client::new(), &base, "billdesk")
    }

    #[tokio::test]
    async fn uniqueness_lookup() {
        let backend = backend().await;
        assert!(backend.check_email("taken@example.edu").await.unwrap());
        assert!(!backend.check_email("free@example.edu").await.unwrap());
    }

    #[tokio::test]
    async fn register_accepts_numeric_id() {
        let backend = backend().await;
        let order_id = OrderId::parse("PU1").unwrap();
        let id = backend
            .register(&order_id, &RegistrationDraft::default())
            .await
            .unwrap();
        assert_eq!(id, "42");
    }

    #[tokio::test]
    async fn non_2xx_carries_backend_message() {
        let backend = backend().await;
        let config = crate::config::Config::for_tests("http://unused");
        let request = OrderRequest::new(&config, &OrderId::parse("PU1").unwrap(), "REG1");
        match backend.create_order(&request).await {
            Err(PortalError::Backend { status, message }) => {
                assert_eq!(status, 502);
                assert_eq!(message, "merchant not configured");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn verification_decodes_gateway_aliases() {
        let backend = backend().await;
        let response = backend
            .verify_payment(&VerificationRequest {
                orderid: "PU1".to_string(),
                transaction_response: None,
            })
            .await
            .unwrap();
        assert_eq!(response.transaction_id.as_deref(), Some("TX1"));
        assert_eq!(response.classify(), crate::callback::Outcome::Success);
    }

    #[tokio::test]
    async fn unknown_order_is_none() {
        let backend = backend().await;
        let missing = backend
            .fetch_order(&OrderId::parse("PUNOPE").unwrap())
            .await
            .unwrap();
        assert!(missing.is_none());

        let found = backend
            .fetch_order(&OrderId::parse("PUKNOWN").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.metadata.registration_id.as_deref(), Some("REG7"));
        assert_eq!(found.transaction_info.order_id.as_deref(), Some("PUKNOWN"));
    }

    #[tokio::test]
    async fn unreachable_backend_is_an_http_error() {
        let backend = HttpBackend::new(Client::new(), "http://127.0.0.1:9", "billdesk");
        assert!(matches!(
            backend.check_email("a@b.co").await,
            Err(PortalError::Http(_))
        ));
    }
}
