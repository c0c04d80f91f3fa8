//! HTTP API and webhook surface.
//!
//! Order and pool endpoints speak JSON. Webhook endpoints receive provider
//! callbacks; each one authenticates the raw body against the shared
//! webhook secret before anything reaches the core, and the voice webhook
//! answers with the call-control XML the provider executes.

use axum::{
	body::Bytes,
	extract::{Path, Query, State},
	http::{header, HeaderMap, StatusCode},
	response::{IntoResponse, Response},
	routing::{get, post},
	Json, Router,
};
use serde::Deserialize;
use sha3::{Digest, Sha3_256};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::service::ProxycallService;
use proxycall_confirmation::SubmissionOutcome;
use proxycall_orders::{NewClient, OrderError, OrderRequest};
use proxycall_pool::PoolFilter;
use proxycall_routing::{RoutingVerdict, SmsRouting};
use proxycall_telephony::CallDirective;
use proxycall_types::{
	email_strict, name_strict, CountryIso, NumberClass, Order, PhoneNumber, PoolEntry, PoolStatus,
	ValidationError,
};

const SIGNATURE_HEADER: &str = "x-webhook-signature";

#[derive(Clone)]
pub struct AppState {
	service: Arc<ProxycallService>,
	webhook_secret: Arc<str>,
}

pub fn build_router(service: Arc<ProxycallService>, webhook_secret: &str) -> Router {
	let state = AppState {
		service,
		webhook_secret: webhook_secret.into(),
	};

	Router::new()
		.route("/orders", post(create_order))
		.route("/orders/{id}", get(get_order))
		.route("/pool", get(list_pool))
		.route("/pool/stock", post(stock_pool))
		.route("/webhooks/voice", post(voice_webhook))
		.route("/webhooks/sms", post(sms_webhook))
		.with_state(state)
		.layer(TraceLayer::new_for_http())
		.layer(CorsLayer::permissive())
}

pub async fn serve(service: Arc<ProxycallService>, webhook_secret: &str, port: u16) -> anyhow::Result<()> {
	let app = build_router(service, webhook_secret);
	let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
	info!("API server listening on port {}", port);
	axum::serve(listener, app).await?;
	Ok(())
}

enum ApiError {
	Unauthorized,
	BadRequest(String),
	Unprocessable(String),
	NotFound(String),
	Internal(String),
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let (status, message) = match self {
			Self::Unauthorized => (StatusCode::UNAUTHORIZED, "invalid signature".to_string()),
			Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
			Self::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m),
			Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
			Self::Internal(m) => {
				warn!("internal error: {}", m);
				(StatusCode::INTERNAL_SERVER_ERROR, m)
			}
		};
		(status, Json(serde_json::json!({ "error": message }))).into_response()
	}
}

impl From<ValidationError> for ApiError {
	fn from(e: ValidationError) -> Self {
		Self::Unprocessable(e.to_string())
	}
}

impl From<OrderError> for ApiError {
	fn from(e: OrderError) -> Self {
		match e {
			OrderError::NotFound(id) => Self::NotFound(format!("order {} not found", id)),
			other => Self::Internal(other.to_string()),
		}
	}
}

#[derive(Deserialize)]
struct CreateOrderBody {
	client_id: String,
	name: String,
	email: String,
	phone: String,
	residency: String,
	#[serde(default)]
	number_type: Option<String>,
}

fn order_json(order: &Order) -> serde_json::Value {
	// expected_code stays server-side.
	serde_json::json!({
		"order_id": order.order_id,
		"client_id": order.client_id,
		"status": order.status.as_str(),
		"proxy_number": order.proxy_number.as_ref().map(|n| n.as_str().to_string()),
		"attempt_count": order.attempt_count,
		"created_at": order.created_at.to_rfc3339(),
	})
}

async fn create_order(
	State(state): State<AppState>,
	Json(body): Json<CreateOrderBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let preferred_class = match body.number_type.as_deref() {
		Some(raw) => NumberClass::parse(raw, "number_type")?,
		None => NumberClass::Mobile,
	};
	let request = OrderRequest {
		client: NewClient {
			client_id: name_strict(&body.client_id, "client_id")?,
			name: name_strict(&body.name, "name")?,
			email: email_strict(&body.email, "email")?,
			real_phone: PhoneNumber::parse(&body.phone, "phone")?,
			residency: CountryIso::parse(&body.residency, "residency")?,
		},
		preferred_class,
	};

	let order = state.service.orders.create_order(request).await?;
	Ok(Json(order_json(&order)))
}

async fn get_order(
	State(state): State<AppState>,
	Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let order = state.service.orders.get_order(&id).await?;
	Ok(Json(order_json(&order)))
}

#[derive(Deserialize, Default)]
struct PoolQuery {
	country: Option<String>,
	class: Option<String>,
	status: Option<String>,
}

async fn list_pool(
	State(state): State<AppState>,
	Query(query): Query<PoolQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let filter = PoolFilter {
		country: query
			.country
			.as_deref()
			.map(|c| CountryIso::parse(c, "country"))
			.transpose()?,
		class: query
			.class
			.as_deref()
			.map(|c| NumberClass::parse(c, "class"))
			.transpose()?,
		status: match query.status.as_deref() {
			Some(raw) => Some(
				PoolStatus::parse(raw)
					.ok_or_else(|| ApiError::Unprocessable(format!("bad status {:?}", raw)))?,
			),
			None => None,
		},
	};

	let entries = state
		.service
		.pool
		.list_pool(&filter)
		.await
		.map_err(|e| ApiError::Internal(e.to_string()))?;
	Ok(Json(serde_json::json!({
		"entries": entries.iter().map(entry_json).collect::<Vec<_>>(),
	})))
}

fn entry_json(entry: &PoolEntry) -> serde_json::Value {
	serde_json::json!({
		"number": entry.number.as_str(),
		"class": entry.class.as_str(),
		"country": entry.country.as_str(),
		"status": entry.status.as_str(),
		"assigned_to": entry.assigned_to,
	})
}

#[derive(Deserialize)]
struct StockBody {
	country: String,
	#[serde(default)]
	class: Option<String>,
	count: u32,
}

async fn stock_pool(
	State(state): State<AppState>,
	Json(body): Json<StockBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
	let country = CountryIso::parse(&body.country, "country")?;
	let class = match body.class.as_deref() {
		Some(raw) => NumberClass::parse(raw, "class")?,
		None => NumberClass::Mobile,
	};

	let stocked = state
		.service
		.orders
		.stock_pool(&country, class, body.count)
		.await?;
	Ok(Json(serde_json::json!({ "stocked": stocked })))
}

/// Checks the shared-secret digest over the raw body. Nothing reaches the
/// core on a mismatch.
fn authenticate(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<(), ApiError> {
	let presented = headers
		.get(SIGNATURE_HEADER)
		.and_then(|v| v.to_str().ok())
		.ok_or(ApiError::Unauthorized)?;

	let expected = webhook_signature(&state.webhook_secret, body);
	if !digest_eq(presented, &expected) {
		return Err(ApiError::Unauthorized);
	}
	Ok(())
}

/// Constant-time comparison of hex digests; the position of a mismatch
/// must not show in response timing.
fn digest_eq(presented: &str, expected: &str) -> bool {
	let presented = presented.to_ascii_lowercase();
	let (a, b) = (presented.as_bytes(), expected.as_bytes());
	if a.len() != b.len() {
		return false;
	}
	a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub fn webhook_signature(secret: &str, body: &[u8]) -> String {
	let mut hasher = Sha3_256::new();
	hasher.update(secret.as_bytes());
	hasher.update(body);
	hex::encode(hasher.finalize())
}

#[derive(Deserialize)]
struct VoiceWebhookBody {
	from: String,
	to: String,
}

#[derive(Deserialize)]
struct SmsWebhookBody {
	from: String,
	to: String,
	body: String,
}

async fn voice_webhook(
	State(state): State<AppState>,
	headers: HeaderMap,
	body: Bytes,
) -> Result<Response, ApiError> {
	authenticate(&state, &headers, &body)?;
	let payload: VoiceWebhookBody =
		serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
	let proxy = PhoneNumber::parse(&payload.to, "to")?;
	let caller = PhoneNumber::parse(&payload.from, "from")?;

	let verdict = state
		.service
		.routing
		.decide(&proxy, &caller)
		.await
		.map_err(|e| ApiError::Internal(e.to_string()))?;

	let xml = match verdict {
		RoutingVerdict::Forward(real) => {
			render_directive(&state.service.telephony.bridge_call(&caller, &real))
		}
		RoutingVerdict::Block(reason) => {
			format!("<Response><Reject reason=\"{}\"/></Response>", reason.as_str())
		}
	};
	Ok(xml_response(xml))
}

async fn sms_webhook(
	State(state): State<AppState>,
	headers: HeaderMap,
	body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
	authenticate(&state, &headers, &body)?;
	let payload: SmsWebhookBody =
		serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
	let proxy = PhoneNumber::parse(&payload.to, "to")?;
	let sender = PhoneNumber::parse(&payload.from, "from")?;

	// A pending order on the proxy owns its inbound SMS; everything else
	// is relayed traffic.
	let outcome = state
		.service
		.confirmation
		.submit_code(&proxy, &payload.body)
		.await
		.map_err(|e| ApiError::Internal(e.to_string()))?;

	if outcome != SubmissionOutcome::NoPendingOrder {
		return Ok(Json(serde_json::json!({
			"handled": "confirmation",
			"outcome": confirmation_outcome(outcome),
		})));
	}

	let routed = state
		.service
		.routing
		.route_sms(&proxy, &sender, &payload.body)
		.await
		.map_err(|e| ApiError::Internal(e.to_string()))?;
	Ok(Json(serde_json::json!({
		"handled": "routing",
		"outcome": routing_outcome(&routed),
	})))
}

fn confirmation_outcome(outcome: SubmissionOutcome) -> &'static str {
	match outcome {
		SubmissionOutcome::Matched => "matched",
		SubmissionOutcome::Mismatched => "mismatched",
		SubmissionOutcome::Unparseable => "unparseable",
		SubmissionOutcome::NoPendingOrder => "no_pending_order",
	}
}

fn routing_outcome(outcome: &SmsRouting) -> String {
	match outcome {
		SmsRouting::Relayed { .. } => "relayed".to_string(),
		SmsRouting::NoRecentCorrespondent => "no_recent_correspondent".to_string(),
		SmsRouting::Blocked(reason) => format!("blocked:{}", reason.as_str()),
	}
}

fn render_directive(directive: &CallDirective) -> String {
	match directive {
		CallDirective::Bridge {
			caller_id,
			connect_to,
		} => format!(
			"<Response><Dial callerId=\"{}\"><Number>{}</Number></Dial></Response>",
			caller_id, connect_to
		),
		CallDirective::Announce { message } => {
			format!("<Response><Say>{}</Say><Hangup/></Response>", message)
		}
	}
}

fn xml_response(xml: String) -> Response {
	([(header::CONTENT_TYPE, "application/xml")], xml).into_response()
}
