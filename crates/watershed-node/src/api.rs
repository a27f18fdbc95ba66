//! HTTP API for the lending node.
//!
//! Authentication happens upstream: the gateway resolves the session and
//! forwards the caller's user ID in the `x-watershed-user` header.

use crate::error::Error;
use crate::service::LendingService;
use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use watershed_ledger::{LoanApplication, LoanShare, LoanStatus, Money, PaymentType, WatershedLoan};

type AppState = Arc<LendingService>;
type ApiResult<T> = std::result::Result<T, Error>;

/// Header carrying the authenticated user ID.
pub const USER_HEADER: &str = "x-watershed-user";

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    // CORS layer for browser access
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health (at root and under /api/v1 for compatibility)
        .route("/health", get(health))
        .route("/api/v1/health", get(health))
        // Borrowing
        .route("/api/v1/eligibility", get(get_eligibility))
        .route("/api/v1/loans", post(apply_for_loan))
        .route("/api/v1/loans/:id", get(get_loan))
        .route("/api/v1/loans/:id/payments", post(make_payment))
        // Community funding
        .route("/api/v1/loans/:id/pledges", post(pledge))
        // Balances
        .route("/api/v1/watershed", get(get_watershed))
        .route("/api/v1/reserve", get(get_reserve))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// --- Errors and auth ---

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Validation(_) | Error::Ineligible(_) | Error::InvalidState(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = if self.is_internal() {
            tracing::error!("Request failed: {}", self);
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Caller(v.to_string()))
            .ok_or(Error::Unauthorized)
    }
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| Error::Validation(rejection.body_text()))
}

// --- Health ---

async fn health() -> &'static str {
    "OK"
}

// --- Loan views ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PureLoanView {
    id: String,
    amount: Money,
    status: LoanStatus,
    monthly_payment: Money,
    term_months: u32,
    next_payment_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BackedLoanView {
    id: String,
    amount: Money,
    self_funded: Money,
    community_funded: Money,
    origination_fee: Money,
    total_obligation: Money,
    status: LoanStatus,
    funding_deadline: Option<DateTime<Utc>>,
    monthly_payment: Money,
    term_months: u32,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LoanView {
    Pure(PureLoanView),
    Backed(BackedLoanView),
}

impl From<&WatershedLoan> for LoanView {
    fn from(loan: &WatershedLoan) -> Self {
        match loan.backing() {
            None => LoanView::Pure(PureLoanView {
                id: loan.id.clone(),
                amount: loan.amount,
                status: loan.status,
                monthly_payment: loan.monthly_payment,
                term_months: loan.term_months,
                next_payment_date: loan.next_payment_date,
            }),
            Some(backing) => LoanView::Backed(BackedLoanView {
                id: loan.id.clone(),
                amount: loan.amount,
                self_funded: backing.self_funded_amount,
                community_funded: backing.community_funded_amount,
                origination_fee: backing.origination_fee,
                total_obligation: loan.total_obligation(),
                status: loan.status,
                funding_deadline: Some(backing.funding_deadline),
                monthly_payment: loan.monthly_payment,
                term_months: loan.term_months,
            }),
        }
    }
}

// --- Borrowing endpoints ---

async fn get_eligibility(
    State(service): State<AppState>,
    Caller(user): Caller,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(service.eligibility(&user)?))
}

async fn apply_for_loan(
    State(service): State<AppState>,
    Caller(user): Caller,
    payload: Result<Json<LoanApplication>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let app = body(payload)?;
    let loan = service.apply(&user, &app).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "loan": LoanView::from(&loan) })),
    ))
}

async fn get_loan(
    State(service): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(service.loan_detail(&user, &id)?))
}

#[derive(Debug, Deserialize)]
struct RepaymentRequest {
    amount: Option<Money>,
    #[serde(rename = "type", default)]
    payment_type: PaymentType,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PaymentSummary {
    amount: Money,
    applied_to_community: Money,
    applied_to_self: Money,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RepaidLoanSummary {
    remaining_balance: Money,
    community_remaining_balance: Money,
    is_completed: bool,
    community_fully_repaid: bool,
    funding_lock_lifted: bool,
}

async fn make_payment(
    State(service): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<String>,
    payload: Result<Json<RepaymentRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let req = body(payload)?;
    let receipt = service
        .repay(&user, &id, req.amount, req.payment_type)
        .await?;

    let outcome = receipt.outcome;
    let message = if outcome.completed {
        "Loan fully repaid".to_string()
    } else if outcome.funding_lock_lifted {
        "Community backers are fully repaid and the funding lock is lifted".to_string()
    } else {
        format!(
            "Payment of {} applied, {} remaining",
            receipt.payment.amount, receipt.loan.remaining_balance
        )
    };

    Ok(Json(json!({
        "success": true,
        "payment": PaymentSummary {
            amount: receipt.payment.amount,
            applied_to_community: receipt.payment.applied_to_community,
            applied_to_self: receipt.payment.applied_to_self,
        },
        "loan": RepaidLoanSummary {
            remaining_balance: receipt.loan.remaining_balance,
            community_remaining_balance: receipt.loan.community_remaining_balance(),
            is_completed: outcome.completed,
            community_fully_repaid: outcome.community_fully_repaid,
            funding_lock_lifted: outcome.funding_lock_lifted,
        },
        "message": message,
    })))
}

// --- Community funding ---

#[derive(Debug, Deserialize)]
struct PledgeRequest {
    amount: Money,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PledgeResponse {
    success: bool,
    share: LoanShare,
    fully_funded: bool,
    loan: LoanView,
}

async fn pledge(
    State(service): State<AppState>,
    Caller(user): Caller,
    Path(id): Path<String>,
    payload: Result<Json<PledgeRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let req = body(payload)?;
    let receipt = service.pledge(&user, &id, req.amount).await?;
    Ok((
        StatusCode::CREATED,
        Json(PledgeResponse {
            success: true,
            loan: LoanView::from(&receipt.loan),
            share: receipt.share,
            fully_funded: receipt.fully_funded,
        }),
    ))
}

// --- Balances ---

async fn get_watershed(
    State(service): State<AppState>,
    Caller(user): Caller,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(service.account(&user)?))
}

async fn get_reserve(
    State(service): State<AppState>,
    Caller(_user): Caller,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(service.reserve_summary()?))
}
