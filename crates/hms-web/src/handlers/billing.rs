//! 账单、付款与移动支付接口

use super::{created, PageParams};
use crate::auth::CurrentUser;
use crate::error::{ApiJson, ApiResult};
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Json},
};
use hms_core::utils::generate_reference;
use hms_core::{
    HmsError, Invoice, MobilePayment, MobilePaymentStatus, MobileProvider, Money, Page, Payment, Result, UserRole,
};
use hms_database::{
    InvoiceFilter, NewInvoice, NewInvoiceItem, NewMobilePayment, NewPayment, PaymentReceipt, WebhookOutcome,
};
use hms_integration::{
    normalize_phone, parse_notice, verify_signature, GatewayStatus, Notification, PaymentGateway, PaymentRequest,
    SIGNATURE_HEADER,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const CASHIERS: &[UserRole] = &[UserRole::Cashier];
const BILLING_DESK: &[UserRole] = &[UserRole::Cashier, UserRole::Receptionist];

/// 入账后的统一收尾
fn payment_credited(state: &AppState, receipt: &PaymentReceipt) {
    state.metrics.record_payment(receipt.payment.method.as_str());
    state.hub.publish(Notification::new(
        "payment.received",
        "billing",
        json!({
            "invoice_id": receipt.invoice.id,
            "invoice_number": receipt.invoice.invoice_number,
            "payment_id": receipt.payment.id,
            "amount": receipt.payment.amount,
            "method": receipt.payment.method,
            "balance": receipt.invoice.balance,
            "status": receipt.invoice.status,
        }),
    ));
    if let Some(transition) = &receipt.visit {
        state.visit_transitioned(transition);
    }
}

fn outcome_label(outcome: &WebhookOutcome) -> &'static str {
    match outcome {
        WebhookOutcome::Credited { .. } => "credited",
        WebhookOutcome::AlreadyProcessed { .. } => "duplicate",
        WebhookOutcome::ParkedForReview { .. } => "review",
        WebhookOutcome::Failed => "failed",
    }
}

// ========== 发票 ==========

pub async fn list_invoices(
    State(state): State<AppState>,
    Query(filter): Query<InvoiceFilter>,
    Query(page): Query<PageParams>,
) -> ApiResult<Json<Page<Invoice>>> {
    Ok(Json(state.queries().list_invoices(&filter, page.into()).await?))
}

pub async fn create_invoice(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiJson(invoice): ApiJson<NewInvoice>,
) -> ApiResult<impl IntoResponse> {
    user.require_any(BILLING_DESK)?;
    let invoice = state.queries().create_invoice(&invoice).await?;
    info!("Created invoice {} for {}", invoice.invoice_number, invoice.total_amount);
    state.audit(Some(user.id), "create", "invoice", Some(invoice.id)).await;
    Ok(created(invoice))
}

pub async fn get_invoice(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Invoice>> {
    Ok(Json(state.queries().get_invoice(id).await?))
}

pub async fn add_invoice_item(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    ApiJson(item): ApiJson<NewInvoiceItem>,
) -> ApiResult<Json<Invoice>> {
    user.require_any(BILLING_DESK)?;
    let invoice = state.queries().add_invoice_item(id, &item).await?;
    state.audit(Some(user.id), "add_item", "invoice", Some(id)).await;
    Ok(Json(invoice))
}

pub async fn cancel_invoice(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Invoice>> {
    user.require_any(CASHIERS)?;
    let invoice = state.queries().cancel_invoice(id).await?;
    state.audit(Some(user.id), "cancel", "invoice", Some(id)).await;
    Ok(Json(invoice))
}

// ========== 付款 ==========

pub async fn list_payments(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Vec<Payment>>> {
    Ok(Json(state.queries().list_payments(id).await?))
}

pub async fn apply_payment(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    ApiJson(mut payment): ApiJson<NewPayment>,
) -> ApiResult<impl IntoResponse> {
    user.require_any(CASHIERS)?;
    payment.received_by = Some(user.id);

    let receipt = state.queries().apply_payment(id, &payment).await?;
    payment_credited(&state, &receipt);
    state.audit(Some(user.id), "payment", "invoice", Some(id)).await;
    Ok(created(receipt))
}

pub async fn get_payment(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Payment>> {
    Ok(Json(state.queries().get_payment(id).await?))
}

/// 作废付款，仅管理员
pub async fn void_payment(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Invoice>> {
    user.require_any(&[])?;
    let invoice = state.queries().void_payment(id).await?;
    warn!("Payment {} voided by {}", id, user.username);
    state.audit(Some(user.id), "void", "payment", Some(id)).await;
    Ok(Json(invoice))
}

// ========== 移动支付 ==========

/// 测试模式下任何渠道都走模拟网关；非测试模式不接受模拟渠道
fn resolve_gateway(state: &AppState, provider: MobileProvider) -> Result<Arc<dyn PaymentGateway>> {
    if state.config.payments.simulate {
        return state.gateways.get(MobileProvider::Simulated);
    }
    if provider == MobileProvider::Simulated {
        return Err(HmsError::Validation("simulated payments are disabled".to_string()));
    }
    state.gateways.get(provider)
}

/// 按网关报告的状态更新移动支付，处理中返回 `None`
async fn apply_gateway_status(
    state: &AppState,
    reference: &str,
    status: GatewayStatus,
    transaction_id: Option<&str>,
    raw: &str,
) -> Result<Option<WebhookOutcome>> {
    let db = state.queries();
    let outcome = match status {
        GatewayStatus::Completed => db.complete_mobile_payment(reference, transaction_id, raw).await?,
        GatewayStatus::Failed => db.fail_mobile_payment(reference, raw).await?,
        GatewayStatus::Pending => {
            db.record_gateway_response(reference, transaction_id, raw).await?;
            return Ok(None);
        }
    };

    match &outcome {
        WebhookOutcome::Credited { receipt } => payment_credited(state, receipt),
        WebhookOutcome::ParkedForReview { reason } => {
            warn!("Mobile payment {} parked for review: {}", reference, reason);
            state.hub.publish(Notification::new(
                "payment.review",
                "billing",
                json!({ "reference": reference, "reason": reason }),
            ));
        }
        WebhookOutcome::AlreadyProcessed { .. } | WebhookOutcome::Failed => {}
    }
    Ok(Some(outcome))
}

pub async fn payment_providers(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "simulate": state.config.payments.simulate,
        "providers": state.gateways.providers(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct MobilePaymentRequest {
    pub invoice_id: Uuid,
    pub provider: MobileProvider,
    pub phone_number: String,
    /// 未提供时支付发票余额
    pub amount: Option<Money>,
    pub buyer_name: Option<String>,
    pub buyer_email: Option<String>,
}

/// 发起移动支付
pub async fn initiate_mobile_payment(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiJson(request): ApiJson<MobilePaymentRequest>,
) -> ApiResult<impl IntoResponse> {
    user.require_any(BILLING_DESK)?;
    let phone_number = normalize_phone(&request.phone_number)?;
    let gateway = resolve_gateway(&state, request.provider)?;

    let db = state.queries();
    let invoice = db.get_invoice(request.invoice_id).await?;
    let amount = request.amount.unwrap_or(invoice.balance);
    db.check_payable(invoice.id, amount).await?;
    let patient = db.get_patient(invoice.patient_id).await?;

    let payment = db
        .create_mobile_payment(&NewMobilePayment {
            reference: generate_reference("MP"),
            invoice_id: invoice.id,
            provider: request.provider,
            phone_number: phone_number.clone(),
            amount,
        })
        .await?;
    let reference = payment.reference.clone();

    let gateway_request = PaymentRequest {
        reference: reference.clone(),
        amount,
        phone_number,
        buyer_name: request
            .buyer_name
            .unwrap_or_else(|| format!("{} {}", patient.first_name, patient.last_name)),
        buyer_email: request.buyer_email.or(patient.email),
    };

    let response = match gateway.initiate(&gateway_request).await {
        Ok(response) => response,
        Err(e) => {
            db.fail_mobile_payment(&reference, &json!({ "error": e.to_string() }).to_string())
                .await?;
            return Err(e.into());
        }
    };

    let raw = response.raw.to_string();
    let outcome = apply_gateway_status(&state, &reference, response.status, response.transaction_id.as_deref(), &raw).await?;
    if matches!(outcome, Some(WebhookOutcome::Failed)) {
        return Err(HmsError::Gateway(format!(
            "{} rejected payment {}: {}",
            response.provider,
            reference,
            response.message.unwrap_or_default()
        ))
        .into());
    }

    info!("Initiated {} payment {} for invoice {}", request.provider, reference, invoice.invoice_number);
    state.audit(Some(user.id), "mobile_payment", "invoice", Some(invoice.id)).await;
    let payment = db.get_mobile_payment(&reference).await?;
    Ok(created(json!({ "payment": payment, "message": response.message })))
}

pub async fn get_mobile_payment(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> ApiResult<Json<MobilePayment>> {
    Ok(Json(state.queries().get_mobile_payment(&reference).await?))
}

/// 主动向网关查询一笔待确认的移动支付
pub async fn refresh_mobile_payment(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(reference): Path<String>,
) -> ApiResult<Json<Value>> {
    user.require_any(BILLING_DESK)?;
    let payment = state.queries().get_mobile_payment(&reference).await?;
    if payment.status != MobilePaymentStatus::Pending {
        return Ok(Json(json!({ "payment": payment, "outcome": "unchanged" })));
    }

    let gateway = resolve_gateway(&state, payment.provider)?;
    let response = gateway.check_status(&reference).await?;
    let outcome = apply_gateway_status(
        &state,
        &reference,
        response.status,
        response.transaction_id.as_deref(),
        &response.raw.to_string(),
    )
    .await?;

    let payment = state.queries().get_mobile_payment(&reference).await?;
    let label = outcome.as_ref().map(outcome_label).unwrap_or("pending");
    Ok(Json(json!({ "payment": payment, "outcome": label })))
}

// ========== 支付回调 ==========

pub async fn zenopay_webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> ApiResult<Json<Value>> {
    receive_webhook(&state, MobileProvider::ZenoPay, &headers, &body).await
}

pub async fn mobile_money_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let provider: MobileProvider = provider.parse()?;
    receive_webhook(&state, provider, &headers, &body).await
}

/// 校验签名、解析回调并幂等地更新支付状态
async fn receive_webhook(
    state: &AppState,
    provider: MobileProvider,
    headers: &HeaderMap,
    body: &[u8],
) -> ApiResult<Json<Value>> {
    let simulate = state.config.payments.simulate;
    if provider == MobileProvider::Simulated && !simulate {
        return Err(HmsError::Forbidden("simulated payments are disabled".to_string()).into());
    }

    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    if let Err(e) = verify_signature(state.gateways.webhook_secret(provider), body, signature) {
        warn!("Rejected {} webhook: {}", provider, e);
        state.metrics.record_webhook(provider.as_str(), "rejected");
        return Err(e.into());
    }

    let notice = parse_notice(provider, body)?;
    let payment = state.queries().get_mobile_payment(&notice.reference).await?;
    if payment.provider != provider && !(simulate && provider == MobileProvider::Simulated) {
        warn!(
            "{} webhook for {} which belongs to {}",
            provider, notice.reference, payment.provider
        );
        return Err(HmsError::Validation("payment reference belongs to another provider".to_string()).into());
    }

    let outcome = apply_gateway_status(
        state,
        &notice.reference,
        notice.status,
        notice.transaction_id.as_deref(),
        &notice.raw,
    )
    .await?;
    let label = outcome.as_ref().map(outcome_label).unwrap_or("pending");
    state.metrics.record_webhook(provider.as_str(), label);
    info!("{} webhook for {}: {}", provider, notice.reference, label);

    Ok(Json(json!({
        "received": true,
        "reference": notice.reference,
        "outcome": label,
    })))
}
