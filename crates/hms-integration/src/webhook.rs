//! 支付回调处理
//!
//! 负责回调签名校验和各渠道回调报文的解析，入账由数据库层完成。

use crate::connectors::GatewayStatus;
use hmac::{Hmac, Mac};
use hms_core::{HmsError, MobileProvider, Result};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// 签名请求头
pub const SIGNATURE_HEADER: &str = "x-signature";

/// 计算回调报文签名（小写十六进制）
pub fn sign_payload(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| HmsError::Internal(format!("invalid webhook secret: {}", e)))?;
    mac.update(body);
    Ok(mac
        .finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

/// 校验回调签名
///
/// 未配置密钥时不校验；配置了密钥则签名头必须存在且一致，允许 `sha256=` 前缀。
pub fn verify_signature(secret: Option<&str>, body: &[u8], header: Option<&str>) -> Result<()> {
    let Some(secret) = secret.filter(|s| !s.is_empty()) else {
        return Ok(());
    };

    let provided = header
        .map(str::trim)
        .map(|h| h.strip_prefix("sha256=").unwrap_or(h))
        .filter(|h| !h.is_empty())
        .ok_or_else(|| HmsError::Unauthorized("missing webhook signature".to_string()))?;

    let expected = sign_payload(secret, body)?;
    let provided = provided.to_ascii_lowercase();
    if expected.as_bytes().ct_eq(provided.as_bytes()).unwrap_u8() == 1 {
        Ok(())
    } else {
        Err(HmsError::Unauthorized("invalid webhook signature".to_string()))
    }
}

/// 规范化后的回调通知
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookNotice {
    pub provider: MobileProvider,
    pub reference: String,
    pub status: GatewayStatus,
    pub transaction_id: Option<String>,
    pub raw: String,
}

#[derive(Debug, Deserialize)]
struct ZenoPayCallback {
    order_id: Option<String>,
    reference: Option<String>,
    payment_status: Option<String>,
    status: Option<String>,
    transid: Option<String>,
    transaction_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MobileMoneyCallback {
    reference: Option<String>,
    order_id: Option<String>,
    status: String,
    transaction_id: Option<String>,
}

/// 解析回调报文
pub fn parse_notice(provider: MobileProvider, body: &[u8]) -> Result<WebhookNotice> {
    let raw = String::from_utf8_lossy(body).into_owned();

    let (reference, status, transaction_id) = match provider {
        MobileProvider::ZenoPay => {
            let callback: ZenoPayCallback = serde_json::from_slice(body)
                .map_err(|e| HmsError::Validation(format!("malformed zenopay callback: {}", e)))?;
            let status = callback
                .payment_status
                .or(callback.status)
                .ok_or_else(|| HmsError::Validation("callback is missing payment_status".to_string()))?;
            (
                callback.order_id.or(callback.reference),
                status,
                callback.transid.or(callback.transaction_id),
            )
        }
        _ => {
            let callback: MobileMoneyCallback = serde_json::from_slice(body)
                .map_err(|e| HmsError::Validation(format!("malformed {} callback: {}", provider, e)))?;
            (callback.reference.or(callback.order_id), callback.status, callback.transaction_id)
        }
    };

    let reference = reference
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .ok_or_else(|| HmsError::Validation("callback is missing the payment reference".to_string()))?;

    Ok(WebhookNotice {
        provider,
        reference,
        status: GatewayStatus::parse(&status),
        transaction_id: transaction_id.filter(|t| !t.trim().is_empty()),
        raw,
    })
}
