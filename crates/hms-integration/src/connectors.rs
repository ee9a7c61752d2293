//! 支付网关连接器
//!
//! 提供移动支付渠道的统一接口：
//! - ZenoPay 坦桑尼亚移动支付
//! - 通用移动钱包渠道（M-Pesa、Tigo Pesa、Airtel Money、HaloPesa）
//! - 测试模式下的模拟网关
//!
//! 网关只负责发起支付和查询状态，不做重试；最终结果以回调为准。

use async_trait::async_trait;
use hms_core::{HmsError, MobileProvider, Money, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 网关调用超时
pub const GATEWAY_TIMEOUT: Duration = Duration::from_secs(10);

/// 网关报告的支付状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    Pending,
    Completed,
    Failed,
}

impl GatewayStatus {
    /// 各渠道的状态写法不一，未识别的一律视为处理中
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "completed" | "complete" | "success" | "successful" | "paid" | "settled" => Self::Completed,
            "failed" | "failure" | "cancelled" | "canceled" | "rejected" | "declined" | "expired" => {
                Self::Failed
            }
            _ => Self::Pending,
        }
    }
}

/// 发起支付请求
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub reference: String,
    pub amount: Money,
    /// 已规范化为 255XXXXXXXXX
    pub phone_number: String,
    pub buyer_name: String,
    pub buyer_email: Option<String>,
}

/// 网关应答
#[derive(Debug, Clone, Serialize)]
pub struct GatewayResponse {
    pub provider: MobileProvider,
    pub reference: String,
    pub status: GatewayStatus,
    pub transaction_id: Option<String>,
    pub message: Option<String>,
    pub raw: serde_json::Value,
}

/// 支付网关接口
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn provider(&self) -> MobileProvider;

    /// 发起支付，返回受理结果
    async fn initiate(&self, request: &PaymentRequest) -> Result<GatewayResponse>;

    /// 主动查询支付状态
    async fn check_status(&self, reference: &str) -> Result<GatewayResponse>;
}

/// 金额以主币单位传给网关，整数金额不带小数
fn amount_value(amount: Money) -> serde_json::Value {
    let minor = amount.minor();
    if minor % 100 == 0 {
        serde_json::Value::from(minor / 100)
    } else {
        serde_json::Value::from(minor as f64 / 100.0)
    }
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(GATEWAY_TIMEOUT)
        .build()
        .map_err(|e| HmsError::Internal(format!("failed to build http client: {}", e)))
}

fn gateway_error(provider: MobileProvider, err: reqwest::Error) -> HmsError {
    if err.is_timeout() {
        HmsError::Gateway(format!("{} did not respond within {}s", provider, GATEWAY_TIMEOUT.as_secs()))
    } else {
        HmsError::Gateway(format!("{} request failed: {}", provider, err))
    }
}

/// 读取应答，非 2xx 视为网关错误
async fn read_response(provider: MobileProvider, response: reqwest::Response) -> Result<serde_json::Value> {
    let status = response.status();
    let body = response.text().await.map_err(|e| gateway_error(provider, e))?;
    let json = serde_json::from_str(&body).unwrap_or_else(|_| serde_json::Value::String(body.clone()));

    if status.is_success() {
        debug!("{} responded {}: {}", provider, status, body);
        Ok(json)
    } else {
        warn!("{} rejected request with {}: {}", provider, status, body);
        let message = json
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| status.to_string());
        Err(HmsError::Gateway(format!("{} rejected the request: {}", provider, message)))
    }
}

fn str_field(json: &serde_json::Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| json.get(*key).and_then(|v| v.as_str()))
        .map(str::to_string)
}

// ========== ZenoPay ==========

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ZenoPaySettings {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: String,
    /// 网关回调地址
    pub webhook_url: String,
    pub webhook_secret: Option<String>,
}

pub struct ZenoPayGateway {
    settings: ZenoPaySettings,
    client: reqwest::Client,
}

impl ZenoPayGateway {
    pub fn new(settings: ZenoPaySettings) -> Result<Self> {
        if settings.api_key.trim().is_empty() {
            return Err(HmsError::Config("zenopay api_key is required".to_string()));
        }
        Ok(Self {
            client: http_client()?,
            settings,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    /// 发起支付的请求体
    pub fn request_body(&self, request: &PaymentRequest) -> serde_json::Value {
        serde_json::json!({
            "order_id": request.reference,
            "buyer_email": request.buyer_email.clone().unwrap_or_default(),
            "buyer_name": request.buyer_name,
            "buyer_phone": request.phone_number,
            "amount": amount_value(request.amount),
            "webhook_url": self.settings.webhook_url,
        })
    }

    fn to_response(reference: &str, raw: serde_json::Value) -> GatewayResponse {
        // 状态查询结果在 data[0] 中，发起支付的应答在顶层
        let record = raw
            .get("data")
            .and_then(|d| d.as_array())
            .and_then(|d| d.first())
            .cloned()
            .unwrap_or_else(|| raw.clone());

        let status = str_field(&record, &["payment_status", "status"])
            .map(|s| GatewayStatus::parse(&s))
            .unwrap_or(GatewayStatus::Pending);
        GatewayResponse {
            provider: MobileProvider::ZenoPay,
            reference: reference.to_string(),
            status,
            transaction_id: str_field(&record, &["transid", "transaction_id"]),
            message: str_field(&raw, &["message"]),
            raw,
        }
    }
}

#[async_trait]
impl PaymentGateway for ZenoPayGateway {
    fn provider(&self) -> MobileProvider {
        MobileProvider::ZenoPay
    }

    async fn initiate(&self, request: &PaymentRequest) -> Result<GatewayResponse> {
        info!("Initiating ZenoPay payment {} for {}", request.reference, request.amount);
        let response = self
            .client
            .post(self.url("/api/payments/mobile_money_tanzania"))
            .header("x-api-key", &self.settings.api_key)
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| gateway_error(MobileProvider::ZenoPay, e))?;

        let raw = read_response(MobileProvider::ZenoPay, response).await?;
        if raw.get("status").and_then(|s| s.as_str()) == Some("error") {
            let message = str_field(&raw, &["message"]).unwrap_or_else(|| "unknown error".to_string());
            return Err(HmsError::Gateway(format!("zenopay rejected the request: {}", message)));
        }
        // 受理成功不代表已付款，最终状态等回调
        let mut response = Self::to_response(&request.reference, raw);
        response.status = GatewayStatus::Pending;
        Ok(response)
    }

    async fn check_status(&self, reference: &str) -> Result<GatewayResponse> {
        let response = self
            .client
            .get(self.url("/api/payments/order-status"))
            .header("x-api-key", &self.settings.api_key)
            .query(&[("order_id", reference)])
            .send()
            .await
            .map_err(|e| gateway_error(MobileProvider::ZenoPay, e))?;

        let raw = read_response(MobileProvider::ZenoPay, response).await?;
        Ok(Self::to_response(reference, raw))
    }
}

// ========== 通用移动钱包 ==========

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MobileMoneySettings {
    pub enabled: bool,
    pub endpoint: String,
    pub merchant_id: String,
    pub api_key: String,
    pub callback_url: String,
    pub webhook_secret: Option<String>,
}

/// 通用移动钱包渠道，各运营商共用同一聚合接口
pub struct MobileMoneyGateway {
    provider: MobileProvider,
    settings: MobileMoneySettings,
    client: reqwest::Client,
}

impl MobileMoneyGateway {
    pub fn new(provider: MobileProvider, settings: MobileMoneySettings) -> Result<Self> {
        if matches!(provider, MobileProvider::ZenoPay | MobileProvider::Simulated) {
            return Err(HmsError::Config(format!("{} is not a mobile money operator", provider)));
        }
        if settings.endpoint.trim().is_empty() {
            return Err(HmsError::Config("mobile money endpoint is required".to_string()));
        }
        Ok(Self {
            provider,
            client: http_client()?,
            settings,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.endpoint.trim_end_matches('/'), path)
    }

    pub fn request_body(&self, request: &PaymentRequest) -> serde_json::Value {
        serde_json::json!({
            "provider": self.provider.as_str(),
            "reference": request.reference,
            "msisdn": request.phone_number,
            "amount": amount_value(request.amount),
            "currency": "TZS",
            "customer_name": request.buyer_name,
            "callback_url": self.settings.callback_url,
        })
    }

    fn to_response(&self, reference: &str, raw: serde_json::Value) -> GatewayResponse {
        GatewayResponse {
            provider: self.provider,
            reference: reference.to_string(),
            status: str_field(&raw, &["status"])
                .map(|s| GatewayStatus::parse(&s))
                .unwrap_or(GatewayStatus::Pending),
            transaction_id: str_field(&raw, &["transaction_id", "transactionId"]),
            message: str_field(&raw, &["message"]),
            raw,
        }
    }
}

#[async_trait]
impl PaymentGateway for MobileMoneyGateway {
    fn provider(&self) -> MobileProvider {
        self.provider
    }

    async fn initiate(&self, request: &PaymentRequest) -> Result<GatewayResponse> {
        info!("Initiating {} payment {} for {}", self.provider, request.reference, request.amount);
        let response = self
            .client
            .post(self.url("/payments"))
            .header("X-Merchant-Id", &self.settings.merchant_id)
            .header("X-Api-Key", &self.settings.api_key)
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| gateway_error(self.provider, e))?;

        let raw = read_response(self.provider, response).await?;
        let response = self.to_response(&request.reference, raw);
        if response.status == GatewayStatus::Failed {
            return Err(HmsError::Gateway(format!(
                "{} declined the payment: {}",
                self.provider,
                response.message.unwrap_or_default()
            )));
        }
        Ok(response)
    }

    async fn check_status(&self, reference: &str) -> Result<GatewayResponse> {
        let response = self
            .client
            .get(self.url(&format!("/payments/{}", reference)))
            .header("X-Merchant-Id", &self.settings.merchant_id)
            .header("X-Api-Key", &self.settings.api_key)
            .send()
            .await
            .map_err(|e| gateway_error(self.provider, e))?;

        let raw = read_response(self.provider, response).await?;
        Ok(self.to_response(reference, raw))
    }
}

// ========== 模拟网关 ==========

/// 测试模式网关，不发起任何网络请求
///
/// 发起支付总是受理；状态查询总是返回处理中，完成由模拟回调驱动。
#[derive(Debug, Clone, Default)]
pub struct SimulatedGateway;

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    fn provider(&self) -> MobileProvider {
        MobileProvider::Simulated
    }

    async fn initiate(&self, request: &PaymentRequest) -> Result<GatewayResponse> {
        info!("Simulated payment {} for {} accepted", request.reference, request.amount);
        Ok(GatewayResponse {
            provider: MobileProvider::Simulated,
            reference: request.reference.clone(),
            status: GatewayStatus::Pending,
            transaction_id: Some(format!("SIM-{}", request.reference)),
            message: Some("simulated payment accepted".to_string()),
            raw: serde_json::json!({
                "status": "success",
                "order_id": request.reference,
                "simulated": true,
            }),
        })
    }

    async fn check_status(&self, reference: &str) -> Result<GatewayResponse> {
        Ok(GatewayResponse {
            provider: MobileProvider::Simulated,
            reference: reference.to_string(),
            status: GatewayStatus::Pending,
            transaction_id: Some(format!("SIM-{}", reference)),
            message: None,
            raw: serde_json::json!({ "status": "pending", "simulated": true }),
        })
    }
}

// ========== 网关注册表 ==========

/// 按渠道查找网关和回调密钥
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<MobileProvider, Arc<dyn PaymentGateway>>,
    secrets: HashMap<MobileProvider, String>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按配置构建；测试模式下所有渠道都走模拟网关
    pub fn from_settings(zenopay: &ZenoPaySettings, mobile_money: &MobileMoneySettings, simulate: bool) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(SimulatedGateway), None);

        if simulate {
            info!("Payment gateways running in simulated mode");
            return Ok(registry);
        }

        if zenopay.enabled {
            registry.register(
                Arc::new(ZenoPayGateway::new(zenopay.clone())?),
                zenopay.webhook_secret.clone(),
            );
        }
        if mobile_money.enabled {
            for provider in [
                MobileProvider::Mpesa,
                MobileProvider::TigoPesa,
                MobileProvider::AirtelMoney,
                MobileProvider::HaloPesa,
            ] {
                registry.register(
                    Arc::new(MobileMoneyGateway::new(provider, mobile_money.clone())?),
                    mobile_money.webhook_secret.clone(),
                );
            }
        }
        Ok(registry)
    }

    pub fn register(&mut self, gateway: Arc<dyn PaymentGateway>, webhook_secret: Option<String>) {
        let provider = gateway.provider();
        info!("Registered payment gateway: {}", provider);
        self.gateways.insert(provider, gateway);
        match webhook_secret.filter(|s| !s.is_empty()) {
            Some(secret) => {
                self.secrets.insert(provider, secret);
            }
            None => {
                self.secrets.remove(&provider);
            }
        }
    }

    pub fn get(&self, provider: MobileProvider) -> Result<Arc<dyn PaymentGateway>> {
        self.gateways
            .get(&provider)
            .cloned()
            .ok_or_else(|| HmsError::Validation(format!("payment provider {} is not enabled", provider)))
    }

    pub fn webhook_secret(&self, provider: MobileProvider) -> Option<&str> {
        self.secrets.get(&provider).map(String::as_str)
    }

    pub fn providers(&self) -> Vec<MobileProvider> {
        let mut providers: Vec<_> = self.gateways.keys().copied().collect();
        providers.sort_by_key(|p| p.as_str());
        providers
    }
}
