//! 用户认证和授权系统
//!
//! 密码以 PBKDF2-HMAC-SHA256 加盐存储，令牌为 HS256 签名的 JWT。
//! 认证中间件把当前用户放入请求扩展，处理器通过 `CurrentUser` 提取并按角色鉴权。

use crate::error::{ApiError, ApiJson, ApiResult};
use crate::state::AppState;
use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::{
    engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD},
    Engine as _,
};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use hms_admin::config::BootstrapAdminConfig;
use hms_core::{HmsError, Result, User, UserRole};
use hms_database::{DatabaseQueries, NewUser};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// 密码哈希迭代次数
pub const PBKDF2_ROUNDS: u32 = 100_000;
const SALT_LENGTH: usize = 16;
const HASH_LENGTH: usize = 32;
const HASH_SCHEME: &str = "pbkdf2-sha256";
const JWT_HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

/// JWT声明
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub role: UserRole,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
}

/// 登录请求
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// 登录响应
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub token_type: &'static str,
    pub expires_at: DateTime<Utc>,
    pub user: User,
}

/// 已认证的请求发起人
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentUser {
    pub id: Uuid,
    pub username: String,
    pub role: UserRole,
}

impl CurrentUser {
    /// 管理员拥有所有权限
    pub fn require_any(&self, roles: &[UserRole]) -> Result<()> {
        if self.role == UserRole::Admin || roles.contains(&self.role) {
            return Ok(());
        }
        Err(HmsError::Forbidden(format!(
            "role {} may not perform this action",
            self.role
        )))
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> std::result::Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or_else(|| ApiError(HmsError::Unauthorized("user not authenticated".to_string())))
    }
}

/// 认证服务
#[derive(Debug)]
pub struct AuthService {
    secret: Vec<u8>,
    token_ttl: Duration,
    rounds: u32,
}

impl AuthService {
    pub fn new(secret: &[u8], token_ttl_minutes: i64) -> Self {
        Self {
            secret: secret.to_vec(),
            token_ttl: Duration::minutes(token_ttl_minutes),
            rounds: PBKDF2_ROUNDS,
        }
    }

    /// 调整新密码的迭代次数，已存储的哈希按其自带的次数校验
    pub fn with_rounds(mut self, rounds: u32) -> Self {
        self.rounds = rounds.max(1);
        self
    }

    /// 生成 `pbkdf2-sha256$轮数$盐$哈希` 格式的密码哈希
    pub fn hash_password(&self, password: &str) -> Result<String> {
        if password.chars().count() < 8 {
            return Err(HmsError::Validation("password must be at least 8 characters".to_string()));
        }
        let mut salt = [0u8; SALT_LENGTH];
        rand::thread_rng().fill_bytes(&mut salt);
        let hash = derive(password, &salt, self.rounds);
        Ok(format!(
            "{}${}${}${}",
            HASH_SCHEME,
            self.rounds,
            STANDARD_NO_PAD.encode(salt),
            STANDARD_NO_PAD.encode(hash)
        ))
    }

    pub fn verify_password(&self, password: &str, stored: &str) -> bool {
        let parts: Vec<&str> = stored.split('$').collect();
        let [scheme, rounds, salt, expected] = parts.as_slice() else {
            return false;
        };
        if *scheme != HASH_SCHEME {
            return false;
        }
        let (Ok(rounds), Ok(salt), Ok(expected)) = (
            rounds.parse::<u32>(),
            STANDARD_NO_PAD.decode(salt),
            STANDARD_NO_PAD.decode(expected),
        ) else {
            return false;
        };
        if rounds == 0 {
            return false;
        }

        let actual = derive(password, &salt, rounds);
        actual[..].ct_eq(&expected[..]).into()
    }

    /// 签发令牌，返回令牌和过期时间
    pub fn issue_token(&self, user: &User) -> Result<(String, DateTime<Utc>)> {
        let now = Utc::now();
        let expires_at = now + self.token_ttl;
        let claims = Claims {
            sub: user.id.to_string(),
            username: user.username.clone(),
            role: user.role,
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let header = URL_SAFE_NO_PAD.encode(JWT_HEADER);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let message = format!("{}.{}", header, payload);
        let signature = URL_SAFE_NO_PAD.encode(self.sign(message.as_bytes())?);
        Ok((format!("{}.{}", message, signature), expires_at))
    }

    /// 校验签名和过期时间
    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        let invalid = || HmsError::Unauthorized("invalid token".to_string());

        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        let header: serde_json::Value = URL_SAFE_NO_PAD
            .decode(header)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .ok_or_else(invalid)?;
        if header.get("alg").and_then(|v| v.as_str()) != Some("HS256") {
            return Err(invalid());
        }

        let provided = URL_SAFE_NO_PAD.decode(signature).map_err(|_| invalid())?;
        let mut mac = self.mac()?;
        mac.update(parts_prefix(token).as_bytes());
        mac.verify_slice(&provided).map_err(|_| invalid())?;

        let claims: Claims = URL_SAFE_NO_PAD
            .decode(payload)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .ok_or_else(invalid)?;

        if claims.exp <= Utc::now().timestamp() {
            return Err(HmsError::Unauthorized("token has expired".to_string()));
        }
        Ok(claims)
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| HmsError::Internal(format!("failed to create HMAC: {}", e)))
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let mut mac = self.mac()?;
        mac.update(message);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

/// 令牌中被签名的部分，即最后一个 `.` 之前的内容
fn parts_prefix(token: &str) -> &str {
    token.rsplit_once('.').map(|(prefix, _)| prefix).unwrap_or(token)
}

fn derive(password: &str, salt: &[u8], rounds: u32) -> [u8; HASH_LENGTH] {
    let mut out = [0u8; HASH_LENGTH];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, rounds, &mut out);
    out
}

/// 认证中间件
///
/// 校验 `Authorization: Bearer` 令牌，并确认账号仍然有效。
pub async fn auth_middleware(State(state): State<AppState>, mut request: Request, next: Next) -> ApiResult<Response> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or_else(|| HmsError::Unauthorized("missing bearer token".to_string()))?;

    let claims = state.auth.verify_token(token.trim())?;
    let user_id = Uuid::parse_str(&claims.sub).map_err(|_| HmsError::Unauthorized("invalid token".to_string()))?;

    let user = state.queries().get_user(user_id).await.map_err(|e| match e {
        HmsError::NotFound(_) => HmsError::Unauthorized("user no longer exists".to_string()),
        other => other,
    })?;
    if !user.is_active {
        return Err(HmsError::Unauthorized("account is disabled".to_string()).into());
    }

    request.extensions_mut().insert(CurrentUser {
        id: user.id,
        username: user.username,
        role: user.role,
    });
    Ok(next.run(request).await)
}

/// 登录处理器
pub async fn login_handler(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    info!("Login attempt for user: {}", request.username);
    let rejected = || HmsError::Unauthorized("invalid username or password".to_string());

    let Some((user, password_hash)) = state.queries().find_credentials(request.username.trim()).await? else {
        warn!("Login failed for unknown user {}", request.username);
        return Err(rejected().into());
    };
    if !state.auth.verify_password(&request.password, &password_hash) {
        warn!("Login failed for {}: wrong password", user.username);
        return Err(rejected().into());
    }
    if !user.is_active {
        return Err(HmsError::Unauthorized("account is disabled".to_string()).into());
    }

    let (token, expires_at) = state.auth.issue_token(&user)?;
    state.queries().record_login(user.id).await?;
    state.audit(Some(user.id), "login", "user", Some(user.id)).await;
    info!("User logged in successfully: {}", user.username);

    Ok(Json(LoginResponse {
        token,
        token_type: "Bearer",
        expires_at,
        user,
    }))
}

/// 获取当前用户信息
pub async fn get_current_user(State(state): State<AppState>, current: CurrentUser) -> ApiResult<Json<User>> {
    Ok(Json(state.queries().get_user(current.id).await?))
}

/// 用户表为空时创建初始管理员
///
/// 未配置初始密码时跳过，返回 `None`。
pub async fn bootstrap_admin(
    db: &DatabaseQueries<'_>,
    auth: &AuthService,
    admin: &BootstrapAdminConfig,
) -> Result<Option<User>> {
    if db.count_users().await? > 0 {
        return Ok(None);
    }
    if admin.password.is_empty() {
        warn!("No users exist and no bootstrap admin password is configured (HMS__AUTH__BOOTSTRAP_ADMIN__PASSWORD)");
        return Ok(None);
    }

    let user = db
        .create_user(&NewUser {
            username: admin.username.clone(),
            email: admin.email.clone(),
            full_name: admin.full_name.clone(),
            password_hash: auth.hash_password(&admin.password)?,
            role: UserRole::Admin,
            department_id: None,
        })
        .await?;
    info!("Created bootstrap administrator {}", user.username);
    Ok(Some(user))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> AuthService {
        AuthService::new(b"test-secret-0123456789", 60).with_rounds(1_000)
    }

    fn user(role: UserRole) -> User {
        User {
            id: Uuid::new_v4(),
            username: "amina".to_string(),
            email: "amina@hms.local".to_string(),
            full_name: "Amina Said".to_string(),
            role,
            department_id: None,
            is_active: true,
            created_at: Utc::now(),
            last_login: None,
        }
    }

    #[test]
    fn test_password_hash_round_trip() {
        let auth = service();
        let stored = auth.hash_password("correct horse").unwrap();
        assert!(stored.starts_with("pbkdf2-sha256$1000$"));
        assert!(auth.verify_password("correct horse", &stored));
        assert!(!auth.verify_password("correct horsf", &stored));
        assert!(!auth.verify_password("correct horse", "plain-text"));
        assert_ne!(stored, auth.hash_password("correct horse").unwrap());
        assert!(auth.hash_password("short").is_err());
    }

    #[test]
    fn test_token_round_trip() {
        let auth = service();
        let user = user(UserRole::Nurse);
        let (token, expires_at) = auth.issue_token(&user).unwrap();
        assert!(expires_at > Utc::now());

        let claims = auth.verify_token(&token).unwrap();
        assert_eq!(claims.sub, user.id.to_string());
        assert_eq!(claims.role, UserRole::Nurse);
    }

    #[test]
    fn test_tampered_or_foreign_tokens_rejected() {
        let auth = service();
        let (token, _) = auth.issue_token(&user(UserRole::Nurse)).unwrap();

        let (header, rest) = token.split_once('.').unwrap();
        let (_, signature) = rest.split_once('.').unwrap();
        let mut claims = auth.verify_token(&token).unwrap();
        claims.role = UserRole::Admin;
        let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap());
        let forged = format!("{}.{}.{}", header, forged_payload, signature);
        assert!(auth.verify_token(&forged).is_err());

        let other = AuthService::new(b"another-secret-9876543210", 60);
        assert!(other.verify_token(&token).is_err());
        assert!(auth.verify_token("not-a-token").is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let auth = AuthService::new(b"test-secret-0123456789", -1);
        let (token, _) = auth.issue_token(&user(UserRole::Doctor)).unwrap();
        assert!(matches!(auth.verify_token(&token), Err(HmsError::Unauthorized(_))));
    }

    #[test]
    fn test_role_guard() {
        let nurse = CurrentUser {
            id: Uuid::new_v4(),
            username: "n".to_string(),
            role: UserRole::Nurse,
        };
        assert!(nurse.require_any(&[UserRole::Nurse, UserRole::Doctor]).is_ok());
        assert!(matches!(nurse.require_any(&[UserRole::Pharmacist]), Err(HmsError::Forbidden(_))));

        let admin = CurrentUser {
            role: UserRole::Admin,
            ..nurse
        };
        assert!(admin.require_any(&[UserRole::Pharmacist]).is_ok());
    }
}
