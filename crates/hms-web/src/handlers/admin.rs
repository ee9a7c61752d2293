//! 科室、收费项目、用户与审计日志接口

use super::{created, PageParams};
use crate::auth::CurrentUser;
use crate::error::{ApiJson, ApiResult};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Json},
};
use hms_core::{ActivityLog, Department, HmsError, Page, Service, User, UserRole};
use hms_database::{NewDepartment, NewService, NewUser, UpdateService, UpdateUser};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

// ========== 科室 ==========

pub async fn list_departments(State(state): State<AppState>) -> ApiResult<Json<Vec<Department>>> {
    Ok(Json(state.queries().list_departments().await?))
}

pub async fn create_department(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiJson(department): ApiJson<NewDepartment>,
) -> ApiResult<impl IntoResponse> {
    user.require_any(&[])?;
    let department = state.queries().create_department(&department).await?;
    state.audit(Some(user.id), "create", "department", Some(department.id)).await;
    Ok(created(department))
}

pub async fn get_department(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Department>> {
    Ok(Json(state.queries().get_department(id).await?))
}

// ========== 收费项目 ==========

#[derive(Debug, Deserialize)]
pub struct ServiceQuery {
    pub department_id: Option<Uuid>,
    #[serde(default)]
    pub active_only: bool,
}

pub async fn list_services(
    State(state): State<AppState>,
    Query(query): Query<ServiceQuery>,
) -> ApiResult<Json<Vec<Service>>> {
    Ok(Json(
        state
            .queries()
            .list_services(query.department_id, query.active_only)
            .await?,
    ))
}

pub async fn create_service(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiJson(service): ApiJson<NewService>,
) -> ApiResult<impl IntoResponse> {
    user.require_any(&[])?;
    let service = state.queries().create_service(&service).await?;
    state.audit(Some(user.id), "create", "service", Some(service.id)).await;
    Ok(created(service))
}

pub async fn get_service(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Service>> {
    Ok(Json(state.queries().get_service(id).await?))
}

pub async fn update_service(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    ApiJson(update): ApiJson<UpdateService>,
) -> ApiResult<Json<Service>> {
    user.require_any(&[])?;
    let service = state.queries().update_service(id, &update).await?;
    state.audit(Some(user.id), "update", "service", Some(id)).await;
    Ok(Json(service))
}

// ========== 用户 ==========

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub role: Option<UserRole>,
}

pub async fn list_users(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<UserQuery>,
) -> ApiResult<Json<Vec<User>>> {
    user.require_any(&[])?;
    Ok(Json(state.queries().list_users(query.role).await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub password: String,
    pub role: UserRole,
    pub department_id: Option<Uuid>,
}

pub async fn create_user(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiJson(request): ApiJson<CreateUserRequest>,
) -> ApiResult<impl IntoResponse> {
    user.require_any(&[])?;
    let created_user = state
        .queries()
        .create_user(&NewUser {
            username: request.username.trim().to_string(),
            email: request.email,
            full_name: request.full_name,
            password_hash: state.auth.hash_password(&request.password)?,
            role: request.role,
            department_id: request.department_id,
        })
        .await?;

    info!("User {} created with role {} by {}", created_user.username, created_user.role, user.username);
    state.audit(Some(user.id), "create", "user", Some(created_user.id)).await;
    Ok(created(created_user))
}

pub async fn get_user(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<User>> {
    if user.id != id {
        user.require_any(&[])?;
    }
    Ok(Json(state.queries().get_user(id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateUserRequest {
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub password: Option<String>,
    pub role: Option<UserRole>,
    pub department_id: Option<Uuid>,
    pub is_active: Option<bool>,
}

/// 修改用户；非管理员只能修改自己的资料和密码
pub async fn update_user(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    ApiJson(request): ApiJson<UpdateUserRequest>,
) -> ApiResult<Json<User>> {
    let privileged = request.role.is_some() || request.is_active.is_some() || request.department_id.is_some();
    if user.id != id || privileged {
        user.require_any(&[])?;
    }
    if user.id == id && request.is_active == Some(false) {
        return Err(HmsError::Validation("you cannot deactivate your own account".to_string()).into());
    }

    let password_hash = request
        .password
        .as_deref()
        .map(|password| state.auth.hash_password(password))
        .transpose()?;
    let updated = state
        .queries()
        .update_user(
            id,
            &UpdateUser {
                email: request.email,
                full_name: request.full_name,
                password_hash,
                role: request.role,
                department_id: request.department_id,
                is_active: request.is_active,
            },
        )
        .await?;

    state.audit(Some(user.id), "update", "user", Some(id)).await;
    Ok(Json(updated))
}

// ========== 审计日志 ==========

#[derive(Debug, Deserialize)]
pub struct ActivityQuery {
    pub entity_type: Option<String>,
    pub entity_id: Option<Uuid>,
}

pub async fn list_activity(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<ActivityQuery>,
    Query(page): Query<PageParams>,
) -> ApiResult<Json<Page<ActivityLog>>> {
    user.require_any(&[])?;
    let logs = state
        .queries()
        .list_activity(query.entity_type.as_deref(), query.entity_id, page.into())
        .await?;
    Ok(Json(logs))
}
