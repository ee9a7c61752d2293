//! 患者接口

use super::{created, PageParams};
use crate::auth::CurrentUser;
use crate::cache::VISITS;
use crate::error::{ApiJson, ApiResult};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use hms_core::{Page, Patient, PatientVisit, UserRole};
use hms_database::{NewPatient, UpdatePatient};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

const REGISTRARS: &[UserRole] = &[UserRole::Receptionist, UserRole::Nurse, UserRole::Doctor];

#[derive(Debug, Deserialize)]
pub struct PatientQuery {
    pub search: Option<String>,
}

pub async fn list_patients(
    State(state): State<AppState>,
    Query(query): Query<PatientQuery>,
    Query(page): Query<PageParams>,
) -> ApiResult<Json<Page<Patient>>> {
    let page = state
        .queries()
        .list_patients(query.search.as_deref(), page.into())
        .await?;
    Ok(Json(page))
}

pub async fn create_patient(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiJson(patient): ApiJson<NewPatient>,
) -> ApiResult<impl IntoResponse> {
    user.require_any(REGISTRARS)?;
    let patient = state.queries().create_patient(&patient).await?;
    info!("Registered patient {} by {}", patient.patient_number, user.username);
    state.audit(Some(user.id), "create", "patient", Some(patient.id)).await;
    Ok(created(patient))
}

pub async fn get_patient(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Patient>> {
    Ok(Json(state.queries().get_patient(id).await?))
}

pub async fn update_patient(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    ApiJson(update): ApiJson<UpdatePatient>,
) -> ApiResult<Json<Patient>> {
    user.require_any(REGISTRARS)?;
    let patient = state.queries().update_patient(id, &update).await?;
    // 队列缓存里带着患者姓名
    state.cache.invalidate(VISITS);
    state.audit(Some(user.id), "update", "patient", Some(id)).await;
    Ok(Json(patient))
}

pub async fn delete_patient(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    user.require_any(&[])?;
    state.queries().delete_patient(id).await?;
    state.cache.invalidate(VISITS);
    state.audit(Some(user.id), "delete", "patient", Some(id)).await;
    Ok(StatusCode::NO_CONTENT)
}

/// 患者当前进行中的就诊，没有则返回 `null`
pub async fn active_visit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Option<PatientVisit>>> {
    state.queries().get_patient(id).await?;
    Ok(Json(state.queries().active_visit_for_patient(id).await?))
}
