//! 就诊与预约接口

use super::{created, PageParams};
use crate::auth::CurrentUser;
use crate::cache::{APPOINTMENTS, VISITS};
use crate::error::{ApiJson, ApiResult};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, RawQuery, State},
    response::{IntoResponse, Json},
};
use hms_core::{Appointment, AppointmentStatus, HmsError, PageRequest, PatientVisit, UserRole, VisitStage};
use hms_database::{engine, AppointmentFilter, NewAppointment, NewVisit, UpdateAppointment, VisitFilter, VisitTransition};
use hms_integration::Notification;
use hms_workflow::{stage_room, VisitEvent};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

const SCHEDULERS: &[UserRole] = &[UserRole::Receptionist, UserRole::Nurse, UserRole::Doctor];

/// 各科室可以推进本科室阶段的角色
pub fn stage_roles(stage: VisitStage) -> &'static [UserRole] {
    match stage {
        VisitStage::Reception => &[UserRole::Receptionist],
        VisitStage::Nurse => &[UserRole::Nurse],
        VisitStage::Doctor => &[UserRole::Doctor],
        VisitStage::Lab => &[UserRole::LabTechnician],
        VisitStage::Pharmacy => &[UserRole::Pharmacist],
        VisitStage::Billing => &[UserRole::Cashier],
        VisitStage::Discharged => &[],
    }
}

fn event_roles(stage: VisitStage, event: &VisitEvent) -> &'static [UserRole] {
    match event {
        VisitEvent::Cancel => &[UserRole::Receptionist, UserRole::Doctor],
        _ => stage_roles(stage),
    }
}

fn publish_visit_created(state: &AppState, visit: &PatientVisit) {
    let data = json!({
        "visit_id": visit.id,
        "visit_number": visit.visit_number,
        "patient_id": visit.patient_id,
        "stage": visit.state.current_stage,
    });
    state
        .hub
        .publish_to_rooms("visit.created", ["visits".to_string(), stage_room(VisitStage::Reception)], data);
}

fn publish_appointment(state: &AppState, appointment: &Appointment) {
    state.hub.publish(Notification::new(
        "appointment.updated",
        "appointments",
        json!({
            "appointment_id": appointment.id,
            "patient_id": appointment.patient_id,
            "status": appointment.status,
            "scheduled_at": appointment.scheduled_at,
            "visit_id": appointment.visit_id,
        }),
    ));
}

// ========== 就诊 ==========

pub async fn list_visits(
    State(state): State<AppState>,
    RawQuery(raw): RawQuery,
    Query(filter): Query<VisitFilter>,
    Query(page): Query<PageParams>,
) -> ApiResult<Json<Value>> {
    let key = format!("list?{}", raw.unwrap_or_default());
    let page: PageRequest = page.into();
    let value = state
        .cache
        .get_or_load(VISITS, &key, || async { state.queries().list_visits(&filter, page).await })
        .await?;
    Ok(Json(value))
}

pub async fn create_visit(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiJson(visit): ApiJson<NewVisit>,
) -> ApiResult<impl IntoResponse> {
    user.require_any(&[UserRole::Receptionist])?;
    let visit = state.queries().create_visit(&visit).await?;
    info!("Opened visit {} by {}", visit.visit_number, user.username);

    state.cache.invalidate(VISITS);
    publish_visit_created(&state, &visit);
    state.audit(Some(user.id), "create", "visit", Some(visit.id)).await;
    Ok(created(visit))
}

pub async fn get_visit(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Value>> {
    let key = format!("visit:{}", id);
    let value = state
        .cache
        .get_or_load(VISITS, &key, || async { state.queries().get_visit(id).await })
        .await?;
    Ok(Json(value))
}

/// 就诊状态转换请求，例如 `{"event": "complete_consultation", "prescribed": true}`
#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    #[serde(flatten)]
    pub event: VisitEvent,
    /// 客户端读取时的版本号，用于乐观锁
    pub expected_version: Option<i64>,
}

pub async fn transition_visit(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    ApiJson(request): ApiJson<TransitionRequest>,
) -> ApiResult<Json<VisitTransition>> {
    let visit = state.queries().get_visit(id).await?;
    user.require_any(event_roles(visit.state.current_stage, &request.event))?;

    let transition = state
        .queries()
        .transition_visit(id, request.event, request.expected_version)
        .await?;
    state.visit_transitioned(&transition);
    state
        .audit(Some(user.id), request.event.name(), "visit", Some(id))
        .await;
    Ok(Json(transition))
}

/// 当前状态下允许的事件
pub async fn visit_events(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Vec<VisitEvent>>> {
    let visit = state.queries().get_visit(id).await?;
    Ok(Json(engine().visit_machine().get_possible_events(&visit.state)))
}

pub async fn stage_queue(State(state): State<AppState>, Path(stage): Path<VisitStage>) -> ApiResult<Json<Value>> {
    let key = format!("queue:{}", stage);
    let value = state
        .cache
        .get_or_load(VISITS, &key, || async {
            let queue = state.queries().stage_queue(stage).await?;
            let stats = queue.stats();
            Ok::<_, HmsError>(json!({ "queue": queue, "stats": stats }))
        })
        .await?;
    Ok(Json(value))
}

// ========== 预约 ==========

pub async fn list_appointments(
    State(state): State<AppState>,
    RawQuery(raw): RawQuery,
    Query(filter): Query<AppointmentFilter>,
    Query(page): Query<PageParams>,
) -> ApiResult<Json<Value>> {
    let key = format!("list?{}", raw.unwrap_or_default());
    let page: PageRequest = page.into();
    let value = state
        .cache
        .get_or_load(APPOINTMENTS, &key, || async {
            state.queries().list_appointments(&filter, page).await
        })
        .await?;
    Ok(Json(value))
}

pub async fn create_appointment(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiJson(appointment): ApiJson<NewAppointment>,
) -> ApiResult<impl IntoResponse> {
    user.require_any(SCHEDULERS)?;
    let appointment = state.queries().create_appointment(&appointment).await?;

    state.cache.invalidate(APPOINTMENTS);
    publish_appointment(&state, &appointment);
    state.audit(Some(user.id), "create", "appointment", Some(appointment.id)).await;
    Ok(created(appointment))
}

pub async fn get_appointment(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Value>> {
    let key = format!("appointment:{}", id);
    let value = state
        .cache
        .get_or_load(APPOINTMENTS, &key, || async { state.queries().get_appointment(id).await })
        .await?;
    Ok(Json(value))
}

pub async fn update_appointment(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    ApiJson(update): ApiJson<UpdateAppointment>,
) -> ApiResult<Json<Appointment>> {
    user.require_any(SCHEDULERS)?;
    let appointment = state.queries().update_appointment(id, &update).await?;

    state.cache.invalidate(APPOINTMENTS);
    publish_appointment(&state, &appointment);
    state.audit(Some(user.id), "update", "appointment", Some(id)).await;
    Ok(Json(appointment))
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: AppointmentStatus,
}

pub async fn update_appointment_status(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    ApiJson(request): ApiJson<StatusRequest>,
) -> ApiResult<Json<Value>> {
    user.require_any(SCHEDULERS)?;
    let (appointment, visit) = state
        .queries()
        .update_appointment_status(id, request.status)
        .await?;

    if let Some(visit) = &visit {
        state.cache.invalidate_workflow();
        publish_visit_created(&state, visit);
    } else {
        state.cache.invalidate(APPOINTMENTS);
    }
    publish_appointment(&state, &appointment);
    state
        .audit(Some(user.id), request.status.as_str(), "appointment", Some(id))
        .await;
    Ok(Json(json!({ "appointment": appointment, "visit": visit })))
}

#[derive(Debug, Default, Deserialize)]
pub struct CheckInRequest {
    pub chief_complaint: Option<String>,
}

/// 预约签到并开始就诊
pub async fn check_in_appointment(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    body: Option<ApiJson<CheckInRequest>>,
) -> ApiResult<impl IntoResponse> {
    user.require_any(&[UserRole::Receptionist])?;
    let request = body.map(|ApiJson(request)| request).unwrap_or_default();
    let (appointment, visit) = state
        .queries()
        .check_in_appointment(id, request.chief_complaint)
        .await?;

    state.cache.invalidate_workflow();
    publish_appointment(&state, &appointment);
    publish_visit_created(&state, &visit);
    state.audit(Some(user.id), "check_in", "appointment", Some(id)).await;
    Ok(created(json!({ "appointment": appointment, "visit": visit })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_request_shape() {
        let request: TransitionRequest = serde_json::from_value(json!({
            "event": "complete_consultation",
            "prescribed": true,
            "expected_version": 4
        }))
        .unwrap();
        assert_eq!(request.event, VisitEvent::CompleteConsultation { prescribed: true });
        assert_eq!(request.expected_version, Some(4));

        let request: TransitionRequest = serde_json::from_value(json!({ "event": "start" })).unwrap();
        assert_eq!(request.event, VisitEvent::Start);
        assert_eq!(request.expected_version, None);
    }

    #[test]
    fn test_only_the_stage_owner_advances_a_stage() {
        assert_eq!(event_roles(VisitStage::Pharmacy, &VisitEvent::Start), &[UserRole::Pharmacist]);
        assert!(event_roles(VisitStage::Pharmacy, &VisitEvent::Cancel).contains(&UserRole::Doctor));
        assert!(stage_roles(VisitStage::Discharged).is_empty());
    }
}
