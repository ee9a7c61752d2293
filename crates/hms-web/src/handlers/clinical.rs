//! 药房与检验接口

use super::{created, PageParams};
use crate::auth::CurrentUser;
use crate::error::{ApiJson, ApiResult};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Json},
};
use hms_core::{LabResult, LabTest, Medication, Page, Prescription, UserRole, VisitStage};
use hms_database::{
    DispenseReceipt, LabTestFilter, LabUpdate, NewLabTest, NewMedication, NewPrescription, PrescriptionFilter,
};
use hms_integration::Notification;
use hms_workflow::stage_room;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

const STOCK_KEEPERS: &[UserRole] = &[UserRole::Pharmacist];
const LAB_ORDERERS: &[UserRole] = &[UserRole::Doctor, UserRole::Nurse];

// ========== 药品 ==========

#[derive(Debug, Deserialize)]
pub struct MedicationQuery {
    pub search: Option<String>,
}

pub async fn list_medications(
    State(state): State<AppState>,
    Query(query): Query<MedicationQuery>,
) -> ApiResult<Json<Vec<Medication>>> {
    Ok(Json(state.queries().list_medications(query.search.as_deref()).await?))
}

pub async fn low_stock_medications(State(state): State<AppState>) -> ApiResult<Json<Vec<Medication>>> {
    Ok(Json(state.queries().low_stock_medications().await?))
}

pub async fn create_medication(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiJson(medication): ApiJson<NewMedication>,
) -> ApiResult<impl IntoResponse> {
    user.require_any(STOCK_KEEPERS)?;
    let medication = state.queries().create_medication(&medication).await?;
    state.audit(Some(user.id), "create", "medication", Some(medication.id)).await;
    Ok(created(medication))
}

pub async fn get_medication(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Medication>> {
    Ok(Json(state.queries().get_medication(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct RestockRequest {
    pub quantity: i64,
}

pub async fn restock_medication(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    ApiJson(request): ApiJson<RestockRequest>,
) -> ApiResult<Json<Medication>> {
    user.require_any(STOCK_KEEPERS)?;
    let medication = state.queries().restock_medication(id, request.quantity).await?;
    info!("Restocked {} by {} to {}", medication.name, request.quantity, medication.stock_quantity);
    state.audit(Some(user.id), "restock", "medication", Some(id)).await;
    Ok(Json(medication))
}

// ========== 处方 ==========

pub async fn list_prescriptions(
    State(state): State<AppState>,
    Query(filter): Query<PrescriptionFilter>,
    Query(page): Query<PageParams>,
) -> ApiResult<Json<Page<Prescription>>> {
    Ok(Json(state.queries().list_prescriptions(&filter, page.into()).await?))
}

pub async fn create_prescription(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiJson(mut prescription): ApiJson<NewPrescription>,
) -> ApiResult<impl IntoResponse> {
    user.require_any(&[UserRole::Doctor])?;
    prescription.doctor_id = prescription.doctor_id.or(Some(user.id));

    let prescription = state.queries().create_prescription(&prescription).await?;
    state.hub.publish(Notification::new(
        "prescription.created",
        stage_room(VisitStage::Pharmacy),
        json!({
            "prescription_id": prescription.id,
            "patient_id": prescription.patient_id,
            "visit_id": prescription.visit_id,
            "items": prescription.items.len(),
        }),
    ));
    state.audit(Some(user.id), "create", "prescription", Some(prescription.id)).await;
    Ok(created(prescription))
}

pub async fn get_prescription(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Prescription>> {
    Ok(Json(state.queries().get_prescription(id).await?))
}

pub async fn cancel_prescription(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Prescription>> {
    user.require_any(&[UserRole::Doctor, UserRole::Pharmacist])?;
    let prescription = state.queries().cancel_prescription(id).await?;
    state.audit(Some(user.id), "cancel", "prescription", Some(id)).await;
    Ok(Json(prescription))
}

/// 发出处方中的一项药品
pub async fn dispense_item(
    State(state): State<AppState>,
    user: CurrentUser,
    Path((prescription_id, item_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<DispenseReceipt>> {
    user.require_any(STOCK_KEEPERS)?;
    let receipt = state
        .queries()
        .dispense_item(prescription_id, item_id, Some(user.id))
        .await?;

    if let Some(transition) = &receipt.visit {
        state.visit_transitioned(transition);
    }
    if receipt.medication.needs_reorder() {
        warn!(
            "Medication {} is at {} units, reorder level {}",
            receipt.medication.name, receipt.medication.stock_quantity, receipt.medication.reorder_level
        );
        state.hub.publish(Notification::new(
            "medication.low_stock",
            stage_room(VisitStage::Pharmacy),
            json!({
                "medication_id": receipt.medication.id,
                "name": receipt.medication.name,
                "stock_quantity": receipt.medication.stock_quantity,
            }),
        ));
    }
    state
        .audit(Some(user.id), "dispense", "prescription", Some(prescription_id))
        .await;
    Ok(Json(receipt))
}

// ========== 检验 ==========

fn lab_changed(state: &AppState, event: &str, update: &LabUpdate) {
    if let Some(transition) = &update.visit {
        state.visit_transitioned(transition);
    }
    let room = match event {
        "lab.results_ready" => stage_room(update.test.ordered_from.unwrap_or(VisitStage::Doctor)),
        _ => stage_room(VisitStage::Lab),
    };
    state.hub.publish(Notification::new(
        event,
        room,
        json!({
            "lab_test_id": update.test.id,
            "patient_id": update.test.patient_id,
            "visit_id": update.test.visit_id,
            "test_name": update.test.test_name,
            "status": update.test.status,
            "priority": update.test.priority,
            "critical": update.test.has_critical_result(),
        }),
    ));
}

pub async fn list_lab_tests(
    State(state): State<AppState>,
    Query(filter): Query<LabTestFilter>,
    Query(page): Query<PageParams>,
) -> ApiResult<Json<Page<LabTest>>> {
    Ok(Json(state.queries().list_lab_tests(&filter, page.into()).await?))
}

pub async fn order_lab_test(
    State(state): State<AppState>,
    user: CurrentUser,
    ApiJson(mut order): ApiJson<NewLabTest>,
) -> ApiResult<impl IntoResponse> {
    user.require_any(LAB_ORDERERS)?;
    order.ordered_by = order.ordered_by.or(Some(user.id));

    let update = state.queries().order_lab_test(&order).await?;
    lab_changed(&state, "lab.ordered", &update);
    state.audit(Some(user.id), "order", "lab_test", Some(update.test.id)).await;
    Ok(created(update))
}

pub async fn get_lab_test(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<LabTest>> {
    Ok(Json(state.queries().get_lab_test(id).await?))
}

pub async fn start_lab_test(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<LabTest>> {
    user.require_any(&[UserRole::LabTechnician])?;
    let test = state.queries().start_lab_test(id).await?;
    state.audit(Some(user.id), "start", "lab_test", Some(id)).await;
    Ok(Json(test))
}

#[derive(Debug, Deserialize)]
pub struct ResultsRequest {
    pub results: Vec<LabResult>,
}

pub async fn record_lab_results(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    ApiJson(request): ApiJson<ResultsRequest>,
) -> ApiResult<Json<LabUpdate>> {
    user.require_any(&[UserRole::LabTechnician])?;
    let update = state.queries().record_lab_results(id, &request.results).await?;
    lab_changed(&state, "lab.results_ready", &update);
    state.audit(Some(user.id), "record_results", "lab_test", Some(id)).await;
    Ok(Json(update))
}

pub async fn cancel_lab_test(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<LabUpdate>> {
    user.require_any(&[UserRole::Doctor, UserRole::Nurse, UserRole::LabTechnician])?;
    let update = state.queries().cancel_lab_test(id).await?;
    lab_changed(&state, "lab.cancelled", &update);
    state.audit(Some(user.id), "cancel", "lab_test", Some(id)).await;
    Ok(Json(update))
}
