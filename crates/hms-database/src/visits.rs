//! 就诊与预约查询
//!
//! 就诊状态只通过工作流引擎生成的转换计划修改，写入时以 `version` 做乐观锁。

use crate::models::*;
use crate::queries::DatabaseQueries;
use chrono::{DateTime, Duration, Utc};
use hms_core::utils::{generate_reference, non_empty};
use hms_core::{
    Appointment, AppointmentStatus, HmsError, Page, PageRequest, PatientVisit, Result, StageStatus,
    VisitStage, VisitState,
};
use hms_workflow::appointment::{self, AppointmentEvent, AppointmentStateMachine, MAX_DURATION_MINUTES};
use hms_workflow::worklist::{QueueEntry, StageQueue};
use hms_workflow::{TransitionPlan, VisitEvent, WorkflowEffect, WorkflowEngine};
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::sync::OnceLock;
use uuid::Uuid;

/// 全局工作流引擎，转换表只构建一次
pub fn engine() -> &'static WorkflowEngine {
    static ENGINE: OnceLock<WorkflowEngine> = OnceLock::new();
    ENGINE.get_or_init(WorkflowEngine::new)
}

/// 已提交的就诊状态转换
#[derive(Debug, Clone, Serialize)]
pub struct VisitTransition {
    pub visit: PatientVisit,
    pub plan: TransitionPlan,
}

pub(crate) async fn fetch_visit(conn: &mut SqliteConnection, id: Uuid) -> Result<PatientVisit> {
    sqlx::query_as::<_, DbVisit>("SELECT * FROM patient_visits WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| HmsError::not_found("visit", id))
        .and_then(PatientVisit::try_from)
}

/// 写入转换计划并执行附带的数据库副作用
///
/// 以读取时的版本号为条件更新，期间被他人修改则返回冲突。
pub(crate) async fn store_transition(
    conn: &mut SqliteConnection,
    visit: &PatientVisit,
    plan: &TransitionPlan,
) -> Result<PatientVisit> {
    let now = Utc::now();
    let next = &plan.next;
    let completed_at = if plan.completes_visit() { Some(now) } else { visit.completed_at };

    let result = sqlx::query(
        r#"
        UPDATE patient_visits SET
            reception_status = ?, nurse_status = ?, doctor_status = ?, lab_status = ?,
            pharmacy_status = ?, billing_status = ?, current_stage = ?, overall_status = ?,
            lab_return_stage = ?, version = version + 1, updated_at = ?, completed_at = ?
        WHERE id = ? AND version = ?
        "#,
    )
    .bind(next.reception_status.as_str())
    .bind(next.nurse_status.as_str())
    .bind(next.doctor_status.as_str())
    .bind(next.lab_status.as_str())
    .bind(next.pharmacy_status.as_str())
    .bind(next.billing_status.as_str())
    .bind(next.current_stage.as_str())
    .bind(next.overall_status.as_str())
    .bind(next.lab_return_stage.map(|s| s.as_str()))
    .bind(now)
    .bind(completed_at)
    .bind(visit.id)
    .bind(visit.version)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        tracing::warn!("Visit {} changed concurrently, {} rejected", visit.id, plan.event.name());
        return Err(HmsError::Conflict(format!(
            "visit {} was modified concurrently, reload and retry",
            visit.visit_number
        )));
    }

    for effect in &plan.effects {
        let target = match effect {
            WorkflowEffect::CompleteAppointment => AppointmentStatus::Completed,
            WorkflowEffect::CancelAppointment => AppointmentStatus::Cancelled,
            _ => continue,
        };
        sqlx::query("UPDATE appointments SET status = ?, updated_at = ? WHERE visit_id = ? AND status = 'in_progress'")
            .bind(target.as_str())
            .bind(now)
            .bind(visit.id)
            .execute(&mut *conn)
            .await?;
    }

    Ok(PatientVisit {
        state: *next,
        version: visit.version + 1,
        updated_at: now,
        completed_at,
        ..visit.clone()
    })
}

/// 手动结束阶段前检查该阶段是否还有未了结的业务
async fn outstanding_work(conn: &mut SqliteConnection, visit_id: Uuid, event: VisitEvent) -> Result<Option<String>> {
    let (sql, what) = match event {
        VisitEvent::CompleteBilling => (
            "SELECT COUNT(*) FROM invoices WHERE visit_id = ? AND status <> 'cancelled' AND paid_amount < total_amount",
            "unpaid invoices",
        ),
        VisitEvent::CompleteLab => (
            "SELECT COUNT(*) FROM lab_tests WHERE visit_id = ? AND status IN ('ordered', 'in_progress')",
            "open lab tests",
        ),
        VisitEvent::CompleteDispensing => (
            r#"
            SELECT COUNT(*) FROM prescription_items i
            JOIN prescriptions p ON p.id = i.prescription_id
            WHERE p.visit_id = ? AND p.status <> 'cancelled' AND i.dispensed = 0
            "#,
            "undispensed prescription items",
        ),
        _ => return Ok(None),
    };

    let open: i64 = sqlx::query_scalar(sql).bind(visit_id).fetch_one(&mut *conn).await?;
    Ok((open > 0).then(|| format!("visit still has {} {}", open, what)))
}

/// 在事务内按业务事件推进就诊（付款、发药、化验之后）
pub(crate) async fn advance_visit<F>(
    conn: &mut SqliteConnection,
    visit_id: Uuid,
    decide: F,
) -> Result<Option<VisitTransition>>
where
    F: FnOnce(&WorkflowEngine, &VisitState) -> Option<VisitEvent>,
{
    let visit = fetch_visit(conn, visit_id).await?;
    let Some(event) = decide(engine(), &visit.state) else {
        return Ok(None);
    };

    let plan = engine().plan_visit_transition(&visit.state, event)?;
    let visit = store_transition(conn, &visit, &plan).await?;
    Ok(Some(VisitTransition { visit, plan }))
}

async fn insert_visit(conn: &mut SqliteConnection, visit: &NewVisit) -> Result<PatientVisit> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    let state = VisitState::initial();

    let inserted = sqlx::query(
        r#"
        INSERT INTO patient_visits (id, visit_number, patient_id, appointment_id, department_id, chief_complaint,
            reception_status, nurse_status, doctor_status, lab_status, pharmacy_status, billing_status,
            current_stage, overall_status, lab_return_stage, version, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, 0, ?, ?)
        "#,
    )
    .bind(id)
    .bind(generate_reference("VIS"))
    .bind(visit.patient_id)
    .bind(visit.appointment_id)
    .bind(visit.department_id)
    .bind(non_empty(visit.chief_complaint.clone()))
    .bind(state.reception_status.as_str())
    .bind(state.nurse_status.as_str())
    .bind(state.doctor_status.as_str())
    .bind(state.lab_status.as_str())
    .bind(state.pharmacy_status.as_str())
    .bind(state.billing_status.as_str())
    .bind(state.current_stage.as_str())
    .bind(state.overall_status.as_str())
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await;

    match inserted {
        Ok(_) => {}
        Err(e) => {
            return Err(match HmsError::from(e) {
                HmsError::Conflict(_) => HmsError::Conflict(format!(
                    "patient {} already has an active visit",
                    visit.patient_id
                )),
                other => other,
            })
        }
    }

    tracing::info!("Opened visit {} for patient {}", id, visit.patient_id);
    fetch_visit(conn, id).await
}

impl<'a> DatabaseQueries<'a> {
    // ========== 就诊 ==========

    /// 登记新就诊，同一患者只能有一个进行中的就诊
    pub async fn create_visit(&self, visit: &NewVisit) -> Result<PatientVisit> {
        let mut tx = self.pool().pool().begin().await?;
        let created = insert_visit(&mut tx, visit).await?;
        tx.commit().await?;
        Ok(created)
    }

    pub async fn get_visit(&self, id: Uuid) -> Result<PatientVisit> {
        let mut conn = self.pool().pool().acquire().await?;
        fetch_visit(&mut conn, id).await
    }

    pub async fn active_visit_for_patient(&self, patient_id: Uuid) -> Result<Option<PatientVisit>> {
        sqlx::query_as::<_, DbVisit>(
            "SELECT * FROM patient_visits WHERE patient_id = ? AND overall_status = 'active'",
        )
        .bind(patient_id)
        .fetch_optional(self.pool().pool())
        .await?
        .map(PatientVisit::try_from)
        .transpose()
    }

    pub async fn list_visits(&self, filter: &VisitFilter, page: PageRequest) -> Result<Page<PatientVisit>> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM patient_visits WHERE 1 = 1");
        push_visit_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(self.pool().pool()).await?;

        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM patient_visits WHERE 1 = 1");
        push_visit_filter(&mut query, filter);
        query
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(page.limit())
            .push(" OFFSET ")
            .push_bind(page.offset());

        let rows: Vec<DbVisit> = query.build_query_as().fetch_all(self.pool().pool()).await?;
        let items = rows
            .into_iter()
            .map(PatientVisit::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page::new(items, total, page))
    }

    /// 执行一次就诊状态转换
    ///
    /// `expected_version` 由客户端提供时，与当前版本不一致直接返回冲突。
    pub async fn transition_visit(
        &self,
        id: Uuid,
        event: VisitEvent,
        expected_version: Option<i64>,
    ) -> Result<VisitTransition> {
        let visit = self.get_visit(id).await?;
        if let Some(expected) = expected_version {
            if expected != visit.version {
                return Err(HmsError::Conflict(format!(
                    "visit version is {}, expected {}",
                    visit.version, expected
                )));
            }
        }

        let plan = engine().plan_visit_transition(&visit.state, event).map_err(|e| {
            tracing::warn!("Rejected {} on visit {}: {}", event.name(), visit.visit_number, e);
            e
        })?;

        // 先写入取得写锁，再在同一事务内核对业务数据，不满足时整体回滚
        let mut tx = self.pool().pool().begin().await?;
        let visit = store_transition(&mut tx, &visit, &plan).await?;
        if let Some(reason) = outstanding_work(&mut tx, visit.id, event).await? {
            tracing::warn!("Rejected {} on visit {}: {}", event.name(), visit.visit_number, reason);
            return Err(HmsError::Conflict(reason));
        }
        tx.commit().await?;

        tracing::info!(
            "Visit {} {} -> {} via {}",
            visit.visit_number,
            plan.previous.current_stage,
            plan.next.current_stage,
            event.name()
        );
        Ok(VisitTransition { visit, plan })
    }

    /// 科室工作队列，包含在本科室排队、处理中以及等待化验返回的就诊
    pub async fn stage_queue(&self, stage: VisitStage) -> Result<StageQueue> {
        if stage == VisitStage::Discharged {
            return Err(HmsError::Validation("discharged visits have no queue".to_string()));
        }
        let column = format!("{}_status", stage.as_str());

        let sql = format!(
            r#"
            SELECT v.id AS visit_id, v.visit_number, v.patient_id, p.first_name, p.last_name,
                   v.chief_complaint, v.{column} AS stage_status, v.updated_at
            FROM patient_visits v
            JOIN patients p ON p.id = v.patient_id
            WHERE v.overall_status = 'active'
              AND (v.current_stage = ? OR v.{column} = 'on_hold')
            "#
        );

        let rows = sqlx::query_as::<_, DbQueueRow>(&sql)
            .bind(stage.as_str())
            .fetch_all(self.pool().pool())
            .await?;

        let entries = rows
            .into_iter()
            .map(|row| {
                Ok(QueueEntry {
                    visit_id: row.visit_id,
                    visit_number: row.visit_number,
                    patient_id: row.patient_id,
                    patient_name: format!("{} {}", row.first_name, row.last_name),
                    chief_complaint: row.chief_complaint,
                    status: row.stage_status.parse::<StageStatus>()?,
                    since: row.updated_at,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(StageQueue::build(stage, entries))
    }

    // ========== 预约 ==========

    pub async fn create_appointment(&self, new: &NewAppointment) -> Result<Appointment> {
        appointment::validate_schedule(new.scheduled_at, new.duration_minutes, Utc::now())?;
        if let Some(doctor_id) = new.doctor_id {
            self.ensure_doctor_free(doctor_id, new.scheduled_at, new.duration_minutes, None)
                .await?;
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO appointments (id, patient_id, doctor_id, department_id, scheduled_at, duration_minutes,
                reason, notes, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(new.patient_id)
        .bind(new.doctor_id)
        .bind(new.department_id)
        .bind(new.scheduled_at)
        .bind(new.duration_minutes)
        .bind(non_empty(new.reason.clone()))
        .bind(non_empty(new.notes.clone()))
        .bind(AppointmentStatus::Scheduled.as_str())
        .bind(now)
        .bind(now)
        .execute(self.pool().pool())
        .await?;

        tracing::info!("Scheduled appointment {} for patient {}", id, new.patient_id);
        self.get_appointment(id).await
    }

    pub async fn get_appointment(&self, id: Uuid) -> Result<Appointment> {
        sqlx::query_as::<_, DbAppointment>("SELECT * FROM appointments WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool().pool())
            .await?
            .ok_or_else(|| HmsError::not_found("appointment", id))
            .and_then(Appointment::try_from)
    }

    pub async fn list_appointments(
        &self,
        filter: &AppointmentFilter,
        page: PageRequest,
    ) -> Result<Page<Appointment>> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM appointments WHERE 1 = 1");
        push_appointment_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(self.pool().pool()).await?;

        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM appointments WHERE 1 = 1");
        push_appointment_filter(&mut query, filter);
        query
            .push(" ORDER BY scheduled_at ASC LIMIT ")
            .push_bind(page.limit())
            .push(" OFFSET ")
            .push_bind(page.offset());

        let rows: Vec<DbAppointment> = query.build_query_as().fetch_all(self.pool().pool()).await?;
        let items = rows
            .into_iter()
            .map(Appointment::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Page::new(items, total, page))
    }

    /// 改期或修改预约信息，仅限尚未开始的预约
    pub async fn update_appointment(&self, id: Uuid, update: &UpdateAppointment) -> Result<Appointment> {
        let current = self.get_appointment(id).await?;
        if !matches!(current.status, AppointmentStatus::Scheduled | AppointmentStatus::Confirmed) {
            return Err(HmsError::Conflict(format!(
                "appointment in status {} can no longer be changed",
                current.status
            )));
        }

        let scheduled_at = update.scheduled_at.unwrap_or(current.scheduled_at);
        let duration = update.duration_minutes.unwrap_or(current.duration_minutes);
        let doctor_id = update.doctor_id.or(current.doctor_id);
        if update.scheduled_at.is_some() || update.duration_minutes.is_some() {
            appointment::validate_schedule(scheduled_at, duration, Utc::now())?;
        }
        if let Some(doctor_id) = doctor_id {
            self.ensure_doctor_free(doctor_id, scheduled_at, duration, Some(id)).await?;
        }

        let result = sqlx::query(
            r#"
            UPDATE appointments SET
                doctor_id = ?, department_id = COALESCE(?, department_id), scheduled_at = ?,
                duration_minutes = ?, reason = COALESCE(?, reason), notes = COALESCE(?, notes), updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(doctor_id)
        .bind(update.department_id)
        .bind(scheduled_at)
        .bind(duration)
        .bind(non_empty(update.reason.clone()))
        .bind(non_empty(update.notes.clone()))
        .bind(Utc::now())
        .bind(id)
        .bind(current.status.as_str())
        .execute(self.pool().pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(HmsError::Conflict("appointment was modified concurrently".to_string()));
        }
        self.get_appointment(id).await
    }

    /// 按目标状态变更预约，签到会同时创建就诊
    pub async fn update_appointment_status(
        &self,
        id: Uuid,
        target: AppointmentStatus,
    ) -> Result<(Appointment, Option<PatientVisit>)> {
        let event = AppointmentStateMachine::event_for_target(target)?;
        if event == AppointmentEvent::CheckIn {
            let (appointment, visit) = self.check_in_appointment(id, None).await?;
            return Ok((appointment, Some(visit)));
        }

        let current = self.get_appointment(id).await?;
        let next = engine().plan_appointment(current.status, event)?;

        let result = sqlx::query("UPDATE appointments SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
            .bind(next.as_str())
            .bind(Utc::now())
            .bind(id)
            .bind(current.status.as_str())
            .execute(self.pool().pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(HmsError::Conflict("appointment was modified concurrently".to_string()));
        }

        tracing::info!("Appointment {} {} -> {}", id, current.status, next);
        Ok((self.get_appointment(id).await?, None))
    }

    /// 预约签到：预约进入就诊中并创建关联就诊，两者在同一事务中提交
    pub async fn check_in_appointment(
        &self,
        id: Uuid,
        chief_complaint: Option<String>,
    ) -> Result<(Appointment, PatientVisit)> {
        let mut tx = self.pool().pool().begin().await?;

        let claimed = sqlx::query(
            "UPDATE appointments SET status = 'in_progress', updated_at = ? WHERE id = ? AND status IN ('scheduled', 'confirmed')",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            drop(tx);
            let current = self.get_appointment(id).await?;
            // 由状态机给出拒绝原因
            engine().plan_appointment(current.status, AppointmentEvent::CheckIn)?;
            return Err(HmsError::Conflict("appointment was modified concurrently".to_string()));
        }

        let row = sqlx::query_as::<_, DbAppointment>("SELECT * FROM appointments WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

        let visit = insert_visit(
            &mut tx,
            &NewVisit {
                patient_id: row.patient_id,
                appointment_id: Some(id),
                department_id: row.department_id,
                chief_complaint: chief_complaint.or_else(|| row.reason.clone()),
            },
        )
        .await?;

        sqlx::query("UPDATE appointments SET visit_id = ? WHERE id = ?")
            .bind(visit.id)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::info!("Appointment {} checked in as visit {}", id, visit.visit_number);
        Ok((self.get_appointment(id).await?, visit))
    }

    async fn ensure_doctor_free(
        &self,
        doctor_id: Uuid,
        start: DateTime<Utc>,
        duration_minutes: i32,
        exclude: Option<Uuid>,
    ) -> Result<()> {
        let window_start = start - Duration::minutes(MAX_DURATION_MINUTES as i64);
        let window_end = start + Duration::minutes(duration_minutes as i64);

        let rows = sqlx::query_as::<_, DbAppointment>(
            "SELECT * FROM appointments WHERE doctor_id = ? AND scheduled_at >= ? AND scheduled_at < ?",
        )
        .bind(doctor_id)
        .bind(window_start)
        .bind(window_end)
        .fetch_all(self.pool().pool())
        .await?;

        for row in rows {
            let other = Appointment::try_from(row)?;
            if Some(other.id) == exclude || !appointment::blocks_schedule(other.status) {
                continue;
            }
            if appointment::overlaps(start, duration_minutes, other.scheduled_at, other.duration_minutes) {
                return Err(HmsError::Conflict(format!(
                    "doctor already has appointment {} at {}",
                    other.id, other.scheduled_at
                )));
            }
        }
        Ok(())
    }
}

fn push_visit_filter<'q>(query: &mut QueryBuilder<'q, Sqlite>, filter: &VisitFilter) {
    if let Some(patient_id) = filter.patient_id {
        query.push(" AND patient_id = ").push_bind(patient_id);
    }
    if let Some(stage) = filter.stage {
        query.push(" AND current_stage = ").push_bind(stage.as_str());
    }
    if let Some(status) = filter.overall_status {
        query.push(" AND overall_status = ").push_bind(status.as_str());
    }
}

fn push_appointment_filter<'q>(query: &mut QueryBuilder<'q, Sqlite>, filter: &AppointmentFilter) {
    if let Some(patient_id) = filter.patient_id {
        query.push(" AND patient_id = ").push_bind(patient_id);
    }
    if let Some(doctor_id) = filter.doctor_id {
        query.push(" AND doctor_id = ").push_bind(doctor_id);
    }
    if let Some(status) = filter.status {
        query.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(date) = filter.date {
        query.push(" AND date(scheduled_at) = ").push_bind(date);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::test_support::*;
    use hms_core::OverallStatus;

    #[tokio::test]
    async fn test_one_active_visit_per_patient() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);
        let patient = patient(&db, "Juma").await;

        let new_visit = NewVisit {
            patient_id: patient.id,
            appointment_id: None,
            department_id: None,
            chief_complaint: Some("fever".to_string()),
        };
        let visit = db.create_visit(&new_visit).await.unwrap();
        assert_eq!(visit.state, VisitState::initial());

        let err = db.create_visit(&new_visit).await.unwrap_err();
        assert!(matches!(err, HmsError::Conflict(_)));

        // 取消后可以重新登记
        db.transition_visit(visit.id, VisitEvent::Cancel, None).await.unwrap();
        assert!(db.create_visit(&new_visit).await.is_ok());
    }

    #[tokio::test]
    async fn test_transition_persists_and_bumps_version() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);
        let patient = patient(&db, "Neema").await;
        let visit = db
            .create_visit(&NewVisit {
                patient_id: patient.id,
                appointment_id: None,
                department_id: None,
                chief_complaint: None,
            })
            .await
            .unwrap();

        let done = db
            .transition_visit(visit.id, VisitEvent::CompleteReception, Some(0))
            .await
            .unwrap();
        assert_eq!(done.visit.version, 1);
        assert_eq!(done.plan.next.current_stage, VisitStage::Nurse);

        let reloaded = db.get_visit(visit.id).await.unwrap();
        assert_eq!(reloaded.state.current_stage, VisitStage::Nurse);
        assert_eq!(reloaded.state.nurse_status, StageStatus::Pending);

        // 过期版本号
        let err = db
            .transition_visit(visit.id, VisitEvent::Start, Some(0))
            .await
            .unwrap_err();
        assert!(matches!(err, HmsError::Conflict(_)));

        // 乱序事件
        let err = db
            .transition_visit(visit.id, VisitEvent::CompleteBilling, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HmsError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_stage_queue_separates_pending_and_in_progress() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);

        let mut ids = Vec::new();
        for name in ["A", "B", "C"] {
            let patient = patient(&db, name).await;
            let visit = db
                .create_visit(&NewVisit {
                    patient_id: patient.id,
                    appointment_id: None,
                    department_id: None,
                    chief_complaint: None,
                })
                .await
                .unwrap();
            ids.push(visit.id);
        }
        db.transition_visit(ids[0], VisitEvent::Start, None).await.unwrap();

        let queue = db.stage_queue(VisitStage::Reception).await.unwrap();
        assert_eq!(queue.waiting.len(), 2);
        assert_eq!(queue.in_progress.len(), 1);
        assert_eq!(queue.in_progress[0].visit_id, ids[0]);

        // 护士开化验单后，就诊出现在护士队列的等待化验部分
        db.transition_visit(ids[1], VisitEvent::CompleteReception, None).await.unwrap();
        db.transition_visit(ids[1], VisitEvent::OrderLab, None).await.unwrap();
        let nurse = db.stage_queue(VisitStage::Nurse).await.unwrap();
        assert_eq!(nurse.on_hold.len(), 1);
        assert!(nurse.waiting.is_empty());
        let lab = db.stage_queue(VisitStage::Lab).await.unwrap();
        assert_eq!(lab.waiting.len(), 1);
    }

    #[tokio::test]
    async fn test_appointment_check_in_and_completion() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);
        let patient = patient(&db, "Rehema").await;

        let appointment = db
            .create_appointment(&NewAppointment {
                patient_id: patient.id,
                doctor_id: None,
                department_id: None,
                scheduled_at: Utc::now() + Duration::hours(2),
                duration_minutes: 30,
                reason: Some("follow-up".to_string()),
                notes: None,
            })
            .await
            .unwrap();

        let (confirmed, _) = db
            .update_appointment_status(appointment.id, AppointmentStatus::Confirmed)
            .await
            .unwrap();
        assert_eq!(confirmed.status, AppointmentStatus::Confirmed);

        let (checked_in, visit) = db.check_in_appointment(appointment.id, None).await.unwrap();
        assert_eq!(checked_in.status, AppointmentStatus::InProgress);
        assert_eq!(checked_in.visit_id, Some(visit.id));
        assert_eq!(visit.chief_complaint.as_deref(), Some("follow-up"));

        // 重复签到被拒绝
        assert!(db.check_in_appointment(appointment.id, None).await.is_err());

        for event in [
            VisitEvent::CompleteReception,
            VisitEvent::CompleteTriage,
            VisitEvent::CompleteConsultation { prescribed: false },
            VisitEvent::CompleteBilling,
        ] {
            db.transition_visit(visit.id, event, None).await.unwrap();
        }

        let visit = db.get_visit(visit.id).await.unwrap();
        assert_eq!(visit.state.overall_status, OverallStatus::Completed);
        assert!(visit.completed_at.is_some());
        let appointment = db.get_appointment(appointment.id).await.unwrap();
        assert_eq!(appointment.status, AppointmentStatus::Completed);
    }

    async fn visit_through(db: &DatabaseQueries<'_>, name: &str, events: &[VisitEvent]) -> PatientVisit {
        let patient = patient(db, name).await;
        let visit = db
            .create_visit(&NewVisit {
                patient_id: patient.id,
                appointment_id: None,
                department_id: None,
                chief_complaint: None,
            })
            .await
            .unwrap();
        for event in events {
            db.transition_visit(visit.id, *event, None).await.unwrap();
        }
        db.get_visit(visit.id).await.unwrap()
    }

    #[tokio::test]
    async fn test_billing_cannot_close_with_unpaid_invoice() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);
        let visit = visit_through(
            &db,
            "Mosi",
            &[
                VisitEvent::CompleteReception,
                VisitEvent::CompleteTriage,
                VisitEvent::CompleteConsultation { prescribed: false },
            ],
        )
        .await;

        let invoice = db
            .create_invoice(&NewInvoice {
                patient_id: visit.patient_id,
                visit_id: Some(visit.id),
                items: vec![NewInvoiceItem {
                    description: Some("Consultation".to_string()),
                    service_id: None,
                    medication_id: None,
                    quantity: 1,
                    unit_price: Some("40.00".parse().unwrap()),
                }],
            })
            .await
            .unwrap();

        let err = db
            .transition_visit(visit.id, VisitEvent::CompleteBilling, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HmsError::Conflict(_)));

        // 回滚后状态和版本都不变
        let unchanged = db.get_visit(visit.id).await.unwrap();
        assert_eq!(unchanged.version, visit.version);
        assert_eq!(unchanged.state.current_stage, VisitStage::Billing);
        assert_eq!(unchanged.state.overall_status, OverallStatus::Active);

        let receipt = db
            .apply_payment(
                invoice.id,
                &NewPayment {
                    amount: "40.00".parse().unwrap(),
                    method: hms_core::PaymentMethod::Cash,
                    reference_number: None,
                    received_by: None,
                    notes: None,
                },
            )
            .await
            .unwrap();
        let settled = receipt.visit.unwrap().visit;
        assert_eq!(settled.state.overall_status, OverallStatus::Completed);
    }

    #[tokio::test]
    async fn test_lab_and_pharmacy_cannot_close_with_open_work() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);

        let at_nurse = visit_through(&db, "Amani", &[VisitEvent::CompleteReception]).await;
        let ordered = db
            .order_lab_test(&NewLabTest {
                patient_id: at_nurse.patient_id,
                visit_id: Some(at_nurse.id),
                test_name: "Malaria RDT".to_string(),
                test_code: None,
                ordered_by: None,
                priority: None,
                notes: None,
            })
            .await
            .unwrap();
        assert_eq!(ordered.visit.unwrap().visit.state.current_stage, VisitStage::Lab);
        let err = db
            .transition_visit(at_nurse.id, VisitEvent::CompleteLab, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HmsError::Conflict(_)));
        assert_eq!(db.get_visit(at_nurse.id).await.unwrap().state.current_stage, VisitStage::Lab);

        let at_pharmacy = visit_through(
            &db,
            "Zuhura",
            &[
                VisitEvent::CompleteReception,
                VisitEvent::CompleteTriage,
                VisitEvent::CompleteConsultation { prescribed: true },
            ],
        )
        .await;
        let medication = db
            .create_medication(&NewMedication {
                name: "Paracetamol".to_string(),
                generic_name: None,
                form: None,
                strength: None,
                unit_price: hms_core::Money::from_major(1),
                stock_quantity: 20,
                reorder_level: 5,
            })
            .await
            .unwrap();
        db.create_prescription(&NewPrescription {
            patient_id: at_pharmacy.patient_id,
            visit_id: Some(at_pharmacy.id),
            doctor_id: None,
            notes: None,
            items: vec![NewPrescriptionItem {
                medication_id: medication.id,
                dosage: "500mg".to_string(),
                frequency: "3x daily".to_string(),
                duration_days: 3,
                quantity: 9,
                instructions: None,
            }],
        })
        .await
        .unwrap();
        let err = db
            .transition_visit(at_pharmacy.id, VisitEvent::CompleteDispensing, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HmsError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_cancelling_visit_cancels_checked_in_appointment() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);
        let patient = patient(&db, "Subira").await;
        let appointment = db
            .create_appointment(&NewAppointment {
                patient_id: patient.id,
                doctor_id: None,
                department_id: None,
                scheduled_at: Utc::now() + Duration::hours(1),
                duration_minutes: 20,
                reason: None,
                notes: None,
            })
            .await
            .unwrap();
        let (_, visit) = db.check_in_appointment(appointment.id, None).await.unwrap();

        let cancelled = db.transition_visit(visit.id, VisitEvent::Cancel, None).await.unwrap();
        assert_eq!(cancelled.visit.state.overall_status, OverallStatus::Cancelled);
        let appointment = db.get_appointment(appointment.id).await.unwrap();
        assert_eq!(appointment.status, AppointmentStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_doctor_double_booking_rejected() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);
        let patient = patient(&db, "Baraka").await;
        let doctor = db
            .create_user(&NewUser {
                username: "dr.mwita".to_string(),
                email: "mwita@example.com".to_string(),
                full_name: "Dr Mwita".to_string(),
                password_hash: "x".to_string(),
                role: hms_core::UserRole::Doctor,
                department_id: None,
            })
            .await
            .unwrap();

        let at = Utc::now() + Duration::days(1);
        let new = NewAppointment {
            patient_id: patient.id,
            doctor_id: Some(doctor.id),
            department_id: None,
            scheduled_at: at,
            duration_minutes: 30,
            reason: None,
            notes: None,
        };
        let first = db.create_appointment(&new).await.unwrap();

        let clash = NewAppointment {
            scheduled_at: at + Duration::minutes(15),
            ..new.clone()
        };
        assert!(matches!(db.create_appointment(&clash).await, Err(HmsError::Conflict(_))));

        // 取消后时间段释放
        db.update_appointment_status(first.id, AppointmentStatus::Cancelled)
            .await
            .unwrap();
        assert!(db.create_appointment(&clash).await.is_ok());
    }
}
