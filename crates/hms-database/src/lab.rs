//! 检验单
//!
//! 从护士或医生阶段开单时就诊转入化验阶段，原阶段挂起；
//! 该就诊的最后一张检验单出结果（或取消）后就诊回到原阶段。

use crate::models::*;
use crate::queries::DatabaseQueries;
use crate::visits::{advance_visit, engine, fetch_visit, store_transition, VisitTransition};
use chrono::Utc;
use hms_core::utils::non_empty;
use hms_core::{HmsError, LabPriority, LabResult, LabTest, LabTestStatus, Page, PageRequest, Result};
use hms_workflow::lab;
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use uuid::Uuid;

/// 检验单变更结果
#[derive(Debug, Clone, Serialize)]
pub struct LabUpdate {
    pub test: LabTest,
    pub visit: Option<VisitTransition>,
}

async fn fetch_lab_test(conn: &mut SqliteConnection, id: Uuid) -> Result<LabTest> {
    sqlx::query_as::<_, DbLabTest>("SELECT * FROM lab_tests WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| HmsError::not_found("lab test", id))
        .and_then(LabTest::try_from)
}

/// 检验单关闭后，就诊没有未完成的检验时结束化验阶段
async fn settle_visit(conn: &mut SqliteConnection, visit_id: Option<Uuid>) -> Result<Option<VisitTransition>> {
    let Some(visit_id) = visit_id else {
        return Ok(None);
    };

    let open_tests = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM lab_tests WHERE visit_id = ? AND status IN ('ordered', 'in_progress')",
    )
    .bind(visit_id)
    .fetch_one(&mut *conn)
    .await?;

    advance_visit(conn, visit_id, |engine, state| engine.event_after_lab_results(state, open_tests)).await
}

impl<'a> DatabaseQueries<'a> {
    /// 开具检验单
    pub async fn order_lab_test(&self, new: &NewLabTest) -> Result<LabUpdate> {
        let test_name = new.test_name.trim();
        if test_name.is_empty() {
            return Err(HmsError::Validation("test_name is required".to_string()));
        }

        // 归属和阶段先在事务外校验，事务内第一条语句必须是写入
        if let Some(visit_id) = new.visit_id {
            let mut conn = self.pool().pool().acquire().await?;
            let visit = fetch_visit(&mut conn, visit_id).await?;
            if visit.patient_id != new.patient_id {
                return Err(HmsError::Validation("visit belongs to a different patient".to_string()));
            }
            engine().event_for_lab_order(&visit.state)?;
        }

        let id = Uuid::new_v4();
        let mut tx = self.pool().pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO lab_tests (id, patient_id, visit_id, test_name, test_code, ordered_by, ordered_from, priority, status, results, notes, ordered_at)
            VALUES (?, ?, ?, ?, ?, ?, NULL, ?, ?, NULL, ?, ?)
            "#,
        )
        .bind(id)
        .bind(new.patient_id)
        .bind(new.visit_id)
        .bind(test_name)
        .bind(non_empty(new.test_code.clone()))
        .bind(new.ordered_by)
        .bind(new.priority.unwrap_or(LabPriority::Routine).as_str())
        .bind(LabTestStatus::Ordered.as_str())
        .bind(non_empty(new.notes.clone()))
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        // 已持有写锁，重新读取就诊确定开单阶段
        let mut transition = None;
        if let Some(visit_id) = new.visit_id {
            let visit = fetch_visit(&mut tx, visit_id).await?;
            let ordered_from = match engine().event_for_lab_order(&visit.state)? {
                Some(event) => {
                    let from = visit.state.current_stage;
                    let plan = engine().plan_visit_transition(&visit.state, event)?;
                    let stored = store_transition(&mut tx, &visit, &plan).await?;
                    transition = Some(VisitTransition { visit: stored, plan });
                    Some(from)
                }
                None => visit.state.lab_return_stage,
            };

            sqlx::query("UPDATE lab_tests SET ordered_from = ? WHERE id = ?")
                .bind(ordered_from.map(|stage| stage.as_str()))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        let test = fetch_lab_test(&mut tx, id).await?;
        tx.commit().await?;

        tracing::info!("Ordered lab test {} ({}) priority {}", test.test_name, id, test.priority);
        Ok(LabUpdate {
            test,
            visit: transition,
        })
    }

    pub async fn get_lab_test(&self, id: Uuid) -> Result<LabTest> {
        let mut conn = self.pool().pool().acquire().await?;
        fetch_lab_test(&mut conn, id).await
    }

    pub async fn list_lab_tests(&self, filter: &LabTestFilter, page: PageRequest) -> Result<Page<LabTest>> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM lab_tests WHERE 1 = 1");
        push_lab_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(self.pool().pool()).await?;

        // 紧急程度优先，其次按开单时间
        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM lab_tests WHERE 1 = 1");
        push_lab_filter(&mut query, filter);
        query
            .push(
                " ORDER BY CASE priority WHEN 'stat' THEN 0 WHEN 'urgent' THEN 1 ELSE 2 END, ordered_at LIMIT ",
            )
            .push_bind(page.limit())
            .push(" OFFSET ")
            .push_bind(page.offset());

        let rows: Vec<DbLabTest> = query.build_query_as().fetch_all(self.pool().pool()).await?;
        let items = rows.into_iter().map(LabTest::try_from).collect::<Result<Vec<_>>>()?;
        Ok(Page::new(items, total, page))
    }

    pub async fn start_lab_test(&self, id: Uuid) -> Result<LabTest> {
        let mut tx = self.pool().pool().begin().await?;
        let started = sqlx::query("UPDATE lab_tests SET status = 'in_progress' WHERE id = ? AND status = 'ordered'")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if started.rows_affected() == 0 {
            let current = fetch_lab_test(&mut tx, id).await?;
            lab::start(current.status)?;
            return Err(HmsError::Conflict("lab test changed while starting".to_string()));
        }

        let test = fetch_lab_test(&mut tx, id).await?;
        tx.commit().await?;
        Ok(test)
    }

    /// 录入结果
    pub async fn record_lab_results(&self, id: Uuid, results: &[LabResult]) -> Result<LabUpdate> {
        lab::validate_results(results)?;
        let encoded = serde_json::to_string(results)?;

        let mut tx = self.pool().pool().begin().await?;
        let now = Utc::now();
        let recorded = sqlx::query(
            r#"
            UPDATE lab_tests SET status = 'completed', results = ?, completed_at = ?
            WHERE id = ? AND status IN ('ordered', 'in_progress')
            "#,
        )
        .bind(&encoded)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let test = fetch_lab_test(&mut tx, id).await?;
        if recorded.rows_affected() == 0 {
            lab::record_results(test.status, results)?;
            return Err(HmsError::Conflict("lab test changed while recording results".to_string()));
        }

        let visit = settle_visit(&mut tx, test.visit_id).await?;
        tx.commit().await?;

        if test.has_critical_result() {
            tracing::warn!("Critical result recorded for lab test {} (patient {})", test.id, test.patient_id);
        }
        tracing::info!("Recorded {} results for lab test {}", results.len(), id);
        Ok(LabUpdate { test, visit })
    }

    pub async fn cancel_lab_test(&self, id: Uuid) -> Result<LabUpdate> {
        let mut tx = self.pool().pool().begin().await?;
        let cancelled = sqlx::query(
            "UPDATE lab_tests SET status = 'cancelled' WHERE id = ? AND status IN ('ordered', 'in_progress')",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let test = fetch_lab_test(&mut tx, id).await?;
        if cancelled.rows_affected() == 0 {
            lab::cancel(test.status)?;
            return Err(HmsError::Conflict("lab test changed while cancelling".to_string()));
        }

        let visit = settle_visit(&mut tx, test.visit_id).await?;
        tx.commit().await?;
        Ok(LabUpdate { test, visit })
    }
}

fn push_lab_filter<'q>(query: &mut QueryBuilder<'q, Sqlite>, filter: &LabTestFilter) {
    if let Some(patient_id) = filter.patient_id {
        query.push(" AND patient_id = ").push_bind(patient_id);
    }
    if let Some(visit_id) = filter.visit_id {
        query.push(" AND visit_id = ").push_bind(visit_id);
    }
    if let Some(status) = filter.status {
        query.push(" AND status = ").push_bind(status.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::test_support::*;
    use hms_core::{PatientVisit, ResultFlag, StageStatus, VisitStage};
    use hms_workflow::VisitEvent;

    fn result(parameter: &str, flag: ResultFlag) -> LabResult {
        LabResult {
            parameter: parameter.to_string(),
            value: "5.4".to_string(),
            unit: Some("mmol/L".to_string()),
            reference_range: None,
            flag,
        }
    }

    fn order(patient_id: Uuid, visit_id: Option<Uuid>, name: &str) -> NewLabTest {
        NewLabTest {
            patient_id,
            visit_id,
            test_name: name.to_string(),
            test_code: None,
            ordered_by: None,
            priority: None,
            notes: None,
        }
    }

    async fn visit_at_nurse(db: &DatabaseQueries<'_>, patient_id: Uuid) -> PatientVisit {
        let visit = db
            .create_visit(&NewVisit {
                patient_id,
                appointment_id: None,
                department_id: None,
                chief_complaint: None,
            })
            .await
            .unwrap();
        db.transition_visit(visit.id, VisitEvent::CompleteReception, None)
            .await
            .unwrap()
            .visit
    }

    #[tokio::test]
    async fn test_lab_round_trip_returns_to_ordering_stage() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);
        let patient = patient(&db, "Kheri").await;
        let visit = visit_at_nurse(&db, patient.id).await;

        let first = db.order_lab_test(&order(patient.id, Some(visit.id), "Malaria RDT")).await.unwrap();
        assert_eq!(first.test.ordered_from, Some(VisitStage::Nurse));
        let moved = first.visit.unwrap().visit;
        assert_eq!(moved.state.current_stage, VisitStage::Lab);
        assert_eq!(moved.state.nurse_status, StageStatus::OnHold);

        // 已在化验阶段，追加检验不再转换
        let second = db.order_lab_test(&order(patient.id, Some(visit.id), "FBC")).await.unwrap();
        assert!(second.visit.is_none());
        assert_eq!(second.test.ordered_from, Some(VisitStage::Nurse));

        let started = db.start_lab_test(first.test.id).await.unwrap();
        assert_eq!(started.status, LabTestStatus::InProgress);

        let done = db
            .record_lab_results(first.test.id, &[result("Plasmodium", ResultFlag::Normal)])
            .await
            .unwrap();
        assert!(done.visit.is_none());

        let last = db
            .record_lab_results(second.test.id, &[result("Hb", ResultFlag::Critical)])
            .await
            .unwrap();
        assert!(last.test.has_critical_result());
        let back = last.visit.unwrap().visit;
        assert_eq!(back.state.current_stage, VisitStage::Nurse);
        assert_eq!(back.state.lab_status, StageStatus::Completed);
        assert!(back.state.nurse_status.is_active());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_orders_on_different_visits() {
        let pool = file_pool().await;
        let db = DatabaseQueries::new(&pool);

        for round in 0..5 {
            let a = patient(&db, &format!("Amina{}", round)).await;
            let b = patient(&db, &format!("Bakari{}", round)).await;
            let visit_a = visit_at_nurse(&db, a.id).await;
            let visit_b = visit_at_nurse(&db, b.id).await;

            let order_a = order(a.id, Some(visit_a.id), "Malaria RDT");
            let order_b = order(b.id, Some(visit_b.id), "FBC");
            let (first, second) = tokio::join!(db.order_lab_test(&order_a), db.order_lab_test(&order_b));

            for update in [first.unwrap(), second.unwrap()] {
                assert_eq!(update.test.ordered_from, Some(VisitStage::Nurse));
                assert_eq!(update.visit.unwrap().visit.state.current_stage, VisitStage::Lab);
            }
        }
    }

    #[tokio::test]
    async fn test_results_are_validated_and_final() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);
        let patient = patient(&db, "Mwajuma").await;
        let test = db.order_lab_test(&order(patient.id, None, "Glucose")).await.unwrap().test;

        let duplicate = [result("Glucose", ResultFlag::High), result("glucose", ResultFlag::Normal)];
        assert!(matches!(
            db.record_lab_results(test.id, &duplicate).await,
            Err(HmsError::Validation(_))
        ));

        db.record_lab_results(test.id, &[result("Glucose", ResultFlag::High)])
            .await
            .unwrap();
        assert!(db
            .record_lab_results(test.id, &[result("Glucose", ResultFlag::Normal)])
            .await
            .is_err());
        assert!(db.cancel_lab_test(test.id).await.is_err());

        let stored = db.get_lab_test(test.id).await.unwrap();
        assert_eq!(stored.results.len(), 1);
        assert_eq!(stored.status, LabTestStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancelling_last_open_test_releases_visit() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);
        let patient = patient(&db, "Issa").await;
        let visit = visit_at_nurse(&db, patient.id).await;

        let ordered = db.order_lab_test(&order(patient.id, Some(visit.id), "CRP")).await.unwrap();
        let cancelled = db.cancel_lab_test(ordered.test.id).await.unwrap();
        assert_eq!(cancelled.test.status, LabTestStatus::Cancelled);
        assert_eq!(cancelled.visit.unwrap().visit.state.current_stage, VisitStage::Nurse);

        let page = db
            .list_lab_tests(
                &LabTestFilter {
                    visit_id: Some(visit.id),
                    ..Default::default()
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn test_order_rejected_outside_clinical_stages() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);
        let patient = patient(&db, "Halima").await;
        let visit = db
            .create_visit(&NewVisit {
                patient_id: patient.id,
                appointment_id: None,
                department_id: None,
                chief_complaint: None,
            })
            .await
            .unwrap();

        let result = db.order_lab_test(&order(patient.id, Some(visit.id), "FBC")).await;
        assert!(matches!(result, Err(HmsError::Conflict(_))));
        assert!(db
            .list_lab_tests(&LabTestFilter::default(), PageRequest::default())
            .await
            .unwrap()
            .items
            .is_empty());
    }
}
