//! 药品库存、处方与发药

use crate::billing::{add_item, open_invoice_for_visit};
use crate::models::*;
use crate::queries::DatabaseQueries;
use crate::visits::{advance_visit, VisitTransition};
use chrono::Utc;
use hms_core::utils::non_empty;
use hms_core::{
    HmsError, InvoiceItem, Medication, Page, PageRequest, Prescription, PrescriptionItem, PrescriptionStatus, Result,
};
use hms_workflow::pharmacy::{self, ItemSpec};
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use uuid::Uuid;

/// 发药结果
#[derive(Debug, Clone, Serialize)]
pub struct DispenseReceipt {
    pub prescription: Prescription,
    pub medication: Medication,
    /// 就诊有未作废发票时追加的药费明细
    pub invoice_item: Option<InvoiceItem>,
    pub visit: Option<VisitTransition>,
}

async fn fetch_medication(conn: &mut SqliteConnection, id: Uuid) -> Result<Medication> {
    sqlx::query_as::<_, DbMedication>("SELECT * FROM medications WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .map(Medication::from)
        .ok_or_else(|| HmsError::not_found("medication", id))
}

async fn fetch_prescription(conn: &mut SqliteConnection, id: Uuid) -> Result<Prescription> {
    let row = sqlx::query_as::<_, DbPrescription>("SELECT * FROM prescriptions WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| HmsError::not_found("prescription", id))?;
    let items = sqlx::query_as::<_, DbPrescriptionItem>(
        "SELECT * FROM prescription_items WHERE prescription_id = ? ORDER BY rowid",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;
    row.into_prescription(items.into_iter().map(PrescriptionItem::from).collect())
}

impl<'a> DatabaseQueries<'a> {
    // ========== 药品 ==========

    pub async fn create_medication(&self, new: &NewMedication) -> Result<Medication> {
        if new.name.trim().is_empty() {
            return Err(HmsError::Validation("medication name is required".to_string()));
        }
        if new.unit_price.is_negative() || new.stock_quantity < 0 || new.reorder_level < 0 {
            return Err(HmsError::Validation(
                "price, stock and reorder level must not be negative".to_string(),
            ));
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO medications (id, name, generic_name, form, strength, unit_price, stock_quantity, reorder_level, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(new.name.trim())
        .bind(non_empty(new.generic_name.clone()))
        .bind(non_empty(new.form.clone()))
        .bind(non_empty(new.strength.clone()))
        .bind(new.unit_price.minor())
        .bind(new.stock_quantity)
        .bind(new.reorder_level)
        .bind(now)
        .bind(now)
        .execute(self.pool().pool())
        .await?;

        self.get_medication(id).await
    }

    pub async fn get_medication(&self, id: Uuid) -> Result<Medication> {
        let mut conn = self.pool().pool().acquire().await?;
        fetch_medication(&mut conn, id).await
    }

    pub async fn list_medications(&self, search: Option<&str>) -> Result<Vec<Medication>> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM medications WHERE 1 = 1");
        if let Some(term) = search.map(str::trim).filter(|t| !t.is_empty()) {
            let pattern = format!("%{}%", term);
            query
                .push(" AND (name LIKE ")
                .push_bind(pattern.clone())
                .push(" OR generic_name LIKE ")
                .push_bind(pattern)
                .push(")");
        }
        query.push(" ORDER BY name");

        let rows: Vec<DbMedication> = query.build_query_as().fetch_all(self.pool().pool()).await?;
        Ok(rows.into_iter().map(Medication::from).collect())
    }

    /// 库存低于补货线的药品
    pub async fn low_stock_medications(&self) -> Result<Vec<Medication>> {
        let rows = sqlx::query_as::<_, DbMedication>(
            "SELECT * FROM medications WHERE stock_quantity <= reorder_level ORDER BY stock_quantity, name",
        )
        .fetch_all(self.pool().pool())
        .await?;
        Ok(rows.into_iter().map(Medication::from).collect())
    }

    /// 入库
    pub async fn restock_medication(&self, id: Uuid, quantity: i64) -> Result<Medication> {
        if quantity <= 0 {
            return Err(HmsError::Validation("restock quantity must be positive".to_string()));
        }

        let result = sqlx::query(
            "UPDATE medications SET stock_quantity = stock_quantity + ?, updated_at = ? WHERE id = ?",
        )
        .bind(quantity)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool().pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(HmsError::not_found("medication", id));
        }

        let medication = self.get_medication(id).await?;
        tracing::info!("Restocked {} by {} (now {})", medication.name, quantity, medication.stock_quantity);
        Ok(medication)
    }

    // ========== 处方 ==========

    pub async fn create_prescription(&self, new: &NewPrescription) -> Result<Prescription> {
        if new.items.is_empty() {
            return Err(HmsError::Validation("prescription needs at least one item".to_string()));
        }
        for item in &new.items {
            pharmacy::validate_item(&ItemSpec {
                dosage: &item.dosage,
                frequency: &item.frequency,
                duration_days: item.duration_days,
                quantity: item.quantity,
            })?;
        }

        // 就诊归属在事务外校验，事务内第一条语句必须是写入
        if let Some(visit_id) = new.visit_id {
            let owner = sqlx::query_scalar::<_, Uuid>("SELECT patient_id FROM patient_visits WHERE id = ?")
                .bind(visit_id)
                .fetch_optional(self.pool().pool())
                .await?
                .ok_or_else(|| HmsError::not_found("visit", visit_id))?;
            if owner != new.patient_id {
                return Err(HmsError::Validation("visit belongs to a different patient".to_string()));
            }
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let mut tx = self.pool().pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO prescriptions (id, patient_id, visit_id, doctor_id, status, notes, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(new.patient_id)
        .bind(new.visit_id)
        .bind(new.doctor_id)
        .bind(PrescriptionStatus::Pending.as_str())
        .bind(non_empty(new.notes.clone()))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for item in &new.items {
            sqlx::query(
                r#"
                INSERT INTO prescription_items (id, prescription_id, medication_id, dosage, frequency, duration_days, quantity, instructions, dispensed)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(id)
            .bind(item.medication_id)
            .bind(item.dosage.trim())
            .bind(item.frequency.trim())
            .bind(item.duration_days)
            .bind(item.quantity)
            .bind(non_empty(item.instructions.clone()))
            .execute(&mut *tx)
            .await?;
        }

        let prescription = fetch_prescription(&mut tx, id).await?;
        tx.commit().await?;

        tracing::info!("Created prescription {} with {} items", id, prescription.items.len());
        Ok(prescription)
    }

    pub async fn get_prescription(&self, id: Uuid) -> Result<Prescription> {
        let mut conn = self.pool().pool().acquire().await?;
        fetch_prescription(&mut conn, id).await
    }

    pub async fn list_prescriptions(
        &self,
        filter: &PrescriptionFilter,
        page: PageRequest,
    ) -> Result<Page<Prescription>> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM prescriptions WHERE 1 = 1");
        push_prescription_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(self.pool().pool()).await?;

        let mut query = QueryBuilder::<Sqlite>::new("SELECT id FROM prescriptions WHERE 1 = 1");
        push_prescription_filter(&mut query, filter);
        query
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(page.limit())
            .push(" OFFSET ")
            .push_bind(page.offset());
        let ids: Vec<Uuid> = query.build_query_scalar().fetch_all(self.pool().pool()).await?;

        let mut conn = self.pool().pool().acquire().await?;
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            items.push(fetch_prescription(&mut conn, id).await?);
        }
        Ok(Page::new(items, total, page))
    }

    pub async fn cancel_prescription(&self, id: Uuid) -> Result<Prescription> {
        let mut tx = self.pool().pool().begin().await?;
        let cancelled = sqlx::query(
            "UPDATE prescriptions SET status = 'cancelled', updated_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if cancelled.rows_affected() == 0 {
            let current = fetch_prescription(&mut tx, id).await?;
            pharmacy::check_cancellable(current.status)?;
            return Err(HmsError::Conflict("prescription changed while cancelling".to_string()));
        }

        let prescription = fetch_prescription(&mut tx, id).await?;
        tx.commit().await?;
        Ok(prescription)
    }

    /// 发出一条处方明细
    ///
    /// 标记发药、扣减库存、追加药费与推进就诊在同一事务中完成，任一步失败全部回滚。
    pub async fn dispense_item(
        &self,
        prescription_id: Uuid,
        item_id: Uuid,
        dispensed_by: Option<Uuid>,
    ) -> Result<DispenseReceipt> {
        let mut tx = self.pool().pool().begin().await?;
        let now = Utc::now();

        let marked = sqlx::query(
            r#"
            UPDATE prescription_items SET dispensed = 1, dispensed_at = ?, dispensed_by = ?
            WHERE id = ? AND prescription_id = ? AND dispensed = 0
              AND EXISTS (SELECT 1 FROM prescriptions p WHERE p.id = ? AND p.status <> 'cancelled')
            "#,
        )
        .bind(now)
        .bind(dispensed_by)
        .bind(item_id)
        .bind(prescription_id)
        .bind(prescription_id)
        .execute(&mut *tx)
        .await?;

        let current = fetch_prescription(&mut tx, prescription_id).await?;
        let item = current
            .items
            .iter()
            .find(|i| i.id == item_id)
            .cloned()
            .ok_or_else(|| HmsError::not_found("prescription item", item_id))?;
        if marked.rows_affected() == 0 {
            pharmacy::check_dispensable(current.status, item.dispensed)?;
            return Err(HmsError::Conflict("prescription changed while dispensing".to_string()));
        }

        let taken = sqlx::query(
            "UPDATE medications SET stock_quantity = stock_quantity - ?, updated_at = ? WHERE id = ? AND stock_quantity >= ?",
        )
        .bind(item.quantity)
        .bind(now)
        .bind(item.medication_id)
        .bind(item.quantity)
        .execute(&mut *tx)
        .await?;

        let medication = fetch_medication(&mut tx, item.medication_id).await?;
        if taken.rows_affected() == 0 {
            pharmacy::check_stock(&medication.name, medication.stock_quantity, item.quantity)?;
            return Err(HmsError::Conflict(format!("stock for {} changed while dispensing", medication.name)));
        }

        let invoice_item = match current.visit_id {
            Some(visit_id) => match open_invoice_for_visit(&mut tx, visit_id).await? {
                Some(invoice_id) => Some(
                    add_item(
                        &mut tx,
                        invoice_id,
                        &NewInvoiceItem {
                            description: Some(format!("{} x{}", medication.name, item.quantity)),
                            service_id: None,
                            medication_id: Some(medication.id),
                            quantity: item.quantity,
                            unit_price: Some(medication.unit_price),
                        },
                    )
                    .await?,
                ),
                None => None,
            },
            None => None,
        };

        let dispensed = current.items.iter().filter(|i| i.dispensed || i.id == item_id).count();
        let status = pharmacy::derive_status(dispensed, current.items.len());
        sqlx::query("UPDATE prescriptions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now)
            .bind(prescription_id)
            .execute(&mut *tx)
            .await?;

        let visit = match current.visit_id {
            Some(visit_id) => {
                advance_visit(&mut tx, visit_id, |engine, state| engine.event_after_dispensing(state, status)).await?
            }
            None => None,
        };

        let prescription = fetch_prescription(&mut tx, prescription_id).await?;
        tx.commit().await?;

        if medication.needs_reorder() {
            tracing::warn!(
                "Medication {} is at {} units, reorder level {}",
                medication.name,
                medication.stock_quantity,
                medication.reorder_level
            );
        }
        tracing::info!("Dispensed {} x{} for prescription {}", medication.name, item.quantity, prescription_id);

        Ok(DispenseReceipt {
            prescription,
            medication,
            invoice_item,
            visit,
        })
    }
}

fn push_prescription_filter<'q>(query: &mut QueryBuilder<'q, Sqlite>, filter: &PrescriptionFilter) {
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
    use hms_core::{Money, OverallStatus, VisitStage};
    use hms_workflow::VisitEvent;

    async fn medication(db: &DatabaseQueries<'_>, name: &str, stock: i64) -> Medication {
        db.create_medication(&NewMedication {
            name: name.to_string(),
            generic_name: None,
            form: Some("tablet".to_string()),
            strength: None,
            unit_price: Money::from_major(2),
            stock_quantity: stock,
            reorder_level: 5,
        })
        .await
        .unwrap()
    }

    fn item(medication_id: Uuid, quantity: i64) -> NewPrescriptionItem {
        NewPrescriptionItem {
            medication_id,
            dosage: "500mg".to_string(),
            frequency: "3x daily".to_string(),
            duration_days: 5,
            quantity,
            instructions: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_prescriptions_on_different_visits() {
        let pool = file_pool().await;
        let db = DatabaseQueries::new(&pool);
        let amoxicillin = medication(&db, "Amoxicillin", 100).await;

        for round in 0..5 {
            let mut requests = Vec::new();
            for name in ["Rashidi", "Upendo"] {
                let patient = patient(&db, &format!("{}{}", name, round)).await;
                let visit = db
                    .create_visit(&NewVisit {
                        patient_id: patient.id,
                        appointment_id: None,
                        department_id: None,
                        chief_complaint: None,
                    })
                    .await
                    .unwrap();
                requests.push(NewPrescription {
                    patient_id: patient.id,
                    visit_id: Some(visit.id),
                    doctor_id: None,
                    notes: None,
                    items: vec![item(amoxicillin.id, 6)],
                });
            }

            let (first, second) = tokio::join!(
                db.create_prescription(&requests[0]),
                db.create_prescription(&requests[1])
            );
            assert_eq!(first.unwrap().status, PrescriptionStatus::Pending);
            assert_eq!(second.unwrap().status, PrescriptionStatus::Pending);
        }
    }

    #[tokio::test]
    async fn test_insufficient_stock_changes_nothing() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);
        let patient = patient(&db, "Baraka").await;
        let amoxicillin = medication(&db, "Amoxicillin", 10).await;

        let prescription = db
            .create_prescription(&NewPrescription {
                patient_id: patient.id,
                visit_id: None,
                doctor_id: None,
                notes: None,
                items: vec![item(amoxicillin.id, 15)],
            })
            .await
            .unwrap();

        let err = db
            .dispense_item(prescription.id, prescription.items[0].id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HmsError::Conflict(_)));

        assert_eq!(db.get_medication(amoxicillin.id).await.unwrap().stock_quantity, 10);
        let after = db.get_prescription(prescription.id).await.unwrap();
        assert!(!after.items[0].dispensed);
        assert_eq!(after.status, PrescriptionStatus::Pending);
    }

    #[tokio::test]
    async fn test_partial_then_full_dispensing() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);
        let patient = patient(&db, "Neema").await;
        let paracetamol = medication(&db, "Paracetamol", 30).await;
        let ors = medication(&db, "ORS", 8).await;

        let prescription = db
            .create_prescription(&NewPrescription {
                patient_id: patient.id,
                visit_id: None,
                doctor_id: None,
                notes: None,
                items: vec![item(paracetamol.id, 10), item(ors.id, 4)],
            })
            .await
            .unwrap();

        let first = db
            .dispense_item(prescription.id, prescription.items[0].id, None)
            .await
            .unwrap();
        assert_eq!(first.prescription.status, PrescriptionStatus::PartiallyDispensed);
        assert_eq!(first.medication.stock_quantity, 20);
        assert!(first.invoice_item.is_none());

        // 同一明细不能重复发药
        assert!(matches!(
            db.dispense_item(prescription.id, prescription.items[0].id, None).await,
            Err(HmsError::Conflict(_))
        ));
        assert!(matches!(db.cancel_prescription(prescription.id).await, Err(HmsError::Conflict(_))));

        let second = db
            .dispense_item(prescription.id, prescription.items[1].id, None)
            .await
            .unwrap();
        assert_eq!(second.prescription.status, PrescriptionStatus::Dispensed);
        assert_eq!(db.low_stock_medications().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dispensing_bills_visit_and_moves_to_billing() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);
        let patient = patient(&db, "Rehema").await;
        let drug = medication(&db, "Metformin", 50).await;

        let visit = db
            .create_visit(&NewVisit {
                patient_id: patient.id,
                appointment_id: None,
                department_id: None,
                chief_complaint: None,
            })
            .await
            .unwrap();
        for event in [
            VisitEvent::CompleteReception,
            VisitEvent::CompleteTriage,
            VisitEvent::CompleteConsultation { prescribed: true },
        ] {
            db.transition_visit(visit.id, event, None).await.unwrap();
        }
        let invoice = db
            .create_invoice(&NewInvoice {
                patient_id: patient.id,
                visit_id: Some(visit.id),
                items: Vec::new(),
            })
            .await
            .unwrap();

        let prescription = db
            .create_prescription(&NewPrescription {
                patient_id: patient.id,
                visit_id: Some(visit.id),
                doctor_id: None,
                notes: None,
                items: vec![item(drug.id, 6)],
            })
            .await
            .unwrap();

        let receipt = db
            .dispense_item(prescription.id, prescription.items[0].id, None)
            .await
            .unwrap();
        assert_eq!(receipt.invoice_item.unwrap().total, Money::from_major(12));
        let transition = receipt.visit.unwrap();
        assert_eq!(transition.visit.state.current_stage, VisitStage::Billing);
        assert_eq!(transition.visit.state.overall_status, OverallStatus::Active);
        assert_eq!(db.get_invoice(invoice.id).await.unwrap().total_amount, Money::from_major(12));
    }

    #[tokio::test]
    async fn test_prescription_validation() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);
        let patient = patient(&db, "Juma").await;
        let drug = medication(&db, "Ibuprofen", 10).await;

        let mut bad = item(drug.id, 0);
        bad.dosage = "200mg".to_string();
        let result = db
            .create_prescription(&NewPrescription {
                patient_id: patient.id,
                visit_id: None,
                doctor_id: None,
                notes: None,
                items: vec![bad],
            })
            .await;
        assert!(matches!(result, Err(HmsError::Validation(_))));

        let cancelled = db
            .create_prescription(&NewPrescription {
                patient_id: patient.id,
                visit_id: None,
                doctor_id: None,
                notes: None,
                items: vec![item(drug.id, 2)],
            })
            .await
            .unwrap();
        let cancelled = db.cancel_prescription(cancelled.id).await.unwrap();
        assert_eq!(cancelled.status, PrescriptionStatus::Cancelled);
        assert!(db
            .dispense_item(cancelled.id, cancelled.items[0].id, None)
            .await
            .is_err());
    }
}
