//! 发票、付款与移动支付
//!
//! 所有改动已付金额的操作都在事务中进行，且事务的第一条语句就是带条件的
//! 原子更新：`paid_amount + amount <= total_amount` 不成立时更新零行，
//! 并发请求在数据库层排队，已付金额永远不会超过总额。

use crate::models::*;
use crate::queries::DatabaseQueries;
use crate::visits::{advance_visit, VisitTransition};
use chrono::Utc;
use hms_core::utils::{generate_reference, non_empty};
use hms_core::{
    HmsError, Invoice, InvoiceItem, InvoiceStatus, MobilePayment, MobilePaymentStatus, Money, Page,
    PageRequest, Payment, PaymentMethod, Result,
};
use hms_workflow::billing::{self, InvoiceBalance};
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use uuid::Uuid;

/// 付款入账结果
#[derive(Debug, Clone, Serialize)]
pub struct PaymentReceipt {
    pub payment: Payment,
    pub invoice: Invoice,
    /// 付清发票后就诊结算完成
    pub visit: Option<VisitTransition>,
}

/// 移动支付回调处理结果
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Credited { receipt: PaymentReceipt },
    /// 重复回调，未做任何修改
    AlreadyProcessed { status: MobilePaymentStatus },
    /// 入账会导致超付，转人工核对
    ParkedForReview { reason: String },
    Failed,
}

pub(crate) async fn fetch_invoice_row(conn: &mut SqliteConnection, id: Uuid) -> Result<DbInvoice> {
    sqlx::query_as::<_, DbInvoice>("SELECT * FROM invoices WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| HmsError::not_found("invoice", id))
}

async fn fetch_invoice(conn: &mut SqliteConnection, id: Uuid) -> Result<Invoice> {
    let row = fetch_invoice_row(conn, id).await?;
    let items = sqlx::query_as::<_, DbInvoiceItem>(
        "SELECT * FROM invoice_items WHERE invoice_id = ? ORDER BY created_at",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;
    row.into_invoice(items.into_iter().map(InvoiceItem::from).collect())
}

fn balance_of(row: &DbInvoice) -> Result<InvoiceBalance> {
    Ok(InvoiceBalance {
        total: row.total(),
        paid: row.paid(),
        status: row.status()?,
    })
}

/// 按当前金额重新推导并写回发票状态（已作废的发票不变）
async fn refresh_status(conn: &mut SqliteConnection, id: Uuid) -> Result<InvoiceStatus> {
    let row = fetch_invoice_row(conn, id).await?;
    if row.status()? == InvoiceStatus::Cancelled {
        return Ok(InvoiceStatus::Cancelled);
    }

    let status = billing::derive_status(row.total(), row.paid());
    sqlx::query("UPDATE invoices SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(status)
}

/// 入账：条件更新 → 状态推导 → 付款记录 → 付清时完成就诊结算
async fn credit_invoice(
    conn: &mut SqliteConnection,
    invoice_id: Uuid,
    payment: &NewPayment,
    reference: &str,
) -> Result<PaymentReceipt> {
    billing::validate_amount(payment.amount)?;
    let amount = payment.amount.minor();

    let credited = sqlx::query(
        r#"
        UPDATE invoices SET paid_amount = paid_amount + ?, updated_at = ?
        WHERE id = ? AND status <> 'cancelled' AND paid_amount + ? <= total_amount
        "#,
    )
    .bind(amount)
    .bind(Utc::now())
    .bind(invoice_id)
    .bind(amount)
    .execute(&mut *conn)
    .await?;

    if credited.rows_affected() == 0 {
        let row = fetch_invoice_row(conn, invoice_id).await?;
        let current = balance_of(&row)?;
        // 账单规则给出具体的拒绝原因
        billing::apply_payment(&current, payment.amount)?;
        return Err(HmsError::Conflict(format!(
            "invoice {} changed while applying payment",
            row.invoice_number
        )));
    }

    let status = refresh_status(conn, invoice_id).await?;

    let payment_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO payments (id, invoice_id, amount, method, reference_number, received_by, notes, voided, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)
        "#,
    )
    .bind(payment_id)
    .bind(invoice_id)
    .bind(amount)
    .bind(payment.method.as_str())
    .bind(reference)
    .bind(payment.received_by)
    .bind(non_empty(payment.notes.clone()))
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    let invoice = fetch_invoice(conn, invoice_id).await?;
    let visit = match (status, invoice.visit_id) {
        (InvoiceStatus::Paid, Some(visit_id)) => {
            advance_visit(conn, visit_id, |engine, state| engine.event_after_payment(state, status)).await?
        }
        _ => None,
    };

    let payment = sqlx::query_as::<_, DbPayment>("SELECT * FROM payments WHERE id = ?")
        .bind(payment_id)
        .fetch_one(&mut *conn)
        .await?;

    Ok(PaymentReceipt {
        payment: Payment::try_from(payment)?,
        invoice,
        visit,
    })
}

/// 解析明细单价和描述，未提供时取收费项目或药品信息
async fn resolve_item(conn: &mut SqliteConnection, item: &NewInvoiceItem) -> Result<(String, Money, Money)> {
    let catalogue: Option<(String, i64)> = if let Some(service_id) = item.service_id {
        Some(
            sqlx::query_as::<_, (String, i64)>("SELECT name, price FROM services WHERE id = ?")
                .bind(service_id)
                .fetch_optional(&mut *conn)
                .await?
                .ok_or_else(|| HmsError::not_found("service", service_id))?,
        )
    } else if let Some(medication_id) = item.medication_id {
        Some(
            sqlx::query_as::<_, (String, i64)>("SELECT name, unit_price FROM medications WHERE id = ?")
                .bind(medication_id)
                .fetch_optional(&mut *conn)
                .await?
                .ok_or_else(|| HmsError::not_found("medication", medication_id))?,
        )
    } else {
        None
    };

    let unit_price = match (item.unit_price, &catalogue) {
        (Some(price), _) => price,
        (None, Some((_, price))) => Money::from_minor(*price),
        (None, None) => {
            return Err(HmsError::Validation(
                "unit_price is required for items without a service or medication".to_string(),
            ))
        }
    };
    let description = non_empty(item.description.clone())
        .or_else(|| catalogue.map(|(name, _)| name))
        .ok_or_else(|| HmsError::Validation("item description is required".to_string()))?;

    let total = billing::line_total(unit_price, item.quantity)?;
    Ok((description, unit_price, total))
}

/// 追加明细并增加发票总额
pub(crate) async fn add_item(
    conn: &mut SqliteConnection,
    invoice_id: Uuid,
    item: &NewInvoiceItem,
) -> Result<InvoiceItem> {
    let priced = resolve_item(conn, item).await?;
    add_priced_item(conn, invoice_id, item, priced).await
}

/// 写入已定价的明细，第一条语句即为写入
async fn add_priced_item(
    conn: &mut SqliteConnection,
    invoice_id: Uuid,
    item: &NewInvoiceItem,
    (description, unit_price, total): (String, Money, Money),
) -> Result<InvoiceItem> {
    let grown = sqlx::query(
        "UPDATE invoices SET total_amount = total_amount + ?, updated_at = ? WHERE id = ? AND status <> 'cancelled'",
    )
    .bind(total.minor())
    .bind(Utc::now())
    .bind(invoice_id)
    .execute(&mut *conn)
    .await?;

    if grown.rows_affected() == 0 {
        let row = fetch_invoice_row(conn, invoice_id).await?;
        billing::add_item(&balance_of(&row)?, total)?;
        return Err(HmsError::Conflict("invoice changed while adding item".to_string()));
    }

    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO invoice_items (id, invoice_id, description, service_id, medication_id, quantity, unit_price, total, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id)
    .bind(invoice_id)
    .bind(&description)
    .bind(item.service_id)
    .bind(item.medication_id)
    .bind(item.quantity)
    .bind(unit_price.minor())
    .bind(total.minor())
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    refresh_status(conn, invoice_id).await?;

    let row = sqlx::query_as::<_, DbInvoiceItem>("SELECT * FROM invoice_items WHERE id = ?")
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(InvoiceItem::from(row))
}

/// 就诊当前未作废的发票（最新一张）
pub(crate) async fn open_invoice_for_visit(conn: &mut SqliteConnection, visit_id: Uuid) -> Result<Option<Uuid>> {
    let id = sqlx::query_scalar::<_, Uuid>(
        "SELECT id FROM invoices WHERE visit_id = ? AND status <> 'cancelled' ORDER BY created_at DESC LIMIT 1",
    )
    .bind(visit_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(id)
}

impl<'a> DatabaseQueries<'a> {
    // ========== 发票 ==========

    /// 开具发票，可同时带入明细
    pub async fn create_invoice(&self, new: &NewInvoice) -> Result<Invoice> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let mut tx = self.pool().pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO invoices (id, invoice_number, patient_id, visit_id, total_amount, paid_amount, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, 0, 0, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(generate_reference("INV"))
        .bind(new.patient_id)
        .bind(new.visit_id)
        .bind(InvoiceStatus::Unpaid.as_str())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for item in &new.items {
            add_item(&mut tx, id, item).await?;
        }

        let invoice = fetch_invoice(&mut tx, id).await?;
        tx.commit().await?;

        tracing::info!("Created invoice {} total {}", invoice.invoice_number, invoice.total_amount);
        Ok(invoice)
    }

    pub async fn get_invoice(&self, id: Uuid) -> Result<Invoice> {
        let mut conn = self.pool().pool().acquire().await?;
        fetch_invoice(&mut conn, id).await
    }

    pub async fn list_invoices(&self, filter: &InvoiceFilter, page: PageRequest) -> Result<Page<Invoice>> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM invoices WHERE 1 = 1");
        push_invoice_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(self.pool().pool()).await?;

        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM invoices WHERE 1 = 1");
        push_invoice_filter(&mut query, filter);
        query
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(page.limit())
            .push(" OFFSET ")
            .push_bind(page.offset());

        // 列表不带明细
        let rows: Vec<DbInvoice> = query.build_query_as().fetch_all(self.pool().pool()).await?;
        let items = rows
            .into_iter()
            .map(|row| row.into_invoice(Vec::new()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Page::new(items, total, page))
    }

    pub async fn add_invoice_item(&self, invoice_id: Uuid, item: &NewInvoiceItem) -> Result<Invoice> {
        // 定价只读，放在事务之前
        let priced = {
            let mut conn = self.pool().pool().acquire().await?;
            resolve_item(&mut conn, item).await?
        };

        let mut tx = self.pool().pool().begin().await?;
        add_priced_item(&mut tx, invoice_id, item, priced).await?;
        let invoice = fetch_invoice(&mut tx, invoice_id).await?;
        tx.commit().await?;
        Ok(invoice)
    }

    /// 作废发票，仅限尚未收款的发票
    pub async fn cancel_invoice(&self, id: Uuid) -> Result<Invoice> {
        let mut tx = self.pool().pool().begin().await?;
        let cancelled = sqlx::query(
            "UPDATE invoices SET status = 'cancelled', updated_at = ? WHERE id = ? AND status <> 'cancelled' AND paid_amount = 0",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if cancelled.rows_affected() == 0 {
            let row = fetch_invoice_row(&mut tx, id).await?;
            billing::cancel(&balance_of(&row)?)?;
            return Err(HmsError::Conflict("invoice changed while cancelling".to_string()));
        }

        let invoice = fetch_invoice(&mut tx, id).await?;
        tx.commit().await?;
        tracing::info!("Cancelled invoice {}", invoice.invoice_number);
        Ok(invoice)
    }

    // ========== 付款 ==========

    /// 登记一笔付款
    ///
    /// 整个过程在一个事务中完成；发票付清且就诊处于结算阶段时，就诊同时结束。
    pub async fn apply_payment(&self, invoice_id: Uuid, payment: &NewPayment) -> Result<PaymentReceipt> {
        let reference = non_empty(payment.reference_number.clone()).unwrap_or_else(|| generate_reference("PAY"));

        let mut tx = self.pool().pool().begin().await?;
        let receipt = match credit_invoice(&mut tx, invoice_id, payment, &reference).await {
            Ok(receipt) => receipt,
            Err(e) => {
                tracing::warn!("Payment of {} on invoice {} rejected: {}", payment.amount, invoice_id, e);
                return Err(e);
            }
        };
        tx.commit().await?;

        tracing::info!(
            "Applied {} {} to invoice {} (status {})",
            payment.method,
            payment.amount,
            receipt.invoice.invoice_number,
            receipt.invoice.status
        );
        Ok(receipt)
    }

    /// 撤销付款，已付金额相应减少
    pub async fn void_payment(&self, payment_id: Uuid) -> Result<Invoice> {
        let mut tx = self.pool().pool().begin().await?;
        let voided = sqlx::query("UPDATE payments SET voided = 1 WHERE id = ? AND voided = 0")
            .bind(payment_id)
            .execute(&mut *tx)
            .await?;

        let payment = sqlx::query_as::<_, DbPayment>("SELECT * FROM payments WHERE id = ?")
            .bind(payment_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| HmsError::not_found("payment", payment_id))?;
        if voided.rows_affected() == 0 {
            return Err(HmsError::Conflict("payment is already voided".to_string()));
        }

        let reversed = sqlx::query(
            r#"
            UPDATE invoices SET paid_amount = paid_amount - ?, updated_at = ?
            WHERE id = ? AND status <> 'cancelled' AND paid_amount >= ?
            "#,
        )
        .bind(payment.amount)
        .bind(Utc::now())
        .bind(payment.invoice_id)
        .bind(payment.amount)
        .execute(&mut *tx)
        .await?;

        if reversed.rows_affected() == 0 {
            let row = fetch_invoice_row(&mut tx, payment.invoice_id).await?;
            billing::void_payment(&balance_of(&row)?, Money::from_minor(payment.amount))?;
            return Err(HmsError::Conflict("invoice changed while voiding payment".to_string()));
        }

        refresh_status(&mut tx, payment.invoice_id).await?;
        let invoice = fetch_invoice(&mut tx, payment.invoice_id).await?;
        tx.commit().await?;

        tracing::info!("Voided payment {} on invoice {}", payment.reference_number, invoice.invoice_number);
        Ok(invoice)
    }

    pub async fn list_payments(&self, invoice_id: Uuid) -> Result<Vec<Payment>> {
        let rows = sqlx::query_as::<_, DbPayment>(
            "SELECT * FROM payments WHERE invoice_id = ? ORDER BY created_at",
        )
        .bind(invoice_id)
        .fetch_all(self.pool().pool())
        .await?;
        rows.into_iter().map(Payment::try_from).collect()
    }

    pub async fn get_payment(&self, id: Uuid) -> Result<Payment> {
        sqlx::query_as::<_, DbPayment>("SELECT * FROM payments WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool().pool())
            .await?
            .ok_or_else(|| HmsError::not_found("payment", id))
            .and_then(Payment::try_from)
    }

    // ========== 移动支付 ==========

    /// 发起前检查发票能否接受该金额
    pub async fn check_payable(&self, invoice_id: Uuid, amount: Money) -> Result<Invoice> {
        let invoice = self.get_invoice(invoice_id).await?;
        let balance = InvoiceBalance {
            total: invoice.total_amount,
            paid: invoice.paid_amount,
            status: invoice.status,
        };
        billing::apply_payment(&balance, amount)?;
        Ok(invoice)
    }

    pub async fn create_mobile_payment(&self, new: &NewMobilePayment) -> Result<MobilePayment> {
        billing::validate_amount(new.amount)?;

        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO mobile_payments (id, reference, invoice_id, provider, phone_number, amount, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(&new.reference)
        .bind(new.invoice_id)
        .bind(new.provider.as_str())
        .bind(&new.phone_number)
        .bind(new.amount.minor())
        .bind(MobilePaymentStatus::Pending.as_str())
        .bind(now)
        .bind(now)
        .execute(self.pool().pool())
        .await?;

        tracing::info!("Created {} mobile payment {}", new.provider, new.reference);
        self.get_mobile_payment(&new.reference).await
    }

    pub async fn get_mobile_payment(&self, reference: &str) -> Result<MobilePayment> {
        sqlx::query_as::<_, DbMobilePayment>("SELECT * FROM mobile_payments WHERE reference = ?")
            .bind(reference)
            .fetch_optional(self.pool().pool())
            .await?
            .ok_or_else(|| HmsError::not_found("mobile payment", reference))
            .and_then(MobilePayment::try_from)
    }

    /// 记录网关的受理结果，不改变状态
    pub async fn record_gateway_response(
        &self,
        reference: &str,
        transaction_id: Option<&str>,
        provider_response: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE mobile_payments SET transaction_id = COALESCE(?, transaction_id), provider_response = ?, updated_at = ? WHERE reference = ?",
        )
        .bind(transaction_id)
        .bind(provider_response)
        .bind(Utc::now())
        .bind(reference)
        .execute(self.pool().pool())
        .await?;
        Ok(())
    }

    /// 网关确认支付成功
    ///
    /// `pending → completed` 的条件更新保证同一回调只入账一次；付款记录以移动支付
    /// 流水号为唯一编号，重放也无法重复入账。
    pub async fn complete_mobile_payment(
        &self,
        reference: &str,
        transaction_id: Option<&str>,
        provider_response: &str,
    ) -> Result<WebhookOutcome> {
        let mut tx = self.pool().pool().begin().await?;
        let now = Utc::now();

        let claimed = sqlx::query(
            r#"
            UPDATE mobile_payments SET status = 'completed', transaction_id = COALESCE(?, transaction_id),
                provider_response = ?, completed_at = ?, updated_at = ?
            WHERE reference = ? AND status = 'pending'
            "#,
        )
        .bind(transaction_id)
        .bind(provider_response)
        .bind(now)
        .bind(now)
        .bind(reference)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, DbMobilePayment>("SELECT * FROM mobile_payments WHERE reference = ?")
            .bind(reference)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| HmsError::not_found("mobile payment", reference))?;
        let mobile = MobilePayment::try_from(row)?;

        if claimed.rows_affected() == 0 {
            tracing::info!("Ignoring replayed completion for mobile payment {} ({})", reference, mobile.status);
            return Ok(WebhookOutcome::AlreadyProcessed { status: mobile.status });
        }

        let payment = NewPayment {
            amount: mobile.amount,
            method: PaymentMethod::MobileMoney,
            reference_number: Some(mobile.reference.clone()),
            received_by: None,
            notes: Some(format!("{} {}", mobile.provider, mobile.phone_number)),
        };

        match credit_invoice(&mut tx, mobile.invoice_id, &payment, &mobile.reference).await {
            Ok(receipt) => {
                tx.commit().await?;
                tracing::info!(
                    "Mobile payment {} credited {} to invoice {}",
                    reference,
                    mobile.amount,
                    receipt.invoice.invoice_number
                );
                Ok(WebhookOutcome::Credited { receipt })
            }
            Err(HmsError::Conflict(reason)) => {
                // 丢弃入账过程中的全部写入，只把支付单标记为待核对
                tx.rollback().await?;
                sqlx::query(
                    "UPDATE mobile_payments SET status = 'review', transaction_id = COALESCE(?, transaction_id), provider_response = ?, updated_at = ? WHERE reference = ? AND status = 'pending'",
                )
                .bind(transaction_id)
                .bind(provider_response)
                .bind(Utc::now())
                .bind(reference)
                .execute(self.pool().pool())
                .await?;
                tracing::warn!("Mobile payment {} parked for review: {}", reference, reason);
                Ok(WebhookOutcome::ParkedForReview { reason })
            }
            Err(e) => Err(e),
        }
    }

    /// 网关报告支付失败
    pub async fn fail_mobile_payment(&self, reference: &str, provider_response: &str) -> Result<WebhookOutcome> {
        let failed = sqlx::query(
            "UPDATE mobile_payments SET status = 'failed', provider_response = ?, updated_at = ? WHERE reference = ? AND status = 'pending'",
        )
        .bind(provider_response)
        .bind(Utc::now())
        .bind(reference)
        .execute(self.pool().pool())
        .await?;

        let mobile = self.get_mobile_payment(reference).await?;
        if failed.rows_affected() == 0 {
            return Ok(WebhookOutcome::AlreadyProcessed { status: mobile.status });
        }

        tracing::info!("Mobile payment {} failed", reference);
        Ok(WebhookOutcome::Failed)
    }
}

fn push_invoice_filter<'q>(query: &mut QueryBuilder<'q, Sqlite>, filter: &InvoiceFilter) {
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
    use hms_core::{MobileProvider, OverallStatus, VisitStage};
    use hms_workflow::VisitEvent;

    fn money(s: &str) -> Money {
        s.parse().unwrap()
    }

    fn cash(amount: &str) -> NewPayment {
        NewPayment {
            amount: money(amount),
            method: PaymentMethod::Cash,
            reference_number: None,
            received_by: None,
            notes: None,
        }
    }

    fn line(description: &str, price: &str) -> NewInvoiceItem {
        NewInvoiceItem {
            description: Some(description.to_string()),
            service_id: None,
            medication_id: None,
            quantity: 1,
            unit_price: Some(money(price)),
        }
    }

    async fn invoice(db: &DatabaseQueries<'_>, total: &str, visit_id: Option<Uuid>, patient_id: Uuid) -> Invoice {
        db.create_invoice(&NewInvoice {
            patient_id,
            visit_id,
            items: vec![line("Consultation", total)],
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_partial_then_full_payment() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);
        let patient = patient(&db, "Zawadi").await;
        let invoice = invoice(&db, "150.00", None, patient.id).await;
        assert_eq!(invoice.status, InvoiceStatus::Unpaid);

        let first = db.apply_payment(invoice.id, &cash("80.00")).await.unwrap();
        assert_eq!(first.invoice.balance, money("70.00"));
        assert_eq!(first.invoice.status, InvoiceStatus::Partial);

        let second = db.apply_payment(invoice.id, &cash("70.00")).await.unwrap();
        assert_eq!(second.invoice.balance, Money::ZERO);
        assert_eq!(second.invoice.status, InvoiceStatus::Paid);
        assert_eq!(db.list_payments(invoice.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_overpayment_rejected_without_side_effects() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);
        let patient = patient(&db, "Imani").await;
        let invoice = invoice(&db, "150.00", None, patient.id).await;

        let err = db.apply_payment(invoice.id, &cash("150.01")).await.unwrap_err();
        assert!(matches!(err, HmsError::Conflict(_)));

        let after = db.get_invoice(invoice.id).await.unwrap();
        assert_eq!(after.paid_amount, Money::ZERO);
        assert!(db.list_payments(invoice.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_payments_never_overpay() {
        let pool = file_pool().await;
        let db = DatabaseQueries::new(&pool);
        let patient = patient(&db, "Tumaini").await;
        let invoice = invoice(&db, "150.00", None, patient.id).await;

        let first = cash("80.00");
        let second = cash("70.00");
        let third = cash("80.00");
        let (a, b, c) = tokio::join!(
            db.apply_payment(invoice.id, &first),
            db.apply_payment(invoice.id, &second),
            db.apply_payment(invoice.id, &third),
        );
        let succeeded = [a.is_ok(), b.is_ok(), c.is_ok()].iter().filter(|ok| **ok).count();
        assert!(succeeded >= 1);

        let after = db.get_invoice(invoice.id).await.unwrap();
        assert!(after.paid_amount <= after.total_amount);
        let recorded: Money = db
            .list_payments(invoice.id)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.amount)
            .sum();
        assert_eq!(recorded, after.paid_amount);
        assert_eq!(after.status, billing::derive_status(after.total_amount, after.paid_amount));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_split_payment_settles_invoice() {
        let pool = file_pool().await;
        let db = DatabaseQueries::new(&pool);

        for round in 0..5 {
            let patient = patient(&db, &format!("Pendo{}", round)).await;
            let invoice = invoice(&db, "150.00", None, patient.id).await;

            let first = cash("80.00");
            let second = cash("70.00");
            let (a, b) = tokio::join!(
                db.apply_payment(invoice.id, &first),
                db.apply_payment(invoice.id, &second),
            );
            a.unwrap();
            b.unwrap();

            let after = db.get_invoice(invoice.id).await.unwrap();
            assert_eq!(after.status, InvoiceStatus::Paid);
            assert_eq!(after.balance, Money::ZERO);
            assert_eq!(db.list_payments(invoice.id).await.unwrap().len(), 2);
        }
    }

    #[tokio::test]
    async fn test_settling_invoice_completes_visit_at_billing() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);
        let patient = patient(&db, "Faraji").await;
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
            VisitEvent::CompleteConsultation { prescribed: false },
        ] {
            db.transition_visit(visit.id, event, None).await.unwrap();
        }

        let invoice = invoice(&db, "40.00", Some(visit.id), patient.id).await;
        let partial = db.apply_payment(invoice.id, &cash("10.00")).await.unwrap();
        assert!(partial.visit.is_none());

        let paid = db.apply_payment(invoice.id, &cash("30.00")).await.unwrap();
        let transition = paid.visit.unwrap();
        assert_eq!(transition.visit.state.current_stage, VisitStage::Discharged);
        assert_eq!(transition.visit.state.overall_status, OverallStatus::Completed);
    }

    #[tokio::test]
    async fn test_void_and_cancel() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);
        let patient = patient(&db, "Salma").await;
        let invoice = invoice(&db, "50.00", None, patient.id).await;

        let receipt = db.apply_payment(invoice.id, &cash("50.00")).await.unwrap();
        assert!(matches!(db.cancel_invoice(invoice.id).await, Err(HmsError::Conflict(_))));

        let after_void = db.void_payment(receipt.payment.id).await.unwrap();
        assert_eq!(after_void.status, InvoiceStatus::Unpaid);
        assert!(matches!(db.void_payment(receipt.payment.id).await, Err(HmsError::Conflict(_))));

        let cancelled = db.cancel_invoice(invoice.id).await.unwrap();
        assert_eq!(cancelled.status, InvoiceStatus::Cancelled);
        assert!(db.apply_payment(invoice.id, &cash("1.00")).await.is_err());
        assert!(db.add_invoice_item(invoice.id, &line("Extra", "5.00")).await.is_err());
    }

    #[tokio::test]
    async fn test_service_price_used_when_item_has_no_price() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);
        let patient = patient(&db, "Hadija").await;
        let service = db
            .create_service(&NewService {
                code: "XRAY".to_string(),
                name: "Chest X-ray".to_string(),
                department_id: None,
                price: money("35.00"),
            })
            .await
            .unwrap();

        let invoice = db
            .create_invoice(&NewInvoice {
                patient_id: patient.id,
                visit_id: None,
                items: vec![NewInvoiceItem {
                    description: None,
                    service_id: Some(service.id),
                    medication_id: None,
                    quantity: 2,
                    unit_price: None,
                }],
            })
            .await
            .unwrap();
        assert_eq!(invoice.total_amount, money("70.00"));
        assert_eq!(invoice.items[0].description, "Chest X-ray");
    }

    async fn mobile(db: &DatabaseQueries<'_>, invoice_id: Uuid, amount: &str) -> MobilePayment {
        db.create_mobile_payment(&NewMobilePayment {
            reference: generate_reference("MP"),
            invoice_id,
            provider: MobileProvider::ZenoPay,
            phone_number: "255712345678".to_string(),
            amount: money(amount),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_webhook_replay_does_not_double_credit() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);
        let patient = patient(&db, "Amani").await;
        let invoice = invoice(&db, "150.00", None, patient.id).await;
        let mobile = mobile(&db, invoice.id, "80.00").await;

        let first = db
            .complete_mobile_payment(&mobile.reference, Some("TX-1"), "{}")
            .await
            .unwrap();
        assert!(matches!(first, WebhookOutcome::Credited { .. }));

        let replay = db
            .complete_mobile_payment(&mobile.reference, Some("TX-1"), "{}")
            .await
            .unwrap();
        assert!(matches!(
            replay,
            WebhookOutcome::AlreadyProcessed {
                status: MobilePaymentStatus::Completed
            }
        ));

        let after = db.get_invoice(invoice.id).await.unwrap();
        assert_eq!(after.paid_amount, money("80.00"));
        assert_eq!(db.list_payments(invoice.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_overpaying_webhook_is_parked_for_review() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);
        let patient = patient(&db, "Pendo").await;
        let invoice = invoice(&db, "100.00", None, patient.id).await;
        let mobile = mobile(&db, invoice.id, "80.00").await;

        db.apply_payment(invoice.id, &cash("50.00")).await.unwrap();
        let outcome = db
            .complete_mobile_payment(&mobile.reference, None, "{}")
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::ParkedForReview { .. }));

        let stored = db.get_mobile_payment(&mobile.reference).await.unwrap();
        assert_eq!(stored.status, MobilePaymentStatus::Review);
        assert_eq!(db.get_invoice(invoice.id).await.unwrap().paid_amount, money("50.00"));
    }

    #[tokio::test]
    async fn test_failed_webhook() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);
        let patient = patient(&db, "Subira").await;
        let invoice = invoice(&db, "20.00", None, patient.id).await;
        let mobile = mobile(&db, invoice.id, "20.00").await;

        let outcome = db.fail_mobile_payment(&mobile.reference, "{}").await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Failed));
        // 失败后再收到成功回调不入账
        let late = db.complete_mobile_payment(&mobile.reference, None, "{}").await.unwrap();
        assert!(matches!(
            late,
            WebhookOutcome::AlreadyProcessed {
                status: MobilePaymentStatus::Failed
            }
        ));
        assert!(matches!(
            db.complete_mobile_payment("MP-UNKNOWN", None, "{}").await,
            Err(HmsError::NotFound(_))
        ));
    }
}
