//! 数据库模型
//!
//! 枚举以 snake_case 字符串存储，金额以分为单位的整数存储。

use chrono::{DateTime, NaiveDate, Utc};
use hms_core::models::*;
use hms_core::{HmsError, Money, Result};
use sqlx::FromRow;
use uuid::Uuid;

fn parse<T: std::str::FromStr<Err = HmsError>>(value: &str) -> Result<T> {
    value.parse()
}

fn parse_opt<T: std::str::FromStr<Err = HmsError>>(value: Option<String>) -> Result<Option<T>> {
    value.as_deref().map(parse).transpose()
}

// 数据库表模型 - 使用FromRow trait用于SQL查询

/// 数据库患者表
#[derive(Debug, FromRow)]
pub struct DbPatient {
    pub id: Uuid,
    pub patient_number: String,
    pub first_name: String,
    pub last_name: String,
    pub gender: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub blood_group: Option<String>,
    pub allergies: Option<String>,
    pub chronic_conditions: Option<String>,
    pub emergency_contact_name: Option<String>,
    pub emergency_contact_phone: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DbPatient> for Patient {
    type Error = HmsError;

    fn try_from(row: DbPatient) -> Result<Self> {
        Ok(Patient {
            id: row.id,
            patient_number: row.patient_number,
            first_name: row.first_name,
            last_name: row.last_name,
            gender: parse_opt(row.gender)?,
            date_of_birth: row.date_of_birth,
            phone: row.phone,
            email: row.email,
            address: row.address,
            blood_group: row.blood_group,
            allergies: row.allergies,
            chronic_conditions: row.chronic_conditions,
            emergency_contact_name: row.emergency_contact_name,
            emergency_contact_phone: row.emergency_contact_phone,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// 数据库预约表
#[derive(Debug, FromRow)]
pub struct DbAppointment {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub doctor_id: Option<Uuid>,
    pub department_id: Option<Uuid>,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: i32,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub status: String,
    pub visit_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DbAppointment> for Appointment {
    type Error = HmsError;

    fn try_from(row: DbAppointment) -> Result<Self> {
        Ok(Appointment {
            id: row.id,
            patient_id: row.patient_id,
            doctor_id: row.doctor_id,
            department_id: row.department_id,
            scheduled_at: row.scheduled_at,
            duration_minutes: row.duration_minutes,
            reason: row.reason,
            notes: row.notes,
            status: parse(&row.status)?,
            visit_id: row.visit_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// 数据库就诊表
#[derive(Debug, FromRow)]
pub struct DbVisit {
    pub id: Uuid,
    pub visit_number: String,
    pub patient_id: Uuid,
    pub appointment_id: Option<Uuid>,
    pub department_id: Option<Uuid>,
    pub chief_complaint: Option<String>,
    pub reception_status: String,
    pub nurse_status: String,
    pub doctor_status: String,
    pub lab_status: String,
    pub pharmacy_status: String,
    pub billing_status: String,
    pub current_stage: String,
    pub overall_status: String,
    pub lab_return_stage: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<DbVisit> for PatientVisit {
    type Error = HmsError;

    fn try_from(row: DbVisit) -> Result<Self> {
        let state = VisitState {
            reception_status: parse(&row.reception_status)?,
            nurse_status: parse(&row.nurse_status)?,
            doctor_status: parse(&row.doctor_status)?,
            lab_status: parse(&row.lab_status)?,
            pharmacy_status: parse(&row.pharmacy_status)?,
            billing_status: parse(&row.billing_status)?,
            current_stage: parse(&row.current_stage)?,
            overall_status: parse(&row.overall_status)?,
            lab_return_stage: parse_opt(row.lab_return_stage)?,
        };

        Ok(PatientVisit {
            id: row.id,
            visit_number: row.visit_number,
            patient_id: row.patient_id,
            appointment_id: row.appointment_id,
            department_id: row.department_id,
            chief_complaint: row.chief_complaint,
            state,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

/// 队列查询行（就诊 + 患者姓名）
#[derive(Debug, FromRow)]
pub struct DbQueueRow {
    pub visit_id: Uuid,
    pub visit_number: String,
    pub patient_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub chief_complaint: Option<String>,
    pub stage_status: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
pub struct DbDepartment {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<DbDepartment> for Department {
    fn from(row: DbDepartment) -> Self {
        Department {
            id: row.id,
            name: row.name,
            description: row.description,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct DbService {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub department_id: Option<Uuid>,
    pub price: i64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<DbService> for Service {
    fn from(row: DbService) -> Self {
        Service {
            id: row.id,
            code: row.code,
            name: row.name,
            department_id: row.department_id,
            price: Money::from_minor(row.price),
            active: row.active,
            created_at: row.created_at,
        }
    }
}

/// 数据库药品表
#[derive(Debug, FromRow)]
pub struct DbMedication {
    pub id: Uuid,
    pub name: String,
    pub generic_name: Option<String>,
    pub form: Option<String>,
    pub strength: Option<String>,
    pub unit_price: i64,
    pub stock_quantity: i64,
    pub reorder_level: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DbMedication> for Medication {
    fn from(row: DbMedication) -> Self {
        Medication {
            id: row.id,
            name: row.name,
            generic_name: row.generic_name,
            form: row.form,
            strength: row.strength,
            unit_price: Money::from_minor(row.unit_price),
            stock_quantity: row.stock_quantity,
            reorder_level: row.reorder_level,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct DbPrescription {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub visit_id: Option<Uuid>,
    pub doctor_id: Option<Uuid>,
    pub status: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DbPrescription {
    pub fn into_prescription(self, items: Vec<PrescriptionItem>) -> Result<Prescription> {
        Ok(Prescription {
            id: self.id,
            patient_id: self.patient_id,
            visit_id: self.visit_id,
            doctor_id: self.doctor_id,
            status: parse(&self.status)?,
            notes: self.notes,
            items,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct DbPrescriptionItem {
    pub id: Uuid,
    pub prescription_id: Uuid,
    pub medication_id: Uuid,
    pub dosage: String,
    pub frequency: String,
    pub duration_days: i32,
    pub quantity: i64,
    pub instructions: Option<String>,
    pub dispensed: bool,
    pub dispensed_at: Option<DateTime<Utc>>,
    pub dispensed_by: Option<Uuid>,
}

impl From<DbPrescriptionItem> for PrescriptionItem {
    fn from(row: DbPrescriptionItem) -> Self {
        PrescriptionItem {
            id: row.id,
            prescription_id: row.prescription_id,
            medication_id: row.medication_id,
            dosage: row.dosage,
            frequency: row.frequency,
            duration_days: row.duration_days,
            quantity: row.quantity,
            instructions: row.instructions,
            dispensed: row.dispensed,
            dispensed_at: row.dispensed_at,
            dispensed_by: row.dispensed_by,
        }
    }
}

/// 数据库检验表，结果以 JSON 文本存储
#[derive(Debug, FromRow)]
pub struct DbLabTest {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub visit_id: Option<Uuid>,
    pub test_name: String,
    pub test_code: Option<String>,
    pub ordered_by: Option<Uuid>,
    pub ordered_from: Option<String>,
    pub priority: String,
    pub status: String,
    pub results: Option<String>,
    pub notes: Option<String>,
    pub ordered_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<DbLabTest> for LabTest {
    type Error = HmsError;

    fn try_from(row: DbLabTest) -> Result<Self> {
        let results = match row.results.as_deref() {
            Some(json) if !json.is_empty() => serde_json::from_str(json)?,
            _ => Vec::new(),
        };

        Ok(LabTest {
            id: row.id,
            patient_id: row.patient_id,
            visit_id: row.visit_id,
            test_name: row.test_name,
            test_code: row.test_code,
            ordered_by: row.ordered_by,
            ordered_from: parse_opt(row.ordered_from)?,
            priority: parse(&row.priority)?,
            status: parse(&row.status)?,
            results,
            notes: row.notes,
            ordered_at: row.ordered_at,
            completed_at: row.completed_at,
        })
    }
}

/// 数据库发票表
#[derive(Debug, FromRow)]
pub struct DbInvoice {
    pub id: Uuid,
    pub invoice_number: String,
    pub patient_id: Uuid,
    pub visit_id: Option<Uuid>,
    pub total_amount: i64,
    pub paid_amount: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DbInvoice {
    pub fn total(&self) -> Money {
        Money::from_minor(self.total_amount)
    }

    pub fn paid(&self) -> Money {
        Money::from_minor(self.paid_amount)
    }

    pub fn status(&self) -> Result<InvoiceStatus> {
        parse(&self.status)
    }

    pub fn into_invoice(self, items: Vec<InvoiceItem>) -> Result<Invoice> {
        let status = self.status()?;
        let (total, paid) = (self.total(), self.paid());
        Ok(Invoice {
            id: self.id,
            invoice_number: self.invoice_number,
            patient_id: self.patient_id,
            visit_id: self.visit_id,
            total_amount: total,
            paid_amount: paid,
            balance: total - paid,
            status,
            items,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct DbInvoiceItem {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub description: String,
    pub service_id: Option<Uuid>,
    pub medication_id: Option<Uuid>,
    pub quantity: i64,
    pub unit_price: i64,
    pub total: i64,
    pub created_at: DateTime<Utc>,
}

impl From<DbInvoiceItem> for InvoiceItem {
    fn from(row: DbInvoiceItem) -> Self {
        InvoiceItem {
            id: row.id,
            invoice_id: row.invoice_id,
            description: row.description,
            service_id: row.service_id,
            medication_id: row.medication_id,
            quantity: row.quantity,
            unit_price: Money::from_minor(row.unit_price),
            total: Money::from_minor(row.total),
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct DbPayment {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub amount: i64,
    pub method: String,
    pub reference_number: String,
    pub received_by: Option<Uuid>,
    pub notes: Option<String>,
    pub voided: bool,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DbPayment> for Payment {
    type Error = HmsError;

    fn try_from(row: DbPayment) -> Result<Self> {
        Ok(Payment {
            id: row.id,
            invoice_id: row.invoice_id,
            amount: Money::from_minor(row.amount),
            method: parse(&row.method)?,
            reference_number: row.reference_number,
            received_by: row.received_by,
            notes: row.notes,
            voided: row.voided,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct DbMobilePayment {
    pub id: Uuid,
    pub reference: String,
    pub invoice_id: Uuid,
    pub provider: String,
    pub phone_number: String,
    pub amount: i64,
    pub status: String,
    pub transaction_id: Option<String>,
    pub provider_response: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<DbMobilePayment> for MobilePayment {
    type Error = HmsError;

    fn try_from(row: DbMobilePayment) -> Result<Self> {
        Ok(MobilePayment {
            id: row.id,
            reference: row.reference,
            invoice_id: row.invoice_id,
            provider: parse(&row.provider)?,
            phone_number: row.phone_number,
            amount: Money::from_minor(row.amount),
            status: parse(&row.status)?,
            transaction_id: row.transaction_id,
            provider_response: row.provider_response,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

/// 数据库用户表，包含密码哈希
#[derive(Debug, FromRow)]
pub struct DbUser {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub password_hash: String,
    pub role: String,
    pub department_id: Option<Uuid>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl DbUser {
    /// 拆分为用户信息和密码哈希
    pub fn into_credentials(self) -> Result<(User, String)> {
        let user = User {
            id: self.id,
            username: self.username,
            email: self.email,
            full_name: self.full_name,
            role: parse(&self.role)?,
            department_id: self.department_id,
            is_active: self.is_active,
            created_at: self.created_at,
            last_login: self.last_login,
        };
        Ok((user, self.password_hash))
    }
}

#[derive(Debug, FromRow)]
pub struct DbActivityLog {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<Uuid>,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<DbActivityLog> for ActivityLog {
    fn from(row: DbActivityLog) -> Self {
        ActivityLog {
            id: row.id,
            user_id: row.user_id,
            action: row.action,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            details: row.details,
            created_at: row.created_at,
        }
    }
}

// 插入模型 - 用于创建新记录

/// 新患者插入模型
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct NewPatient {
    pub first_name: String,
    pub last_name: String,
    pub gender: Option<Gender>,
    pub date_of_birth: Option<NaiveDate>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub blood_group: Option<String>,
    pub allergies: Option<String>,
    pub chronic_conditions: Option<String>,
    pub emergency_contact_name: Option<String>,
    pub emergency_contact_phone: Option<String>,
}

/// 患者更新模型，未提供的字段保持不变
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct UpdatePatient {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub gender: Option<Gender>,
    pub date_of_birth: Option<NaiveDate>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub blood_group: Option<String>,
    pub allergies: Option<String>,
    pub chronic_conditions: Option<String>,
    pub emergency_contact_name: Option<String>,
    pub emergency_contact_phone: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewAppointment {
    pub patient_id: Uuid,
    pub doctor_id: Option<Uuid>,
    pub department_id: Option<Uuid>,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default = "default_duration")]
    pub duration_minutes: i32,
    pub reason: Option<String>,
    pub notes: Option<String>,
}

fn default_duration() -> i32 {
    30
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct UpdateAppointment {
    pub doctor_id: Option<Uuid>,
    pub department_id: Option<Uuid>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i32>,
    pub reason: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewVisit {
    pub patient_id: Uuid,
    pub appointment_id: Option<Uuid>,
    pub department_id: Option<Uuid>,
    pub chief_complaint: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewDepartment {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewService {
    pub code: String,
    pub name: String,
    pub department_id: Option<Uuid>,
    pub price: Money,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct UpdateService {
    pub name: Option<String>,
    pub department_id: Option<Uuid>,
    pub price: Option<Money>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewMedication {
    pub name: String,
    pub generic_name: Option<String>,
    pub form: Option<String>,
    pub strength: Option<String>,
    pub unit_price: Money,
    #[serde(default)]
    pub stock_quantity: i64,
    #[serde(default)]
    pub reorder_level: i64,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewPrescriptionItem {
    pub medication_id: Uuid,
    pub dosage: String,
    pub frequency: String,
    pub duration_days: i32,
    pub quantity: i64,
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewPrescription {
    pub patient_id: Uuid,
    pub visit_id: Option<Uuid>,
    pub doctor_id: Option<Uuid>,
    pub notes: Option<String>,
    pub items: Vec<NewPrescriptionItem>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewLabTest {
    pub patient_id: Uuid,
    pub visit_id: Option<Uuid>,
    pub test_name: String,
    pub test_code: Option<String>,
    pub ordered_by: Option<Uuid>,
    pub priority: Option<LabPriority>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewInvoiceItem {
    pub description: Option<String>,
    pub service_id: Option<Uuid>,
    pub medication_id: Option<Uuid>,
    pub quantity: i64,
    /// 未提供时取收费项目价格
    pub unit_price: Option<Money>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewInvoice {
    pub patient_id: Uuid,
    pub visit_id: Option<Uuid>,
    #[serde(default)]
    pub items: Vec<NewInvoiceItem>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewPayment {
    pub amount: Money,
    pub method: PaymentMethod,
    /// 未提供时自动生成
    pub reference_number: Option<String>,
    #[serde(skip)]
    pub received_by: Option<Uuid>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewMobilePayment {
    pub reference: String,
    pub invoice_id: Uuid,
    pub provider: MobileProvider,
    pub phone_number: String,
    pub amount: Money,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub password_hash: String,
    pub role: UserRole,
    pub department_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateUser {
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub password_hash: Option<String>,
    pub role: Option<UserRole>,
    pub department_id: Option<Uuid>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct NewActivity {
    pub user_id: Option<Uuid>,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<Uuid>,
    pub details: Option<String>,
}

impl NewActivity {
    pub fn new(user_id: Option<Uuid>, action: &str, entity_type: &str, entity_id: Option<Uuid>) -> Self {
        Self {
            user_id,
            action: action.to_string(),
            entity_type: entity_type.to_string(),
            entity_id,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

// 查询过滤条件

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct AppointmentFilter {
    pub patient_id: Option<Uuid>,
    pub doctor_id: Option<Uuid>,
    pub status: Option<AppointmentStatus>,
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct VisitFilter {
    pub patient_id: Option<Uuid>,
    pub stage: Option<VisitStage>,
    pub overall_status: Option<OverallStatus>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct PrescriptionFilter {
    pub patient_id: Option<Uuid>,
    pub visit_id: Option<Uuid>,
    pub status: Option<PrescriptionStatus>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct LabTestFilter {
    pub patient_id: Option<Uuid>,
    pub visit_id: Option<Uuid>,
    pub status: Option<LabTestStatus>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct InvoiceFilter {
    pub patient_id: Option<Uuid>,
    pub visit_id: Option<Uuid>,
    pub status: Option<InvoiceStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visit_row() -> DbVisit {
        DbVisit {
            id: Uuid::new_v4(),
            visit_number: "VIS-20240101-ABCDEF".to_string(),
            patient_id: Uuid::new_v4(),
            appointment_id: None,
            department_id: None,
            chief_complaint: None,
            reception_status: "completed".to_string(),
            nurse_status: "on_hold".to_string(),
            doctor_status: "not_started".to_string(),
            lab_status: "pending".to_string(),
            pharmacy_status: "not_started".to_string(),
            billing_status: "not_started".to_string(),
            current_stage: "lab".to_string(),
            overall_status: "active".to_string(),
            lab_return_stage: Some("nurse".to_string()),
            version: 3,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn test_visit_row_conversion() {
        let visit = PatientVisit::try_from(visit_row()).unwrap();
        assert_eq!(visit.state.current_stage, VisitStage::Lab);
        assert_eq!(visit.state.nurse_status, StageStatus::OnHold);
        assert_eq!(visit.state.lab_return_stage, Some(VisitStage::Nurse));
        assert_eq!(visit.version, 3);
    }

    #[test]
    fn test_unknown_stored_status_is_an_error() {
        let mut row = visit_row();
        row.nurse_status = "Partially Done".to_string();
        assert!(PatientVisit::try_from(row).is_err());
    }

    #[test]
    fn test_invoice_balance_derived_from_amounts() {
        let row = DbInvoice {
            id: Uuid::new_v4(),
            invoice_number: "INV-1".to_string(),
            patient_id: Uuid::new_v4(),
            visit_id: None,
            total_amount: 15000,
            paid_amount: 8000,
            status: "partial".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let invoice = row.into_invoice(Vec::new()).unwrap();
        assert_eq!(invoice.balance, Money::from_major(70));
        assert_eq!(invoice.status, InvoiceStatus::Partial);
    }
}
