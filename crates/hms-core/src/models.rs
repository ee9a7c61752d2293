//! 核心数据模型定义

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::money::Money;

/// 为以字符串形式存储在数据库中的枚举生成 `as_str` / `FromStr` / `Display`
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            pub fn all() -> Vec<Self> {
                vec![$(Self::$variant),+]
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::error::HmsError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(crate::error::HmsError::Validation(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// ========== 患者 ==========

/// 性别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    Other,
}

string_enum!(Gender { Male => "male", Female => "female", Other => "other" });

/// 患者基本信息与病史
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub id: Uuid,
    pub patient_number: String, // 医院内部病历号
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
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ========== 预约 ==========

/// 预约状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,  // 已预约
    Confirmed,  // 已确认
    InProgress, // 就诊中
    Completed,  // 已完成
    Cancelled,  // 已取消
}

string_enum!(AppointmentStatus {
    Scheduled => "scheduled",
    Confirmed => "confirmed",
    InProgress => "in_progress",
    Completed => "completed",
    Cancelled => "cancelled",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub doctor_id: Option<Uuid>,
    pub department_id: Option<Uuid>,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: i32,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub status: AppointmentStatus,
    pub visit_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ========== 就诊流程 ==========

/// 就诊阶段
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum VisitStage {
    Reception,
    Nurse,
    Doctor,
    Lab,
    Pharmacy,
    Billing,
    Discharged,
}

string_enum!(VisitStage {
    Reception => "reception",
    Nurse => "nurse",
    Doctor => "doctor",
    Lab => "lab",
    Pharmacy => "pharmacy",
    Billing => "billing",
    Discharged => "discharged",
});

/// 单个科室阶段的处理状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    NotStarted, // 尚未到达
    Pending,    // 排队等候
    InProgress, // 处理中
    OnHold,     // 等待化验结果
    Completed,  // 已完成
    Skipped,    // 已跳过
}

string_enum!(StageStatus {
    NotStarted => "not_started",
    Pending => "pending",
    InProgress => "in_progress",
    OnHold => "on_hold",
    Completed => "completed",
    Skipped => "skipped",
});

impl StageStatus {
    /// 该阶段是否已经结束
    pub fn is_done(&self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Skipped)
    }

    /// 该阶段是否正在排队或处理
    pub fn is_active(&self) -> bool {
        matches!(self, StageStatus::Pending | StageStatus::InProgress)
    }
}

/// 就诊整体状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Active,
    Completed,
    Cancelled,
}

string_enum!(OverallStatus {
    Active => "active",
    Completed => "completed",
    Cancelled => "cancelled",
});

/// 就诊的全部阶段状态
///
/// 六个科室状态、当前阶段指针和整体状态只能通过工作流状态机整体修改。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct VisitState {
    pub reception_status: StageStatus,
    pub nurse_status: StageStatus,
    pub doctor_status: StageStatus,
    pub lab_status: StageStatus,
    pub pharmacy_status: StageStatus,
    pub billing_status: StageStatus,
    pub current_stage: VisitStage,
    pub overall_status: OverallStatus,
    /// 化验完成后返回的阶段（护士或医生）
    pub lab_return_stage: Option<VisitStage>,
}

impl VisitState {
    /// 新登记就诊的初始状态
    pub fn initial() -> Self {
        Self {
            reception_status: StageStatus::Pending,
            nurse_status: StageStatus::NotStarted,
            doctor_status: StageStatus::NotStarted,
            lab_status: StageStatus::NotStarted,
            pharmacy_status: StageStatus::NotStarted,
            billing_status: StageStatus::NotStarted,
            current_stage: VisitStage::Reception,
            overall_status: OverallStatus::Active,
            lab_return_stage: None,
        }
    }

    pub fn status_of(&self, stage: VisitStage) -> Option<StageStatus> {
        match stage {
            VisitStage::Reception => Some(self.reception_status),
            VisitStage::Nurse => Some(self.nurse_status),
            VisitStage::Doctor => Some(self.doctor_status),
            VisitStage::Lab => Some(self.lab_status),
            VisitStage::Pharmacy => Some(self.pharmacy_status),
            VisitStage::Billing => Some(self.billing_status),
            VisitStage::Discharged => None,
        }
    }

    pub fn set_status(&mut self, stage: VisitStage, status: StageStatus) {
        match stage {
            VisitStage::Reception => self.reception_status = status,
            VisitStage::Nurse => self.nurse_status = status,
            VisitStage::Doctor => self.doctor_status = status,
            VisitStage::Lab => self.lab_status = status,
            VisitStage::Pharmacy => self.pharmacy_status = status,
            VisitStage::Billing => self.billing_status = status,
            VisitStage::Discharged => {}
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.overall_status != OverallStatus::Active
    }
}

/// 患者就诊记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientVisit {
    pub id: Uuid,
    pub visit_number: String,
    pub patient_id: Uuid,
    pub appointment_id: Option<Uuid>,
    pub department_id: Option<Uuid>,
    pub chief_complaint: Option<String>,
    #[serde(flatten)]
    pub state: VisitState,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ========== 科室与收费项目 ==========

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Department {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 可收费服务目录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub department_id: Option<Uuid>,
    pub price: Money,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

// ========== 药房 ==========

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Medication {
    pub id: Uuid,
    pub name: String,
    pub generic_name: Option<String>,
    pub form: Option<String>,
    pub strength: Option<String>,
    pub unit_price: Money,
    pub stock_quantity: i64,
    pub reorder_level: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Medication {
    pub fn needs_reorder(&self) -> bool {
        self.stock_quantity <= self.reorder_level
    }
}

/// 处方状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PrescriptionStatus {
    Pending,
    PartiallyDispensed,
    Dispensed,
    Cancelled,
}

string_enum!(PrescriptionStatus {
    Pending => "pending",
    PartiallyDispensed => "partially_dispensed",
    Dispensed => "dispensed",
    Cancelled => "cancelled",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrescriptionItem {
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prescription {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub visit_id: Option<Uuid>,
    pub doctor_id: Option<Uuid>,
    pub status: PrescriptionStatus,
    pub notes: Option<String>,
    pub items: Vec<PrescriptionItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ========== 检验 ==========

/// 检验单状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LabTestStatus {
    Ordered,
    InProgress,
    Completed,
    Cancelled,
}

string_enum!(LabTestStatus {
    Ordered => "ordered",
    InProgress => "in_progress",
    Completed => "completed",
    Cancelled => "cancelled",
});

impl LabTestStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, LabTestStatus::Ordered | LabTestStatus::InProgress)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LabPriority {
    Routine,
    Urgent,
    Stat,
}

string_enum!(LabPriority { Routine => "routine", Urgent => "urgent", Stat => "stat" });

/// 结果标记
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResultFlag {
    Normal,
    Low,
    High,
    Critical,
}

/// 单项检验结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabResult {
    pub parameter: String,
    pub value: String,
    pub unit: Option<String>,
    pub reference_range: Option<String>,
    #[serde(default = "default_flag")]
    pub flag: ResultFlag,
}

fn default_flag() -> ResultFlag {
    ResultFlag::Normal
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabTest {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub visit_id: Option<Uuid>,
    pub test_name: String,
    pub test_code: Option<String>,
    pub ordered_by: Option<Uuid>,
    /// 开单阶段（护士或医生）
    pub ordered_from: Option<VisitStage>,
    pub priority: LabPriority,
    pub status: LabTestStatus,
    pub results: Vec<LabResult>,
    pub notes: Option<String>,
    pub ordered_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl LabTest {
    pub fn has_critical_result(&self) -> bool {
        self.results.iter().any(|r| r.flag == ResultFlag::Critical)
    }
}

// ========== 账单与支付 ==========

/// 发票状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Unpaid,
    Partial,
    Paid,
    Cancelled,
}

string_enum!(InvoiceStatus {
    Unpaid => "unpaid",
    Partial => "partial",
    Paid => "paid",
    Cancelled => "cancelled",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub description: String,
    pub service_id: Option<Uuid>,
    pub medication_id: Option<Uuid>,
    pub quantity: i64,
    pub unit_price: Money,
    pub total: Money,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub invoice_number: String,
    pub patient_id: Uuid,
    pub visit_id: Option<Uuid>,
    pub total_amount: Money,
    pub paid_amount: Money,
    pub balance: Money,
    pub status: InvoiceStatus,
    pub items: Vec<InvoiceItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 支付方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Insurance,
    MobileMoney,
    BankTransfer,
}

string_enum!(PaymentMethod {
    Cash => "cash",
    Card => "card",
    Insurance => "insurance",
    MobileMoney => "mobile_money",
    BankTransfer => "bank_transfer",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub amount: Money,
    pub method: PaymentMethod,
    pub reference_number: String,
    pub received_by: Option<Uuid>,
    pub notes: Option<String>,
    /// 已撤销的付款不再计入发票已付金额
    pub voided: bool,
    pub created_at: DateTime<Utc>,
}

/// 移动支付渠道
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MobileProvider {
    #[serde(rename = "zenopay")]
    ZenoPay,
    Mpesa,
    #[serde(rename = "tigopesa")]
    TigoPesa,
    AirtelMoney,
    #[serde(rename = "halopesa")]
    HaloPesa,
    Simulated,
}

string_enum!(MobileProvider {
    ZenoPay => "zenopay",
    Mpesa => "mpesa",
    TigoPesa => "tigopesa",
    AirtelMoney => "airtel_money",
    HaloPesa => "halopesa",
    Simulated => "simulated",
});

/// 移动支付状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MobilePaymentStatus {
    Pending,
    Completed,
    Failed,
    /// 回调金额超过发票余额，需人工核对
    Review,
}

string_enum!(MobilePaymentStatus {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
    Review => "review",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MobilePayment {
    pub id: Uuid,
    pub reference: String,
    pub invoice_id: Uuid,
    pub provider: MobileProvider,
    pub phone_number: String,
    pub amount: Money,
    pub status: MobilePaymentStatus,
    pub transaction_id: Option<String>,
    pub provider_response: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ========== 用户与审计 ==========

/// 用户角色
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Receptionist,
    Nurse,
    Doctor,
    LabTechnician,
    Pharmacist,
    Cashier,
}

string_enum!(UserRole {
    Admin => "admin",
    Receptionist => "receptionist",
    Nurse => "nurse",
    Doctor => "doctor",
    LabTechnician => "lab_technician",
    Pharmacist => "pharmacist",
    Cashier => "cashier",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub role: UserRole,
    pub department_id: Option<Uuid>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLog {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<Uuid>,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ========== 分页 ==========

/// 分页参数
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub per_page: u32,
}

impl PageRequest {
    pub const DEFAULT_PER_PAGE: u32 = 20;
    pub const MAX_PER_PAGE: u32 = 100;

    pub fn new(page: Option<u32>, per_page: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            per_page: per_page
                .unwrap_or(Self::DEFAULT_PER_PAGE)
                .clamp(1, Self::MAX_PER_PAGE),
        }
    }

    pub fn limit(&self) -> i64 {
        self.per_page as i64
    }

    pub fn offset(&self) -> i64 {
        (self.page as i64 - 1) * self.per_page as i64
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// 分页结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub per_page: u32,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, request: PageRequest) -> Self {
        Self {
            items,
            total,
            page: request.page,
            per_page: request.per_page,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_string_round_trip() {
        for stage in VisitStage::all() {
            assert_eq!(stage.as_str().parse::<VisitStage>().unwrap(), stage);
        }
        assert_eq!("partial".parse::<InvoiceStatus>().unwrap(), InvoiceStatus::Partial);
        assert!("Partially Paid".parse::<InvoiceStatus>().is_err());
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&UserRole::LabTechnician).unwrap();
        assert_eq!(json, "\"lab_technician\"");
        for provider in MobileProvider::all() {
            let json = serde_json::to_string(&provider).unwrap();
            assert_eq!(json, format!("\"{}\"", provider.as_str()));
        }
    }

    #[test]
    fn test_page_request_clamps() {
        let page = PageRequest::new(Some(0), Some(1000));
        assert_eq!(page.page, 1);
        assert_eq!(page.per_page, PageRequest::MAX_PER_PAGE);
        assert_eq!(PageRequest::new(Some(3), Some(10)).offset(), 20);
    }

    #[test]
    fn test_initial_visit_state() {
        let state = VisitState::initial();
        assert_eq!(state.current_stage, VisitStage::Reception);
        assert_eq!(state.status_of(VisitStage::Reception), Some(StageStatus::Pending));
        assert!(!state.is_terminal());
    }
}
