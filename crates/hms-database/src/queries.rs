//! 数据库查询操作
//!
//! 表结构、患者、科室、收费项目、用户与操作日志。就诊、账单、药房和检验的
//! 查询分别位于同名模块中，均为 `DatabaseQueries` 的方法。

use crate::connection::DatabasePool;
use crate::models::*;
use chrono::Utc;
use hms_core::utils::{generate_reference, non_empty};
use hms_core::{
    ActivityLog, Department, HmsError, Page, PageRequest, Patient, Result, Service, User, UserRole,
};
use sqlx::{QueryBuilder, Sqlite};
use uuid::Uuid;

/// 数据库查询操作接口
pub struct DatabaseQueries<'a> {
    pool: &'a DatabasePool,
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS departments (
        id BLOB PRIMARY KEY,
        name TEXT UNIQUE NOT NULL,
        description TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id BLOB PRIMARY KEY,
        username TEXT UNIQUE NOT NULL,
        email TEXT UNIQUE NOT NULL,
        full_name TEXT NOT NULL,
        password_hash TEXT NOT NULL,
        role TEXT NOT NULL,
        department_id BLOB REFERENCES departments(id),
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        last_login TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS services (
        id BLOB PRIMARY KEY,
        code TEXT UNIQUE NOT NULL,
        name TEXT NOT NULL,
        department_id BLOB REFERENCES departments(id),
        price INTEGER NOT NULL CHECK (price >= 0),
        active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS patients (
        id BLOB PRIMARY KEY,
        patient_number TEXT UNIQUE NOT NULL,
        first_name TEXT NOT NULL,
        last_name TEXT NOT NULL,
        gender TEXT,
        date_of_birth TEXT,
        phone TEXT,
        email TEXT,
        address TEXT,
        blood_group TEXT,
        allergies TEXT,
        chronic_conditions TEXT,
        emergency_contact_name TEXT,
        emergency_contact_phone TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS patient_visits (
        id BLOB PRIMARY KEY,
        visit_number TEXT UNIQUE NOT NULL,
        patient_id BLOB NOT NULL REFERENCES patients(id),
        appointment_id BLOB,
        department_id BLOB REFERENCES departments(id),
        chief_complaint TEXT,
        reception_status TEXT NOT NULL,
        nurse_status TEXT NOT NULL,
        doctor_status TEXT NOT NULL,
        lab_status TEXT NOT NULL,
        pharmacy_status TEXT NOT NULL,
        billing_status TEXT NOT NULL,
        current_stage TEXT NOT NULL,
        overall_status TEXT NOT NULL,
        lab_return_stage TEXT,
        version INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        completed_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS appointments (
        id BLOB PRIMARY KEY,
        patient_id BLOB NOT NULL REFERENCES patients(id),
        doctor_id BLOB REFERENCES users(id),
        department_id BLOB REFERENCES departments(id),
        scheduled_at TEXT NOT NULL,
        duration_minutes INTEGER NOT NULL,
        reason TEXT,
        notes TEXT,
        status TEXT NOT NULL,
        visit_id BLOB REFERENCES patient_visits(id),
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS medications (
        id BLOB PRIMARY KEY,
        name TEXT UNIQUE NOT NULL,
        generic_name TEXT,
        form TEXT,
        strength TEXT,
        unit_price INTEGER NOT NULL CHECK (unit_price >= 0),
        stock_quantity INTEGER NOT NULL DEFAULT 0 CHECK (stock_quantity >= 0),
        reorder_level INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS prescriptions (
        id BLOB PRIMARY KEY,
        patient_id BLOB NOT NULL REFERENCES patients(id),
        visit_id BLOB REFERENCES patient_visits(id),
        doctor_id BLOB REFERENCES users(id),
        status TEXT NOT NULL,
        notes TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS prescription_items (
        id BLOB PRIMARY KEY,
        prescription_id BLOB NOT NULL REFERENCES prescriptions(id) ON DELETE CASCADE,
        medication_id BLOB NOT NULL REFERENCES medications(id),
        dosage TEXT NOT NULL,
        frequency TEXT NOT NULL,
        duration_days INTEGER NOT NULL,
        quantity INTEGER NOT NULL CHECK (quantity > 0),
        instructions TEXT,
        dispensed INTEGER NOT NULL DEFAULT 0,
        dispensed_at TEXT,
        dispensed_by BLOB
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS lab_tests (
        id BLOB PRIMARY KEY,
        patient_id BLOB NOT NULL REFERENCES patients(id),
        visit_id BLOB REFERENCES patient_visits(id),
        test_name TEXT NOT NULL,
        test_code TEXT,
        ordered_by BLOB,
        ordered_from TEXT,
        priority TEXT NOT NULL,
        status TEXT NOT NULL,
        results TEXT,
        notes TEXT,
        ordered_at TEXT NOT NULL,
        completed_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS invoices (
        id BLOB PRIMARY KEY,
        invoice_number TEXT UNIQUE NOT NULL,
        patient_id BLOB NOT NULL REFERENCES patients(id),
        visit_id BLOB REFERENCES patient_visits(id),
        total_amount INTEGER NOT NULL DEFAULT 0,
        paid_amount INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        CHECK (paid_amount >= 0 AND paid_amount <= total_amount)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS invoice_items (
        id BLOB PRIMARY KEY,
        invoice_id BLOB NOT NULL REFERENCES invoices(id) ON DELETE CASCADE,
        description TEXT NOT NULL,
        service_id BLOB REFERENCES services(id),
        medication_id BLOB REFERENCES medications(id),
        quantity INTEGER NOT NULL CHECK (quantity > 0),
        unit_price INTEGER NOT NULL,
        total INTEGER NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS payments (
        id BLOB PRIMARY KEY,
        invoice_id BLOB NOT NULL REFERENCES invoices(id),
        amount INTEGER NOT NULL CHECK (amount > 0),
        method TEXT NOT NULL,
        reference_number TEXT UNIQUE NOT NULL,
        received_by BLOB,
        notes TEXT,
        voided INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS mobile_payments (
        id BLOB PRIMARY KEY,
        reference TEXT UNIQUE NOT NULL,
        invoice_id BLOB NOT NULL REFERENCES invoices(id),
        provider TEXT NOT NULL,
        phone_number TEXT NOT NULL,
        amount INTEGER NOT NULL CHECK (amount > 0),
        status TEXT NOT NULL,
        transaction_id TEXT,
        provider_response TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        completed_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS activity_logs (
        id BLOB PRIMARY KEY,
        user_id BLOB,
        action TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        entity_id BLOB,
        details TEXT,
        created_at TEXT NOT NULL
    )
    "#,
];

impl<'a> DatabaseQueries<'a> {
    pub fn new(pool: &'a DatabasePool) -> Self {
        Self { pool }
    }

    pub(crate) fn pool(&self) -> &'a DatabasePool {
        self.pool
    }

    /// 创建数据库表
    pub async fn create_tables(&self) -> Result<()> {
        let pool = self.pool.pool();

        for statement in SCHEMA {
            sqlx::query(statement).execute(pool).await?;
        }

        // 创建索引以优化查询性能
        self.create_indexes().await?;

        tracing::info!("Database tables created successfully");
        Ok(())
    }

    /// 创建数据库索引
    async fn create_indexes(&self) -> Result<()> {
        let pool = self.pool.pool();

        let indexes = vec![
            "CREATE INDEX IF NOT EXISTS idx_patients_name ON patients(last_name, first_name)",
            "CREATE INDEX IF NOT EXISTS idx_patients_phone ON patients(phone)",
            "CREATE INDEX IF NOT EXISTS idx_appointments_patient ON appointments(patient_id)",
            "CREATE INDEX IF NOT EXISTS idx_appointments_doctor ON appointments(doctor_id, scheduled_at)",
            "CREATE INDEX IF NOT EXISTS idx_visits_patient ON patient_visits(patient_id)",
            "CREATE INDEX IF NOT EXISTS idx_visits_stage ON patient_visits(current_stage, overall_status)",
            // 每位患者同一时间只有一个进行中的就诊
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_visits_one_active ON patient_visits(patient_id) WHERE overall_status = 'active'",
            "CREATE INDEX IF NOT EXISTS idx_prescriptions_visit ON prescriptions(visit_id)",
            "CREATE INDEX IF NOT EXISTS idx_prescription_items_prescription ON prescription_items(prescription_id)",
            "CREATE INDEX IF NOT EXISTS idx_lab_tests_visit ON lab_tests(visit_id, status)",
            "CREATE INDEX IF NOT EXISTS idx_invoices_visit ON invoices(visit_id)",
            "CREATE INDEX IF NOT EXISTS idx_invoices_patient ON invoices(patient_id)",
            "CREATE INDEX IF NOT EXISTS idx_invoice_items_invoice ON invoice_items(invoice_id)",
            "CREATE INDEX IF NOT EXISTS idx_payments_invoice ON payments(invoice_id)",
            "CREATE INDEX IF NOT EXISTS idx_mobile_payments_invoice ON mobile_payments(invoice_id)",
            "CREATE INDEX IF NOT EXISTS idx_activity_logs_entity ON activity_logs(entity_type, entity_id)",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql).execute(pool).await?;
        }

        tracing::info!("Database indexes created successfully");
        Ok(())
    }

    // ========== 患者相关操作 ==========

    /// 登记新患者
    pub async fn create_patient(&self, patient: &NewPatient) -> Result<Patient> {
        let first_name = patient.first_name.trim();
        let last_name = patient.last_name.trim();
        if first_name.is_empty() || last_name.is_empty() {
            return Err(HmsError::Validation("first_name and last_name are required".to_string()));
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO patients (id, patient_number, first_name, last_name, gender, date_of_birth,
                phone, email, address, blood_group, allergies, chronic_conditions,
                emergency_contact_name, emergency_contact_phone, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(generate_reference("PAT"))
        .bind(first_name)
        .bind(last_name)
        .bind(patient.gender.map(|g| g.as_str()))
        .bind(patient.date_of_birth)
        .bind(non_empty(patient.phone.clone()))
        .bind(non_empty(patient.email.clone()))
        .bind(non_empty(patient.address.clone()))
        .bind(non_empty(patient.blood_group.clone()))
        .bind(non_empty(patient.allergies.clone()))
        .bind(non_empty(patient.chronic_conditions.clone()))
        .bind(non_empty(patient.emergency_contact_name.clone()))
        .bind(non_empty(patient.emergency_contact_phone.clone()))
        .bind(now)
        .bind(now)
        .execute(self.pool.pool())
        .await?;

        tracing::info!("Registered patient {}", id);
        self.get_patient(id).await
    }

    /// 根据ID查找患者
    pub async fn get_patient_by_id(&self, id: Uuid) -> Result<Option<Patient>> {
        let result = sqlx::query_as::<_, DbPatient>("SELECT * FROM patients WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;

        result.map(Patient::try_from).transpose()
    }

    pub async fn get_patient(&self, id: Uuid) -> Result<Patient> {
        self.get_patient_by_id(id)
            .await?
            .ok_or_else(|| HmsError::not_found("patient", id))
    }

    /// 分页查询患者，支持按姓名、病历号或电话模糊搜索
    pub async fn list_patients(&self, search: Option<&str>, page: PageRequest) -> Result<Page<Patient>> {
        let pattern = search
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", s));

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM patients");
        push_patient_search(&mut count, pattern.as_deref());
        let total: i64 = count.build_query_scalar().fetch_one(self.pool.pool()).await?;

        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM patients");
        push_patient_search(&mut query, pattern.as_deref());
        query
            .push(" ORDER BY updated_at DESC LIMIT ")
            .push_bind(page.limit())
            .push(" OFFSET ")
            .push_bind(page.offset());

        let rows: Vec<DbPatient> = query.build_query_as().fetch_all(self.pool.pool()).await?;
        let items = rows.into_iter().map(Patient::try_from).collect::<Result<Vec<_>>>()?;
        Ok(Page::new(items, total, page))
    }

    /// 更新患者信息
    pub async fn update_patient(&self, id: Uuid, update: &UpdatePatient) -> Result<Patient> {
        let result = sqlx::query(
            r#"
            UPDATE patients SET
                first_name = COALESCE(?, first_name),
                last_name = COALESCE(?, last_name),
                gender = COALESCE(?, gender),
                date_of_birth = COALESCE(?, date_of_birth),
                phone = COALESCE(?, phone),
                email = COALESCE(?, email),
                address = COALESCE(?, address),
                blood_group = COALESCE(?, blood_group),
                allergies = COALESCE(?, allergies),
                chronic_conditions = COALESCE(?, chronic_conditions),
                emergency_contact_name = COALESCE(?, emergency_contact_name),
                emergency_contact_phone = COALESCE(?, emergency_contact_phone),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(non_empty(update.first_name.clone()))
        .bind(non_empty(update.last_name.clone()))
        .bind(update.gender.map(|g| g.as_str()))
        .bind(update.date_of_birth)
        .bind(non_empty(update.phone.clone()))
        .bind(non_empty(update.email.clone()))
        .bind(non_empty(update.address.clone()))
        .bind(non_empty(update.blood_group.clone()))
        .bind(non_empty(update.allergies.clone()))
        .bind(non_empty(update.chronic_conditions.clone()))
        .bind(non_empty(update.emergency_contact_name.clone()))
        .bind(non_empty(update.emergency_contact_phone.clone()))
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(HmsError::not_found("patient", id));
        }
        self.get_patient(id).await
    }

    /// 删除患者，已有就诊或账单记录的患者不允许删除
    pub async fn delete_patient(&self, id: Uuid) -> Result<()> {
        let references: i64 = sqlx::query_scalar(
            r#"
            SELECT (SELECT COUNT(*) FROM patient_visits WHERE patient_id = ?)
                 + (SELECT COUNT(*) FROM invoices WHERE patient_id = ?)
                 + (SELECT COUNT(*) FROM appointments WHERE patient_id = ?)
            "#,
        )
        .bind(id)
        .bind(id)
        .bind(id)
        .fetch_one(self.pool.pool())
        .await?;

        if references > 0 {
            return Err(HmsError::Conflict(
                "patient has visits, appointments or invoices and cannot be deleted".to_string(),
            ));
        }

        let result = sqlx::query("DELETE FROM patients WHERE id = ?")
            .bind(id)
            .execute(self.pool.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(HmsError::not_found("patient", id));
        }

        tracing::info!("Deleted patient {}", id);
        Ok(())
    }

    // ========== 科室与收费项目 ==========

    pub async fn create_department(&self, department: &NewDepartment) -> Result<Department> {
        let name = department.name.trim();
        if name.is_empty() {
            return Err(HmsError::Validation("department name is required".to_string()));
        }

        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO departments (id, name, description, created_at) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(name)
            .bind(non_empty(department.description.clone()))
            .bind(Utc::now())
            .execute(self.pool.pool())
            .await?;

        self.get_department(id).await
    }

    pub async fn get_department(&self, id: Uuid) -> Result<Department> {
        sqlx::query_as::<_, DbDepartment>("SELECT * FROM departments WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?
            .map(Department::from)
            .ok_or_else(|| HmsError::not_found("department", id))
    }

    pub async fn list_departments(&self) -> Result<Vec<Department>> {
        let rows = sqlx::query_as::<_, DbDepartment>("SELECT * FROM departments ORDER BY name")
            .fetch_all(self.pool.pool())
            .await?;
        Ok(rows.into_iter().map(Department::from).collect())
    }

    pub async fn create_service(&self, service: &NewService) -> Result<Service> {
        if service.code.trim().is_empty() || service.name.trim().is_empty() {
            return Err(HmsError::Validation("service code and name are required".to_string()));
        }
        if service.price.is_negative() {
            return Err(HmsError::Validation("service price cannot be negative".to_string()));
        }

        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO services (id, code, name, department_id, price, active, created_at) VALUES (?, ?, ?, ?, ?, 1, ?)",
        )
        .bind(id)
        .bind(service.code.trim())
        .bind(service.name.trim())
        .bind(service.department_id)
        .bind(service.price.minor())
        .bind(Utc::now())
        .execute(self.pool.pool())
        .await?;

        self.get_service(id).await
    }

    pub async fn get_service(&self, id: Uuid) -> Result<Service> {
        sqlx::query_as::<_, DbService>("SELECT * FROM services WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?
            .map(Service::from)
            .ok_or_else(|| HmsError::not_found("service", id))
    }

    pub async fn list_services(&self, department_id: Option<Uuid>, active_only: bool) -> Result<Vec<Service>> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM services WHERE 1 = 1");
        if let Some(department_id) = department_id {
            query.push(" AND department_id = ").push_bind(department_id);
        }
        if active_only {
            query.push(" AND active = 1");
        }
        query.push(" ORDER BY name");

        let rows: Vec<DbService> = query.build_query_as().fetch_all(self.pool.pool()).await?;
        Ok(rows.into_iter().map(Service::from).collect())
    }

    pub async fn update_service(&self, id: Uuid, update: &UpdateService) -> Result<Service> {
        if update.price.map(|p| p.is_negative()).unwrap_or(false) {
            return Err(HmsError::Validation("service price cannot be negative".to_string()));
        }

        let result = sqlx::query(
            r#"
            UPDATE services SET
                name = COALESCE(?, name),
                department_id = COALESCE(?, department_id),
                price = COALESCE(?, price),
                active = COALESCE(?, active)
            WHERE id = ?
            "#,
        )
        .bind(non_empty(update.name.clone()))
        .bind(update.department_id)
        .bind(update.price.map(|p| p.minor()))
        .bind(update.active)
        .bind(id)
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(HmsError::not_found("service", id));
        }
        self.get_service(id).await
    }

    // ========== 用户 ==========

    pub async fn create_user(&self, user: &NewUser) -> Result<User> {
        if user.username.trim().is_empty() || user.email.trim().is_empty() {
            return Err(HmsError::Validation("username and email are required".to_string()));
        }

        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO users (id, username, email, full_name, password_hash, role, department_id, is_active, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(id)
        .bind(user.username.trim())
        .bind(user.email.trim())
        .bind(user.full_name.trim())
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .bind(user.department_id)
        .bind(Utc::now())
        .execute(self.pool.pool())
        .await?;

        tracing::info!("Created user {} with role {}", user.username, user.role);
        self.get_user(id).await
    }

    pub async fn get_user(&self, id: Uuid) -> Result<User> {
        sqlx::query_as::<_, DbUser>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?
            .ok_or_else(|| HmsError::not_found("user", id))?
            .into_credentials()
            .map(|(user, _)| user)
    }

    /// 按用户名查找用户及其密码哈希
    pub async fn find_credentials(&self, username: &str) -> Result<Option<(User, String)>> {
        sqlx::query_as::<_, DbUser>("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(self.pool.pool())
            .await?
            .map(DbUser::into_credentials)
            .transpose()
    }

    pub async fn list_users(&self, role: Option<UserRole>) -> Result<Vec<User>> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM users");
        if let Some(role) = role {
            query.push(" WHERE role = ").push_bind(role.as_str());
        }
        query.push(" ORDER BY username");

        let rows: Vec<DbUser> = query.build_query_as().fetch_all(self.pool.pool()).await?;
        rows.into_iter()
            .map(|row| row.into_credentials().map(|(user, _)| user))
            .collect()
    }

    pub async fn update_user(&self, id: Uuid, update: &UpdateUser) -> Result<User> {
        let result = sqlx::query(
            r#"
            UPDATE users SET
                email = COALESCE(?, email),
                full_name = COALESCE(?, full_name),
                password_hash = COALESCE(?, password_hash),
                role = COALESCE(?, role),
                department_id = COALESCE(?, department_id),
                is_active = COALESCE(?, is_active)
            WHERE id = ?
            "#,
        )
        .bind(non_empty(update.email.clone()))
        .bind(non_empty(update.full_name.clone()))
        .bind(update.password_hash.as_deref())
        .bind(update.role.map(|r| r.as_str()))
        .bind(update.department_id)
        .bind(update.is_active)
        .bind(id)
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(HmsError::not_found("user", id));
        }
        self.get_user(id).await
    }

    pub async fn count_users(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(self.pool.pool())
            .await?;
        Ok(count)
    }

    pub async fn record_login(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE users SET last_login = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }

    // ========== 操作日志 ==========

    pub async fn log_activity(&self, activity: &NewActivity) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO activity_logs (id, user_id, action, entity_type, entity_id, details, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(activity.user_id)
        .bind(&activity.action)
        .bind(&activity.entity_type)
        .bind(activity.entity_id)
        .bind(&activity.details)
        .bind(Utc::now())
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    pub async fn list_activity(
        &self,
        entity_type: Option<&str>,
        entity_id: Option<Uuid>,
        page: PageRequest,
    ) -> Result<Page<ActivityLog>> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM activity_logs WHERE 1 = 1");
        push_activity_filter(&mut count, entity_type, entity_id);
        let total: i64 = count.build_query_scalar().fetch_one(self.pool.pool()).await?;

        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM activity_logs WHERE 1 = 1");
        push_activity_filter(&mut query, entity_type, entity_id);
        query
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(page.limit())
            .push(" OFFSET ")
            .push_bind(page.offset());

        let rows: Vec<DbActivityLog> = query.build_query_as().fetch_all(self.pool.pool()).await?;
        Ok(Page::new(rows.into_iter().map(ActivityLog::from).collect(), total, page))
    }
}

fn push_patient_search<'q>(query: &mut QueryBuilder<'q, Sqlite>, pattern: Option<&str>) {
    if let Some(pattern) = pattern {
        let pattern = pattern.to_string();
        query
            .push(" WHERE first_name LIKE ")
            .push_bind(pattern.clone())
            .push(" OR last_name LIKE ")
            .push_bind(pattern.clone())
            .push(" OR patient_number LIKE ")
            .push_bind(pattern.clone())
            .push(" OR phone LIKE ")
            .push_bind(pattern);
    }
}

fn push_activity_filter<'q>(query: &mut QueryBuilder<'q, Sqlite>, entity_type: Option<&str>, entity_id: Option<Uuid>) {
    if let Some(entity_type) = entity_type {
        query.push(" AND entity_type = ").push_bind(entity_type.to_string());
    }
    if let Some(entity_id) = entity_id {
        query.push(" AND entity_id = ").push_bind(entity_id);
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn test_patient_crud() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);

        let created = patient(&db, "Asha").await;
        assert!(created.patient_number.starts_with("PAT-"));

        let updated = db
            .update_patient(
                created.id,
                &UpdatePatient {
                    allergies: Some("penicillin".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.allergies.as_deref(), Some("penicillin"));
        assert_eq!(updated.first_name, "Asha");

        let page = db.list_patients(Some("ash"), PageRequest::default()).await.unwrap();
        assert_eq!(page.total, 1);

        db.delete_patient(created.id).await.unwrap();
        assert!(db.get_patient_by_id(created.id).await.unwrap().is_none());
        assert!(matches!(db.delete_patient(created.id).await, Err(HmsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_patient_requires_names() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);
        let err = db
            .create_patient(&NewPatient {
                first_name: " ".to_string(),
                last_name: "X".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HmsError::Validation(_)));
    }

    #[tokio::test]
    async fn test_duplicate_username_is_conflict() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);
        let new_user = NewUser {
            username: "cashier1".to_string(),
            email: "c1@example.com".to_string(),
            full_name: "Cashier One".to_string(),
            password_hash: "hash".to_string(),
            role: UserRole::Cashier,
            department_id: None,
        };
        db.create_user(&new_user).await.unwrap();

        let err = db
            .create_user(&NewUser {
                email: "other@example.com".to_string(),
                ..new_user
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HmsError::Conflict(_)));

        let (user, hash) = db.find_credentials("cashier1").await.unwrap().unwrap();
        assert_eq!(user.role, UserRole::Cashier);
        assert_eq!(hash, "hash");
    }

    #[tokio::test]
    async fn test_services_and_activity_log() {
        let pool = memory_pool().await;
        let db = DatabaseQueries::new(&pool);

        let department = db
            .create_department(&NewDepartment {
                name: "Outpatient".to_string(),
                description: None,
            })
            .await
            .unwrap();
        let service = db
            .create_service(&NewService {
                code: "CONS".to_string(),
                name: "Consultation".to_string(),
                department_id: Some(department.id),
                price: "25000.00".parse().unwrap(),
            })
            .await
            .unwrap();
        assert_eq!(db.list_services(Some(department.id), true).await.unwrap().len(), 1);

        let service = db
            .update_service(
                service.id,
                &UpdateService {
                    active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!service.active);
        assert!(db.list_services(None, true).await.unwrap().is_empty());

        db.log_activity(&NewActivity::new(None, "update", "service", Some(service.id)))
            .await
            .unwrap();
        let logs = db
            .list_activity(Some("service"), Some(service.id), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(logs.total, 1);
        assert_eq!(logs.items[0].action, "update");
    }
}
