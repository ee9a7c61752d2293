//! 药房发药规则

use hms_core::{HmsError, PrescriptionStatus, Result};

/// 处方明细的校验参数
#[derive(Debug, Clone)]
pub struct ItemSpec<'a> {
    pub dosage: &'a str,
    pub frequency: &'a str,
    pub duration_days: i32,
    pub quantity: i64,
}

/// 校验处方明细
pub fn validate_item(item: &ItemSpec<'_>) -> Result<()> {
    if item.dosage.trim().is_empty() {
        return Err(HmsError::Validation("dosage is required".to_string()));
    }
    if item.frequency.trim().is_empty() {
        return Err(HmsError::Validation("frequency is required".to_string()));
    }
    if item.duration_days <= 0 {
        return Err(HmsError::Validation("duration_days must be positive".to_string()));
    }
    if item.quantity <= 0 {
        return Err(HmsError::Validation("quantity must be positive".to_string()));
    }
    Ok(())
}

/// 根据已发药明细数推导处方状态
pub fn derive_status(dispensed: usize, total: usize) -> PrescriptionStatus {
    if dispensed == 0 {
        PrescriptionStatus::Pending
    } else if dispensed >= total {
        PrescriptionStatus::Dispensed
    } else {
        PrescriptionStatus::PartiallyDispensed
    }
}

/// 发药前置检查
pub fn check_dispensable(status: PrescriptionStatus, already_dispensed: bool) -> Result<()> {
    if status == PrescriptionStatus::Cancelled {
        return Err(HmsError::Conflict("prescription is cancelled".to_string()));
    }
    if already_dispensed {
        return Err(HmsError::Conflict("prescription item already dispensed".to_string()));
    }
    Ok(())
}

/// 库存检查
pub fn check_stock(medication: &str, available: i64, requested: i64) -> Result<()> {
    if requested > available {
        return Err(HmsError::Conflict(format!(
            "insufficient stock for {}: requested {}, available {}",
            medication, requested, available
        )));
    }
    Ok(())
}

/// 取消处方，已有发药记录的不允许
pub fn check_cancellable(status: PrescriptionStatus) -> Result<()> {
    match status {
        PrescriptionStatus::Pending => Ok(()),
        PrescriptionStatus::Cancelled => {
            Err(HmsError::Conflict("prescription is already cancelled".to_string()))
        }
        _ => Err(HmsError::Conflict(
            "prescription with dispensed items cannot be cancelled".to_string(),
        )),
    }
}
