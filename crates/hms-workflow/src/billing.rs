//! 账单规则
//!
//! 发票余额与状态的唯一计算来源。数据库层在事务内执行带条件的原子更新，
//! 这里负责状态推导和拒绝原因的判定。

use hms_core::{HmsError, InvoiceStatus, Money, Result};
use serde::{Deserialize, Serialize};

/// 发票金额快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceBalance {
    pub total: Money,
    pub paid: Money,
    pub status: InvoiceStatus,
}

impl InvoiceBalance {
    pub fn new(total: Money, paid: Money) -> Self {
        Self {
            total,
            paid,
            status: derive_status(total, paid),
        }
    }

    pub fn balance(&self) -> Money {
        self.total - self.paid
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == InvoiceStatus::Cancelled
    }
}

/// 根据总额和已付金额推导发票状态
pub fn derive_status(total: Money, paid: Money) -> InvoiceStatus {
    if !paid.is_positive() {
        InvoiceStatus::Unpaid
    } else if paid >= total {
        InvoiceStatus::Paid
    } else {
        InvoiceStatus::Partial
    }
}

/// 计算明细行金额
pub fn line_total(unit_price: Money, quantity: i64) -> Result<Money> {
    if quantity <= 0 {
        return Err(HmsError::Validation("quantity must be positive".to_string()));
    }
    if unit_price.is_negative() {
        return Err(HmsError::Validation("unit price cannot be negative".to_string()));
    }
    unit_price
        .checked_mul(quantity)
        .ok_or_else(|| HmsError::Validation("line total out of range".to_string()))
}

pub fn validate_amount(amount: Money) -> Result<()> {
    if !amount.is_positive() {
        return Err(HmsError::Validation("payment amount must be positive".to_string()));
    }
    Ok(())
}

/// 入账一笔付款，已付金额永远不超过总额
pub fn apply_payment(current: &InvoiceBalance, amount: Money) -> Result<InvoiceBalance> {
    validate_amount(amount)?;

    if current.is_cancelled() {
        return Err(HmsError::Conflict("invoice is cancelled".to_string()));
    }
    if current.status == InvoiceStatus::Paid {
        return Err(HmsError::Conflict("invoice is already settled".to_string()));
    }

    let paid = current
        .paid
        .checked_add(amount)
        .ok_or_else(|| HmsError::Validation("payment amount out of range".to_string()))?;
    if paid > current.total {
        return Err(HmsError::Conflict(format!(
            "payment of {} exceeds outstanding balance of {}",
            amount,
            current.balance()
        )));
    }

    Ok(InvoiceBalance::new(current.total, paid))
}

/// 撤销一笔付款
pub fn void_payment(current: &InvoiceBalance, amount: Money) -> Result<InvoiceBalance> {
    validate_amount(amount)?;

    if current.is_cancelled() {
        return Err(HmsError::Conflict("invoice is cancelled".to_string()));
    }
    let paid = current.paid - amount;
    if paid.is_negative() {
        return Err(HmsError::Conflict("void would make paid amount negative".to_string()));
    }

    Ok(InvoiceBalance::new(current.total, paid))
}

/// 追加明细行
pub fn add_item(current: &InvoiceBalance, line: Money) -> Result<InvoiceBalance> {
    if current.is_cancelled() {
        return Err(HmsError::Conflict("cannot add items to a cancelled invoice".to_string()));
    }
    let total = current
        .total
        .checked_add(line)
        .ok_or_else(|| HmsError::Validation("invoice total out of range".to_string()))?;
    Ok(InvoiceBalance::new(total, current.paid))
}

/// 作废发票，仅允许未收款的发票
pub fn cancel(current: &InvoiceBalance) -> Result<InvoiceBalance> {
    if current.is_cancelled() {
        return Err(HmsError::Conflict("invoice is already cancelled".to_string()));
    }
    if current.paid.is_positive() {
        return Err(HmsError::Conflict(
            "invoice with recorded payments cannot be cancelled".to_string(),
        ));
    }
    Ok(InvoiceBalance {
        total: current.total,
        paid: current.paid,
        status: InvoiceStatus::Cancelled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn money(s: &str) -> Money {
        s.parse().unwrap()
    }

    #[test]
    fn test_partial_then_full_payment() {
        let invoice = InvoiceBalance::new(money("150.00"), Money::ZERO);
        assert_eq!(invoice.status, InvoiceStatus::Unpaid);

        let after_first = apply_payment(&invoice, money("80.00")).unwrap();
        assert_eq!(after_first.balance(), money("70.00"));
        assert_eq!(after_first.status, InvoiceStatus::Partial);

        let after_second = apply_payment(&after_first, money("70.00")).unwrap();
        assert_eq!(after_second.balance(), Money::ZERO);
        assert_eq!(after_second.status, InvoiceStatus::Paid);
    }

    #[test]
    fn test_overpayment_rejected() {
        let invoice = InvoiceBalance::new(money("150.00"), money("80.00"));
        let err = apply_payment(&invoice, money("70.01")).unwrap_err();
        assert!(matches!(err, HmsError::Conflict(_)));
    }

    #[test]
    fn test_payment_on_settled_or_cancelled_invoice() {
        let paid = InvoiceBalance::new(money("10.00"), money("10.00"));
        assert!(apply_payment(&paid, money("1.00")).is_err());

        let cancelled = cancel(&InvoiceBalance::new(money("10.00"), Money::ZERO)).unwrap();
        assert!(apply_payment(&cancelled, money("1.00")).is_err());
    }

    #[test]
    fn test_non_positive_amounts_rejected() {
        let invoice = InvoiceBalance::new(money("10.00"), Money::ZERO);
        assert!(matches!(apply_payment(&invoice, Money::ZERO), Err(HmsError::Validation(_))));
        assert!(matches!(apply_payment(&invoice, money("-1.00")), Err(HmsError::Validation(_))));
    }

    #[test]
    fn test_void_reverts_status() {
        let invoice = InvoiceBalance::new(money("150.00"), money("150.00"));
        let after = void_payment(&invoice, money("70.00")).unwrap();
        assert_eq!(after.status, InvoiceStatus::Partial);
        assert!(void_payment(&after, money("100.00")).is_err());
    }

    #[test]
    fn test_adding_items_reopens_paid_invoice() {
        let invoice = InvoiceBalance::new(money("50.00"), money("50.00"));
        let after = add_item(&invoice, money("20.00")).unwrap();
        assert_eq!(after.status, InvoiceStatus::Partial);
        assert_eq!(after.balance(), money("20.00"));
    }

    #[test]
    fn test_cancel_requires_no_payments() {
        let invoice = InvoiceBalance::new(money("50.00"), money("10.00"));
        assert!(cancel(&invoice).is_err());
    }

    #[test]
    fn test_line_total() {
        assert_eq!(line_total(money("2.50"), 4).unwrap(), money("10.00"));
        assert!(line_total(money("2.50"), 0).is_err());
        assert!(line_total(money("-1.00"), 1).is_err());
    }
}
