//! 检验单规则

use hms_core::{HmsError, LabResult, LabTestStatus, ResultFlag, Result};
use std::collections::HashSet;

/// 检验单状态变更
pub fn start(status: LabTestStatus) -> Result<LabTestStatus> {
    match status {
        LabTestStatus::Ordered => Ok(LabTestStatus::InProgress),
        other => Err(HmsError::InvalidStateTransition {
            from: other.to_string(),
            event: "start".to_string(),
        }),
    }
}

pub fn cancel(status: LabTestStatus) -> Result<LabTestStatus> {
    if status.is_open() {
        Ok(LabTestStatus::Cancelled)
    } else {
        Err(HmsError::InvalidStateTransition {
            from: status.to_string(),
            event: "cancel".to_string(),
        })
    }
}

/// 录入结果，检验单随之完成
pub fn record_results(status: LabTestStatus, results: &[LabResult]) -> Result<LabTestStatus> {
    if !status.is_open() {
        return Err(HmsError::InvalidStateTransition {
            from: status.to_string(),
            event: "record_results".to_string(),
        });
    }
    validate_results(results)?;
    Ok(LabTestStatus::Completed)
}

/// 结果非空，参数名非空且不重复
pub fn validate_results(results: &[LabResult]) -> Result<()> {
    if results.is_empty() {
        return Err(HmsError::Validation("at least one result is required".to_string()));
    }

    let mut seen = HashSet::new();
    for result in results {
        let parameter = result.parameter.trim();
        if parameter.is_empty() {
            return Err(HmsError::Validation("result parameter is required".to_string()));
        }
        if result.value.trim().is_empty() {
            return Err(HmsError::Validation(format!("value for '{}' is required", parameter)));
        }
        if !seen.insert(parameter.to_lowercase()) {
            return Err(HmsError::Validation(format!("duplicate result parameter '{}'", parameter)));
        }
    }
    Ok(())
}

/// 最严重的结果标记
pub fn worst_flag(results: &[LabResult]) -> ResultFlag {
    let rank = |flag: ResultFlag| match flag {
        ResultFlag::Normal => 0,
        ResultFlag::Low | ResultFlag::High => 1,
        ResultFlag::Critical => 2,
    };
    results
        .iter()
        .map(|r| r.flag)
        .max_by_key(|flag| rank(*flag))
        .unwrap_or(ResultFlag::Normal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(parameter: &str, value: &str, flag: ResultFlag) -> LabResult {
        LabResult {
            parameter: parameter.to_string(),
            value: value.to_string(),
            unit: None,
            reference_range: None,
            flag,
        }
    }

    #[test]
    fn test_lifecycle() {
        let status = start(LabTestStatus::Ordered).unwrap();
        assert_eq!(status, LabTestStatus::InProgress);
        assert!(start(status).is_err());

        let results = vec![result("Hb", "13.2", ResultFlag::Normal)];
        assert_eq!(record_results(status, &results).unwrap(), LabTestStatus::Completed);
        assert!(record_results(LabTestStatus::Completed, &results).is_err());
        assert!(cancel(LabTestStatus::Completed).is_err());
        assert_eq!(cancel(LabTestStatus::Ordered).unwrap(), LabTestStatus::Cancelled);
    }

    #[test]
    fn test_result_validation() {
        assert!(validate_results(&[]).is_err());
        assert!(validate_results(&[result(" ", "1", ResultFlag::Normal)]).is_err());
        assert!(validate_results(&[
            result("WBC", "4.1", ResultFlag::Normal),
            result("wbc", "4.2", ResultFlag::Normal),
        ])
        .is_err());
    }

    #[test]
    fn test_worst_flag() {
        let results = vec![
            result("Na", "140", ResultFlag::Normal),
            result("K", "6.9", ResultFlag::Critical),
            result("Cl", "110", ResultFlag::High),
        ];
        assert_eq!(worst_flag(&results), ResultFlag::Critical);
        assert_eq!(worst_flag(&[]), ResultFlag::Normal);
    }
}
