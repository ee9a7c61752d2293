//! 预约生命周期
//!
//! Scheduled → Confirmed → InProgress → Completed，未开始前可取消。

use chrono::{DateTime, Duration, Utc};
use hms_core::{AppointmentStatus, HmsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 预约事件
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentEvent {
    Confirm,
    CheckIn,
    Complete,
    Cancel,
}

/// 预约时长上下限（分钟）
pub const MIN_DURATION_MINUTES: i32 = 5;
pub const MAX_DURATION_MINUTES: i32 = 240;

/// 预约状态机
#[derive(Debug)]
pub struct AppointmentStateMachine {
    transitions: HashMap<(AppointmentStatus, AppointmentEvent), AppointmentStatus>,
}

impl AppointmentStateMachine {
    pub fn new() -> Self {
        use AppointmentEvent::*;
        use AppointmentStatus as S;

        let mut transitions = HashMap::new();
        transitions.insert((S::Scheduled, Confirm), S::Confirmed);
        transitions.insert((S::Scheduled, CheckIn), S::InProgress);
        transitions.insert((S::Confirmed, CheckIn), S::InProgress);
        transitions.insert((S::InProgress, Complete), S::Completed);
        transitions.insert((S::Scheduled, Cancel), S::Cancelled);
        transitions.insert((S::Confirmed, Cancel), S::Cancelled);

        Self { transitions }
    }

    pub fn can_transition(&self, from: AppointmentStatus, event: AppointmentEvent) -> bool {
        self.transitions.contains_key(&(from, event))
    }

    pub fn transition(&self, from: AppointmentStatus, event: AppointmentEvent) -> Result<AppointmentStatus> {
        self.transitions
            .get(&(from, event))
            .copied()
            .ok_or_else(|| HmsError::InvalidStateTransition {
                from: from.to_string(),
                event: format!("{:?}", event).to_lowercase(),
            })
    }

    /// 将目标状态映射为事件，供 `PUT /appointments/{id}/status` 使用
    pub fn event_for_target(target: AppointmentStatus) -> Result<AppointmentEvent> {
        match target {
            AppointmentStatus::Confirmed => Ok(AppointmentEvent::Confirm),
            AppointmentStatus::InProgress => Ok(AppointmentEvent::CheckIn),
            AppointmentStatus::Completed => Ok(AppointmentEvent::Complete),
            AppointmentStatus::Cancelled => Ok(AppointmentEvent::Cancel),
            AppointmentStatus::Scheduled => Err(HmsError::Validation(
                "an appointment cannot be moved back to scheduled".to_string(),
            )),
        }
    }
}

impl Default for AppointmentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// 校验预约时间
pub fn validate_schedule(scheduled_at: DateTime<Utc>, duration_minutes: i32, now: DateTime<Utc>) -> Result<()> {
    if !(MIN_DURATION_MINUTES..=MAX_DURATION_MINUTES).contains(&duration_minutes) {
        return Err(HmsError::Validation(format!(
            "duration must be between {} and {} minutes",
            MIN_DURATION_MINUTES, MAX_DURATION_MINUTES
        )));
    }
    if scheduled_at <= now {
        return Err(HmsError::Validation("appointment must be scheduled in the future".to_string()));
    }
    Ok(())
}

/// 判断两个预约时间段是否重叠
pub fn overlaps(
    a_start: DateTime<Utc>,
    a_minutes: i32,
    b_start: DateTime<Utc>,
    b_minutes: i32,
) -> bool {
    let a_end = a_start + Duration::minutes(a_minutes as i64);
    let b_end = b_start + Duration::minutes(b_minutes as i64);
    a_start < b_end && b_start < a_end
}

/// 占用医生时间的预约状态
pub fn blocks_schedule(status: AppointmentStatus) -> bool {
    matches!(
        status,
        AppointmentStatus::Scheduled | AppointmentStatus::Confirmed | AppointmentStatus::InProgress
    )
}
