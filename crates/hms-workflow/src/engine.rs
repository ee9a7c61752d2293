//! 工作流引擎
//!
//! 协调就诊状态机与预约状态机，并根据业务事件（付款、发药、化验）推导
//! 需要触发的就诊事件。引擎本身不做任何 I/O，由数据库层在事务中执行计划。

use crate::{
    appointment::{AppointmentEvent, AppointmentStateMachine},
    state_machine::{check_consistency, VisitEvent, VisitStateMachine},
};
use hms_core::{
    AppointmentStatus, HmsError, InvoiceStatus, OverallStatus, PrescriptionStatus, Result,
    VisitStage, VisitState,
};
use serde::{Deserialize, Serialize};

/// 状态转换附带的副作用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum WorkflowEffect {
    /// 就诊结束，关联预约置为已完成
    CompleteAppointment,
    /// 就诊取消，关联的进行中预约一并取消
    CancelAppointment,
    /// 新阶段出现待处理患者
    NotifyStage { stage: VisitStage },
    /// 化验结果已出，通知开单阶段
    LabResultsReady { stage: VisitStage },
}

/// 一次就诊状态转换的执行计划
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionPlan {
    pub event: VisitEvent,
    pub previous: VisitState,
    pub next: VisitState,
    pub effects: Vec<WorkflowEffect>,
}

impl TransitionPlan {
    pub fn stage_changed(&self) -> bool {
        self.previous.current_stage != self.next.current_stage
    }

    pub fn completes_visit(&self) -> bool {
        self.next.overall_status == OverallStatus::Completed
    }

    /// 需要推送通知的房间
    pub fn rooms(&self) -> Vec<String> {
        let mut rooms = vec!["visits".to_string(), stage_room(self.previous.current_stage)];
        if self.stage_changed() {
            rooms.push(stage_room(self.next.current_stage));
        }
        rooms
    }
}

pub fn stage_room(stage: VisitStage) -> String {
    format!("stage:{}", stage)
}

/// 工作流引擎
#[derive(Debug, Default)]
pub struct WorkflowEngine {
    visits: VisitStateMachine,
    appointments: AppointmentStateMachine,
}

impl WorkflowEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visit_machine(&self) -> &VisitStateMachine {
        &self.visits
    }

    /// 计划一次就诊状态转换
    ///
    /// 先校验已存储的状态组合，损坏的记录不再继续流转。
    pub fn plan_visit_transition(&self, state: &VisitState, event: VisitEvent) -> Result<TransitionPlan> {
        if let Err(reason) = check_consistency(state) {
            tracing::error!("Refusing to transition corrupt visit state: {}", reason);
            return Err(HmsError::Internal(format!("inconsistent visit state: {}", reason)));
        }

        let next = self.visits.transition(state, &event)?;
        let mut effects = Vec::new();

        if next.overall_status == OverallStatus::Completed {
            effects.push(WorkflowEffect::CompleteAppointment);
        } else if next.overall_status == OverallStatus::Cancelled {
            effects.push(WorkflowEffect::CancelAppointment);
        } else if next.current_stage != state.current_stage
            && next.overall_status == OverallStatus::Active
        {
            if event == VisitEvent::CompleteLab {
                effects.push(WorkflowEffect::LabResultsReady {
                    stage: next.current_stage,
                });
            }
            effects.push(WorkflowEffect::NotifyStage {
                stage: next.current_stage,
            });
        }

        tracing::info!(
            "Planned visit transition {}: {} -> {}",
            event.name(),
            state.current_stage,
            next.current_stage
        );

        Ok(TransitionPlan {
            event,
            previous: *state,
            next,
            effects,
        })
    }

    /// 计划预约状态变更
    pub fn plan_appointment(&self, status: AppointmentStatus, event: AppointmentEvent) -> Result<AppointmentStatus> {
        self.appointments.transition(status, event)
    }

    /// 付款入账后需要触发的就诊事件
    pub fn event_after_payment(&self, state: &VisitState, invoice_status: InvoiceStatus) -> Option<VisitEvent> {
        if invoice_status != InvoiceStatus::Paid || state.current_stage != VisitStage::Billing {
            return None;
        }
        self.allowed(state, VisitEvent::CompleteBilling)
    }

    /// 发药后需要触发的就诊事件
    pub fn event_after_dispensing(
        &self,
        state: &VisitState,
        prescription_status: PrescriptionStatus,
    ) -> Option<VisitEvent> {
        if prescription_status != PrescriptionStatus::Dispensed || state.current_stage != VisitStage::Pharmacy {
            return None;
        }
        self.allowed(state, VisitEvent::CompleteDispensing)
    }

    /// 开具化验单时需要触发的就诊事件，已在化验阶段时追加检验不再转换
    pub fn event_for_lab_order(&self, state: &VisitState) -> Result<Option<VisitEvent>> {
        match state.current_stage {
            VisitStage::Lab => Ok(None),
            VisitStage::Nurse | VisitStage::Doctor => {
                if self.visits.can_transition(state, &VisitEvent::OrderLab) {
                    Ok(Some(VisitEvent::OrderLab))
                } else {
                    Err(HmsError::InvalidStateTransition {
                        from: state.current_stage.to_string(),
                        event: VisitEvent::OrderLab.name().to_string(),
                    })
                }
            }
            other => Err(HmsError::Conflict(format!(
                "lab tests can only be ordered from nurse or doctor stage, visit is at {}",
                other
            ))),
        }
    }

    /// 化验结果录入后，没有未完成的检验时结束化验阶段
    pub fn event_after_lab_results(&self, state: &VisitState, open_tests: i64) -> Option<VisitEvent> {
        if open_tests > 0 || state.current_stage != VisitStage::Lab {
            return None;
        }
        self.allowed(state, VisitEvent::CompleteLab)
    }

    fn allowed(&self, state: &VisitState, event: VisitEvent) -> Option<VisitEvent> {
        if self.visits.can_transition(state, &event) {
            Some(event)
        } else {
            None
        }
    }
}

/// 当前阶段是否允许某角色办理
pub fn stage_accepts(state: &VisitState, stage: VisitStage) -> bool {
    !state.is_terminal()
        && state.current_stage == stage
        && state.status_of(stage).map(|s| s.is_active()).unwrap_or(false)
}
