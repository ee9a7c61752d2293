//! 就诊阶段状态机
//!
//! 管理一次就诊从挂号到结算的完整阶段流转：
//! reception → nurse → doctor → (lab) → pharmacy → billing → discharged
//!
//! 所有状态字段只能经由转换表中登记的规则修改，非法或乱序事件一律拒绝。

use hms_core::{HmsError, OverallStatus, Result, StageStatus, VisitStage, VisitState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 就诊阶段事件
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum VisitEvent {
    /// 当前阶段开始处理（排队 → 处理中）
    Start,
    CompleteReception,
    CompleteTriage,
    /// 护士或医生开具化验单
    OrderLab,
    CompleteLab,
    CompleteConsultation { prescribed: bool },
    CompleteDispensing,
    CompleteBilling,
    Cancel,
}

impl VisitEvent {
    pub fn name(&self) -> &'static str {
        match self {
            VisitEvent::Start => "start",
            VisitEvent::CompleteReception => "complete_reception",
            VisitEvent::CompleteTriage => "complete_triage",
            VisitEvent::OrderLab => "order_lab",
            VisitEvent::CompleteLab => "complete_lab",
            VisitEvent::CompleteConsultation { .. } => "complete_consultation",
            VisitEvent::CompleteDispensing => "complete_dispensing",
            VisitEvent::CompleteBilling => "complete_billing",
            VisitEvent::Cancel => "cancel",
        }
    }
}

type Guard = fn(&VisitState) -> bool;
type Apply = fn(&mut VisitState);

/// 转换规则：前置条件 + 状态修改
#[derive(Clone, Copy)]
struct TransitionRule {
    guard: Guard,
    apply: Apply,
}

impl std::fmt::Debug for TransitionRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TransitionRule")
    }
}

/// 参与主流程的阶段（化验为旁路阶段）
const PIPELINE: [VisitStage; 5] = [
    VisitStage::Reception,
    VisitStage::Nurse,
    VisitStage::Doctor,
    VisitStage::Pharmacy,
    VisitStage::Billing,
];

/// 可执行 `Start` / `Cancel` 的阶段
const WORK_STAGES: [VisitStage; 6] = [
    VisitStage::Reception,
    VisitStage::Nurse,
    VisitStage::Doctor,
    VisitStage::Lab,
    VisitStage::Pharmacy,
    VisitStage::Billing,
];

fn current_is_pending(state: &VisitState) -> bool {
    state.status_of(state.current_stage) == Some(StageStatus::Pending)
}

fn current_is_active(state: &VisitState) -> bool {
    state
        .status_of(state.current_stage)
        .map(|s| s.is_active())
        .unwrap_or(false)
}

fn start_current(state: &mut VisitState) {
    state.set_status(state.current_stage, StageStatus::InProgress);
}

fn complete_reception(state: &mut VisitState) {
    state.reception_status = StageStatus::Completed;
    state.nurse_status = StageStatus::Pending;
    state.current_stage = VisitStage::Nurse;
}

fn complete_triage(state: &mut VisitState) {
    state.nurse_status = StageStatus::Completed;
    state.doctor_status = StageStatus::Pending;
    state.current_stage = VisitStage::Doctor;
}

fn order_lab(state: &mut VisitState) {
    let ordering_stage = state.current_stage;
    state.set_status(ordering_stage, StageStatus::OnHold);
    state.lab_status = StageStatus::Pending;
    state.lab_return_stage = Some(ordering_stage);
    state.current_stage = VisitStage::Lab;
}

fn complete_lab(state: &mut VisitState) {
    let return_stage = state.lab_return_stage.take().unwrap_or(VisitStage::Doctor);
    state.lab_status = StageStatus::Completed;
    state.set_status(return_stage, StageStatus::Pending);
    state.current_stage = return_stage;
}

fn complete_consultation_with_prescription(state: &mut VisitState) {
    state.doctor_status = StageStatus::Completed;
    state.pharmacy_status = StageStatus::Pending;
    state.current_stage = VisitStage::Pharmacy;
}

fn complete_consultation_without_prescription(state: &mut VisitState) {
    state.doctor_status = StageStatus::Completed;
    state.pharmacy_status = StageStatus::Skipped;
    state.billing_status = StageStatus::Pending;
    state.current_stage = VisitStage::Billing;
}

fn complete_dispensing(state: &mut VisitState) {
    state.pharmacy_status = StageStatus::Completed;
    state.billing_status = StageStatus::Pending;
    state.current_stage = VisitStage::Billing;
}

fn complete_billing(state: &mut VisitState) {
    state.billing_status = StageStatus::Completed;
    state.current_stage = VisitStage::Discharged;
    state.overall_status = OverallStatus::Completed;
}

fn cancel(state: &mut VisitState) {
    state.overall_status = OverallStatus::Cancelled;
}

fn always(_: &VisitState) -> bool {
    true
}

fn insert_rule(
    transitions: &mut HashMap<(VisitStage, VisitEvent), TransitionRule>,
    stage: VisitStage,
    event: VisitEvent,
    guard: Guard,
    apply: Apply,
) {
    transitions.insert((stage, event), TransitionRule { guard, apply });
}

/// 就诊阶段状态机
#[derive(Debug)]
pub struct VisitStateMachine {
    transitions: HashMap<(VisitStage, VisitEvent), TransitionRule>,
}

impl VisitStateMachine {
    /// 创建新的状态机实例
    pub fn new() -> Self {
        let mut transitions = HashMap::new();
        let table = &mut transitions;

        for stage in WORK_STAGES {
            insert_rule(table, stage, VisitEvent::Start, current_is_pending, start_current);
            insert_rule(table, stage, VisitEvent::Cancel, always, cancel);
        }

        insert_rule(table, VisitStage::Reception, VisitEvent::CompleteReception, current_is_active, complete_reception);
        insert_rule(table, VisitStage::Nurse, VisitEvent::CompleteTriage, current_is_active, complete_triage);
        insert_rule(table, VisitStage::Nurse, VisitEvent::OrderLab, current_is_active, order_lab);
        insert_rule(table, VisitStage::Doctor, VisitEvent::OrderLab, current_is_active, order_lab);
        insert_rule(table, VisitStage::Lab, VisitEvent::CompleteLab, current_is_active, complete_lab);
        insert_rule(
            table,
            VisitStage::Doctor,
            VisitEvent::CompleteConsultation { prescribed: true },
            current_is_active,
            complete_consultation_with_prescription,
        );
        insert_rule(
            table,
            VisitStage::Doctor,
            VisitEvent::CompleteConsultation { prescribed: false },
            current_is_active,
            complete_consultation_without_prescription,
        );
        insert_rule(table, VisitStage::Pharmacy, VisitEvent::CompleteDispensing, current_is_active, complete_dispensing);
        insert_rule(table, VisitStage::Billing, VisitEvent::CompleteBilling, current_is_active, complete_billing);

        Self { transitions }
    }

    /// 检查事件在当前状态下是否可执行
    pub fn can_transition(&self, state: &VisitState, event: &VisitEvent) -> bool {
        if state.is_terminal() {
            return false;
        }
        self.transitions
            .get(&(state.current_stage, *event))
            .map(|rule| (rule.guard)(state))
            .unwrap_or(false)
    }

    /// 执行状态转换，返回新状态
    pub fn transition(&self, state: &VisitState, event: &VisitEvent) -> Result<VisitState> {
        if !self.can_transition(state, event) {
            return Err(HmsError::InvalidStateTransition {
                from: describe(state),
                event: event.name().to_string(),
            });
        }

        let rule = self.transitions[&(state.current_stage, *event)];
        let mut next = *state;
        (rule.apply)(&mut next);

        tracing::debug!(
            "Visit transitioned on {}: {} -> {}",
            event.name(),
            describe(state),
            describe(&next)
        );
        Ok(next)
    }

    /// 获取当前状态下所有可执行事件
    pub fn get_possible_events(&self, state: &VisitState) -> Vec<VisitEvent> {
        let mut events: Vec<VisitEvent> = self
            .transitions
            .keys()
            .filter(|(stage, _)| *stage == state.current_stage)
            .map(|(_, event)| *event)
            .filter(|event| self.can_transition(state, event))
            .collect();
        events.sort_by_key(|e| e.name());
        events
    }
}

impl Default for VisitStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

fn describe(state: &VisitState) -> String {
    match state.status_of(state.current_stage) {
        Some(status) => format!("{}/{} ({})", state.current_stage, status, state.overall_status),
        None => format!("{} ({})", state.current_stage, state.overall_status),
    }
}

/// 校验一组阶段状态是否构成合法组合
///
/// 用于校验从数据库读取的记录。已取消的就诊冻结在取消时的状态，不再校验。
pub fn check_consistency(state: &VisitState) -> std::result::Result<(), String> {
    match state.overall_status {
        OverallStatus::Cancelled => return Ok(()),
        OverallStatus::Completed => {
            if state.current_stage != VisitStage::Discharged {
                return Err("completed visit must be discharged".to_string());
            }
        }
        OverallStatus::Active => {
            if state.current_stage == VisitStage::Discharged {
                return Err("active visit cannot be discharged".to_string());
            }
        }
    }

    let in_lab = state.current_stage == VisitStage::Lab;
    let anchor = if in_lab {
        match state.lab_return_stage {
            Some(stage @ (VisitStage::Nurse | VisitStage::Doctor)) => stage,
            other => return Err(format!("invalid lab return stage {:?}", other)),
        }
    } else {
        if state.lab_return_stage.is_some() {
            return Err("lab return stage set outside of lab".to_string());
        }
        state.current_stage
    };

    for stage in PIPELINE {
        let status = state.status_of(stage).unwrap_or(StageStatus::NotStarted);
        let ok = if stage < anchor {
            status == StageStatus::Completed || (stage == VisitStage::Pharmacy && status == StageStatus::Skipped)
        } else if stage == anchor {
            if in_lab {
                status == StageStatus::OnHold
            } else {
                status.is_active()
            }
        } else {
            status == StageStatus::NotStarted
        };

        if !ok {
            return Err(format!(
                "stage {} has status {} while current stage is {}",
                stage, status, state.current_stage
            ));
        }
    }

    let lab_ok = if in_lab {
        state.lab_status.is_active()
    } else {
        matches!(state.lab_status, StageStatus::NotStarted | StageStatus::Completed)
    };
    if !lab_ok {
        return Err(format!(
            "lab has status {} while current stage is {}",
            state.lab_status, state.current_stage
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn run(sm: &VisitStateMachine, events: &[VisitEvent]) -> VisitState {
        events.iter().fold(VisitState::initial(), |state, event| {
            sm.transition(&state, event).unwrap()
        })
    }

    #[test]
    fn test_full_pathway_with_prescription() {
        let sm = VisitStateMachine::new();
        let state = run(
            &sm,
            &[
                VisitEvent::Start,
                VisitEvent::CompleteReception,
                VisitEvent::Start,
                VisitEvent::CompleteTriage,
                VisitEvent::Start,
                VisitEvent::CompleteConsultation { prescribed: true },
                VisitEvent::CompleteDispensing,
                VisitEvent::CompleteBilling,
            ],
        );

        assert_eq!(state.current_stage, VisitStage::Discharged);
        assert_eq!(state.overall_status, OverallStatus::Completed);
        assert_eq!(state.pharmacy_status, StageStatus::Completed);
        assert!(check_consistency(&state).is_ok());
    }

    #[test]
    fn test_consultation_without_prescription_skips_pharmacy() {
        let sm = VisitStateMachine::new();
        let state = run(
            &sm,
            &[
                VisitEvent::CompleteReception,
                VisitEvent::CompleteTriage,
                VisitEvent::CompleteConsultation { prescribed: false },
            ],
        );

        assert_eq!(state.current_stage, VisitStage::Billing);
        assert_eq!(state.pharmacy_status, StageStatus::Skipped);
        assert_eq!(state.billing_status, StageStatus::Pending);
    }

    #[test]
    fn test_lab_returns_to_ordering_nurse() {
        let sm = VisitStateMachine::new();
        let state = run(&sm, &[VisitEvent::CompleteReception, VisitEvent::Start, VisitEvent::OrderLab]);

        assert_eq!(state.current_stage, VisitStage::Lab);
        assert_eq!(state.nurse_status, StageStatus::OnHold);
        assert_eq!(state.lab_return_stage, Some(VisitStage::Nurse));
        assert!(check_consistency(&state).is_ok());

        let state = sm.transition(&state, &VisitEvent::CompleteLab).unwrap();
        assert_eq!(state.current_stage, VisitStage::Nurse);
        assert_eq!(state.nurse_status, StageStatus::Pending);
        assert_eq!(state.lab_status, StageStatus::Completed);
        assert_eq!(state.lab_return_stage, None);
    }

    #[test]
    fn test_lab_returns_to_doctor() {
        let sm = VisitStateMachine::new();
        let state = run(
            &sm,
            &[
                VisitEvent::CompleteReception,
                VisitEvent::CompleteTriage,
                VisitEvent::Start,
                VisitEvent::OrderLab,
                VisitEvent::Start,
                VisitEvent::CompleteLab,
            ],
        );

        assert_eq!(state.current_stage, VisitStage::Doctor);
        assert_eq!(state.doctor_status, StageStatus::Pending);
    }

    #[test]
    fn test_out_of_order_events_rejected() {
        let sm = VisitStateMachine::new();
        let state = VisitState::initial();

        assert!(!sm.can_transition(&state, &VisitEvent::CompleteLab));
        assert!(!sm.can_transition(&state, &VisitEvent::CompleteBilling));
        let err = sm.transition(&state, &VisitEvent::CompleteDispensing).unwrap_err();
        assert!(matches!(err, HmsError::InvalidStateTransition { .. }));

        // Start twice is rejected
        let started = sm.transition(&state, &VisitEvent::Start).unwrap();
        assert!(sm.transition(&started, &VisitEvent::Start).is_err());
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        let sm = VisitStateMachine::new();
        let cancelled = sm.transition(&VisitState::initial(), &VisitEvent::Cancel).unwrap();
        assert_eq!(cancelled.overall_status, OverallStatus::Cancelled);
        assert!(sm.get_possible_events(&cancelled).is_empty());
        assert!(sm.transition(&cancelled, &VisitEvent::Cancel).is_err());
    }

    #[test]
    fn test_possible_events() {
        let sm = VisitStateMachine::new();
        let events = sm.get_possible_events(&VisitState::initial());
        assert!(events.contains(&VisitEvent::Start));
        assert!(events.contains(&VisitEvent::CompleteReception));
        assert!(events.contains(&VisitEvent::Cancel));
        assert!(!events.contains(&VisitEvent::OrderLab));
    }

    #[test]
    fn test_detects_contradictory_combination() {
        let mut state = VisitState::initial();
        state.current_stage = VisitStage::Doctor;
        state.reception_status = StageStatus::Completed;
        state.nurse_status = StageStatus::Completed;
        state.doctor_status = StageStatus::Pending;
        assert!(check_consistency(&state).is_ok());

        state.lab_status = StageStatus::InProgress;
        assert!(check_consistency(&state).is_err());

        state.lab_status = StageStatus::NotStarted;
        state.billing_status = StageStatus::Completed;
        assert!(check_consistency(&state).is_err());
    }

    fn any_event() -> impl Strategy<Value = VisitEvent> {
        prop_oneof![
            Just(VisitEvent::Start),
            Just(VisitEvent::CompleteReception),
            Just(VisitEvent::CompleteTriage),
            Just(VisitEvent::OrderLab),
            Just(VisitEvent::CompleteLab),
            Just(VisitEvent::CompleteConsultation { prescribed: true }),
            Just(VisitEvent::CompleteConsultation { prescribed: false }),
            Just(VisitEvent::CompleteDispensing),
            Just(VisitEvent::CompleteBilling),
            Just(VisitEvent::Cancel),
        ]
    }

    proptest! {
        #[test]
        fn prop_reachable_states_are_consistent(events in proptest::collection::vec(any_event(), 0..40)) {
            let sm = VisitStateMachine::new();
            let mut state = VisitState::initial();
            prop_assert!(check_consistency(&state).is_ok());

            for event in events {
                match sm.transition(&state, &event) {
                    Ok(next) => {
                        prop_assert!(check_consistency(&next).is_ok(), "{:?} -> {:?}", event, next);
                        state = next;
                    }
                    Err(_) => prop_assert!(!sm.can_transition(&state, &event)),
                }
            }
        }
    }
}
