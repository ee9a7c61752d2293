//! 科室工作队列
//!
//! 每个阶段的队列分为候诊、处理中和等待化验三部分，各自按进入时间先后排序。

use chrono::{DateTime, Utc};
use hms_core::{StageStatus, VisitStage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 队列条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub visit_id: Uuid,
    pub visit_number: String,
    pub patient_id: Uuid,
    pub patient_name: String,
    pub chief_complaint: Option<String>,
    pub status: StageStatus,
    pub since: DateTime<Utc>,
}

/// 阶段队列
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageQueue {
    pub stage: VisitStage,
    pub waiting: Vec<QueueEntry>,
    pub in_progress: Vec<QueueEntry>,
    pub on_hold: Vec<QueueEntry>,
}

/// 队列统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub in_progress: usize,
    pub on_hold: usize,
}

impl StageQueue {
    /// 由数据库返回的条目构建队列，状态不属于该队列的条目被丢弃
    pub fn build(stage: VisitStage, entries: Vec<QueueEntry>) -> Self {
        let mut queue = Self {
            stage,
            waiting: Vec::new(),
            in_progress: Vec::new(),
            on_hold: Vec::new(),
        };

        for entry in entries {
            match entry.status {
                StageStatus::Pending => queue.waiting.push(entry),
                StageStatus::InProgress => queue.in_progress.push(entry),
                StageStatus::OnHold => queue.on_hold.push(entry),
                other => {
                    tracing::debug!(
                        "Dropping visit {} from {} queue with status {}",
                        entry.visit_number,
                        stage,
                        other
                    );
                }
            }
        }

        for bucket in [&mut queue.waiting, &mut queue.in_progress, &mut queue.on_hold] {
            bucket.sort_by(|a, b| a.since.cmp(&b.since).then_with(|| a.visit_number.cmp(&b.visit_number)));
        }

        queue
    }

    /// 下一位候诊患者
    pub fn next(&self) -> Option<&QueueEntry> {
        self.waiting.first()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            waiting: self.waiting.len(),
            in_progress: self.in_progress.len(),
            on_hold: self.on_hold.len(),
        }
    }
}

/// 拥有工作队列的阶段
pub fn queue_stages() -> Vec<VisitStage> {
    VisitStage::all()
        .into_iter()
        .filter(|stage| *stage != VisitStage::Discharged)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(number: &str, status: StageStatus, minutes_ago: i64) -> QueueEntry {
        QueueEntry {
            visit_id: Uuid::new_v4(),
            visit_number: number.to_string(),
            patient_id: Uuid::new_v4(),
            patient_name: format!("Patient {}", number),
            chief_complaint: None,
            status,
            since: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    #[test]
    fn test_queue_separates_and_orders() {
        let queue = StageQueue::build(
            VisitStage::Pharmacy,
            vec![
                entry("V-3", StageStatus::Pending, 5),
                entry("V-1", StageStatus::InProgress, 30),
                entry("V-2", StageStatus::Pending, 20),
                entry("V-4", StageStatus::Completed, 40),
            ],
        );

        assert_eq!(
            queue.stats(),
            QueueStats {
                waiting: 2,
                in_progress: 1,
                on_hold: 0
            }
        );
        assert_eq!(queue.next().unwrap().visit_number, "V-2");
        assert_eq!(queue.waiting[1].visit_number, "V-3");
    }

    #[test]
    fn test_on_hold_visits_listed_separately() {
        let queue = StageQueue::build(VisitStage::Nurse, vec![entry("V-9", StageStatus::OnHold, 10)]);
        assert!(queue.next().is_none());
        assert_eq!(queue.on_hold.len(), 1);
    }

    #[test]
    fn test_queue_stages_exclude_discharged() {
        let stages = queue_stages();
        assert_eq!(stages.len(), 6);
        assert!(!stages.contains(&VisitStage::Discharged));
    }
}
