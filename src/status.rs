use crate::task::{Task, TaskInfo, TaskStatus, UsageSignal};

const EMPTY_STATUS_REASON: &str = "upstream returned empty status";
const UPSTREAM_FAILURE_REASON: &str = "upstream reported failure";

/// Result of folding one provider observation into a task.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub previous: TaskStatus,
    pub current: TaskStatus,
    /// Usage reported alongside a SUCCESS observation.
    pub usage: Option<UsageSignal>,
}

impl Transition {
    pub fn entered_terminal(&self) -> bool {
        self.current.is_terminal() && !self.previous.is_terminal()
    }
}

/// Applies a provider observation to the task record: status, progress, timestamps
/// and the human-readable result or failure reason. Never touches `quota`.
///
/// An empty or unrecognized status is treated as a failure so the refund path runs.
pub fn apply_observation(task: &mut Task, info: &TaskInfo, now: i64) -> Transition {
    let previous = task.status;
    let (current, unrecognized) = match TaskStatus::parse(&info.status) {
        Some(status) => (status, None),
        None if info.status.trim().is_empty() => {
            (TaskStatus::Failure, Some(EMPTY_STATUS_REASON.to_string()))
        }
        None => (
            TaskStatus::Failure,
            Some(format!(
                "upstream returned unrecognized status: {}",
                info.status.trim()
            )),
        ),
    };

    task.status = current;
    task.progress = current.default_progress().to_string();
    if let Some(data) = &info.data {
        task.data = data.clone();
    }

    match current {
        TaskStatus::InProgress => {
            if task.start_time == 0 {
                task.start_time = now;
            }
        }
        TaskStatus::Success => {
            if task.finish_time == 0 {
                task.finish_time = now;
            }
            if let Some(url) = info.url.as_deref().filter(|url| !url.starts_with("data:")) {
                task.fail_reason = url.to_string();
            }
        }
        TaskStatus::Failure => {
            if task.finish_time == 0 {
                task.finish_time = now;
            }
            task.fail_reason = unrecognized
                .or_else(|| info.reason.clone().filter(|reason| !reason.is_empty()))
                .unwrap_or_else(|| UPSTREAM_FAILURE_REASON.to_string());
        }
        TaskStatus::Submitted | TaskStatus::Queued => {}
    }

    if current != TaskStatus::Failure {
        if let Some(progress) = info.progress.as_deref().filter(|p| !p.is_empty()) {
            task.progress = progress.to_string();
        }
    }

    Transition {
        previous,
        current,
        usage: if current == TaskStatus::Success {
            info.usage()
        } else {
            None
        },
    }
}
