//! External task representation

use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskstore::{Task, TaskResult};

/// Task as returned to callers and posted to webhooks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: String,
    /// Masked declaration
    pub declaration: Value,
    pub result: TaskResult,
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            declaration: task.internal_declaration.clone(),
            result: task.result.clone(),
        }
    }
}

impl TaskView {
    /// Result code, 500 when none was recorded
    pub fn http_code(&self) -> u16 {
        self.result.code.unwrap_or(500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskstore::TaskStatus;

    #[test]
    fn test_view_shape() {
        let mut task = Task::new("t1", 0);
        task.internal_declaration = json!({"class": "DO"});
        task.result.code = Some(200);
        task.result.status = Some(TaskStatus::Ok);
        task.result.message = Some("success".into());

        let view = serde_json::to_value(TaskView::from(&task)).unwrap();
        assert_eq!(
            view,
            json!({
                "id": "t1",
                "declaration": {"class": "DO"},
                "result": {
                    "code": 200,
                    "status": "OK",
                    "message": "success",
                    "errors": [],
                    "warnings": []
                }
            })
        );
    }

    #[test]
    fn test_missing_code_falls_back_to_500() {
        let view = TaskView::from(&Task::new("t1", 0));
        assert_eq!(view.http_code(), 500);
    }
}
