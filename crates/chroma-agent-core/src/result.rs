//! Action result bodies carried in `DATA` messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;

/// One subprocess run on behalf of an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubprocessRecord {
    pub args: Vec<String>,
    pub rc: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Body of the `DATA` message that reports an action's outcome.
///
/// A success always carries a `result` key (null for side-effect-only
/// actions); a failure carries `error_kind`, `error` and `backtrace` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<String>,
    #[serde(default)]
    pub subprocesses: Vec<SubprocessRecord>,
}

impl ActionResult {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            success: true,
            result: Some(result),
            error_kind: None,
            error: None,
            backtrace: None,
            subprocesses: Vec::new(),
        }
    }

    pub fn failure(
        id: impl Into<String>,
        kind: ErrorKind,
        error: impl Into<String>,
        backtrace: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            success: false,
            result: None,
            error_kind: Some(kind),
            error: Some(error.into()),
            backtrace,
            subprocesses: Vec::new(),
        }
    }

    pub fn with_subprocesses(mut self, subprocesses: Vec<SubprocessRecord>) -> Self {
        self.subprocesses = subprocesses;
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_with_null_result_keeps_the_key() {
        let body = ActionResult::success("7", Value::Null).to_value();
        assert_eq!(
            body,
            json!({"id": "7", "success": true, "result": null, "subprocesses": []})
        );
    }

    #[test]
    fn failure_carries_kind_and_backtrace() {
        let body = ActionResult::failure(
            "9",
            ErrorKind::ActionBadArgs,
            "missing argument `mountpoint`",
            Some("trace".into()),
        )
        .to_value();

        assert_eq!(body["success"], json!(false));
        assert_eq!(body["error_kind"], json!("ACTION_BAD_ARGS"));
        assert_eq!(body["backtrace"], json!("trace"));
        assert!(body.get("result").is_none());
    }

    #[test]
    fn subprocess_records_are_attached() {
        let record = SubprocessRecord {
            args: vec!["lctl".into(), "conf_param".into()],
            rc: 0,
            stdout: String::new(),
            stderr: String::new(),
        };
        let result = ActionResult::success("1", Value::Null).with_subprocesses(vec![record]);
        let body = result.to_value();
        assert_eq!(body["subprocesses"][0]["args"][0], json!("lctl"));
        assert_eq!(body["subprocesses"][0]["rc"], json!(0));
    }
}
