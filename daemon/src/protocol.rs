//! IPC protocol definitions (JSON messages)

use crate::error::ProcessError;
use crate::monitor::MonitorEvent;
use crate::priority::PriorityClass;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Ping,
    ListProcesses,
    Refresh,
    Select { params: PidParams },
    GetDetails { params: PidParams },
    StartTracking { params: PidParams },
    StopTracking { params: PidParams },
    GetHistory { params: PidParams },
    ListSessions,
    KillProcess { params: PidParams },
    SetPriority { params: SetPriorityParams },
    SetRefreshInterval { params: IntervalParams },
    SetAutoRefresh { params: ToggleParams },
    SetIncludeSystem { params: ToggleParams },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidParams {
    pub pid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetPriorityParams {
    pub pid: u32,
    pub priority: PriorityClass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalParams {
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToggleParams {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong,
    Response { data: serde_json::Value },
    Error { data: ErrorData },
    Event { data: MonitorEvent },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub kind: String,
    pub message: String,
}

impl Response {
    pub fn data<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(data) => Response::Response { data },
            Err(e) => Response::Error {
                data: ErrorData {
                    kind: "other".to_string(),
                    message: e.to_string(),
                },
            },
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Response::Error {
            data: ErrorData {
                kind: "invalid_request".to_string(),
                message: message.into(),
            },
        }
    }
}

impl From<ProcessError> for Response {
    fn from(err: ProcessError) -> Self {
        Response::Error {
            data: ErrorData {
                kind: err.kind().as_str().to_string(),
                message: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_requests() {
        let req: Request = serde_json::from_str(r#"{"cmd":"start_tracking","params":{"pid":42}}"#).unwrap();
        assert!(matches!(req, Request::StartTracking { params } if params.pid == 42));

        let req: Request =
            serde_json::from_str(r#"{"cmd":"set_priority","params":{"pid":7,"priority":"below_normal"}}"#).unwrap();
        assert!(matches!(
            req,
            Request::SetPriority { params } if params.priority == PriorityClass::BelowNormal
        ));

        let req: Request = serde_json::from_str(r#"{"cmd":"list_processes"}"#).unwrap();
        assert!(matches!(req, Request::ListProcesses));
    }

    #[test]
    fn errors_carry_their_kind() {
        let json = serde_json::to_value(Response::from(ProcessError::AccessDenied(9))).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["data"]["kind"], "access_denied");
    }
}
