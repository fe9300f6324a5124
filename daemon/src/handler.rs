//! Maps protocol requests onto the process monitor

use crate::error::ProcessError;
use crate::monitor::ProcessMonitor;
use crate::protocol::{Request, Response};
use crate::socket::RequestHandler;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub struct DaemonState {
    monitor: Arc<ProcessMonitor>,
}

impl DaemonState {
    pub fn new(monitor: Arc<ProcessMonitor>) -> Self {
        Self { monitor }
    }

    pub fn monitor(&self) -> &Arc<ProcessMonitor> {
        &self.monitor
    }
}

#[async_trait::async_trait]
impl RequestHandler for DaemonState {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong,

            Request::ListProcesses => Response::data(&self.monitor.processes().await),

            Request::Refresh => match self.monitor.refresh().await {
                Ok(Some(processes)) => Response::data(&json!({
                    "skipped": false,
                    "processes": processes,
                })),
                Ok(None) => Response::data(&json!({ "skipped": true })),
                Err(e) => e.into(),
            },

            Request::Select { params } => Response::data(&self.monitor.select(params.pid).await),

            Request::GetDetails { params } => match self.monitor.details(params.pid).await {
                Ok(details) => Response::data(&details),
                Err(e) => e.into(),
            },

            Request::StartTracking { params } => {
                match self.monitor.start_tracking(params.pid).await {
                    Ok(summary) => Response::data(&summary),
                    Err(e) => e.into(),
                }
            }

            Request::StopTracking { params } => match self.monitor.stop_tracking(params.pid).await {
                Ok(stopped) => Response::data(&json!({ "stopped": stopped })),
                Err(e) => e.into(),
            },

            Request::GetHistory { params } => match self.monitor.history(params.pid).await {
                Some(history) => Response::data(&history),
                None => ProcessError::NotFound(params.pid).into(),
            },

            Request::ListSessions => Response::data(&self.monitor.sessions().await),

            Request::KillProcess { params } => match self.monitor.kill(params.pid).await {
                Ok(()) => Response::data(&json!({ "success": true })),
                Err(e) => e.into(),
            },

            Request::SetPriority { params } => {
                match self.monitor.set_priority(params.pid, params.priority).await {
                    Ok(()) => Response::data(&json!({
                        "success": true,
                        "priority": params.priority,
                    })),
                    Err(e) => e.into(),
                }
            }

            Request::SetRefreshInterval { params } => {
                let applied = self
                    .monitor
                    .set_refresh_interval(Duration::from_millis(params.interval_ms))
                    .await;
                Response::data(&json!({ "interval_ms": applied.as_millis() as u64 }))
            }

            Request::SetAutoRefresh { params } => {
                if params.enabled {
                    self.monitor.start_auto_refresh().await;
                } else {
                    self.monitor.stop_auto_refresh().await;
                }
                Response::data(&json!({ "enabled": self.monitor.is_auto_refreshing().await }))
            }

            Request::SetIncludeSystem { params } => {
                self.monitor.set_include_system(params.enabled).await;
                Response::data(&json!({ "include_system": params.enabled }))
            }
        }
    }
}
