//! IPC interface for Vigil
//!
//! Newline-delimited JSON over a Unix socket: one request per line, one
//! response per line.

use crate::controller::{GovernorStatus, Knob};
use crate::cpuidle::IdleState;
use crate::decision::Tunables;
use crate::notifier::PowerEvent;
use crate::profiler::ProfileReport;
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// External cluster request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterRequest {
    Cluster1Out,
    Cluster1In,
    Cluster0OneIn,
    Cluster0OneOut,
}

/// IPC request types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IpcRequest {
    /// Get full daemon status
    GetStatus,

    /// Drop one disable reference
    Enable,

    /// Take one disable reference
    Disable,

    /// Set a runtime knob from its text form
    SetKnob { knob: Knob, value: String },

    /// Get current tunables
    GetKnobs,

    /// Inject a power event
    Event { event: PowerEvent },

    /// Drive a cluster directly
    Cluster { request: ClusterRequest },

    /// Disable or re-enable an idle state
    SetIdleState { state: IdleState, disabled: bool },

    /// Start a profiling session (`None` uses the configured default period)
    StartProfile { period: Option<u32> },

    /// Stop the running profiling session
    StopProfile,

    /// Get the profiling report
    GetProfile { mode: u8 },
}

/// IPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum IpcResponse {
    Success { data: serde_json::Value },
    Error { message: String },
}

/// Full daemon status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub version: String,
    pub governor: GovernorStatus,
    pub lpm_allowed: bool,
    pub profiling: bool,
}

/// IPC handler trait
pub trait IpcHandler: Send + Sync {
    fn get_status(&self) -> DaemonStatus;
    fn enable(&self);
    fn disable(&self);
    fn set_knob(&self, knob: Knob, value: &str) -> Result<()>;
    fn get_knobs(&self) -> Tunables;
    fn power_event(&self, event: PowerEvent);
    fn cluster(&self, request: ClusterRequest) -> Result<()>;
    fn set_idle_state(&self, state: IdleState, disabled: bool) -> Result<()>;
    /// Returns the period actually used
    fn start_profile(&self, period: Option<u32>) -> Result<u32>;
    /// Returns false when no session was running
    fn stop_profile(&self) -> bool;
    fn get_profile(&self, mode: u8) -> Result<ProfileReport>;
}

/// IPC server
pub struct IpcServer<H: IpcHandler> {
    socket_path: String,
    handler: Arc<H>,
}

impl<H: IpcHandler + 'static> IpcServer<H> {
    pub fn new(socket_path: impl Into<String>, handler: Arc<H>) -> Self {
        Self {
            socket_path: socket_path.into(),
            handler,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let _ = std::fs::remove_file(&self.socket_path);

        if let Some(parent) = std::path::Path::new(&self.socket_path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!("Vigil IPC listening on {}", self.socket_path);

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let handler = Arc::clone(&self.handler);
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, handler).await {
                            tracing::error!("Client error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                }
            }
        }
    }
}

async fn handle_client<H: IpcHandler + 'static>(stream: UnixStream, handler: Arc<H>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => {
                // Power events may join governor threads
                let handler = Arc::clone(&handler);
                tokio::task::spawn_blocking(move || process_request(request, handler.as_ref()))
                    .await?
            }
            Err(e) => IpcResponse::Error {
                message: format!("Invalid request: {}", e),
            },
        };

        let response_json = serde_json::to_string(&response)?;
        writer.write_all(response_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        line.clear();
    }

    Ok(())
}

fn success<T: Serialize>(value: T) -> IpcResponse {
    match serde_json::to_value(value) {
        Ok(data) => IpcResponse::Success { data },
        Err(e) => IpcResponse::Error {
            message: format!("Failed to encode response: {}", e),
        },
    }
}

fn respond<T: Serialize>(result: Result<T>) -> IpcResponse {
    match result {
        Ok(value) => success(value),
        Err(e) => IpcResponse::Error {
            message: e.to_string(),
        },
    }
}

pub fn process_request<H: IpcHandler + ?Sized>(request: IpcRequest, handler: &H) -> IpcResponse {
    match request {
        IpcRequest::GetStatus => success(handler.get_status()),

        IpcRequest::Enable => {
            handler.enable();
            success(serde_json::json!({"action": "enable"}))
        }

        IpcRequest::Disable => {
            handler.disable();
            success(serde_json::json!({"action": "disable"}))
        }

        IpcRequest::SetKnob { knob, value } => respond(
            handler
                .set_knob(knob, &value)
                .map(|()| serde_json::json!({"knob": knob, "value": value})),
        ),

        IpcRequest::GetKnobs => success(handler.get_knobs()),

        IpcRequest::Event { event } => {
            handler.power_event(event);
            success(serde_json::json!({"event": event}))
        }

        IpcRequest::Cluster { request } => respond(
            handler
                .cluster(request)
                .map(|()| serde_json::json!({"request": request})),
        ),

        IpcRequest::SetIdleState { state, disabled } => respond(
            handler
                .set_idle_state(state, disabled)
                .map(|()| serde_json::json!({"state": state, "disabled": disabled})),
        ),

        IpcRequest::StartProfile { period } => respond(
            handler
                .start_profile(period)
                .map(|period| serde_json::json!({"period": period})),
        ),

        IpcRequest::StopProfile => success(serde_json::json!({"stopped": handler.stop_profile()})),

        IpcRequest::GetProfile { mode } => respond(handler.get_profile(mode)),
    }
}

/// IPC client
pub struct IpcClient {
    socket_path: String,
}

impl IpcClient {
    pub fn new(socket_path: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub async fn send(&self, request: IpcRequest) -> Result<IpcResponse> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;

        let request_json = serde_json::to_string(&request)?;
        stream.write_all(request_json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;

        Ok(serde_json::from_str(&line)?)
    }

    /// Send `request` and decode the success payload
    pub async fn call<T: DeserializeOwned>(&self, request: IpcRequest) -> Result<T> {
        match self.send(request).await? {
            IpcResponse::Success { data } => Ok(serde_json::from_value(data)?),
            IpcResponse::Error { message } => Err(anyhow::anyhow!(message)),
        }
    }

    pub async fn get_status(&self) -> Result<DaemonStatus> {
        self.call(IpcRequest::GetStatus).await
    }

    pub async fn get_knobs(&self) -> Result<Tunables> {
        self.call(IpcRequest::GetKnobs).await
    }

    pub async fn get_profile(&self, mode: u8) -> Result<ProfileReport> {
        self.call(IpcRequest::GetProfile { mode }).await
    }

    pub async fn set_knob(&self, knob: Knob, value: &str) -> Result<()> {
        let _: serde_json::Value = self
            .call(IpcRequest::SetKnob {
                knob,
                value: value.to_string(),
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::HotplugCommand;
    use crate::decision::HysteresisCounters;
    use crate::profiler::ProfileMode;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct MockHandler {
        calls: Mutex<Vec<String>>,
    }

    impl MockHandler {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    impl IpcHandler for MockHandler {
        fn get_status(&self) -> DaemonStatus {
            DaemonStatus {
                version: "test".into(),
                governor: GovernorStatus {
                    enabled: true,
                    disable_count: 0,
                    lcd_on: true,
                    in_low_power_mode: false,
                    suspend_prepared: false,
                    forced_hotplug: false,
                    one_core_in_request: false,
                    applied: HotplugCommand::Normal,
                    last_decided: None,
                    hysteresis: HysteresisCounters::default(),
                    online_cpus: vec![0, 1],
                    cluster1_hotplugged: false,
                    ticks: 0,
                    executions: 0,
                    worker_running: true,
                    watchdog_running: false,
                    last_error: None,
                },
                lpm_allowed: false,
                profiling: false,
            }
        }

        fn enable(&self) {
            self.record("enable");
        }

        fn disable(&self) {
            self.record("disable");
        }

        fn set_knob(&self, knob: Knob, value: &str) -> Result<()> {
            if value == "bad" {
                anyhow::bail!("rejected {}", knob);
            }
            self.record(format!("{}={}", knob, value));
            Ok(())
        }

        fn get_knobs(&self) -> Tunables {
            Tunables::default()
        }

        fn power_event(&self, event: PowerEvent) {
            self.record(event.to_string());
        }

        fn cluster(&self, request: ClusterRequest) -> Result<()> {
            self.record(format!("{:?}", request));
            Ok(())
        }

        fn set_idle_state(&self, state: IdleState, disabled: bool) -> Result<()> {
            self.record(format!("{}:{}", state, disabled));
            Ok(())
        }

        fn start_profile(&self, period: Option<u32>) -> Result<u32> {
            Ok(period.unwrap_or(10))
        }

        fn stop_profile(&self) -> bool {
            true
        }

        fn get_profile(&self, mode: u8) -> Result<ProfileReport> {
            Ok(ProfileReport {
                mode: ProfileMode::try_from(mode)?,
                active: false,
                started_at: None,
                duration_ms: 0,
                cpus: Vec::new(),
                totals: Vec::new(),
            })
        }
    }

    #[test]
    fn test_request_wire_format() {
        let request = IpcRequest::SetKnob {
            knob: Knob::NrRunning,
            value: "3 4".into(),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"type":"SetKnob","knob":"nr_running","value":"3 4"}"#);

        let parsed: IpcRequest =
            serde_json::from_str(r#"{"type":"Event","event":"display_blank"}"#).unwrap();
        assert_eq!(
            parsed,
            IpcRequest::Event {
                event: PowerEvent::DisplayBlank
            }
        );
    }

    #[test]
    fn test_process_request() {
        let handler = MockHandler::default();

        let response = process_request(
            IpcRequest::SetKnob {
                knob: Knob::StayThreshold,
                value: "7".into(),
            },
            &handler,
        );
        assert!(matches!(response, IpcResponse::Success { .. }));

        let response = process_request(
            IpcRequest::SetKnob {
                knob: Knob::StayThreshold,
                value: "bad".into(),
            },
            &handler,
        );
        match response {
            IpcResponse::Error { message } => assert!(message.contains("stay_threshold")),
            other => panic!("unexpected response: {:?}", other),
        }

        process_request(
            IpcRequest::Event {
                event: PowerEvent::SuspendPrepare,
            },
            &handler,
        );
        assert_eq!(
            *handler.calls.lock().unwrap(),
            vec!["stay_threshold=7".to_string(), "suspend_prepare".to_string()]
        );

        let response = process_request(IpcRequest::GetProfile { mode: 9 }, &handler);
        assert!(matches!(response, IpcResponse::Error { .. }));
    }

    #[tokio::test]
    async fn test_round_trip_over_socket() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("vigil.sock").to_string_lossy().to_string();
        let server = IpcServer::new(socket.clone(), Arc::new(MockHandler::default()));
        let task = tokio::spawn(async move { server.run().await });

        let client = IpcClient::new(socket.clone());
        let mut status = None;
        for _ in 0..50 {
            match client.get_status().await {
                Ok(s) => {
                    status = Some(s);
                    break;
                }
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            }
        }
        let status = status.expect("server never came up");
        assert_eq!(status.governor.online_cpus, vec![0, 1]);

        assert!(client.set_knob(Knob::Delays, "bad").await.is_err());
        let knobs = client.get_knobs().await.unwrap();
        assert_eq!(knobs, Tunables::default());

        task.abort();
    }
}
