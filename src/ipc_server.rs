//! IPC Server module for host communication.
//!
//! This module provides a Unix Domain Socket server through which the host
//! application drives the governor: lifecycle events, measured frame rates,
//! device context updates, mode and override changes, and status queries.

use crate::config::{ConfigManager, QualityMode};
use crate::controller::DebugOverrides;
use crate::error::IpcError;
use crate::governor::Governor;
use crate::platform::SysfsDeviceContext;
use crate::thermal::{PushDeviceContext, ThermalState};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(unix)]
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// Commands that can be received via IPC.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "command")]
pub enum IpcCommand {
    SetActiveWorkload {
        workload_id: String,
    },
    Foreground,
    Background,
    ReportMeasuredRate {
        observed: f64,
    },
    UpdateContext {
        #[serde(default)]
        thermal_state: Option<String>,
        #[serde(default)]
        charging: Option<bool>,
        #[serde(default)]
        low_power: Option<bool>,
    },
    SetMode {
        mode: String,
    },
    SetOverrides {
        #[serde(default)]
        rate: Option<f64>,
        #[serde(default)]
        scale: Option<f64>,
        #[serde(default)]
        detail: Option<f64>,
    },
    ClearOverrides,
    GetStatus,
}

/// Writable side of the device context.
///
/// With the sysfs source only the low-power flag can be pushed; thermal
/// state and charging come from the kernel.
#[derive(Clone)]
pub enum ContextControl {
    Push(Arc<PushDeviceContext>),
    Sysfs(Arc<SysfsDeviceContext>),
}

impl ContextControl {
    pub fn apply(
        &self,
        thermal_state: Option<ThermalState>,
        charging: Option<bool>,
        low_power: Option<bool>,
    ) -> Result<(), IpcError> {
        match self {
            ContextControl::Push(context) => {
                if let Some(state) = thermal_state {
                    context.set_thermal_state(state);
                }
                if let Some(charging) = charging {
                    context.set_charging(charging);
                }
                if let Some(low_power) = low_power {
                    context.set_low_power_mode(low_power);
                }
                Ok(())
            }
            ContextControl::Sysfs(context) => {
                if thermal_state.is_some() || charging.is_some() {
                    return Err(IpcError::InvalidCommand(
                        "thermal_state and charging are read from sysfs and cannot be pushed"
                            .to_string(),
                    ));
                }
                if let Some(low_power) = low_power {
                    context.set_low_power_mode(low_power);
                }
                Ok(())
            }
        }
    }
}

/// Shared daemon state accessible by the IPC server.
pub struct DaemonState {
    pub governor: Arc<Governor>,
    pub context: ContextControl,
    /// Configuration manager
    pub config_manager: Arc<ConfigManager>,
}

impl DaemonState {
    pub fn new(
        governor: Arc<Governor>,
        context: ContextControl,
        config_manager: Arc<ConfigManager>,
    ) -> Self {
        Self {
            governor,
            context,
            config_manager,
        }
    }
}

fn success(message: impl Into<String>) -> serde_json::Value {
    serde_json::json!({ "success": true, "message": message.into() })
}

fn failure(error: impl std::fmt::Display) -> serde_json::Value {
    serde_json::json!({ "success": false, "error": error.to_string() })
}

/// Unix Domain Socket server for IPC.
#[cfg(unix)]
pub struct IpcServer {
    /// Path to the Unix socket
    socket_path: PathBuf,
    /// Unix listener for incoming connections
    listener: UnixListener,
}

#[cfg(unix)]
impl IpcServer {
    /// Create a new IPC server at the specified path.
    ///
    /// Any existing socket file at the path is removed first.
    pub async fn new(path: &str) -> Result<Self, IpcError> {
        let socket_path = PathBuf::from(path);

        Self::cleanup_socket(&socket_path)?;

        let listener = UnixListener::bind(&socket_path).map_err(|e| IpcError::SocketBindFailed {
            path: path.to_string(),
            source: e,
        })?;

        Ok(Self {
            socket_path,
            listener,
        })
    }

    /// Clean up an existing socket file.
    fn cleanup_socket(path: &Path) -> Result<(), IpcError> {
        if path.exists() {
            std::fs::remove_file(path).map_err(|e| IpcError::SocketBindFailed {
                path: path.display().to_string(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Get the socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept and handle incoming connections.
    ///
    /// This runs in a loop, accepting connections and spawning tasks to handle them.
    pub async fn run(&self, state: Arc<DaemonState>) -> Result<(), IpcError> {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, state).await {
                            tracing::warn!("Error handling IPC connection: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Error accepting IPC connection: {}", e);
                }
            }
        }
    }

    /// Handle a single client connection.
    async fn handle_connection(
        stream: UnixStream,
        state: Arc<DaemonState>,
    ) -> Result<(), IpcError> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        // Newline-delimited JSON
        while reader.read_line(&mut line).await? > 0 {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                line.clear();
                continue;
            }

            let response = match serde_json::from_str::<IpcCommand>(trimmed) {
                Ok(command) => Self::handle_command(command, &state).await,
                Err(e) => failure(IpcError::InvalidCommand(e.to_string())),
            };

            let response_str = serde_json::to_string(&response)?;
            writer.write_all(response_str.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;

            line.clear();
        }

        Ok(())
    }

    /// Handle a single IPC command and return the response.
    pub async fn handle_command(
        command: IpcCommand,
        state: &Arc<DaemonState>,
    ) -> serde_json::Value {
        match command {
            IpcCommand::SetActiveWorkload { workload_id } => {
                if workload_id.trim().is_empty() {
                    return failure(IpcError::InvalidCommand(
                        "workload_id must not be empty".to_string(),
                    ));
                }
                state.governor.set_active_workload(&workload_id).await;
                tracing::info!("Workload set via IPC: {}", workload_id);
                success(format!("Active workload set to {}", workload_id))
            }

            IpcCommand::Foreground => {
                state.governor.on_foreground().await;
                success("Foregrounded")
            }

            IpcCommand::Background => {
                state.governor.on_background().await;
                success("Backgrounded")
            }

            IpcCommand::ReportMeasuredRate { observed } => {
                if !observed.is_finite() || observed < 0.0 {
                    return failure(IpcError::InvalidCommand(format!(
                        "observed rate must be a non-negative number, got {}",
                        observed
                    )));
                }
                state.governor.report_measured_rate(observed).await;
                success("Measured rate recorded")
            }

            IpcCommand::UpdateContext {
                thermal_state,
                charging,
                low_power,
            } => {
                let thermal = thermal_state.as_deref().map(ThermalState::parse);
                match state.context.apply(thermal, charging, low_power) {
                    Ok(()) => {
                        tracing::debug!(
                            "Context updated via IPC: thermal={:?}, charging={:?}, low_power={:?}",
                            thermal,
                            charging,
                            low_power
                        );
                        success("Context updated")
                    }
                    Err(e) => failure(e),
                }
            }

            IpcCommand::SetMode { mode } => {
                let mode = match QualityMode::parse(&mode) {
                    Ok(m) => m,
                    Err(e) => return failure(e),
                };

                let mut config = state.config_manager.get();
                config.mode = mode;
                match state.config_manager.update(config) {
                    Ok(()) => {
                        state.governor.set_mode(mode).await;
                        tracing::info!("Mode set via IPC: {}", mode.as_str());
                        serde_json::json!({
                            "success": true,
                            "message": format!("Mode set to {}", mode.as_str()),
                            "mode": mode.as_str()
                        })
                    }
                    Err(e) => {
                        tracing::warn!("Failed to update config via IPC: {}", e);
                        failure(e)
                    }
                }
            }

            IpcCommand::SetOverrides {
                rate,
                scale,
                detail,
            } => {
                let overrides = DebugOverrides {
                    rate,
                    scale,
                    detail,
                };
                state.governor.set_overrides(overrides).await;
                success("Overrides set")
            }

            IpcCommand::ClearOverrides => {
                state.governor.set_overrides(DebugOverrides::default()).await;
                success("Overrides cleared")
            }

            IpcCommand::GetStatus => {
                let status = state.governor.status().await;
                serde_json::to_value(status).unwrap_or_else(|e| {
                    failure(IpcError::SerializationFailed(e))
                })
            }
        }
    }
}

#[cfg(unix)]
impl Drop for IpcServer {
    fn drop(&mut self) {
        // Clean up socket file on drop
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}
