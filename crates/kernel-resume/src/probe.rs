//! Capability probe for the direct in-process kernel transport.
//!
//! Local kernels can be driven over ZeroMQ sockets opened by this process
//! ("raw" transport) when the machine allows it; otherwise they must be
//! reached through a server. The answer is computed once per probe and
//! reported to telemetry exactly once.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use jupyter_protocol::ConnectionInfo;
use log::{debug, error, info};
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::settings::{load_settings, Settings, NON_RAW_NATIVE_TEST_ENV};
use crate::telemetry::{
    TelemetryEvent, TelemetrySink, RAW_TRANSPORT_NOT_SUPPORTED, RAW_TRANSPORT_SUPPORTED,
};

/// Checks that the direct transport can be used on this machine.
#[async_trait]
pub trait TransportLoader: Send + Sync {
    async fn load(&self) -> Result<()>;
}

/// Loads the ZeroMQ transport the way a local kernel launch would: reserve
/// kernel ports on loopback, bind a kernel-side IOPub socket on them and
/// subscribe to it from the client side.
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    runtime_dir: PathBuf,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self {
            runtime_dir: runtimelib::dirs::runtime_dir(),
        }
    }
}

impl LoopbackTransport {
    pub fn new(runtime_dir: PathBuf) -> Self {
        Self { runtime_dir }
    }
}

#[async_trait]
impl TransportLoader for LoopbackTransport {
    async fn load(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.runtime_dir)
            .await
            .with_context(|| {
                format!(
                    "Cannot create runtime directory {}",
                    self.runtime_dir.display()
                )
            })?;

        // Reserve ports
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let ports = runtimelib::peek_ports(ip, 5)
            .await
            .context("Cannot reserve loopback ports")?;

        let connection_info = ConnectionInfo {
            transport: jupyter_protocol::connection_info::Transport::TCP,
            ip: ip.to_string(),
            stdin_port: ports[0],
            control_port: ports[1],
            hb_port: ports[2],
            shell_port: ports[3],
            iopub_port: ports[4],
            signature_scheme: "hmac-sha256".to_string(),
            key: Uuid::new_v4().to_string(),
            kernel_name: None,
        };
        let session_id = Uuid::new_v4().to_string();

        let _kernel_iopub =
            runtimelib::create_kernel_iopub_connection(&connection_info, &session_id)
                .await
                .context("Cannot bind a ZeroMQ socket")?;
        let _client_iopub =
            runtimelib::create_client_iopub_connection(&connection_info, "", &session_id)
                .await
                .context("Cannot connect a ZeroMQ socket")?;

        debug!(
            "[probe] ZeroMQ loopback ok on iopub port {}",
            connection_info.iopub_port
        );
        Ok(())
    }
}

type SettingsSource = Box<dyn Fn() -> Settings + Send + Sync>;

/// Answers whether the direct transport is supported.
pub struct RawTransportSupport {
    settings: SettingsSource,
    loader: Box<dyn TransportLoader>,
    telemetry: Arc<dyn TelemetrySink>,
    supported: OnceCell<bool>,
}

impl RawTransportSupport {
    /// A probe reading settings from the user's settings file.
    pub fn new(loader: Box<dyn TransportLoader>, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            settings: Box::new(load_settings),
            loader,
            telemetry,
            supported: OnceCell::new(),
        }
    }

    /// Replace the settings source. It is consulted on every call.
    pub fn with_settings<F>(mut self, settings: F) -> Self
    where
        F: Fn() -> Settings + Send + Sync + 'static,
    {
        self.settings = Box::new(settings);
        self
    }

    /// Whether local kernels can use the direct transport. Never fails; any
    /// loader error counts as "not supported". Concurrent first calls share
    /// a single load.
    pub async fn is_supported(&self) -> bool {
        if (self.settings)().disable_raw_transport {
            debug!("[probe] Direct transport disabled in settings");
            return false;
        }
        if let Some(supported) = self.supported.get() {
            return *supported;
        }
        if env_override_set() {
            debug!("[probe] {} is set, skipping probe", NON_RAW_NATIVE_TEST_ENV);
            return false;
        }
        *self.supported.get_or_init(|| self.probe()).await
    }

    async fn probe(&self) -> bool {
        match self.loader.load().await {
            Ok(()) => {
                info!("[probe] Direct kernel transport verified");
                self.telemetry
                    .send_event(TelemetryEvent::new(RAW_TRANSPORT_SUPPORTED));
                true
            }
            Err(e) => {
                error!("[probe] Direct kernel transport unavailable: {:#}", e);
                self.telemetry.send_event(
                    TelemetryEvent::new(RAW_TRANSPORT_NOT_SUPPORTED)
                        .with_data(serde_json::json!({ "error": format!("{e:#}") })),
                );
                false
            }
        }
    }
}

fn env_override_set() -> bool {
    std::env::var(NON_RAW_NATIVE_TEST_ENV)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
