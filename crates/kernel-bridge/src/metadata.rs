//! Kernel connection metadata: how a notebook is (or will be) connected to
//! its kernel.
//!
//! Serialized with a `kind` tag using the same camelCase names front-ends
//! already persist, e.g.
//!
//! ```json
//! { "kind": "connectToLiveKernel", "id": "...", "kernelModel": { "id": "...", "name": "python3" }, "baseUrl": "..." }
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A kernelspec as read from `kernel.json` (or reported by a remote server).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpec {
    pub name: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub argv: Vec<String>,
    /// Resource name -> path/URL (logos, kernel.js, ...).
    #[serde(default)]
    pub resources: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Snapshot of a kernel that was already running on a server when we
/// attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveKernelModel {
    /// Server-assigned kernel id. Stable across reconnects.
    pub id: String,
    /// Kernelspec name the kernel was started from.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connections: Option<u32>,
}

/// How a notebook is connected to its kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum KernelConnectionMetadata {
    /// Launch a kernel from a local kernelspec.
    #[serde(rename_all = "camelCase")]
    StartUsingLocalKernelSpec { id: String, kernel_spec: KernelSpec },
    /// Launch a kernel from a Python interpreter.
    #[serde(rename_all = "camelCase")]
    StartUsingPythonInterpreter {
        id: String,
        kernel_spec: KernelSpec,
        interpreter_path: PathBuf,
    },
    /// Launch a kernel on a remote server from one of its kernelspecs.
    #[serde(rename_all = "camelCase")]
    StartUsingRemoteKernelSpec {
        id: String,
        kernel_spec: KernelSpec,
        base_url: String,
    },
    /// Attach to a kernel that is already running on a server.
    #[serde(rename_all = "camelCase")]
    ConnectToLiveKernel {
        id: String,
        kernel_model: LiveKernelModel,
        base_url: String,
    },
}

/// The `kind` tag of a [`KernelConnectionMetadata`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    StartUsingLocalKernelSpec,
    StartUsingPythonInterpreter,
    StartUsingRemoteKernelSpec,
    ConnectToLiveKernel,
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionKind::StartUsingLocalKernelSpec => write!(f, "startUsingLocalKernelSpec"),
            ConnectionKind::StartUsingPythonInterpreter => {
                write!(f, "startUsingPythonInterpreter")
            }
            ConnectionKind::StartUsingRemoteKernelSpec => write!(f, "startUsingRemoteKernelSpec"),
            ConnectionKind::ConnectToLiveKernel => write!(f, "connectToLiveKernel"),
        }
    }
}

impl KernelConnectionMetadata {
    /// Identifier of the connection (not of the kernel).
    pub fn id(&self) -> &str {
        match self {
            KernelConnectionMetadata::StartUsingLocalKernelSpec { id, .. }
            | KernelConnectionMetadata::StartUsingPythonInterpreter { id, .. }
            | KernelConnectionMetadata::StartUsingRemoteKernelSpec { id, .. }
            | KernelConnectionMetadata::ConnectToLiveKernel { id, .. } => id,
        }
    }

    pub fn kind(&self) -> ConnectionKind {
        match self {
            KernelConnectionMetadata::StartUsingLocalKernelSpec { .. } => {
                ConnectionKind::StartUsingLocalKernelSpec
            }
            KernelConnectionMetadata::StartUsingPythonInterpreter { .. } => {
                ConnectionKind::StartUsingPythonInterpreter
            }
            KernelConnectionMetadata::StartUsingRemoteKernelSpec { .. } => {
                ConnectionKind::StartUsingRemoteKernelSpec
            }
            KernelConnectionMetadata::ConnectToLiveKernel { .. } => {
                ConnectionKind::ConnectToLiveKernel
            }
        }
    }

    /// The embedded kernelspec, for the variants that launch a kernel.
    pub fn kernel_spec(&self) -> Option<&KernelSpec> {
        match self {
            KernelConnectionMetadata::StartUsingLocalKernelSpec { kernel_spec, .. }
            | KernelConnectionMetadata::StartUsingPythonInterpreter { kernel_spec, .. }
            | KernelConnectionMetadata::StartUsingRemoteKernelSpec { kernel_spec, .. } => {
                Some(kernel_spec)
            }
            KernelConnectionMetadata::ConnectToLiveKernel { .. } => None,
        }
    }

    /// The live kernel model, for `connectToLiveKernel`.
    pub fn live_kernel(&self) -> Option<&LiveKernelModel> {
        match self {
            KernelConnectionMetadata::ConnectToLiveKernel { kernel_model, .. } => {
                Some(kernel_model)
            }
            _ => None,
        }
    }

    /// Kernelspec name (or the live kernel's spec name).
    pub fn kernel_name(&self) -> &str {
        match self {
            KernelConnectionMetadata::ConnectToLiveKernel { kernel_model, .. } => {
                &kernel_model.name
            }
            other => other.kernel_spec().map(|s| s.name.as_str()).unwrap_or_default(),
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            KernelConnectionMetadata::ConnectToLiveKernel { kernel_model, .. } => kernel_model
                .display_name
                .as_deref()
                .unwrap_or(&kernel_model.name),
            other => other
                .kernel_spec()
                .map(|s| s.display_name.as_str())
                .unwrap_or_default(),
        }
    }
}
