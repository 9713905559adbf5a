//! Wire types for the control-plane socket, plus the data model shared by the
//! store and the deployment controller.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;

/// Lowercase; collapse every run of characters outside `[a-z0-9-]` into a
/// single `-`; trim leading/trailing `-`; fall back to `app` if the result
/// is empty. Used to derive container names and sub-domains from
/// DNS-derived or user-supplied names.
///
/// Idempotent: `sanitize_for_dns(sanitize_for_dns(x)) == sanitize_for_dns(x)`.
pub fn sanitize_for_dns(input: &str) -> String {
    let lower = input.to_lowercase();
    let mut out = String::with_capacity(lower.len());
    let mut last_was_dash = false;
    for ch in lower.chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            out.push(ch);
            last_was_dash = false;
        } else if !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "app".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Which slot of a hostname's blue/green pair is currently serving traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveColor {
    Blue,
    Green,
    None,
}

/// The two slots a hostname's deployment can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    Blue,
    Green,
}

impl Color {
    pub fn opposite(self) -> Color {
        match self {
            Color::Blue => Color::Green,
            Color::Green => Color::Blue,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Color::Blue => "blue",
            Color::Green => "green",
        }
    }
}

impl From<Color> for ActiveColor {
    fn from(c: Color) -> Self {
        match c {
            Color::Blue => ActiveColor::Blue,
            Color::Green => ActiveColor::Green,
        }
    }
}

/// Health of a single blue/green slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown,
    Checking,
    Healthy,
    Unhealthy,
    Stopped,
}

/// A persistent association from a public hostname to a backend target
/// address plus a liveness flag. Exactly zero or one `Route` exists per
/// hostname at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub host: String,
    pub target: String,
    pub health_path: String,
    pub healthy: bool,
    pub project: String,
    pub updated_at: i64,
}

/// One blue or green container belonging to a `Deployment`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerDescriptor {
    pub name: String,
    pub target: Option<String>,
    pub health_path: String,
    pub health_state: HealthState,
    pub started_at: Option<i64>,
}

impl ContainerDescriptor {
    pub fn empty(name: String, health_path: String) -> Self {
        Self {
            name,
            target: None,
            health_path,
            health_state: HealthState::Unknown,
            started_at: None,
        }
    }
}

/// Per-hostname state describing an in-progress or completed blue-green
/// pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub host: String,
    pub blue: ContainerDescriptor,
    pub green: ContainerDescriptor,
    pub active: ActiveColor,
    pub updated_at: i64,
}

impl Deployment {
    pub fn descriptor(&self, color: Color) -> &ContainerDescriptor {
        match color {
            Color::Blue => &self.blue,
            Color::Green => &self.green,
        }
    }

    pub fn descriptor_mut(&mut self, color: Color) -> &mut ContainerDescriptor {
        match color {
            Color::Blue => &mut self.blue,
            Color::Green => &mut self.green,
        }
    }
}

/// An entry in the certificate issuance retry queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertQueueEntry {
    pub host: String,
    pub contact_email: String,
    pub added_at: i64,
    pub last_attempt_at: i64,
    pub attempts: u32,
}

/// Error kinds reported back to control-plane clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    BackendUnavailable,
    HealthCheckFailed,
    CertificateUnavailable,
    IoError,
    Invalid,
}

/// Commands accepted by the control-plane socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Deploy {
        host: String,
        target: String,
        #[serde(default)]
        project: String,
        #[serde(default = "default_health_path")]
        health_path: String,
    },
    Remove {
        host: String,
    },
    List,
    Get {
        host: String,
    },
    Status,
    UpdateHealth {
        host: String,
        healthy: bool,
    },
    SetGlobalOption {
        key: String,
        value: String,
    },
}

pub fn default_health_path() -> String {
    "/up".to_string()
}

/// Response returned for every command: `{"ok": true, "data": ...}` on
/// success, `{"ok": false, "kind": ..., "error": ...}` on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(data: impl Serialize) -> Self {
        Self {
            ok: true,
            data: Some(serde_json::to_value(data).unwrap_or(Value::Null)),
            kind: None,
            error: None,
        }
    }

    pub fn ok_empty() -> Self {
        Self {
            ok: true,
            data: None,
            kind: None,
            error: None,
        }
    }

    pub fn err(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            kind: Some(kind),
            error: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }
}
