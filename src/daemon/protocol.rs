//! RPC wire protocol for daemon communication.
//!
//! Wire format: 4-byte length prefix (big-endian) + UTF-8 JSON payload.
//!
//! Requests carry a protocol version, a method name, and a free-form args
//! object; responses are `{ok, data?, error?}` envelopes. An unknown method
//! answers `{ok: false, error: {kind: "unsupported"}}`, which clients treat
//! as "this daemon does not speak that command yet" and fall back to direct
//! mode — old clients and new daemons (and vice versa) stay compatible.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BeadsError, ErrorKind, Result};
use crate::storage::IssueUpdate;

/// Version spoken by this binary. Bump on incompatible envelope changes.
pub const PROTOCOL_VERSION: u16 = 1;

/// Upper bound on a single frame; anything larger is a corrupt stream.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Method names. Kept as constants so client and server cannot drift.
pub mod methods {
    pub const HEALTH: &str = "health";
    pub const STATUS: &str = "status";
    pub const SHUTDOWN: &str = "shutdown";
    pub const CREATE: &str = "create";
    pub const UPDATE: &str = "update";
    pub const CLOSE: &str = "close";
    pub const GET: &str = "get";
    pub const LIST: &str = "list";
    pub const DEP_ADD: &str = "dep.add";
    pub const DEP_REMOVE: &str = "dep.remove";
    pub const LABEL_ADD: &str = "label.add";
    pub const LABEL_REMOVE: &str = "label.remove";
    pub const EXPORT: &str = "export";
    pub const IMPORT: &str = "import";
}

/// A request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub protocol: u16,
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

impl Request {
    #[must_use]
    pub fn new(method: &str, args: Value) -> Self {
        Self {
            protocol: PROTOCOL_VERSION,
            method: method.to_string(),
            args,
        }
    }
}

/// Error payload inside a response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

/// A response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Response {
    #[must_use]
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(WireError {
                kind,
                message: message.into(),
            }),
        }
    }

    #[must_use]
    pub fn unsupported(method: &str) -> Self {
        Self::failure(ErrorKind::Unsupported, format!("unknown method '{method}'"))
    }

    /// Unwrap into the data value or the carried error.
    pub fn into_result(self) -> Result<Value> {
        if self.ok {
            return Ok(self.data.unwrap_or(Value::Null));
        }
        let error = self.error.unwrap_or(WireError {
            kind: ErrorKind::IoError,
            message: "malformed error response".to_string(),
        });
        Err(BeadsError::from_wire(error.kind, error.message))
    }
}

// === Sync framing (client side) ===

pub fn write_frame(writer: &mut impl Write, payload: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

pub fn read_frame(reader: &mut impl Read) -> std::io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

// === Async framing (server side) ===

pub async fn write_frame_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> std::io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

pub async fn read_frame_async<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

// === Typed args ===

#[derive(Debug, Serialize, Deserialize)]
pub struct GetArgs {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CloseArgs {
    pub id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateArgs {
    pub id: String,
    /// Sparse field map: absent keys untouched, `null` tombstones.
    pub fields: Value,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ListArgs {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DepArgs {
    pub issue_id: String,
    pub depends_on_id: String,
    pub dep_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LabelArgs {
    pub id: String,
    pub label: String,
}

/// `status` method payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusData {
    pub pid: u32,
    pub version: String,
    pub protocol: u16,
    pub phase: String,
    pub db_path: String,
    pub issue_count: usize,
    pub dirty_count: usize,
    pub uptime_secs: u64,
}

/// Decode a sparse JSON field map into an [`IssueUpdate`].
///
/// Absence means "do not touch"; an explicit `null` tombstones the field.
/// This is the one place where raw-JSON presence semantics enter the typed
/// world, shared by the RPC server and the CLI's direct mode.
pub fn issue_update_from_value(fields: &Value) -> Result<IssueUpdate> {
    let Some(map) = fields.as_object() else {
        return Err(BeadsError::validation("fields", "expected an object"));
    };

    let mut update = IssueUpdate::default();
    for (key, value) in map {
        match key.as_str() {
            "title" => {
                update.title = Some(
                    value
                        .as_str()
                        .ok_or_else(|| BeadsError::validation("title", "must be a string"))?
                        .to_string(),
                );
            }
            "description" => update.description = Some(opt_string(value)),
            "design" => update.design = Some(opt_string(value)),
            "acceptance_criteria" => update.acceptance_criteria = Some(opt_string(value)),
            "notes" => update.notes = Some(opt_string(value)),
            "assignee" => update.assignee = Some(opt_string(value)),
            "external_ref" => update.external_ref = Some(opt_string(value)),
            "status" => {
                let raw = value
                    .as_str()
                    .ok_or_else(|| BeadsError::validation("status", "must be a string"))?;
                update.status = Some(raw.parse()?);
            }
            "priority" => {
                let raw = value
                    .as_i64()
                    .ok_or_else(|| BeadsError::validation("priority", "must be a number"))?;
                update.priority = Some(
                    i32::try_from(raw)
                        .ok()
                        .map(crate::model::Priority)
                        .filter(|p| (0..=4).contains(&p.0))
                        .ok_or(BeadsError::InvalidPriority { priority: raw })?,
                );
            }
            "issue_type" => {
                let raw = value
                    .as_str()
                    .ok_or_else(|| BeadsError::validation("issue_type", "must be a string"))?;
                update.issue_type = Some(raw.parse()?);
            }
            "estimated_minutes" => {
                update.estimated_minutes = Some(match value {
                    Value::Null => None,
                    other => Some(
                        other
                            .as_i64()
                            .and_then(|n| i32::try_from(n).ok())
                            .ok_or_else(|| {
                                BeadsError::validation("estimated_minutes", "must be a number")
                            })?,
                    ),
                });
            }
            other => {
                return Err(BeadsError::validation(
                    "fields",
                    format!("unknown field '{other}'"),
                ));
            }
        }
    }
    Ok(update)
}

fn opt_string(value: &Value) -> Option<String> {
    value.as_str().map(ToString::to_string)
}
