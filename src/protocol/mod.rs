//! Wire protocol
//!
//! Client→server messages form a tagged union discriminated on a `type`
//! string field. Validation happens against a parsed `serde_json::Value` so
//! that failures produce a structured issue list rather than a serde error
//! string; the issue list is echoed back to the client in an `error` frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Display-name limit, applied after trimming.
pub const MAX_NAME_LEN: usize = 32;
/// Upper bound on role arrays in `auth` and `roles.update`.
pub const MAX_ROLES: usize = 8;

const MAX_SHORT_STRING: usize = 32;
const MAX_LONG_STRING: usize = 256;

/// Error code carried by `error` frames for malformed or invalid payloads.
pub const ERROR_INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
/// Human-readable message carried alongside [`ERROR_INVALID_PAYLOAD`].
pub const INVALID_PAYLOAD_MESSAGE: &str = "Invalid message payload";

/// Close codes used by the server.
pub const CLOSE_SOCKET_NOT_OPEN: u16 = 4001;
pub const CLOSE_INACTIVITY: u16 = 4400;
pub const CLOSE_KEEPALIVE_FAILED: u16 = 4401;
pub const CLOSE_VERIFICATION_FAILED: u16 = 4403;

/// A user role. Serialized in upper case on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Staff,
    Diamond,
    Gold,
    Member,
}

impl Role {
    /// Fallback role when resolution would otherwise yield an empty set.
    pub const DEFAULT: Role = Role::Member;

    /// Parse a single role string, tolerating case and surrounding
    /// whitespace. Unknown values are dropped by the caller.
    pub fn parse(input: &str) -> Option<Role> {
        match input.trim().to_ascii_uppercase().as_str() {
            "STAFF" => Some(Role::Staff),
            "DIAMOND" => Some(Role::Diamond),
            "GOLD" => Some(Role::Gold),
            "MEMBER" => Some(Role::Member),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Staff => "STAFF",
            Role::Diamond => "DIAMOND",
            Role::Gold => "GOLD",
            Role::Member => "MEMBER",
        }
    }
}

/// Coarse client kind. `LOCAL` is the catch-all default; anything outside
/// the closed set normalizes to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountType {
    #[default]
    Local,
    Premium,
    Legacy,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Local => "LOCAL",
            AccountType::Premium => "PREMIUM",
            AccountType::Legacy => "LEGACY",
        }
    }
}

/// Normalize a raw roles value into a deduplicated ordered role set.
///
/// Non-array input yields an empty set. Entries are trimmed and upper-cased;
/// unknown role names and non-string entries are dropped. Order of first
/// appearance is preserved.
pub fn normalize_roles(input: &Value) -> Vec<Role> {
    let Some(items) = input.as_array() else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for item in items {
        let Some(raw) = item.as_str() else { continue };
        if let Some(role) = Role::parse(raw) {
            if !out.contains(&role) {
                out.push(role);
            }
        }
    }
    out
}

/// Normalize an account-type string; unknown values map to `LOCAL`.
pub fn normalize_account_type(input: &str) -> AccountType {
    match input.trim().to_ascii_uppercase().as_str() {
        "PREMIUM" => AccountType::Premium,
        "LEGACY" => AccountType::Legacy,
        _ => AccountType::Local,
    }
}

/// One schema violation, addressed by field path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

/// Validated `auth` payload. `uuid` and `name` are trimmed; empties are
/// resolved by the auth handler (fresh v4 uuid, `Unknown`), not here.
#[derive(Debug, Clone)]
pub struct AuthPayload {
    pub uuid: String,
    pub name: String,
    pub account_type: AccountType,
    pub roles: Vec<Role>,
}

/// Validated `warp.status` telemetry payload. All fields optional; persisted
/// as-is with a server timestamp added.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarpStatusPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warp_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warp_latency: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_started_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lookup_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_hit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A validated client→server message.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Auth(AuthPayload),
    Ping,
    RolesUpdate { roles: Vec<Role> },
    WarpStatus(WarpStatusPayload),
    /// Well-formed frame with an unrecognized `type`. Logged and ignored.
    Unknown(String),
}

/// Parse and validate a client frame that already parsed as JSON.
pub fn parse_client_message(value: &Value) -> Result<ClientMessage, Vec<ValidationIssue>> {
    let Some(obj) = value.as_object() else {
        return Err(vec![ValidationIssue::new("", "expected a JSON object")]);
    };
    let kind = match obj.get("type").and_then(Value::as_str) {
        Some(kind) => kind,
        None => return Err(vec![ValidationIssue::new("type", "expected a string")]),
    };
    match kind {
        "auth" => validate_auth(value),
        "ping" => Ok(ClientMessage::Ping),
        "roles.update" => validate_roles_update(value),
        "warp.status" => validate_warp_status(value),
        other => Ok(ClientMessage::Unknown(other.to_string())),
    }
}

fn validate_auth(value: &Value) -> Result<ClientMessage, Vec<ValidationIssue>> {
    let mut issues = Vec::new();

    let uuid = match value.get("uuid").and_then(Value::as_str) {
        Some(raw) => raw.trim().to_string(),
        None => {
            issues.push(ValidationIssue::new("uuid", "expected a string"));
            String::new()
        }
    };

    let name = match value.get("name").and_then(Value::as_str) {
        Some(raw) => {
            let trimmed = raw.trim();
            if trimmed.chars().count() > MAX_NAME_LEN {
                issues.push(ValidationIssue::new(
                    "name",
                    format!("must be at most {MAX_NAME_LEN} characters"),
                ));
            }
            trimmed.to_string()
        }
        None => {
            issues.push(ValidationIssue::new("name", "expected a string"));
            String::new()
        }
    };

    let account_type = match value.get("accountType").and_then(Value::as_str) {
        Some(raw) => normalize_account_type(raw),
        None => {
            issues.push(ValidationIssue::new("accountType", "expected a string"));
            AccountType::default()
        }
    };

    let roles = match value.get("roles") {
        None | Some(Value::Null) => Vec::new(),
        Some(raw) => {
            match raw.as_array() {
                Some(items) if items.len() > MAX_ROLES => {
                    issues.push(ValidationIssue::new(
                        "roles",
                        format!("at most {MAX_ROLES} roles allowed"),
                    ));
                }
                Some(_) => {}
                None => issues.push(ValidationIssue::new("roles", "expected an array")),
            }
            normalize_roles(raw)
        }
    };

    if !issues.is_empty() {
        return Err(issues);
    }
    Ok(ClientMessage::Auth(AuthPayload {
        uuid,
        name,
        account_type,
        roles,
    }))
}

fn validate_roles_update(value: &Value) -> Result<ClientMessage, Vec<ValidationIssue>> {
    let raw = value.get("roles").unwrap_or(&Value::Null);
    match raw.as_array() {
        Some(items) if items.is_empty() => Err(vec![ValidationIssue::new(
            "roles",
            "at least 1 role required",
        )]),
        Some(items) if items.len() > MAX_ROLES => Err(vec![ValidationIssue::new(
            "roles",
            format!("at most {MAX_ROLES} roles allowed"),
        )]),
        Some(_) => Ok(ClientMessage::RolesUpdate {
            roles: normalize_roles(raw),
        }),
        None => Err(vec![ValidationIssue::new("roles", "expected an array")]),
    }
}

fn validate_warp_status(value: &Value) -> Result<ClientMessage, Vec<ValidationIssue>> {
    let mut issues = Vec::new();
    let payload = WarpStatusPayload {
        enabled: optional_bool(value, "enabled", &mut issues),
        status: optional_string(value, "status", MAX_SHORT_STRING, &mut issues),
        warp_mode: optional_string(value, "warpMode", MAX_SHORT_STRING, &mut issues),
        resolver: optional_string(value, "resolver", MAX_LONG_STRING, &mut issues),
        warp_latency: optional_uint(value, "warpLatency", &mut issues),
        session_started_at: optional_uint(value, "sessionStartedAt", &mut issues),
        lookup_ms: optional_uint(value, "lookupMs", &mut issues),
        timestamp: optional_uint(value, "timestamp", &mut issues),
        cache_hit: optional_bool(value, "cacheHit", &mut issues),
        error: optional_string(value, "error", MAX_LONG_STRING, &mut issues),
    };

    if !issues.is_empty() {
        return Err(issues);
    }
    Ok(ClientMessage::WarpStatus(payload))
}

fn optional_bool(value: &Value, field: &str, issues: &mut Vec<ValidationIssue>) -> Option<bool> {
    match value.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::Bool(b)) => Some(*b),
        Some(_) => {
            issues.push(ValidationIssue::new(field, "expected a boolean"));
            None
        }
    }
}

fn optional_string(
    value: &Value,
    field: &str,
    max_len: usize,
    issues: &mut Vec<ValidationIssue>,
) -> Option<String> {
    match value.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => {
            if s.chars().count() > max_len {
                issues.push(ValidationIssue::new(
                    field,
                    format!("must be at most {max_len} characters"),
                ));
                None
            } else {
                Some(s.clone())
            }
        }
        Some(_) => {
            issues.push(ValidationIssue::new(field, "expected a string"));
            None
        }
    }
}

fn optional_uint(value: &Value, field: &str, issues: &mut Vec<ValidationIssue>) -> Option<u64> {
    match value.get(field) {
        None | Some(Value::Null) => None,
        Some(raw) => match raw.as_u64() {
            Some(n) => Some(n),
            None => {
                issues.push(ValidationIssue::new(field, "expected a non-negative integer"));
                None
            }
        },
    }
}

/// Server→client frames. The serde tag yields the wire `type` field.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "auth.ok")]
    AuthOk { uuid: String, roles: Vec<Role> },
    #[serde(rename = "user.join")]
    UserJoin {
        uuid: String,
        name: String,
        #[serde(rename = "accountType")]
        account_type: AccountType,
    },
    #[serde(rename = "user.leave")]
    UserLeave { uuid: String },
    #[serde(rename = "user.roles")]
    UserRoles { uuid: String, roles: Vec<Role> },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "server.keepalive")]
    Keepalive,
    #[serde(rename = "server.verify")]
    Verify {
        uuid: String,
        #[serde(rename = "lastSeen")]
        last_seen: u64,
    },
    #[serde(rename = "error")]
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
}

impl ServerMessage {
    /// The `error` frame sent for malformed JSON or schema violations.
    pub fn invalid_payload(details: Option<Value>) -> ServerMessage {
        ServerMessage::Error {
            code: ERROR_INVALID_PAYLOAD.to_string(),
            message: INVALID_PAYLOAD_MESSAGE.to_string(),
            details,
        }
    }
}
