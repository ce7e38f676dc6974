use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

pub use vpc_error::ErrorKind;

/// Global request ID counter for correlation
static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Maximum message size for IPC (8KB)
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024;

/// Maximum property name length accepted on the wire
const MAX_PROPERTY_NAME_LENGTH: usize = 32;

/// Generate a unique request ID for correlation
pub fn generate_request_id() -> u64 {
    REQUEST_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Unique request ID for correlation and debugging
    pub id: u64,
    /// The actual request
    #[serde(flatten)]
    pub request: Request,
}

impl RequestEnvelope {
    pub fn new(request: Request) -> Self {
        Self {
            id: generate_request_id(),
            request,
        }
    }

    pub fn with_id(request: Request, id: u64) -> Self {
        Self { id, request }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "data")]
pub enum Request {
    Ping,
    Version,
    /// Last published driver snapshot (no hardware access)
    Status,
    /// Route a named property through the driver
    SetProperty {
        name: String,
        #[serde(default)]
        value: PropertyValue,
    },
    /// System sleep/resume notification
    Power { event: PowerEvent },
}

/// Value attached to a property request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// No value: flip (clamshell), refresh, or a command property
    #[default]
    None,
    Bool(bool),
    Int(u32),
    /// Raw EC access parameters for ReadEC / WriteEC
    Register(EcRegister),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcRegister {
    pub offset: u8,
    #[serde(default)]
    pub width: EcWidth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<u16>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EcWidth {
    #[default]
    Byte,
    /// Two consecutive bytes, little-endian
    Word,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerEvent {
    Sleep,
    Resume,
}

impl Request {
    /// Validate request parameters before sending to daemon
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Request::Ping | Request::Version | Request::Status | Request::Power { .. } => Ok(()),

            Request::SetProperty { name, value } => {
                validate_property_name(name)?;
                if let PropertyValue::Register(access) = value {
                    validate_ec_register(access, access.value.is_some())?;
                }
                Ok(())
            }
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Ping => "Ping",
            Request::Version => "Version",
            Request::Status => "Status",
            Request::SetProperty { .. } => "SetProperty",
            Request::Power { .. } => "Power",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Request ID this response corresponds to
    pub id: u64,
    /// The actual response
    #[serde(flatten)]
    pub response: Response,
}

impl ResponseEnvelope {
    pub fn new(id: u64, response: Response) -> Self {
        Self { id, response }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Response {
    #[serde(rename = "ok")]
    Ok(ResponseData),
    #[serde(rename = "error")]
    Error { kind: ErrorKind, message: String },
}

/// Response data - each request fills exactly one of these
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SetOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DriverStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resync: Option<Vec<ResyncEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Vec<ConfigEntry>>,
}

impl ResponseData {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn string(v: String) -> Self {
        Self { value: Some(v), ..Self::default() }
    }

    pub fn outcome(o: SetOutcome) -> Self {
        Self { outcome: Some(o), ..Self::default() }
    }

    pub fn status(s: DriverStatus) -> Self {
        Self { status: Some(s), ..Self::default() }
    }

    pub fn resync(r: Vec<ResyncEntry>) -> Self {
        Self { resync: Some(r), ..Self::default() }
    }

    pub fn config(c: Vec<ConfigEntry>, s: DriverStatus) -> Self {
        Self { config: Some(c), status: Some(s), ..Self::default() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// Hardware was written
    Changed,
    /// Hardware already held the requested value, nothing was written
    AlreadySet,
    /// A read-only property or raw EC read returned a value
    Value,
    /// A command property completed
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetOutcome {
    pub result: OutcomeKind,
    pub property: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverStatus {
    pub platform: String,
    pub power: String,
    pub registration: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregator_instance: Option<u64>,
    pub toggles: Vec<ToggleInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleInfo {
    pub property: String,
    /// unknown, valid or invalid
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<u32>,
    #[serde(default)]
    pub missing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncEntry {
    pub property: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok(ResponseData::none())
    }

    pub fn ok_string(s: impl Into<String>) -> Self {
        Response::Ok(ResponseData::string(s.into()))
    }

    pub fn error(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Response::Error { kind, message: msg.into() }
    }
}

impl From<&vpc_error::VpcError> for Response {
    fn from(err: &vpc_error::VpcError) -> Self {
        Response::error(err.kind(), err.to_string())
    }
}

pub fn validate_property_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Property name cannot be empty".into());
    }
    if name.len() > MAX_PROPERTY_NAME_LENGTH {
        return Err(format!(
            "Property name too long: {} > {} chars",
            name.len(),
            MAX_PROPERTY_NAME_LENGTH
        ));
    }
    if let Some(c) = name.chars().find(|c| !c.is_ascii_alphanumeric()) {
        return Err(format!("Property name contains invalid character: {:?}", c));
    }
    Ok(())
}

/// Check offset, width and value of a raw EC access.
///
/// Writes need a value that fits the width; a word access needs room for the
/// second byte inside the 256-byte EC space.
pub fn validate_ec_register(access: &EcRegister, write: bool) -> Result<(), String> {
    if access.width == EcWidth::Word && access.offset == u8::MAX {
        return Err("Word access at 0xFF is out of range".into());
    }
    match (write, access.value) {
        (true, None) => Err("EC write requires a value".into()),
        (true, Some(v)) if access.width == EcWidth::Byte && v > u8::MAX as u16 => {
            Err(format!("Value 0x{:x} out of range for a byte write", v))
        }
        (false, Some(_)) => Err("EC read does not take a value".into()),
        _ => Ok(()),
    }
}
