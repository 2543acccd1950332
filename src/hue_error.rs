/*!
 # Bridge error codes

 The bridge reports failures as `{"error": {"type": N, "address": ..., "description": ...}}`
 elements inside its response array. This module classifies the numeric code and renders
 a readable message from a fixed template table, filling `<placeholder>` markers from the
 keys the failing call was made with.
*/

use serde::Deserialize;
use serde_json::Value;
use std::fmt;

/// Known bridge error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeErrorKind {
    /// 1
    UnauthorizedUser,
    /// 2
    InvalidJson,
    /// 3
    ResourceNotAvailable,
    /// 4
    MethodNotAvailable,
    /// 5
    MissingParameters,
    /// 6
    ParameterNotAvailable,
    /// 7
    InvalidValue,
    /// 8
    ParameterNotModifiable,
    /// 101
    LinkButtonNotPressed,
    /// 201
    DeviceIsOff,
    /// 301
    GroupTableFull,
    /// 302
    DeviceGroupTableFull,
    /// 901
    InternalError,
    /// A code missing from the table
    Unknown(u16),
}

impl BridgeErrorKind {
    /// Classify a numeric bridge error code
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => Self::UnauthorizedUser,
            2 => Self::InvalidJson,
            3 => Self::ResourceNotAvailable,
            4 => Self::MethodNotAvailable,
            5 => Self::MissingParameters,
            6 => Self::ParameterNotAvailable,
            7 => Self::InvalidValue,
            8 => Self::ParameterNotModifiable,
            101 => Self::LinkButtonNotPressed,
            201 => Self::DeviceIsOff,
            301 => Self::GroupTableFull,
            302 => Self::DeviceGroupTableFull,
            901 => Self::InternalError,
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Self::UnauthorizedUser => 1,
            Self::InvalidJson => 2,
            Self::ResourceNotAvailable => 3,
            Self::MethodNotAvailable => 4,
            Self::MissingParameters => 5,
            Self::ParameterNotAvailable => 6,
            Self::InvalidValue => 7,
            Self::ParameterNotModifiable => 8,
            Self::LinkButtonNotPressed => 101,
            Self::DeviceIsOff => 201,
            Self::GroupTableFull => 301,
            Self::DeviceGroupTableFull => 302,
            Self::InternalError => 901,
            Self::Unknown(code) => *code,
        }
    }

    /// Message template with `<placeholder>` markers, `None` for unknown codes
    pub fn template(&self) -> Option<&'static str> {
        let template = match self {
            Self::UnauthorizedUser => "Unauthorized user",
            Self::InvalidJson => "Body contains invalid JSON",
            Self::ResourceNotAvailable => "Resource, <resource>, not available",
            Self::MethodNotAvailable => {
                "Method, <method_name>, not available for resource, <resource>"
            }
            Self::MissingParameters => "Missing parameters in body",
            Self::ParameterNotAvailable => "Parameter, <parameter>, not available",
            Self::InvalidValue => "Invalid value, <value>, for parameter, <parameter>",
            Self::ParameterNotModifiable => "Parameter, <parameter>, is not modifiable",
            Self::LinkButtonNotPressed => "Link button not pressed",
            Self::DeviceIsOff => {
                "Parameter, <parameter>, is not modifiable. Device is set to off."
            }
            Self::GroupTableFull => "Group could not be created. Group table is full.",
            Self::DeviceGroupTableFull => {
                "Device, <id>, could not be added to group. Device's group table is full."
            }
            Self::InternalError => "Internal error, <error code>",
            Self::Unknown(_) => return None,
        };
        Some(template)
    }

    /// Render the template, substituting every `<key>` found in `keys`
    pub fn render(&self, keys: &[(&str, &str)]) -> Option<String> {
        self.template().map(|template| fill_placeholders(template, keys))
    }
}

/// Replace every `<key>` marker in `template` with its value
pub fn fill_placeholders(template: &str, keys: &[(&str, &str)]) -> String {
    keys.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("<{key}>"), value)
    })
}

/// Raw error element as the bridge sends it
#[derive(Debug, Clone, Deserialize)]
pub struct RawBridgeError {
    #[serde(rename = "type")]
    pub code: u16,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub description: String,
}

impl RawBridgeError {
    /// Decodes an error element, keeping whatever text it has when its shape is off.
    ///
    /// An element without a usable numeric `type` gets code 0, which is not in the table.
    pub fn from_element(element: &Value) -> Self {
        if let Ok(raw) = serde_json::from_value::<Self>(element.clone()) {
            return raw;
        }
        let code = element
            .get("type")
            .and_then(|code| match code {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .and_then(|code| u16::try_from(code).ok())
            .unwrap_or(0);
        let text = |key: &str| element.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            code,
            address: text("address").unwrap_or_default(),
            description: text("description").unwrap_or_else(|| element.to_string()),
        }
    }
}

/// A classified bridge failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeError {
    pub kind: BridgeErrorKind,
    /// Resource path the bridge blamed
    pub address: String,
    /// Description as the bridge worded it
    pub description: String,
    /// Message rendered from the template table
    pub message: String,
}

impl BridgeError {
    pub fn from_raw(raw: RawBridgeError, keys: &[(&str, &str)]) -> Self {
        let kind = BridgeErrorKind::from_code(raw.code);
        // The address is the natural fill for <resource> when the call did not name one
        let mut fill: Vec<(&str, &str)> = keys.to_vec();
        if !keys.iter().any(|(key, _)| *key == "resource") {
            fill.push(("resource", raw.address.as_str()));
        }
        let message = kind
            .render(&fill)
            .unwrap_or_else(|| raw.description.clone());
        Self {
            kind,
            address: raw.address,
            description: raw.description,
            message,
        }
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.kind.code())
    }
}

impl std::error::Error for BridgeError {}
