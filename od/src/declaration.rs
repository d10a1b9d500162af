//! Declaration envelope handling
//!
//! A request body is either a bare `Device` declaration or a `DO` envelope
//! wrapping one together with target connection metadata. Everything here is
//! structural; the declaration itself stays opaque apart from the user and
//! license objects account setup and revocation need.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::device::ConnectionInfo;
use crate::error::{OnboardError, OnboardResult};

/// Message recorded for any malformed or invalid request body
pub const BAD_DECLARATION: &str = "bad declaration";

/// Explanation attached to unparsable bodies
pub const BODY_FORMAT: &str = "body must be a JSON object: either a declaration with class \"Device\" \
     or an envelope with class \"DO\" and a \"declaration\" property";

/// Envelope class
pub const ENVELOPE_CLASS: &str = "DO";

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 443;

/// Parse a request body into a JSON object
pub fn parse_body(body: &[u8]) -> OnboardResult<Value> {
    debug!(len = body.len(), "parse_body: called");
    let value: Value = serde_json::from_slice(body).map_err(|e| OnboardError::BadDeclaration(e.to_string()))?;
    if !value.is_object() {
        return Err(OnboardError::BadDeclaration("body is not an object".to_string()));
    }
    Ok(value)
}

/// Wrap a bare declaration into an envelope; envelopes pass through unchanged
pub fn wrap(body: Value) -> Value {
    if body.get("class").and_then(Value::as_str) == Some(ENVELOPE_CLASS) {
        return body;
    }
    debug!("wrap: wrapping bare declaration");
    json!({ "class": ENVELOPE_CLASS, "declaration": body })
}

/// Key file reference used for shell access
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SshKey {
    pub path: String,
}

/// `DO` envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default)]
    pub class: String,

    #[serde(default)]
    pub declaration: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_host: Option<String>,

    /// Number or pointer string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_passphrase: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ssh_key: Option<SshKey>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_tokens: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,

    #[serde(default, rename = "async")]
    pub is_async: bool,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// Parse an envelope out of a wrapped body
    pub fn from_value(value: Value) -> OnboardResult<Self> {
        serde_json::from_value(value).map_err(|e| OnboardError::BadDeclaration(e.to_string()))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Replace pointer-valued target fields with the values they reference
    pub fn resolve_pointers(&mut self) {
        debug!("Envelope::resolve_pointers: called");
        let declaration = &self.declaration;
        let resolve = |field: &mut Option<String>| {
            if let Some(value) = field.as_mut() {
                *value = resolve_pointer(declaration, value);
            }
        };
        resolve(&mut self.target_host);
        resolve(&mut self.target_username);
        resolve(&mut self.target_passphrase);
        let port = match &self.target_port {
            Some(Value::String(port)) => Some(resolve_pointer(declaration, port)),
            _ => None,
        };
        if let Some(port) = port {
            self.target_port = Some(Value::String(port));
        }
    }

    /// Connection details for the target device
    pub fn connection_info(&self) -> ConnectionInfo {
        let port = match &self.target_port {
            Some(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        };
        ConnectionInfo {
            host: self.target_host.clone().unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: port.unwrap_or(DEFAULT_PORT),
            username: self.target_username.clone(),
            password: self.target_passphrase.clone(),
            ssh_key_path: self.target_ssh_key.as_ref().map(|k| k.path.clone()),
            tokens: self.target_tokens.clone(),
        }
    }
}

/// Resolve a `/`-prefixed JSON pointer against the declaration
///
/// Anything that is not a pointer, or a pointer that does not lead to a
/// scalar, is returned as the literal string.
pub fn resolve_pointer(declaration: &Value, candidate: &str) -> String {
    if !candidate.starts_with('/') {
        return candidate.to_string();
    }
    match declaration.pointer(candidate) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => {
            debug!(pointer = %candidate, "resolve_pointer: unresolved, using literal");
            candidate.to_string()
        }
    }
}

fn is_user(value: &Value) -> bool {
    value.get("class").and_then(Value::as_str) == Some("User")
}

/// The `User` object declared for `username`
///
/// Users live under the `Common` tenant; older declarations put them at the
/// top level.
pub fn find_user<'a>(declaration: &'a Value, username: &str) -> Option<&'a Value> {
    if let Some(user) = declaration.get("Common").and_then(|c| c.get(username))
        && is_user(user)
    {
        return Some(user);
    }
    declaration.get(username).filter(|u| is_user(u))
}

pub fn find_user_mut<'a>(declaration: &'a mut Value, username: &str) -> Option<&'a mut Value> {
    let in_common = declaration
        .get("Common")
        .and_then(|c| c.get(username))
        .is_some_and(is_user);
    if in_common {
        return declaration.get_mut("Common").and_then(|c| c.get_mut(username));
    }
    declaration.get_mut(username).filter(|u| is_user(u))
}

/// Declared password for `username`, with pointer resolution
pub fn declared_password(declaration: &Value, username: &str) -> Option<String> {
    let password = find_user(declaration, username)?.get("password")?.as_str()?;
    Some(resolve_pointer(declaration, password))
}

fn license_objects_mut(declaration: &mut Value) -> Vec<&mut Map<String, Value>> {
    let mut found = Vec::new();
    let Value::Object(root) = declaration else {
        return found;
    };
    for (key, value) in root.iter_mut() {
        let Value::Object(object) = value else { continue };
        if key == "Common" {
            for inner in object.values_mut() {
                if let Value::Object(candidate) = inner
                    && candidate.get("class").and_then(Value::as_str) == Some("License")
                {
                    found.push(candidate);
                }
            }
        } else if object.get("class").and_then(Value::as_str) == Some("License") {
            found.push(object);
        }
    }
    found
}

/// Which stashed credentials the license objects need back
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LicenseNeeds {
    /// License manager password, needed when a manager host is named
    pub primary: bool,
    /// Device password the license manager uses to reach back
    pub secondary: bool,
}

/// Remove consumed revoke instructions and report credential needs
pub fn strip_revoke(declaration: &mut Value) -> LicenseNeeds {
    let mut needs = LicenseNeeds::default();
    for license in license_objects_mut(declaration) {
        if license.remove("revokeFrom").is_some() {
            debug!("strip_revoke: removed revokeFrom");
        }
        if license.contains_key("bigIqHost") && !license.contains_key("bigIqPassword") {
            needs.primary = true;
        }
        if license.get("reachable").and_then(Value::as_bool) == Some(true) && !license.contains_key("bigIpPassword") {
            needs.secondary = true;
        }
    }
    needs
}

/// Put recovered credentials back into the license objects that need them
pub fn inject_license_credentials(declaration: &mut Value, primary: Option<&str>, secondary: Option<&str>) {
    for license in license_objects_mut(declaration) {
        if let Some(primary) = primary
            && license.contains_key("bigIqHost")
            && !license.contains_key("bigIqPassword")
        {
            license.insert("bigIqPassword".to_string(), Value::String(primary.to_string()));
        }
        if let Some(secondary) = secondary
            && license.get("reachable").and_then(Value::as_bool) == Some(true)
            && !license.contains_key("bigIpPassword")
        {
            license.insert("bigIpPassword".to_string(), Value::String(secondary.to_string()));
        }
    }
}
