use crate::errors::{ProtocolError, SerializedError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};

/// The fixed command surface. Wire names are the variant names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    CreateKey,
    GetAppKeyMetadata,
    GetKeyIDs,
    GetPublicKeyData,
    GetPrivateKey,
    HasSetAppPassword,
    RemoveKey,
    RenameKey,
    SetUpAppPassword,
    SignTransaction,
    UpdateAppPassword,
    /// Legacy re-encryption path, refused for migrated keys.
    UpdateKeyPassword,
    UpdateKeyTxAuth,
}

impl MessageType {
    pub const ALL: [Self; 13] = [
        Self::CreateKey,
        Self::GetAppKeyMetadata,
        Self::GetKeyIDs,
        Self::GetPublicKeyData,
        Self::GetPrivateKey,
        Self::HasSetAppPassword,
        Self::RemoveKey,
        Self::RenameKey,
        Self::SetUpAppPassword,
        Self::SignTransaction,
        Self::UpdateAppPassword,
        Self::UpdateKeyPassword,
        Self::UpdateKeyTxAuth,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateKey => "CreateKey",
            Self::GetAppKeyMetadata => "GetAppKeyMetadata",
            Self::GetKeyIDs => "GetKeyIDs",
            Self::GetPublicKeyData => "GetPublicKeyData",
            Self::GetPrivateKey => "GetPrivateKey",
            Self::HasSetAppPassword => "HasSetAppPassword",
            Self::RemoveKey => "RemoveKey",
            Self::RenameKey => "RenameKey",
            Self::SetUpAppPassword => "SetUpAppPassword",
            Self::SignTransaction => "SignTransaction",
            Self::UpdateAppPassword => "UpdateAppPassword",
            Self::UpdateKeyPassword => "UpdateKeyPassword",
            Self::UpdateKeyTxAuth => "UpdateKeyTxAuth",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ProtocolError::MissingHandler(s.to_owned()))
    }
}

/// Request: `{messageType, callID, args}`.
///
/// `messageType` stays a plain string on the wire so an unknown type reaches dispatch and
/// fails there as a missing handler instead of as an unreadable frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    #[serde(rename = "messageType")]
    pub message_type: String,
    #[serde(rename = "callID")]
    pub call_id: u64,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Response: `{messageType, callID, result}` or `{messageType, callID, error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    #[serde(rename = "messageType")]
    pub message_type: String,
    #[serde(rename = "callID")]
    pub call_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
}

impl ResultEnvelope {
    pub fn ok(message_type: String, call_id: u64, result: Value) -> Self {
        Self {
            message_type,
            call_id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(message_type: String, call_id: u64, error: SerializedError) -> Self {
        Self {
            message_type,
            call_id,
            result: None,
            error: Some(error),
        }
    }

    /// A `null` result deserializes as a missing one; both mean `Value::Null`.
    pub fn into_outcome(self) -> eyre::Result<Value> {
        match self.error {
            Some(e) => Err(e.into_report()),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}
