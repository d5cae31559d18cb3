//! Typed request/response pairs for every message type.
//!
//! Each command is a struct whose fields are the positional `args` of its envelope, in
//! order. Handlers and callers only ever see these structs; the positional JSON form
//! exists only on the wire.

use super::envelope::MessageType;
use crate::{
    errors::VaultError,
    keystore::app_key::AppKeyData,
    policy::{AuthPolicy, TxAuthPolicy},
    vault::{KeyCreationOptions, KeyPublicData},
};
use secrecy::{ExposeSecret as _, SecretString};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

pub trait Command: Sized + Send + 'static {
    const TYPE: MessageType;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    fn into_args(self) -> Vec<Value>;
    fn from_args(args: Vec<Value>) -> eyre::Result<Self>;
}

/// Positional argument reader. Every failure is an `InvalidArgumentsError`.
struct Args {
    command: MessageType,
    inner: std::vec::IntoIter<Value>,
}

impl Args {
    fn new(command: MessageType, args: Vec<Value>) -> Self {
        Self {
            command,
            inner: args.into_iter(),
        }
    }

    fn invalid(&self, msg: impl std::fmt::Display) -> eyre::Report {
        VaultError::InvalidArguments(format!("{}: {msg}", self.command)).into()
    }

    fn required<T: DeserializeOwned>(&mut self, name: &str) -> eyre::Result<T> {
        let Some(v) = self.inner.next() else {
            return Err(self.invalid(format_args!("missing argument {name}")));
        };
        serde_json::from_value(v).map_err(|e| self.invalid(format_args!("argument {name}: {e}")))
    }

    /// Absent trailing arguments and explicit `null` both read as `None`.
    fn optional<T: DeserializeOwned>(&mut self, name: &str) -> eyre::Result<Option<T>> {
        match self.inner.next() {
            None | Some(Value::Null) => Ok(None),
            Some(v) => serde_json::from_value(v)
                .map(Some)
                .map_err(|e| self.invalid(format_args!("argument {name}: {e}"))),
        }
    }

    fn secret(&mut self, name: &str) -> eyre::Result<SecretString> {
        let s: String = self.required(name)?;
        Ok(SecretString::new(s.into()))
    }

    fn password(&mut self, name: &str) -> eyre::Result<Option<SecretString>> {
        let s: Option<String> = self.optional(name)?;
        Ok(s.map(|s| SecretString::new(s.into())))
    }

    fn finish(mut self) -> eyre::Result<()> {
        let extra = self.inner.by_ref().count();
        if extra > 0 {
            return Err(self.invalid(format_args!("{extra} unexpected extra argument(s)")));
        }
        Ok(())
    }
}

fn secret_arg(s: &SecretString) -> Value {
    Value::String(s.expose_secret().to_owned())
}

fn password_arg(p: Option<&SecretString>) -> Value {
    p.map_or(Value::Null, secret_arg)
}

fn json_arg<T: Serialize>(v: &T) -> Value {
    // Plain data types only; serialization cannot fail for them.
    serde_json::to_value(v).unwrap_or(Value::Null)
}

#[derive(Debug, Clone)]
pub struct CreateKey {
    pub key_id: String,
    pub password: Option<SecretString>,
    pub private_key: SecretString,
    pub options: KeyCreationOptions,
}

impl Command for CreateKey {
    const TYPE: MessageType = MessageType::CreateKey;
    type Output = KeyPublicData;

    fn into_args(self) -> Vec<Value> {
        vec![
            Value::String(self.key_id),
            password_arg(self.password.as_ref()),
            secret_arg(&self.private_key),
            json_arg(&self.options),
        ]
    }

    fn from_args(args: Vec<Value>) -> eyre::Result<Self> {
        let mut a = Args::new(Self::TYPE, args);
        let out = Self {
            key_id: a.required("keyID")?,
            password: a.password("password")?,
            private_key: a.secret("privateKey")?,
            options: a.optional("options")?.unwrap_or_default(),
        };
        a.finish()?;
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GetAppKeyMetadata;

impl Command for GetAppKeyMetadata {
    const TYPE: MessageType = MessageType::GetAppKeyMetadata;
    type Output = Option<AppKeyData>;

    fn into_args(self) -> Vec<Value> {
        Vec::new()
    }

    fn from_args(args: Vec<Value>) -> eyre::Result<Self> {
        Args::new(Self::TYPE, args).finish()?;
        Ok(Self)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GetKeyIDs;

impl Command for GetKeyIDs {
    const TYPE: MessageType = MessageType::GetKeyIDs;
    type Output = Vec<String>;

    fn into_args(self) -> Vec<Value> {
        Vec::new()
    }

    fn from_args(args: Vec<Value>) -> eyre::Result<Self> {
        Args::new(Self::TYPE, args).finish()?;
        Ok(Self)
    }
}

#[derive(Debug, Clone)]
pub struct GetPublicKeyData {
    pub key_id: String,
}

impl Command for GetPublicKeyData {
    const TYPE: MessageType = MessageType::GetPublicKeyData;
    type Output = KeyPublicData;

    fn into_args(self) -> Vec<Value> {
        vec![Value::String(self.key_id)]
    }

    fn from_args(args: Vec<Value>) -> eyre::Result<Self> {
        let mut a = Args::new(Self::TYPE, args);
        let out = Self {
            key_id: a.required("keyID")?,
        };
        a.finish()?;
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct GetPrivateKey {
    pub key_id: String,
    pub password: Option<SecretString>,
}

impl Command for GetPrivateKey {
    const TYPE: MessageType = MessageType::GetPrivateKey;
    type Output = String;

    fn into_args(self) -> Vec<Value> {
        vec![
            Value::String(self.key_id),
            password_arg(self.password.as_ref()),
        ]
    }

    fn from_args(args: Vec<Value>) -> eyre::Result<Self> {
        let mut a = Args::new(Self::TYPE, args);
        let out = Self {
            key_id: a.required("keyID")?,
            password: a.password("password")?,
        };
        a.finish()?;
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HasSetAppPassword;

impl Command for HasSetAppPassword {
    const TYPE: MessageType = MessageType::HasSetAppPassword;
    type Output = bool;

    fn into_args(self) -> Vec<Value> {
        Vec::new()
    }

    fn from_args(args: Vec<Value>) -> eyre::Result<Self> {
        Args::new(Self::TYPE, args).finish()?;
        Ok(Self)
    }
}

#[derive(Debug, Clone)]
pub struct RemoveKey {
    pub key_id: String,
}

impl Command for RemoveKey {
    const TYPE: MessageType = MessageType::RemoveKey;
    type Output = ();

    fn into_args(self) -> Vec<Value> {
        vec![Value::String(self.key_id)]
    }

    fn from_args(args: Vec<Value>) -> eyre::Result<Self> {
        let mut a = Args::new(Self::TYPE, args);
        let out = Self {
            key_id: a.required("keyID")?,
        };
        a.finish()?;
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct RenameKey {
    pub key_id: String,
    pub new_name: String,
}

impl Command for RenameKey {
    const TYPE: MessageType = MessageType::RenameKey;
    type Output = ();

    fn into_args(self) -> Vec<Value> {
        vec![Value::String(self.key_id), Value::String(self.new_name)]
    }

    fn from_args(args: Vec<Value>) -> eyre::Result<Self> {
        let mut a = Args::new(Self::TYPE, args);
        let out = Self {
            key_id: a.required("keyID")?,
            new_name: a.required("newName")?,
        };
        a.finish()?;
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct SetUpAppPassword {
    pub password: SecretString,
    /// Empty means "generate one".
    pub private_key: SecretString,
    pub auth_policy: AuthPolicy,
}

impl Command for SetUpAppPassword {
    const TYPE: MessageType = MessageType::SetUpAppPassword;
    type Output = AppKeyData;

    fn into_args(self) -> Vec<Value> {
        vec![
            secret_arg(&self.password),
            secret_arg(&self.private_key),
            json_arg(&self.auth_policy),
        ]
    }

    fn from_args(args: Vec<Value>) -> eyre::Result<Self> {
        let mut a = Args::new(Self::TYPE, args);
        let out = Self {
            password: a.secret("password")?,
            private_key: a.secret("privateKey")?,
            auth_policy: a.required("authPolicy")?,
        };
        a.finish()?;
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct SignTransaction {
    pub key_id: String,
    pub transaction_envelope: String,
    pub password: Option<SecretString>,
}

impl Command for SignTransaction {
    const TYPE: MessageType = MessageType::SignTransaction;
    type Output = String;

    fn into_args(self) -> Vec<Value> {
        vec![
            Value::String(self.key_id),
            Value::String(self.transaction_envelope),
            password_arg(self.password.as_ref()),
        ]
    }

    fn from_args(args: Vec<Value>) -> eyre::Result<Self> {
        let mut a = Args::new(Self::TYPE, args);
        let out = Self {
            key_id: a.required("keyID")?,
            transaction_envelope: a.required("transactionEnvelope")?,
            password: a.password("password")?,
        };
        a.finish()?;
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct UpdateAppPassword {
    pub new_password: SecretString,
    pub prev_password: Option<SecretString>,
    pub auth_policy: AuthPolicy,
}

impl Command for UpdateAppPassword {
    const TYPE: MessageType = MessageType::UpdateAppPassword;
    type Output = ();

    fn into_args(self) -> Vec<Value> {
        vec![
            secret_arg(&self.new_password),
            password_arg(self.prev_password.as_ref()),
            json_arg(&self.auth_policy),
        ]
    }

    fn from_args(args: Vec<Value>) -> eyre::Result<Self> {
        let mut a = Args::new(Self::TYPE, args);
        let out = Self {
            new_password: a.secret("newPassword")?,
            prev_password: a.password("prevPassword")?,
            auth_policy: a.required("authPolicy")?,
        };
        a.finish()?;
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct UpdateKeyPassword {
    pub key_id: String,
    pub prev_password: Option<SecretString>,
    pub password: Option<SecretString>,
}

impl Command for UpdateKeyPassword {
    const TYPE: MessageType = MessageType::UpdateKeyPassword;
    type Output = ();

    fn into_args(self) -> Vec<Value> {
        vec![
            Value::String(self.key_id),
            password_arg(self.prev_password.as_ref()),
            password_arg(self.password.as_ref()),
        ]
    }

    fn from_args(args: Vec<Value>) -> eyre::Result<Self> {
        let mut a = Args::new(Self::TYPE, args);
        let out = Self {
            key_id: a.required("keyID")?,
            prev_password: a.password("prevPassword")?,
            password: a.password("password")?,
        };
        a.finish()?;
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct UpdateKeyTxAuth {
    pub key_id: String,
    pub tx_auth: TxAuthPolicy,
    pub password: Option<SecretString>,
}

impl Command for UpdateKeyTxAuth {
    const TYPE: MessageType = MessageType::UpdateKeyTxAuth;
    type Output = KeyPublicData;

    fn into_args(self) -> Vec<Value> {
        vec![
            Value::String(self.key_id),
            json_arg(&self.tx_auth),
            password_arg(self.password.as_ref()),
        ]
    }

    fn from_args(args: Vec<Value>) -> eyre::Result<Self> {
        let mut a = Args::new(Self::TYPE, args);
        let out = Self {
            key_id: a.required("keyID")?,
            tx_auth: a.required("txAuth")?,
            password: a.password("password")?,
        };
        a.finish()?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::ContextCompat as _;
    use serde_json::json;

    fn invalid(e: &eyre::Report) -> bool {
        matches!(
            e.downcast_ref::<VaultError>(),
            Some(VaultError::InvalidArguments(_))
        )
    }

    #[test]
    fn create_key_args_are_positional() -> eyre::Result<()> {
        let cmd = CreateKey::from_args(vec![
            json!("k1"),
            json!("hunter2"),
            json!("SECRET"),
            json!({ "name": "Main", "testnet": true, "txAuth": "AlwaysPassword" }),
        ])?;
        assert_eq!(cmd.key_id, "k1");
        assert_eq!(
            cmd.password.as_ref().map(|p| p.expose_secret()),
            Some("hunter2")
        );
        assert!(cmd.options.testnet);
        assert_eq!(cmd.options.tx_auth, Some(AuthPolicy::AlwaysPassword));

        let args = cmd.into_args();
        assert_eq!(args.first(), Some(&json!("k1")));
        assert_eq!(args.get(2), Some(&json!("SECRET")));
        Ok(())
    }

    #[test]
    fn trailing_optional_arguments_may_be_omitted() -> eyre::Result<()> {
        let cmd = GetPrivateKey::from_args(vec![json!("k1")])?;
        assert!(cmd.password.is_none());
        let cmd = GetPrivateKey::from_args(vec![json!("k1"), Value::Null])?;
        assert!(cmd.password.is_none());
        Ok(())
    }

    #[test]
    fn bad_arguments_are_invalid_arguments_errors() -> eyre::Result<()> {
        let err = GetPublicKeyData::from_args(vec![])
            .err()
            .context("missing arg must fail")?;
        assert!(invalid(&err));

        let err = UpdateKeyTxAuth::from_args(vec![json!("k1"), json!("Sometimes")])
            .err()
            .context("unknown policy must fail")?;
        assert!(invalid(&err));

        let err = GetKeyIDs::from_args(vec![json!(1)])
            .err()
            .context("extra arg must fail")?;
        assert!(invalid(&err));
        Ok(())
    }

    #[test]
    fn secrets_are_redacted_in_debug_output() -> eyre::Result<()> {
        let cmd = SetUpAppPassword::from_args(vec![
            json!("hunter2"),
            json!("APP-SECRET"),
            json!("Unprotected"),
        ])?;
        let dbg = format!("{cmd:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(!dbg.contains("APP-SECRET"));
        Ok(())
    }
}
