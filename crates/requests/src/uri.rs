//! Content URIs: `TYPE@key[/doc[/meta...]]`.
//!
//! Only the textual shape is handled here. Key bytes and their cryptography
//! belong to the encoder.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::OperationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// Content hash key.
    Chk,
    /// Signed subspace key.
    Ssk,
    /// Keyword signed key.
    Ksk,
    /// Updatable subspace key.
    Usk,
}

impl KeyType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chk => "CHK",
            Self::Ssk => "SSK",
            Self::Ksk => "KSK",
            Self::Usk => "USK",
        }
    }
}

/// Target or result URI of an insert.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetUri {
    key_type: KeyType,
    key: String,
    meta: Vec<String>,
}

impl TargetUri {
    pub fn parse(s: &str) -> Result<Self, OperationError> {
        let invalid = |why: &str| OperationError::InvalidTarget(format!("{why}: {s:?}"));

        let (ty, rest) = s.split_once('@').ok_or_else(|| invalid("missing '@'"))?;
        let key_type = match ty.to_ascii_uppercase().as_str() {
            "CHK" => KeyType::Chk,
            "SSK" => KeyType::Ssk,
            "KSK" => KeyType::Ksk,
            "USK" => KeyType::Usk,
            _ => return Err(invalid("unknown key type")),
        };
        let mut parts = rest.split('/');
        let key = parts.next().unwrap_or_default().to_string();
        let meta: Vec<String> = parts.map(str::to_string).collect();
        if meta.iter().any(String::is_empty) {
            return Err(invalid("empty path component"));
        }
        Ok(Self {
            key_type,
            key,
            meta,
        })
    }

    /// A fresh content-hash insert target, `CHK@`.
    pub fn chk() -> Self {
        Self {
            key_type: KeyType::Chk,
            key: String::new(),
            meta: Vec::new(),
        }
    }

    /// Checks the URI can be used as an insert target.
    pub fn check_insert_uri(&self) -> Result<(), OperationError> {
        let invalid = |why: &str| OperationError::InvalidTarget(format!("{why}: {self}"));
        match self.key_type {
            KeyType::Chk if !self.key.is_empty() || !self.meta.is_empty() => {
                Err(invalid("CHK insert target cannot carry a key or path"))
            }
            KeyType::Ksk if self.key.is_empty() => Err(invalid("KSK needs a keyword")),
            KeyType::Ssk | KeyType::Usk if self.key.is_empty() || self.meta.is_empty() => {
                Err(invalid("SSK/USK insert needs a key and a document name"))
            }
            _ => Ok(()),
        }
    }

    /// Appends a path component, e.g. a target filename.
    pub fn push_meta_string(mut self, name: impl Into<String>) -> Self {
        self.meta.push(name.into());
        self
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn meta_strings(&self) -> &[String] {
        &self.meta
    }
}

impl fmt::Display for TargetUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key_type.as_str(), self.key)?;
        for m in &self.meta {
            write!(f, "/{m}")?;
        }
        Ok(())
    }
}

impl FromStr for TargetUri {
    type Err = OperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TargetUri {
    type Error = OperationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<TargetUri> for String {
    fn from(uri: TargetUri) -> Self {
        uri.to_string()
    }
}
