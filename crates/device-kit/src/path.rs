//! BIP-32 style derivation paths.
//!
//! PIV keys are not hierarchical, so a path only selects one of the four
//! PIV slots: the full path is validated as `44'/60'/...`-style text and its
//! last component is used as the account index (see
//! [`Slot::from_account_index`]).
//!
//! ```
//! use yubikey_device_kit::DerivationPath;
//! use yubikey_device_kit::yubikey::Slot;
//!
//! let path: DerivationPath = "44'/60'/0'/0".parse().unwrap();
//! assert_eq!(path.slot().unwrap(), Slot::Authentication);
//! ```

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::yubikey::Slot;

/// Hardened derivation flag.
const HARDENED: u32 = 0x8000_0000;

/// BIP-32 allows deeper paths, wallets never go past this.
const MAX_DEPTH: usize = 10;

/// One path component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChildNumber(u32);

impl ChildNumber {
    /// Returns the index without the hardened flag.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0 & !HARDENED
    }

    /// Whether the component is hardened (`'` or `h`).
    #[must_use]
    pub const fn is_hardened(self) -> bool {
        self.0 & HARDENED != 0
    }
}

impl fmt::Display for ChildNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())?;
        if self.is_hardened() {
            f.write_str("'")?;
        }
        Ok(())
    }
}

/// A parsed derivation path such as `44'/60'/0'/0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DerivationPath(Vec<ChildNumber>);

impl DerivationPath {
    /// Returns the path components.
    #[must_use]
    pub fn components(&self) -> &[ChildNumber] {
        &self.0
    }

    /// Resolves the PIV slot addressed by this path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDerivationPath`] when the last component is
    /// hardened or is not an account index with a slot.
    pub fn slot(&self) -> Result<Slot> {
        let last = self
            .0
            .last()
            .ok_or_else(|| Error::InvalidDerivationPath("empty path".to_string()))?;

        if last.is_hardened() {
            return Err(Error::InvalidDerivationPath(format!(
                "account index {last} must not be hardened"
            )));
        }

        Slot::from_account_index(last.index()).ok_or_else(|| {
            Error::InvalidDerivationPath(format!(
                "account index {} has no PIV slot (expected 0-{})",
                last.index(),
                Slot::ALL.len() - 1
            ))
        })
    }
}

impl FromStr for DerivationPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let body = trimmed
            .strip_prefix("m/")
            .or_else(|| trimmed.strip_prefix("M/"))
            .unwrap_or(trimmed);

        if body.is_empty() {
            return Err(Error::InvalidDerivationPath("empty path".to_string()));
        }

        let components = body
            .split('/')
            .map(parse_component)
            .collect::<Result<Vec<_>>>()?;

        if components.len() > MAX_DEPTH {
            return Err(Error::InvalidDerivationPath(format!(
                "{} components exceed the maximum depth of {MAX_DEPTH}",
                components.len()
            )));
        }

        Ok(Self(components))
    }
}

fn parse_component(raw: &str) -> Result<ChildNumber> {
    let (digits, hardened) = match raw.strip_suffix(['\'', 'h', 'H']) {
        Some(digits) => (digits, true),
        None => (raw, false),
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidDerivationPath(format!(
            "component {raw:?} is not a number"
        )));
    }

    let index: u32 = digits.parse().map_err(|_| {
        Error::InvalidDerivationPath(format!("component {raw:?} is out of range"))
    })?;

    if index >= HARDENED {
        return Err(Error::InvalidDerivationPath(format!(
            "component {raw:?} is out of range"
        )));
    }

    Ok(ChildNumber(if hardened { index | HARDENED } else { index }))
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, child) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{child}")?;
        }
        Ok(())
    }
}

impl Serialize for DerivationPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DerivationPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
