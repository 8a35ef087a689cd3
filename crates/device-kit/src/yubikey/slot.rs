//! PIV key slots.
//!
//! | Slot | ID   | Object ID  | PIN |
//! |------|------|------------|-----|
//! | 9a   | 0x9A | `5FC105`   | yes |
//! | 9c   | 0x9C | `5FC10A`   | yes |
//! | 9d   | 0x9D | `5FC10B`   | yes |
//! | 9e   | 0x9E | `5FC101`   | no  |

use core::fmt;

use serde::{Deserialize, Serialize};

/// A PIV slot holding a P-256 key pair and its certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Slot {
    /// PIV Authentication (`9a`).
    #[serde(rename = "9a")]
    Authentication = 0x9A,

    /// Digital Signature (`9c`).
    #[serde(rename = "9c")]
    Signature = 0x9C,

    /// Key Management (`9d`).
    #[serde(rename = "9d")]
    KeyManagement = 0x9D,

    /// Card Authentication (`9e`), usable without a PIN.
    #[serde(rename = "9e")]
    CardAuthentication = 0x9E,
}

impl Slot {
    /// Slots in account-index order.
    pub const ALL: [Self; 4] = [
        Self::Authentication,
        Self::Signature,
        Self::KeyManagement,
        Self::CardAuthentication,
    ];

    /// Returns the key reference used in `GENERAL AUTHENTICATE`.
    ///
    /// ```
    /// use yubikey_device_kit::yubikey::Slot;
    ///
    /// assert_eq!(Slot::Authentication.id(), 0x9A);
    /// ```
    #[must_use]
    pub const fn id(self) -> u8 {
        self as u8
    }

    /// Returns the data object holding the slot certificate.
    #[must_use]
    pub const fn object_id(self) -> [u8; 3] {
        match self {
            Self::Authentication => [0x5F, 0xC1, 0x05],
            Self::Signature => [0x5F, 0xC1, 0x0A],
            Self::KeyManagement => [0x5F, 0xC1, 0x0B],
            Self::CardAuthentication => [0x5F, 0xC1, 0x01],
        }
    }

    /// Whether signing with this slot needs a verified PIN.
    #[must_use]
    pub const fn requires_pin(self) -> bool {
        !matches!(self, Self::CardAuthentication)
    }

    /// Maps an account index (the last derivation path component) to a slot.
    ///
    /// ```
    /// use yubikey_device_kit::yubikey::Slot;
    ///
    /// assert_eq!(Slot::from_account_index(0), Some(Slot::Authentication));
    /// assert_eq!(Slot::from_account_index(4), None);
    /// ```
    #[must_use]
    pub const fn from_account_index(index: u32) -> Option<Self> {
        if index < Self::ALL.len() as u32 {
            Some(Self::ALL[index as usize])
        } else {
            None
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.id())
    }
}
