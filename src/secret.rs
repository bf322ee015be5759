use bitcoin::hashes::{sha256, Hash};
use rand::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

const LENGTH: usize = 32;

/// The secret whose revelation settles the Lightning invoice and unlocks the
/// on-chain output.
#[derive(Clone, Copy, PartialEq, PartialOrd, Ord, Eq, Hash)]
pub struct Preimage([u8; LENGTH]);

impl Preimage {
    pub fn random() -> Self {
        let mut bytes = [0u8; LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);

        Preimage(bytes)
    }

    pub fn from_vec(vec: &[u8]) -> Result<Self, InvalidLength> {
        if vec.len() != LENGTH {
            return Err(InvalidLength {
                expected: LENGTH,
                got: vec.len(),
            });
        }
        let mut data = [0; LENGTH];
        data.copy_from_slice(&vec[..LENGTH]);

        Ok(Preimage(data))
    }

    pub fn as_raw(&self) -> &[u8; LENGTH] {
        &self.0
    }
}

impl From<[u8; LENGTH]> for Preimage {
    fn from(bytes: [u8; LENGTH]) -> Self {
        Preimage(bytes)
    }
}

/// SHA-256 of the preimage; locks both the invoice and the opening output.
#[derive(Clone, Copy, PartialEq, PartialOrd, Ord, Eq, Hash)]
pub struct PaymentHash([u8; LENGTH]);

impl PaymentHash {
    pub fn of(preimage: &Preimage) -> Self {
        let hash = sha256::Hash::hash(preimage.as_raw());

        PaymentHash(hash.into_inner())
    }

    pub fn from_vec(vec: &[u8]) -> Result<Self, InvalidLength> {
        if vec.len() != LENGTH {
            return Err(InvalidLength {
                expected: LENGTH,
                got: vec.len(),
            });
        }
        let mut data = [0; LENGTH];
        data.copy_from_slice(&vec[..LENGTH]);

        Ok(PaymentHash(data))
    }

    pub fn as_raw(&self) -> &[u8; LENGTH] {
        &self.0
    }

    pub fn into_raw(self) -> [u8; LENGTH] {
        self.0
    }
}

#[derive(PartialEq, Clone, Copy, Debug, thiserror::Error)]
#[error("invalid length, expected: {expected:?}, got: {got:?}")]
pub struct InvalidLength {
    expected: usize,
    got: usize,
}

#[derive(PartialEq, Clone, Copy, Debug, thiserror::Error)]
pub enum FromStrError {
    #[error("failed to decode bytes as hex")]
    HexDecode(#[from] hex::FromHexError),
    #[error("failed to construct value from bytes")]
    FromVec(#[from] InvalidLength),
}

macro_rules! hex_str_impls {
    ($ty:ident, $expecting:expr) => {
        impl fmt::LowerHex for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
                f.write_str(hex::encode(&self.0).as_str())
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:x}", self)
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($ty), "({:x})"), self)
            }
        }

        impl FromStr for $ty {
            type Err = FromStrError;

            fn from_str(s: &str) -> Result<Self, <Self as FromStr>::Err> {
                let vec = hex::decode(s)?;
                let value = Self::from_vec(&vec)?;

                Ok(value)
            }
        }

        impl Serialize for $ty {
            fn serialize<S>(
                &self,
                serializer: S,
            ) -> Result<<S as Serializer>::Ok, <S as Serializer>::Error>
            where
                S: Serializer,
            {
                serializer.serialize_str(&format!("{:x}", self))
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D>(deserializer: D) -> Result<Self, <D as Deserializer<'de>>::Error>
            where
                D: Deserializer<'de>,
            {
                struct Visitor;

                impl<'vde> de::Visitor<'vde> for Visitor {
                    type Value = $ty;

                    fn expecting(
                        &self,
                        formatter: &mut fmt::Formatter<'_>,
                    ) -> Result<(), fmt::Error> {
                        formatter.write_str($expecting)
                    }

                    fn visit_str<E>(self, v: &str) -> Result<$ty, E>
                    where
                        E: de::Error,
                    {
                        $ty::from_str(v).map_err(|_| {
                            de::Error::invalid_value(de::Unexpected::Str(v), &"hex encoded bytes")
                        })
                    }
                }

                deserializer.deserialize_str(Visitor)
            }
        }
    };
}

hex_str_impls!(Preimage, "a hex encoded 32 byte preimage");
hex_str_impls!(PaymentHash, "a hex encoded 32 byte payment hash");
