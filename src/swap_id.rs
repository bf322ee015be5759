use rand::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

const LENGTH: usize = 32;

/// Identifies a single swap on the wire, in logs and in the store.
///
/// Minted once by the initiator and echoed by every subsequent message of the
/// same swap. Rendered as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, PartialOrd, Ord, Eq, Hash)]
pub struct SwapId([u8; LENGTH]);

impl SwapId {
    pub fn random() -> Self {
        let mut bytes = [0u8; LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);

        SwapId(bytes)
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

        Ok(SwapId(data))
    }

    pub fn as_bytes(&self) -> &[u8; LENGTH] {
        &self.0
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
    #[error("failed to construct swap id from bytes")]
    FromVec(#[from] InvalidLength),
}

impl FromStr for SwapId {
    type Err = FromStrError;

    fn from_str(s: &str) -> Result<Self, <Self as FromStr>::Err> {
        let vec = hex::decode(s)?;
        let swap_id = Self::from_vec(&vec)?;

        Ok(swap_id)
    }
}

impl fmt::LowerHex for SwapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.write_str(hex::encode(&self.0).as_str())
    }
}

impl fmt::Display for SwapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self)
    }
}

impl fmt::Debug for SwapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwapId({:x})", self)
    }
}

impl Serialize for SwapId {
    fn serialize<S>(&self, serializer: S) -> Result<<S as Serializer>::Ok, <S as Serializer>::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{:x}", self))
    }
}

impl<'de> Deserialize<'de> for SwapId {
    fn deserialize<D>(deserializer: D) -> Result<Self, <D as Deserializer<'de>>::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;

        impl<'vde> de::Visitor<'vde> for Visitor {
            type Value = SwapId;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
                formatter.write_str("a hex encoded 32 byte value")
            }

            fn visit_str<E>(self, v: &str) -> Result<SwapId, E>
            where
                E: de::Error,
            {
                SwapId::from_str(v).map_err(|_| {
                    de::Error::invalid_value(de::Unexpected::Str(v), &"hex encoded bytes")
                })
            }
        }

        deserializer.deserialize_str(Visitor)
    }
}

#[cfg(test)]
mod arbitrary {
    use super::*;
    use quickcheck::{Arbitrary, Gen};

    impl Arbitrary for SwapId {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            let mut bytes = [0u8; LENGTH];
            for byte in &mut bytes {
                *byte = u8::arbitrary(g);
            }

            SwapId(bytes)
        }
    }
}
