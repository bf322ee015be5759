//! Wire messages of the swap protocol.
//!
//! Every message is a JSON payload tagged with a 2-byte type in the odd
//! custom-message range starting at `0xa455`. Unknown but well-formed tags are
//! ignored by the dispatcher so that newer peers can extend the protocol.

use crate::{PROTOCOL_VERSION, SwapId};
use bitcoin::secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Outputs below this are not worth sweeping.
pub const DUST_LIMIT_SAT: u64 = 546;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
pub enum MessageType {
    SwapInRequest,
    SwapInAgreement,
    SwapOutRequest,
    SwapOutAgreement,
    OpeningTxBroadcasted,
    Cancel,
    CoopClose,
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("malformed message type tag: {0}")]
pub struct MalformedTag(String);

impl MessageType {
    pub fn tag(self) -> &'static str {
        match self {
            MessageType::SwapInRequest => "a455",
            MessageType::SwapInAgreement => "a457",
            MessageType::SwapOutRequest => "a459",
            MessageType::SwapOutAgreement => "a45b",
            MessageType::OpeningTxBroadcasted => "a45d",
            MessageType::Cancel => "a45f",
            MessageType::CoopClose => "a461",
        }
    }

    /// Parses a wire tag. `Ok(None)` means the tag is well-formed but unknown
    /// to us and should be ignored.
    pub fn from_tag(tag: &str) -> Result<Option<MessageType>, MalformedTag> {
        if tag.len() != 4 {
            return Err(MalformedTag(tag.to_string()));
        }
        u16::from_str_radix(tag, 16).map_err(|_| MalformedTag(tag.to_string()))?;

        let message_type = match tag {
            "a455" => Some(MessageType::SwapInRequest),
            "a457" => Some(MessageType::SwapInAgreement),
            "a459" => Some(MessageType::SwapOutRequest),
            "a45b" => Some(MessageType::SwapOutAgreement),
            "a45d" => Some(MessageType::OpeningTxBroadcasted),
            "a45f" => Some(MessageType::Cancel),
            "a461" => Some(MessageType::CoopClose),
            _ => None,
        };

        Ok(message_type)
    }
}

/// The chain the on-chain leg settles on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Chain {
    Bitcoin,
    Liquid,
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chain::Bitcoin => f.write_str("btc"),
            Chain::Liquid => f.write_str("l-btc"),
        }
    }
}

impl FromStr for Chain {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "btc" => Ok(Chain::Bitcoin),
            "l-btc" => Ok(Chain::Liquid),
            other => Err(ValidationError::UnsupportedChain(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("protocol version must be {}", PROTOCOL_VERSION)]
    ProtocolVersion,
    #[error("exactly one of asset and network must be set")]
    ChainOneOf,
    #[error("unsupported chain: {0}")]
    UnsupportedChain(String),
    #[error("amount of {0} sat does not clear the dust limit")]
    AmountBelowDust(u64),
    #[error("malformed short channel id: {0}")]
    MalformedScid(String),
    #[error("pubkey is not a compressed secp256k1 point")]
    MalformedPubkey,
    #[error("blinding key must be a 32 byte hex string")]
    MalformedBlindingKey,
    #[error("blinding key is only meaningful on liquid")]
    UnexpectedBlindingKey,
    #[error("privkey must be a 32 byte hex string")]
    MalformedPrivkey,
}

fn validate_pubkey(pubkey: &str) -> Result<(), ValidationError> {
    let bytes = hex::decode(pubkey).map_err(|_| ValidationError::MalformedPubkey)?;
    if bytes.len() != 33 {
        return Err(ValidationError::MalformedPubkey);
    }
    PublicKey::from_slice(&bytes).map_err(|_| ValidationError::MalformedPubkey)?;

    Ok(())
}

fn validate_scid(scid: &str) -> Result<(), ValidationError> {
    let malformed = || ValidationError::MalformedScid(scid.to_string());

    let parts: Vec<&str> = scid.split('x').collect();
    if parts.len() != 3 {
        return Err(malformed());
    }
    for part in parts {
        part.parse::<u64>().map_err(|_| malformed())?;
    }

    Ok(())
}

fn validate_chain_one_of(asset: &str, network: &str) -> Result<Chain, ValidationError> {
    match (asset.is_empty(), network.is_empty()) {
        (false, true) => Ok(Chain::Liquid),
        (true, false) => Ok(Chain::Bitcoin),
        _ => Err(ValidationError::ChainOneOf),
    }
}

/// Asks the peer to send us on-chain coins in exchange for a Lightning
/// payment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SwapOutRequest {
    pub protocol_version: u64,
    pub swap_id: SwapId,
    #[serde(default)]
    pub asset: String,
    #[serde(default)]
    pub network: String,
    pub scid: String,
    pub amount: u64,
    pub pubkey: String,
}

/// Offers us on-chain coins in exchange for a Lightning payment to the peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SwapInRequest {
    pub protocol_version: u64,
    pub swap_id: SwapId,
    #[serde(default)]
    pub asset: String,
    #[serde(default)]
    pub network: String,
    pub scid: String,
    pub amount: u64,
    pub pubkey: String,
}

/// The maker's answer to a swap-out request, carrying the fee invoice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SwapOutAgreement {
    pub protocol_version: u64,
    pub swap_id: SwapId,
    pub pubkey: String,
    pub payreq: String,
}

/// The peer's answer to a swap-in request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SwapInAgreement {
    pub protocol_version: u64,
    pub swap_id: SwapId,
    pub pubkey: String,
    pub premium: u64,
}

/// Announces the opening transaction together with the claim invoice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpeningTxBroadcasted {
    pub swap_id: SwapId,
    pub payreq: String,
    pub tx_id: String,
    pub script_out: u32,
    #[serde(default)]
    pub blinding_key: String,
}

/// Aborts the swap with a human-readable reason.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cancel {
    pub swap_id: SwapId,
    pub message: String,
}

/// Hands the peer our signing key so it can sweep the opening output without
/// waiting for the CSV window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoopClose {
    pub swap_id: SwapId,
    pub message: String,
    pub privkey: String,
}

/// Pairs a concrete message struct with its wire tag.
pub trait PeerMessage: Serialize {
    fn message_type(&self) -> MessageType;
}

impl PeerMessage for SwapOutRequest {
    fn message_type(&self) -> MessageType {
        MessageType::SwapOutRequest
    }
}

impl PeerMessage for SwapInRequest {
    fn message_type(&self) -> MessageType {
        MessageType::SwapInRequest
    }
}

impl PeerMessage for SwapOutAgreement {
    fn message_type(&self) -> MessageType {
        MessageType::SwapOutAgreement
    }
}

impl PeerMessage for SwapInAgreement {
    fn message_type(&self) -> MessageType {
        MessageType::SwapInAgreement
    }
}

impl PeerMessage for OpeningTxBroadcasted {
    fn message_type(&self) -> MessageType {
        MessageType::OpeningTxBroadcasted
    }
}

impl PeerMessage for Cancel {
    fn message_type(&self) -> MessageType {
        MessageType::Cancel
    }
}

impl PeerMessage for CoopClose {
    fn message_type(&self) -> MessageType {
        MessageType::CoopClose
    }
}

pub fn marshal_message<M>(message: &M) -> anyhow::Result<(Vec<u8>, MessageType)>
where
    M: PeerMessage,
{
    let payload = serde_json::to_vec(message)?;

    Ok((payload, message.message_type()))
}

impl SwapOutRequest {
    pub fn chain(&self) -> Result<Chain, ValidationError> {
        validate_chain_one_of(&self.asset, &self.network)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(ValidationError::ProtocolVersion);
        }
        self.chain()?;
        if self.amount <= DUST_LIMIT_SAT {
            return Err(ValidationError::AmountBelowDust(self.amount));
        }
        validate_scid(&self.scid)?;
        validate_pubkey(&self.pubkey)?;

        Ok(())
    }
}

impl SwapInRequest {
    pub fn chain(&self) -> Result<Chain, ValidationError> {
        validate_chain_one_of(&self.asset, &self.network)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(ValidationError::ProtocolVersion);
        }
        self.chain()?;
        if self.amount <= DUST_LIMIT_SAT {
            return Err(ValidationError::AmountBelowDust(self.amount));
        }
        validate_scid(&self.scid)?;
        validate_pubkey(&self.pubkey)?;

        Ok(())
    }
}

impl SwapOutAgreement {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(ValidationError::ProtocolVersion);
        }
        validate_pubkey(&self.pubkey)?;

        Ok(())
    }
}

impl SwapInAgreement {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(ValidationError::ProtocolVersion);
        }
        validate_pubkey(&self.pubkey)?;

        Ok(())
    }
}

impl OpeningTxBroadcasted {
    pub fn validate(&self, chain: Chain) -> Result<(), ValidationError> {
        match chain {
            Chain::Liquid => {
                let bytes = hex::decode(&self.blinding_key)
                    .map_err(|_| ValidationError::MalformedBlindingKey)?;
                if bytes.len() != 32 {
                    return Err(ValidationError::MalformedBlindingKey);
                }
            }
            Chain::Bitcoin => {
                if !self.blinding_key.is_empty() {
                    return Err(ValidationError::UnexpectedBlindingKey);
                }
            }
        }

        Ok(())
    }
}

impl CoopClose {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let bytes = hex::decode(&self.privkey).map_err(|_| ValidationError::MalformedPrivkey)?;
        if bytes.len() != 32 {
            return Err(ValidationError::MalformedPrivkey);
        }

        Ok(())
    }
}
