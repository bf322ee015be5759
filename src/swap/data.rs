use crate::{
    messages::{
        marshal_message, Cancel, Chain, CoopClose, MessageType, OpeningTxBroadcasted, PeerMessage,
        SwapInAgreement, SwapInRequest, SwapOutAgreement, SwapOutRequest,
    },
    swap::State,
    PaymentHash, Preimage, SwapId, SECP,
};
use anyhow::{anyhow, Result};
use bitcoin::secp256k1::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
pub enum SwapType {
    SwapIn,
    SwapOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
pub enum SwapRole {
    Sender,
    Receiver,
}

/// The full persisted record of one swap.
///
/// Owned exclusively by its state machine; a snapshot is written to the store
/// on every transition. Stage envelopes keep the latest message of each
/// protocol stage so that actions and recovery can be driven from the record
/// alone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SwapData {
    pub id: SwapId,
    pub swap_type: SwapType,
    pub role: SwapRole,
    pub initiator_node_id: String,
    pub peer_node_id: String,

    privkey: SecretKey,
    pub preimage: Option<Preimage>,
    pub payment_hash: Option<PaymentHash>,
    /// Set once the swap-out taker has settled the maker's fee invoice;
    /// replaying the payment on recovery is keyed off this.
    pub fee_preimage: Option<Preimage>,

    pub swap_out_request: Option<SwapOutRequest>,
    pub swap_in_request: Option<SwapInRequest>,
    pub swap_out_agreement: Option<SwapOutAgreement>,
    pub swap_in_agreement: Option<SwapInAgreement>,
    pub opening_tx_broadcasted: Option<OpeningTxBroadcasted>,
    pub cancel: Option<Cancel>,
    pub coop_close: Option<CoopClose>,

    pub opening_tx_hex: Option<String>,
    pub opening_tx_id: Option<String>,
    pub opening_tx_vout: Option<u32>,
    pub blinding_key: Option<String>,
    pub claim_tx_id: Option<String>,

    pub current_state: State,
    pub last_err: Option<String>,
    pub cancel_message: Option<String>,

    pub next_message: Option<Vec<u8>>,
    pub next_message_type: Option<MessageType>,

    pub created_at: i64,
}

impl SwapData {
    /// A fresh record for the initiating (sender) side.
    pub fn new(
        id: SwapId,
        swap_type: SwapType,
        initiator_node_id: &str,
        peer_node_id: &str,
    ) -> Self {
        Self::empty(
            id,
            swap_type,
            SwapRole::Sender,
            initiator_node_id,
            peer_node_id,
        )
    }

    /// A fresh record for the responding (receiver) side; the peer is the
    /// initiator.
    pub fn from_request(id: SwapId, swap_type: SwapType, peer_node_id: &str) -> Self {
        Self::empty(id, swap_type, SwapRole::Receiver, peer_node_id, peer_node_id)
    }

    fn empty(
        id: SwapId,
        swap_type: SwapType,
        role: SwapRole,
        initiator_node_id: &str,
        peer_node_id: &str,
    ) -> Self {
        SwapData {
            id,
            swap_type,
            role,
            initiator_node_id: initiator_node_id.to_string(),
            peer_node_id: peer_node_id.to_string(),
            privkey: SecretKey::new(&mut rand::thread_rng()),
            preimage: None,
            payment_hash: None,
            fee_preimage: None,
            swap_out_request: None,
            swap_in_request: None,
            swap_out_agreement: None,
            swap_in_agreement: None,
            opening_tx_broadcasted: None,
            cancel: None,
            coop_close: None,
            opening_tx_hex: None,
            opening_tx_id: None,
            opening_tx_vout: None,
            blinding_key: None,
            claim_tx_id: None,
            current_state: State::Created,
            last_err: None,
            cancel_message: None,
            next_message: None,
            next_message_type: None,
            created_at: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }

    pub fn with_swap_out_request(mut self, request: SwapOutRequest) -> Self {
        self.swap_out_request = Some(request);
        self
    }

    pub fn with_swap_in_request(mut self, request: SwapInRequest) -> Self {
        self.swap_in_request = Some(request);
        self
    }

    pub fn privkey(&self) -> SecretKey {
        self.privkey
    }

    /// The local HTLC identity for this swap.
    pub fn pubkey(&self) -> PublicKey {
        PublicKey::from_secret_key(&SECP, &self.privkey)
    }

    pub fn pubkey_hex(&self) -> String {
        hex::encode(self.pubkey().serialize().to_vec())
    }

    /// The peer's HTLC pubkey, taken from whichever stage message carries it
    /// for this role.
    pub fn peer_pubkey_hex(&self) -> Result<String> {
        let pubkey = match (self.swap_type, self.role) {
            (SwapType::SwapOut, SwapRole::Sender) => self
                .swap_out_agreement
                .as_ref()
                .map(|agreement| agreement.pubkey.clone()),
            (SwapType::SwapOut, SwapRole::Receiver) => self
                .swap_out_request
                .as_ref()
                .map(|request| request.pubkey.clone()),
            (SwapType::SwapIn, SwapRole::Sender) => self
                .swap_in_agreement
                .as_ref()
                .map(|agreement| agreement.pubkey.clone()),
            (SwapType::SwapIn, SwapRole::Receiver) => self
                .swap_in_request
                .as_ref()
                .map(|request| request.pubkey.clone()),
        };

        pubkey.ok_or_else(|| anyhow!("peer pubkey not yet exchanged"))
    }

    /// True for the side that pays the claim invoice and sweeps the opening
    /// output with the preimage.
    pub fn is_taker(&self) -> bool {
        matches!(
            (self.swap_type, self.role),
            (SwapType::SwapOut, SwapRole::Sender) | (SwapType::SwapIn, SwapRole::Receiver)
        )
    }

    pub fn scid(&self) -> Option<String> {
        if let Some(request) = &self.swap_out_request {
            return Some(request.scid.clone());
        }
        self.swap_in_request
            .as_ref()
            .map(|request| request.scid.clone())
    }

    pub fn chain(&self) -> Result<Chain> {
        let chain = if let Some(request) = &self.swap_out_request {
            request.chain()?
        } else if let Some(request) = &self.swap_in_request {
            request.chain()?
        } else {
            return Err(anyhow!("no request stored for this swap"));
        };

        Ok(chain)
    }

    pub fn amount_sat(&self) -> Result<u64> {
        if let Some(request) = &self.swap_out_request {
            return Ok(request.amount);
        }
        self.swap_in_request
            .as_ref()
            .map(|request| request.amount)
            .ok_or_else(|| anyhow!("no request stored for this swap"))
    }

    /// The premium agreed for a swap-in, zero otherwise.
    pub fn premium_sat(&self) -> u64 {
        self.swap_in_agreement
            .as_ref()
            .map(|agreement| agreement.premium)
            .unwrap_or(0)
    }

    /// Marshals `message` and stages it for the next send.
    pub fn stage_message<M>(&mut self, message: &M) -> Result<()>
    where
        M: PeerMessage,
    {
        let (payload, message_type) = marshal_message(message)?;
        self.next_message = Some(payload);
        self.next_message_type = Some(message_type);

        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.current_state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PROTOCOL_VERSION;

    fn swap_out_request(id: SwapId) -> SwapOutRequest {
        SwapOutRequest {
            protocol_version: PROTOCOL_VERSION,
            swap_id: id,
            asset: String::new(),
            network: "mainnet".to_string(),
            scid: "600000x1x0".to_string(),
            amount: 100_000,
            pubkey: "02".repeat(33),
        }
    }

    #[test]
    fn sender_record_starts_created_with_a_fresh_key() {
        let id = SwapId::random();
        let data = SwapData::new(id, SwapType::SwapOut, "us", "them");

        assert_eq!(data.current_state, State::Created);
        assert_eq!(data.role, SwapRole::Sender);
        assert_eq!(data.peer_node_id, "them");
        assert_eq!(data.pubkey_hex().len(), 66);
    }

    #[test]
    fn chain_and_scid_come_from_the_stored_request() {
        let id = SwapId::random();
        let data = SwapData::new(id, SwapType::SwapOut, "us", "them")
            .with_swap_out_request(swap_out_request(id));

        assert_eq!(data.chain().unwrap(), Chain::Bitcoin);
        assert_eq!(data.scid().as_deref(), Some("600000x1x0"));
        assert_eq!(data.amount_sat().unwrap(), 100_000);
    }

    #[test]
    fn record_survives_cbor() {
        let id = SwapId::random();
        let data = SwapData::new(id, SwapType::SwapIn, "us", "them");

        let bytes = serde_cbor::to_vec(&data).unwrap();
        let restored: SwapData = serde_cbor::from_slice(&bytes).unwrap();

        assert_eq!(restored, data);
    }

    #[test]
    fn taker_is_the_invoice_paying_side() {
        let id = SwapId::random();

        assert!(SwapData::new(id, SwapType::SwapOut, "us", "them").is_taker());
        assert!(SwapData::from_request(id, SwapType::SwapIn, "them").is_taker());
        assert!(!SwapData::from_request(id, SwapType::SwapOut, "them").is_taker());
    }
}
