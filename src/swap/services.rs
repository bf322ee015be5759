//! The interfaces through which a swap observes and touches the outside
//! world, and the bundle handed to every machine.
//!
//! Concrete backends (bitcoind wallet, block scanner, CLN/LND client, p2p
//! transport) live outside this crate; the engine only ever sees these
//! traits.

use crate::{
    config::Settings,
    messages::{Chain, MessageType},
    swap::SwapData,
    timeout::TimeoutService,
    PaymentHash, Preimage, SwapId,
};
use anyhow::Result;
use async_trait::async_trait;
use std::{fmt, sync::Arc};

pub type MessageHandler = Arc<dyn Fn(String, String, Vec<u8>) + Send + Sync>;
pub type PaymentCallback = Arc<dyn Fn(String) + Send + Sync>;
pub type ConfirmationCallback = Arc<dyn Fn(SwapId, String) + Send + Sync>;
pub type CsvCallback = Arc<dyn Fn(SwapId) + Send + Sync>;

/// Delivers wire messages to and from the peer.
#[async_trait]
pub trait Messenger: Send + Sync + 'static {
    async fn send_message(
        &self,
        peer_id: &str,
        payload: &[u8],
        message_type: MessageType,
    ) -> Result<()>;

    /// `handler(peer_id, type_tag_hex, payload)` for every inbound message.
    fn add_message_handler(&self, handler: MessageHandler);
}

/// Network parameters of the chain a wallet operates on.
#[derive(Clone, Debug, PartialEq)]
pub enum ChainParams {
    Bitcoin { network: String },
    Liquid { asset: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct OpeningParams {
    pub swap_id: SwapId,
    pub amount_sat: u64,
    pub payment_hash: PaymentHash,
    pub taker_pubkey: String,
    pub maker_pubkey: String,
    pub csv_blocks: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OpeningTx {
    pub tx_hex: String,
    pub tx_id: String,
    pub vout: u32,
    /// Only present on Liquid.
    pub blinding_key: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClaimParams {
    pub swap_id: SwapId,
    pub opening_tx_id: String,
    pub opening_tx_vout: u32,
    pub amount_sat: u64,
    pub payment_hash: PaymentHash,
    pub taker_pubkey: String,
    pub maker_pubkey: String,
    pub csv_blocks: u32,
}

/// How to spend the opening output.
#[derive(Clone, Debug, PartialEq)]
pub enum ClaimPath {
    Preimage { preimage: Preimage },
    Csv,
    Coop { peer_privkey: String },
}

/// Funds, broadcasts and spends the on-chain leg of a swap.
#[async_trait]
pub trait Wallet: Send + Sync + 'static {
    fn chain_params(&self) -> ChainParams;

    /// The cost of getting an opening transaction confirmed, charged to the
    /// taker as the fee invoice.
    async fn estimate_fee_sat(&self) -> Result<u64>;

    /// Builds and broadcasts the opening transaction.
    async fn create_opening_tx(&self, params: &OpeningParams) -> Result<OpeningTx>;

    /// Builds and broadcasts a transaction sweeping the opening output via
    /// `path`; returns the claim txid.
    async fn create_claim_tx(&self, params: &ClaimParams, path: ClaimPath) -> Result<String>;
}

/// Watches the chain for confirmations and CSV expiries.
#[async_trait]
pub trait TxWatcher: Send + Sync + 'static {
    fn add_confirmation_callback(&self, callback: ConfirmationCallback);
    fn add_csv_callback(&self, callback: CsvCallback);

    async fn watch_confirmation(
        &self,
        swap_id: SwapId,
        tx_id: &str,
        vout: u32,
        script_pubkey: &str,
    ) -> Result<()>;

    async fn watch_csv(&self, swap_id: SwapId, tx_id: &str, vout: u32) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct Invoice {
    pub payment_hash: PaymentHash,
    pub amount_msat: u64,
}

/// The local Lightning node.
#[async_trait]
pub trait LightningClient: Send + Sync + 'static {
    /// Pays `payreq` and returns the revealed preimage.
    async fn pay_invoice(&self, payreq: &str) -> Result<Preimage>;

    async fn get_payreq(
        &self,
        amount_msat: u64,
        preimage: &Preimage,
        label: &str,
        description: &str,
    ) -> Result<String>;

    async fn decode_payreq(&self, payreq: &str) -> Result<Invoice>;

    /// `callback(description)` whenever one of our invoices settles.
    fn add_payment_callback(&self, callback: PaymentCallback);
}

/// Persists swap records; written on every transition, read on recovery.
#[async_trait]
pub trait SwapStore: Send + Sync + 'static {
    async fn update_data(&self, swap: &SwapData) -> Result<()>;
    fn get_data(&self, swap_id: &SwapId) -> Result<SwapData>;
    fn list_all(&self) -> Result<Vec<SwapData>>;
    fn list_all_by_peer(&self, peer_id: &str) -> Result<Vec<SwapData>>;
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("chain {0} is not enabled on this node")]
pub struct ChainDisabled(pub Chain);

#[derive(Clone)]
pub struct ChainServices {
    pub wallet: Arc<dyn Wallet>,
    pub watcher: Arc<dyn TxWatcher>,
}

impl fmt::Debug for ChainServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainServices")
            .field("chain", &self.wallet.chain_params())
            .finish()
    }
}

/// Everything a machine needs to execute its actions.
#[derive(Clone)]
pub struct SwapServices {
    pub settings: Settings,
    pub messenger: Arc<dyn Messenger>,
    pub lightning: Arc<dyn LightningClient>,
    pub store: Arc<dyn SwapStore>,
    pub timeout: Arc<TimeoutService>,
    pub bitcoin: Option<ChainServices>,
    pub liquid: Option<ChainServices>,
}

impl SwapServices {
    fn chain_services(&self, chain: Chain) -> Result<&ChainServices, ChainDisabled> {
        let services = match chain {
            Chain::Bitcoin => self.bitcoin.as_ref(),
            Chain::Liquid => self.liquid.as_ref(),
        };

        services.ok_or(ChainDisabled(chain))
    }

    pub fn wallet(&self, chain: Chain) -> Result<Arc<dyn Wallet>, ChainDisabled> {
        Ok(Arc::clone(&self.chain_services(chain)?.wallet))
    }

    pub fn watcher(&self, chain: Chain) -> Result<Arc<dyn TxWatcher>, ChainDisabled> {
        Ok(Arc::clone(&self.chain_services(chain)?.watcher))
    }

    pub fn chain_enabled(&self, chain: Chain) -> bool {
        self.chain_services(chain).is_ok()
    }
}

impl fmt::Debug for SwapServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwapServices")
            .field("settings", &self.settings)
            .field("bitcoin_enabled", &self.bitcoin.is_some())
            .field("liquid_enabled", &self.liquid.is_some())
            .finish()
    }
}
