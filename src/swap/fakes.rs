//! In-memory collaborator doubles for driving machines in tests.

use crate::{
    config::Settings,
    messages::{Chain, MessageType},
    swap::{
        services::{
            ChainParams, ChainServices, ClaimParams, ClaimPath, ConfirmationCallback, CsvCallback,
            Invoice, LightningClient, MessageHandler, Messenger, OpeningParams, OpeningTx,
            PaymentCallback, SwapServices, SwapStore, TxWatcher, Wallet,
        },
        SwapData, SwapDoesNotExist,
    },
    timeout::TimeoutService,
    PaymentHash, Preimage, SwapId,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

#[derive(Default)]
pub struct FakeMessenger {
    pub sent: Mutex<Vec<(String, MessageType, Vec<u8>)>>,
    pub fail_sends: AtomicBool,
}

impl FakeMessenger {
    pub fn sent_types(&self) -> Vec<MessageType> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, message_type, _)| *message_type)
            .collect()
    }
}

#[async_trait]
impl Messenger for FakeMessenger {
    async fn send_message(
        &self,
        peer_id: &str,
        payload: &[u8],
        message_type: MessageType,
    ) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(anyhow!("peer unreachable"));
        }
        self.sent
            .lock()
            .unwrap()
            .push((peer_id.to_string(), message_type, payload.to_vec()));

        Ok(())
    }

    fn add_message_handler(&self, _handler: MessageHandler) {}
}

#[derive(Default)]
pub struct FakeLightning {
    pub invoices: Mutex<HashMap<String, Invoice>>,
    preimages: Mutex<HashMap<String, Preimage>>,
    pub paid: Mutex<Vec<String>>,
    pub created_labels: Mutex<Vec<String>>,
    pub fail_payments: AtomicBool,
}

impl FakeLightning {
    /// Registers an externally-created invoice, as the peer's node would.
    pub fn register_invoice(&self, payreq: &str, preimage: Preimage, amount_msat: u64) {
        self.invoices.lock().unwrap().insert(
            payreq.to_string(),
            Invoice {
                payment_hash: PaymentHash::of(&preimage),
                amount_msat,
            },
        );
        self.preimages
            .lock()
            .unwrap()
            .insert(payreq.to_string(), preimage);
    }
}

#[async_trait]
impl LightningClient for FakeLightning {
    async fn pay_invoice(&self, payreq: &str) -> Result<Preimage> {
        if self.fail_payments.load(Ordering::SeqCst) {
            return Err(anyhow!("no route"));
        }
        let preimage = self
            .preimages
            .lock()
            .unwrap()
            .get(payreq)
            .copied()
            .ok_or_else(|| anyhow!("unknown invoice: {}", payreq))?;
        self.paid.lock().unwrap().push(payreq.to_string());

        Ok(preimage)
    }

    async fn get_payreq(
        &self,
        amount_msat: u64,
        preimage: &Preimage,
        label: &str,
        _description: &str,
    ) -> Result<String> {
        let payreq = format!("lnbc_{}", label);
        self.register_invoice(&payreq, *preimage, amount_msat);
        self.created_labels.lock().unwrap().push(label.to_string());

        Ok(payreq)
    }

    async fn decode_payreq(&self, payreq: &str) -> Result<Invoice> {
        self.invoices
            .lock()
            .unwrap()
            .get(payreq)
            .cloned()
            .ok_or_else(|| anyhow!("cannot decode invoice: {}", payreq))
    }

    fn add_payment_callback(&self, _callback: PaymentCallback) {}
}

pub struct FakeWallet {
    chain: Chain,
    pub openings: Mutex<Vec<OpeningParams>>,
    pub claims: Mutex<Vec<(ClaimParams, ClaimPath)>>,
    pub fail_opening: AtomicBool,
}

impl FakeWallet {
    pub fn new(chain: Chain) -> Self {
        FakeWallet {
            chain,
            openings: Mutex::new(Vec::new()),
            claims: Mutex::new(Vec::new()),
            fail_opening: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Wallet for FakeWallet {
    fn chain_params(&self) -> ChainParams {
        match self.chain {
            Chain::Bitcoin => ChainParams::Bitcoin {
                network: "mainnet".to_string(),
            },
            Chain::Liquid => ChainParams::Liquid {
                asset: "6f".repeat(32),
            },
        }
    }

    async fn estimate_fee_sat(&self) -> Result<u64> {
        Ok(1_000)
    }

    async fn create_opening_tx(&self, params: &OpeningParams) -> Result<OpeningTx> {
        if self.fail_opening.load(Ordering::SeqCst) {
            return Err(anyhow!("wallet has insufficient funds"));
        }
        self.openings.lock().unwrap().push(params.clone());

        Ok(OpeningTx {
            tx_hex: "020000000001".to_string(),
            tx_id: "cd".repeat(32),
            vout: 0,
            blinding_key: match self.chain {
                Chain::Bitcoin => None,
                Chain::Liquid => Some("ab".repeat(32)),
            },
        })
    }

    async fn create_claim_tx(&self, params: &ClaimParams, path: ClaimPath) -> Result<String> {
        let claim_tx_id = format!("claim_of_{}", params.opening_tx_id);
        self.claims.lock().unwrap().push((params.clone(), path));

        Ok(claim_tx_id)
    }
}

#[derive(Default)]
pub struct FakeTxWatcher {
    pub confirmation_watches: Mutex<Vec<(SwapId, String, String)>>,
    pub csv_watches: Mutex<Vec<(SwapId, String)>>,
}

#[async_trait]
impl TxWatcher for FakeTxWatcher {
    fn add_confirmation_callback(&self, _callback: ConfirmationCallback) {}

    fn add_csv_callback(&self, _callback: CsvCallback) {}

    async fn watch_confirmation(
        &self,
        swap_id: SwapId,
        tx_id: &str,
        _vout: u32,
        script_pubkey: &str,
    ) -> Result<()> {
        self.confirmation_watches.lock().unwrap().push((
            swap_id,
            tx_id.to_string(),
            script_pubkey.to_string(),
        ));

        Ok(())
    }

    async fn watch_csv(&self, swap_id: SwapId, tx_id: &str, _vout: u32) -> Result<()> {
        self.csv_watches
            .lock()
            .unwrap()
            .push((swap_id, tx_id.to_string()));

        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    pub swaps: Mutex<HashMap<String, SwapData>>,
}

#[async_trait]
impl SwapStore for InMemoryStore {
    async fn update_data(&self, swap: &SwapData) -> Result<()> {
        self.swaps
            .lock()
            .unwrap()
            .insert(swap.id.to_string(), swap.clone());

        Ok(())
    }

    fn get_data(&self, swap_id: &SwapId) -> Result<SwapData> {
        self.swaps
            .lock()
            .unwrap()
            .get(&swap_id.to_string())
            .cloned()
            .ok_or_else(|| anyhow::Error::new(SwapDoesNotExist))
    }

    fn list_all(&self) -> Result<Vec<SwapData>> {
        Ok(self.swaps.lock().unwrap().values().cloned().collect())
    }

    fn list_all_by_peer(&self, peer_id: &str) -> Result<Vec<SwapData>> {
        Ok(self
            .swaps
            .lock()
            .unwrap()
            .values()
            .filter(|swap| swap.peer_node_id == peer_id)
            .cloned()
            .collect())
    }
}

/// A deterministic compressed pubkey for the peer side of a test swap.
pub fn pubkey_hex(seed: u8) -> String {
    let sk = bitcoin::secp256k1::SecretKey::from_slice(&[seed; 32]).unwrap();
    hex::encode(
        bitcoin::secp256k1::PublicKey::from_secret_key(&crate::SECP, &sk)
            .serialize()
            .to_vec(),
    )
}

pub struct TestWorld {
    pub services: Arc<SwapServices>,
    pub messenger: Arc<FakeMessenger>,
    pub lightning: Arc<FakeLightning>,
    pub wallet: Arc<FakeWallet>,
    pub watcher: Arc<FakeTxWatcher>,
    pub store: Arc<InMemoryStore>,
    pub timeout: Arc<TimeoutService>,
}

/// A Bitcoin-only node against fresh fakes.
pub fn test_world() -> TestWorld {
    let messenger = Arc::new(FakeMessenger::default());
    let lightning = Arc::new(FakeLightning::default());
    let wallet = Arc::new(FakeWallet::new(Chain::Bitcoin));
    let watcher = Arc::new(FakeTxWatcher::default());
    let store = Arc::new(InMemoryStore::default());
    let timeout = Arc::new(TimeoutService::new(Duration::from_secs(600)));

    let services = Arc::new(SwapServices {
        settings: Settings::default(),
        messenger: messenger.clone(),
        lightning: lightning.clone(),
        store: store.clone(),
        timeout: timeout.clone(),
        bitcoin: Some(ChainServices {
            wallet: wallet.clone(),
            watcher: watcher.clone(),
        }),
        liquid: None,
    });

    TestWorld {
        services,
        messenger,
        lightning,
        wallet,
        watcher,
        store,
        timeout,
    }
}
