//! The registry owning all active swaps.
//!
//! Every external event source — peer messages, chain confirmations, CSV
//! expiries, settled invoices, timeouts — enters here, gets validated, and is
//! injected into the right machine. Machines never call back into the
//! registry; removal of finished swaps is decided here alone, off the `done`
//! flag every injection returns.

use crate::{
    messages::{
        Cancel, Chain, CoopClose, MessageType, OpeningTxBroadcasted, SwapInAgreement,
        SwapInRequest, SwapOutAgreement, SwapOutRequest, DUST_LIMIT_SAT,
    },
    swap::{
        in_receiver, in_sender, out_receiver, out_sender,
        services::{ChainParams, SwapServices},
        ActiveSwapOnChannel, Event, EventRejected, OversizedPayload, SwapData, SwapDoesNotExist,
        SwapRole, SwapStateMachine, SwapType, UnexpectedPeer,
    },
    PROTOCOL_VERSION, SwapId,
};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::{
    collections::HashMap,
    str::FromStr,
    sync::{Arc, RwLock, Weak},
};

/// Anything bigger is dropped before parsing.
pub const MAX_PAYLOAD_BYTES: usize = 100 * 1024;

const PAYMENT_LABEL_SEPARATOR: char = '_';

#[derive(Debug)]
pub struct SwapService {
    services: Arc<SwapServices>,
    active_swaps: RwLock<HashMap<String, Arc<SwapStateMachine>>>,
}

impl SwapService {
    pub fn new(services: Arc<SwapServices>) -> Arc<Self> {
        Arc::new(SwapService {
            services,
            active_swaps: RwLock::new(HashMap::new()),
        })
    }

    /// Wires our entry points into the collaborators' callback slots.
    ///
    /// Collaborators may fire callbacks from their own threads; each one is
    /// re-entered through the runtime handle captured here.
    pub fn start(self: &Arc<Self>) {
        let handle = tokio::runtime::Handle::current();

        let timeout_service = Arc::clone(&self.services.timeout);
        timeout_service.set_callback({
            let service = Arc::downgrade(self);
            let handle = handle.clone();
            Arc::new(move |swap_id| {
                Self::spawn_entry(&service, &handle, move |service| async move {
                    service.on_timeout(swap_id).await
                })
            })
        });

        self.services.messenger.add_message_handler({
            let service = Arc::downgrade(self);
            let handle = handle.clone();
            Arc::new(move |peer_id, message_type_hex, payload| {
                Self::spawn_entry(&service, &handle, move |service| async move {
                    service
                        .on_message_received(&peer_id, &message_type_hex, &payload)
                        .await
                })
            })
        });

        self.services.lightning.add_payment_callback({
            let service = Arc::downgrade(self);
            let handle = handle.clone();
            Arc::new(move |description| {
                Self::spawn_entry(&service, &handle, move |service| async move {
                    service.on_payment(&description).await;
                    Ok(())
                })
            })
        });

        for chain in &[Chain::Bitcoin, Chain::Liquid] {
            let watcher = match self.services.watcher(*chain) {
                Ok(watcher) => watcher,
                Err(_) => continue,
            };
            watcher.add_confirmation_callback({
                let service = Arc::downgrade(self);
                let handle = handle.clone();
                Arc::new(move |swap_id, tx_hex| {
                    Self::spawn_entry(&service, &handle, move |service| async move {
                        service.on_tx_confirmed(swap_id, tx_hex).await
                    })
                })
            });
            watcher.add_csv_callback({
                let service = Arc::downgrade(self);
                let handle = handle.clone();
                Arc::new(move |swap_id| {
                    Self::spawn_entry(&service, &handle, move |service| async move {
                        service.on_csv_passed(swap_id).await
                    })
                })
            });
        }
    }

    fn spawn_entry<F, Fut>(service: &Weak<Self>, handle: &tokio::runtime::Handle, entry: F)
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let service = match service.upgrade() {
            Some(service) => service,
            None => return,
        };
        let entered = entry(service);
        handle.spawn(async move {
            if let Err(error) = entered.await {
                if is_benign(&error) {
                    tracing::debug!("callback ignored: {:#}", error);
                } else {
                    tracing::error!("callback failed: {:#}", error);
                }
            }
        });
    }

    /// Rebuilds the machine of every unfinished persisted swap and replays it
    /// to a quiescent state.
    pub async fn recover_swaps(&self) -> Result<()> {
        let swaps = self.services.store.list_all()?;

        for data in swaps {
            if data.is_finished() {
                continue;
            }

            let swap_id = data.id;
            let machine = Arc::new(self.machine_from_data(data));
            self.add_active_swap(&machine);

            let done = machine
                .recover()
                .await
                .with_context(|| format!("failed to recover swap {}", swap_id))?;
            if done {
                self.remove_active_swap(&swap_id);
            }
        }

        Ok(())
    }

    fn machine_from_data(&self, data: SwapData) -> SwapStateMachine {
        let services = Arc::clone(&self.services);

        match (data.swap_type, data.role) {
            (SwapType::SwapOut, SwapRole::Sender) => out_sender::from_data(data, services),
            (SwapType::SwapOut, SwapRole::Receiver) => out_receiver::from_data(data, services),
            (SwapType::SwapIn, SwapRole::Sender) => in_sender::from_data(data, services),
            (SwapType::SwapIn, SwapRole::Receiver) => in_receiver::from_data(data, services),
        }
    }

    /// Starts a swap-out: we pay Lightning, the peer funds on-chain.
    pub async fn swap_out(
        &self,
        peer_node_id: &str,
        chain: Chain,
        scid: &str,
        initiator_node_id: &str,
        amount_sat: u64,
    ) -> Result<Arc<SwapStateMachine>> {
        self.check_admission(scid, amount_sat)?;

        tracing::info!(
            "starting swap-out: peer: {} scid: {} amount: {} sat",
            peer_node_id,
            scid,
            amount_sat
        );

        let swap_id = SwapId::random();
        let mut data = SwapData::new(swap_id, SwapType::SwapOut, initiator_node_id, peer_node_id);
        let (asset, network) = self.chain_fields(chain)?;
        let request = SwapOutRequest {
            protocol_version: PROTOCOL_VERSION,
            swap_id,
            asset,
            network,
            scid: scid.to_string(),
            amount: amount_sat,
            pubkey: data.pubkey_hex(),
        };
        data.stage_message(&request)?;
        let data = data.with_swap_out_request(request);

        let machine = Arc::new(out_sender::from_data(data, Arc::clone(&self.services)));
        self.add_active_swap(&machine);

        let done = machine.send_event(Event::SwapOutStarted).await?;
        if done {
            self.remove_active_swap(&machine.id);
        }

        Ok(machine)
    }

    /// Starts a swap-in: we fund on-chain, the peer pays Lightning.
    pub async fn swap_in(
        &self,
        peer_node_id: &str,
        chain: Chain,
        scid: &str,
        initiator_node_id: &str,
        amount_sat: u64,
    ) -> Result<Arc<SwapStateMachine>> {
        self.check_admission(scid, amount_sat)?;

        tracing::info!(
            "starting swap-in: peer: {} scid: {} amount: {} sat",
            peer_node_id,
            scid,
            amount_sat
        );

        let swap_id = SwapId::random();
        let mut data = SwapData::new(swap_id, SwapType::SwapIn, initiator_node_id, peer_node_id);
        let (asset, network) = self.chain_fields(chain)?;
        let request = SwapInRequest {
            protocol_version: PROTOCOL_VERSION,
            swap_id,
            asset,
            network,
            scid: scid.to_string(),
            amount: amount_sat,
            pubkey: data.pubkey_hex(),
        };
        data.stage_message(&request)?;
        let data = data.with_swap_in_request(request);

        let machine = Arc::new(in_sender::from_data(data, Arc::clone(&self.services)));
        self.add_active_swap(&machine);

        let done = machine.send_event(Event::SwapInStarted).await?;
        if done {
            self.remove_active_swap(&machine.id);
        }

        Ok(machine)
    }

    fn check_admission(&self, scid: &str, amount_sat: u64) -> Result<()> {
        if self.has_active_swap_on_channel(scid) {
            return Err(anyhow::Error::new(ActiveSwapOnChannel(scid.to_string())));
        }
        if amount_sat <= DUST_LIMIT_SAT {
            anyhow::bail!("amount of {} sat does not clear the dust limit", amount_sat);
        }
        if amount_sat > self.services.settings.max_swap_amount_sat {
            anyhow::bail!(
                "amount of {} sat exceeds the configured maximum of {} sat",
                amount_sat,
                self.services.settings.max_swap_amount_sat
            );
        }

        Ok(())
    }

    fn chain_fields(&self, chain: Chain) -> Result<(String, String)> {
        let wallet = self.services.wallet(chain)?;

        Ok(match wallet.chain_params() {
            ChainParams::Bitcoin { network } => (String::new(), network),
            ChainParams::Liquid { asset } => (asset, String::new()),
        })
    }

    /// Entry point for every inbound peer message.
    pub async fn on_message_received(
        &self,
        peer_id: &str,
        message_type_hex: &str,
        payload: &[u8],
    ) -> Result<()> {
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(anyhow::Error::new(OversizedPayload));
        }
        let message_type = match MessageType::from_tag(message_type_hex)? {
            Some(message_type) => message_type,
            None => {
                tracing::debug!("ignoring unknown message type {}", message_type_hex);
                return Ok(());
            }
        };

        tracing::debug!("message from {}: {}", peer_id, message_type);

        match message_type {
            MessageType::SwapOutRequest => {
                let message: SwapOutRequest = parse(payload)?;
                self.on_swap_out_request_received(peer_id, message).await
            }
            MessageType::SwapInRequest => {
                let message: SwapInRequest = parse(payload)?;
                self.on_swap_in_request_received(peer_id, message).await
            }
            MessageType::SwapOutAgreement => {
                let message: SwapOutAgreement = parse(payload)?;
                self.expect_peer(peer_id, &message.swap_id)?;
                self.on_swap_out_agreement_received(message).await
            }
            MessageType::SwapInAgreement => {
                let message: SwapInAgreement = parse(payload)?;
                self.expect_peer(peer_id, &message.swap_id)?;
                self.on_swap_in_agreement_received(message).await
            }
            MessageType::OpeningTxBroadcasted => {
                let message: OpeningTxBroadcasted = parse(payload)?;
                self.expect_peer(peer_id, &message.swap_id)?;
                self.on_opening_tx_message_received(message).await
            }
            MessageType::Cancel => {
                let message: Cancel = parse(payload)?;
                self.expect_peer(peer_id, &message.swap_id)?;
                self.on_cancel_received(message).await
            }
            MessageType::CoopClose => {
                let message: CoopClose = parse(payload)?;
                self.expect_peer(peer_id, &message.swap_id)?;
                self.on_coop_close_received(message).await
            }
        }
    }

    async fn on_swap_out_request_received(
        &self,
        peer_id: &str,
        message: SwapOutRequest,
    ) -> Result<()> {
        if self.has_active_swap_on_channel(&message.scid) {
            return Err(anyhow::Error::new(ActiveSwapOnChannel(message.scid)));
        }
        if let Some(reason) = self.request_rejection(
            message.validate().err(),
            message.chain().ok(),
            &message.asset,
            &message.network,
            message.amount,
        ) {
            return self.reject_request(peer_id, message.swap_id, &reason).await;
        }

        let data = SwapData::from_request(message.swap_id, SwapType::SwapOut, peer_id)
            .with_swap_out_request(message);
        let machine = Arc::new(out_receiver::from_data(data, Arc::clone(&self.services)));
        self.add_active_swap(&machine);

        let done = machine.send_event(Event::SwapOutRequestReceived).await?;
        if done {
            self.remove_active_swap(&machine.id);
        }

        Ok(())
    }

    async fn on_swap_in_request_received(
        &self,
        peer_id: &str,
        message: SwapInRequest,
    ) -> Result<()> {
        if self.has_active_swap_on_channel(&message.scid) {
            return Err(anyhow::Error::new(ActiveSwapOnChannel(message.scid)));
        }
        if let Some(reason) = self.request_rejection(
            message.validate().err(),
            message.chain().ok(),
            &message.asset,
            &message.network,
            message.amount,
        ) {
            return self.reject_request(peer_id, message.swap_id, &reason).await;
        }

        let data = SwapData::from_request(message.swap_id, SwapType::SwapIn, peer_id)
            .with_swap_in_request(message);
        let machine = Arc::new(in_receiver::from_data(data, Arc::clone(&self.services)));
        self.add_active_swap(&machine);

        let done = machine.send_event(Event::SwapInRequestReceived).await?;
        if done {
            self.remove_active_swap(&machine.id);
        }

        Ok(())
    }

    /// Why a request cannot be admitted, if it cannot.
    fn request_rejection(
        &self,
        validation_error: Option<crate::messages::ValidationError>,
        chain: Option<Chain>,
        asset: &str,
        network: &str,
        amount_sat: u64,
    ) -> Option<String> {
        if let Some(error) = validation_error {
            return Some(format!("invalid request: {}", error));
        }
        let chain = chain?;
        if !self.services.chain_enabled(chain) {
            return Some(format!("chain {} is not enabled", chain));
        }
        if amount_sat > self.services.settings.max_swap_amount_sat {
            return Some(format!(
                "amount of {} sat exceeds the maximum of {} sat",
                amount_sat, self.services.settings.max_swap_amount_sat
            ));
        }
        match self.services.wallet(chain).map(|w| w.chain_params()) {
            Ok(ChainParams::Bitcoin { network: ours }) if ours != network => {
                Some(format!("network {} does not match ours", network))
            }
            Ok(ChainParams::Liquid { asset: ours }) if ours != asset => {
                Some(format!("asset {} does not match ours", asset))
            }
            _ => None,
        }
    }

    /// Declines a request we never built a machine for.
    async fn reject_request(&self, peer_id: &str, swap_id: SwapId, reason: &str) -> Result<()> {
        tracing::info!("rejecting swap {} from {}: {}", swap_id, peer_id, reason);

        let (payload, message_type) = crate::messages::marshal_message(&Cancel {
            swap_id,
            message: reason.to_string(),
        })?;

        self.services
            .messenger
            .send_message(peer_id, &payload, message_type)
            .await
    }

    async fn on_swap_out_agreement_received(&self, message: SwapOutAgreement) -> Result<()> {
        let machine = self.get_active_swap(&message.swap_id)?;

        if let Err(error) = message.validate() {
            return self.handle_invalid_message(&machine, &error.to_string()).await;
        }

        self.inject(&machine, Event::FeeInvoiceReceived, move |data| {
            data.swap_out_agreement = Some(message)
        })
        .await
    }

    async fn on_swap_in_agreement_received(&self, message: SwapInAgreement) -> Result<()> {
        let machine = self.get_active_swap(&message.swap_id)?;

        if let Err(error) = message.validate() {
            return self.handle_invalid_message(&machine, &error.to_string()).await;
        }

        self.inject(&machine, Event::AgreementReceived, move |data| {
            data.swap_in_agreement = Some(message)
        })
        .await
    }

    async fn on_opening_tx_message_received(&self, message: OpeningTxBroadcasted) -> Result<()> {
        let machine = self.get_active_swap(&message.swap_id)?;

        let chain = machine
            .chain()
            .ok_or_else(|| anyhow::anyhow!("swap {} has no chain", machine.id))?;
        if let Err(error) = message.validate(chain) {
            return self.handle_invalid_message(&machine, &error.to_string()).await;
        }

        self.inject(&machine, Event::OpeningTxMessageReceived, move |data| {
            data.opening_tx_broadcasted = Some(message)
        })
        .await
    }

    async fn on_cancel_received(&self, message: Cancel) -> Result<()> {
        let machine = self.get_active_swap(&message.swap_id)?;

        // A machine already claiming on chain rejects this; that is the
        // intended outcome, not an error.
        self.inject_lenient(&machine, Event::CancelReceived, move |data| {
            data.cancel = Some(message)
        })
        .await
    }

    async fn on_coop_close_received(&self, message: CoopClose) -> Result<()> {
        let machine = self.get_active_swap(&message.swap_id)?;

        if let Err(error) = message.validate() {
            return self.handle_invalid_message(&machine, &error.to_string()).await;
        }

        self.inject_lenient(&machine, Event::CoopCloseReceived, move |data| {
            data.coop_close = Some(message)
        })
        .await
    }

    /// Routes a stage message that failed validation into the machine's
    /// cancel branch.
    async fn handle_invalid_message(
        &self,
        machine: &Arc<SwapStateMachine>,
        reason: &str,
    ) -> Result<()> {
        let cancel_message = format!("invalid request: {}", reason);

        self.inject_lenient(machine, Event::InvalidMessage, move |data| {
            data.cancel_message = Some(cancel_message)
        })
        .await
    }

    pub async fn on_tx_confirmed(&self, swap_id: SwapId, tx_hex: String) -> Result<()> {
        let machine = self.get_active_swap(&swap_id)?;

        self.inject_lenient(&machine, Event::TxConfirmed, move |data| {
            data.opening_tx_hex = Some(tx_hex)
        })
        .await
    }

    pub async fn on_csv_passed(&self, swap_id: SwapId) -> Result<()> {
        let machine = self.get_active_swap(&swap_id)?;

        self.inject_lenient(&machine, Event::CsvPassed, |_| {}).await
    }

    pub async fn on_timeout(&self, swap_id: SwapId) -> Result<()> {
        let machine = self.get_active_swap(&swap_id)?;

        self.inject_lenient(&machine, Event::Timeout, |_| {}).await
    }

    /// Dispatches a settled invoice by its `<label>_<swap-id>` description.
    pub async fn on_payment(&self, description: &str) {
        let (label, swap_id) = match parse_payment_description(description) {
            Some(parts) => parts,
            None => return,
        };

        let result = match label.as_str() {
            "fee" => self.on_fee_invoice_paid(swap_id).await,
            "claim" => self.on_claim_invoice_paid(swap_id).await,
            _ => return,
        };

        if let Err(error) = result {
            if is_benign(&error) {
                tracing::debug!("payment for swap {} ignored: {:#}", swap_id, error);
            } else {
                tracing::error!("payment for swap {} failed: {:#}", swap_id, error);
            }
        }
    }

    pub async fn on_fee_invoice_paid(&self, swap_id: SwapId) -> Result<()> {
        let machine = self.get_active_swap(&swap_id)?;

        self.inject(&machine, Event::FeeInvoicePaid, |_| {}).await
    }

    pub async fn on_claim_invoice_paid(&self, swap_id: SwapId) -> Result<()> {
        let machine = self.get_active_swap(&swap_id)?;

        self.inject_lenient(&machine, Event::ClaimInvoicePaid, |_| {})
            .await
    }

    /// Manually retries the last staged message after a transport failure.
    pub async fn resend_last_message(&self, swap_id: SwapId) -> Result<()> {
        let machine = self.get_active_swap(&swap_id)?;

        machine.resend_last_message().await
    }

    pub fn list_swaps(&self) -> Result<Vec<SwapData>> {
        self.services.store.list_all()
    }

    pub fn list_swaps_by_peer(&self, peer_id: &str) -> Result<Vec<SwapData>> {
        self.services.store.list_all_by_peer(peer_id)
    }

    pub fn get_swap(&self, swap_id: &SwapId) -> Result<SwapData> {
        self.services.store.get_data(swap_id)
    }

    async fn inject<F>(
        &self,
        machine: &Arc<SwapStateMachine>,
        event: Event,
        prepare: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut SwapData),
    {
        let done = machine.send_event_with(event, prepare).await?;
        if done {
            self.remove_active_swap(&machine.id);
        }

        Ok(())
    }

    /// Like [`inject`], but treats a rejected event as a no-op.
    ///
    /// [`inject`]: SwapService::inject
    async fn inject_lenient<F>(
        &self,
        machine: &Arc<SwapStateMachine>,
        event: Event,
        prepare: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut SwapData),
    {
        match self.inject(machine, event, prepare).await {
            Err(error) if error.downcast_ref::<EventRejected>().is_some() => {
                tracing::debug!("swap {}: {:#}", machine.id, error);
                Ok(())
            }
            result => result,
        }
    }

    fn expect_peer(&self, sender_id: &str, swap_id: &SwapId) -> Result<()> {
        let machine = self.get_active_swap(swap_id)?;
        if machine.peer_node_id() != sender_id {
            return Err(anyhow::Error::new(UnexpectedPeer {
                peer_id: sender_id.to_string(),
                swap_id: *swap_id,
            }));
        }

        Ok(())
    }

    fn add_active_swap(&self, machine: &Arc<SwapStateMachine>) {
        self.active_swaps
            .write()
            .expect("active swaps lock poisoned")
            .insert(machine.id.to_string(), Arc::clone(machine));
    }

    pub fn get_active_swap(&self, swap_id: &SwapId) -> Result<Arc<SwapStateMachine>> {
        self.active_swaps
            .read()
            .expect("active swaps lock poisoned")
            .get(&swap_id.to_string())
            .cloned()
            .ok_or_else(|| anyhow::Error::new(SwapDoesNotExist))
    }

    fn remove_active_swap(&self, swap_id: &SwapId) {
        self.active_swaps
            .write()
            .expect("active swaps lock poisoned")
            .remove(&swap_id.to_string());
    }

    fn has_active_swap_on_channel(&self, scid: &str) -> bool {
        self.active_swaps
            .read()
            .expect("active swaps lock poisoned")
            .values()
            .any(|machine| machine.scid() == Some(scid))
    }
}

fn parse<M>(payload: &[u8]) -> Result<M>
where
    M: DeserializeOwned,
{
    serde_json::from_slice(payload).context("malformed message payload")
}

fn parse_payment_description(description: &str) -> Option<(String, SwapId)> {
    let mut parts = description.splitn(2, PAYMENT_LABEL_SEPARATOR);
    let label = parts.next()?;
    let swap_id = SwapId::from_str(parts.next()?).ok()?;

    Some((label.to_string(), swap_id))
}

fn is_benign(error: &anyhow::Error) -> bool {
    error.downcast_ref::<EventRejected>().is_some()
        || error.downcast_ref::<SwapDoesNotExist>().is_some()
}
