//! One action per unit of side-effecting work.
//!
//! Actions hold no state of their own; everything they need is read from and
//! written to the swap's data record. A failed action records the error on
//! the record and reports `Event::ActionFailed`, leaving the machine free to
//! retry or cancel according to its table.

use crate::{
    htlc,
    messages::{Cancel, CoopClose, OpeningTxBroadcasted, SwapInAgreement, SwapOutAgreement},
    swap::{
        data::SwapType,
        services::{ClaimParams, ClaimPath, OpeningParams, SwapServices},
        Event, SwapData,
    },
    PaymentHash, Preimage, PROTOCOL_VERSION,
};
use anyhow::{anyhow, Context, Result};
use bitcoin::secp256k1::PublicKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum Action {
    NoOp,
    /// Completes a claimed state so the machine can settle into `Done`.
    NoOpDone,
    /// Transmits the staged message.
    SendMessage,
    /// Transmits the staged message and opens a response window.
    SendMessageWithTimeout,
    /// Swap-out maker: create the fee invoice and answer the request.
    SendFeeInvoiceAgreement,
    /// Swap-in peer: accept the request with our pubkey and premium.
    SendAgreement,
    /// Swap-out taker: pay the maker's fee invoice.
    PayFeeInvoice,
    /// Funding side: mint the preimage, create the claim invoice, fund and
    /// broadcast the opening transaction.
    CreateAndBroadcastOpeningTx,
    /// Funding side: announce the opening transaction and watch the CSV
    /// window as our safety net.
    SendOpeningTxBroadcasted,
    /// Paying side: verify the claim invoice and watch for the opening
    /// transaction to confirm.
    AwaitOpeningTxConfirmation,
    /// Paying side: pay the claim invoice, revealing the preimage.
    PayClaimInvoice,
    ClaimPreimage,
    ClaimCsv,
    ClaimCoop,
    SendCancel,
    /// Paying side bail-out: hand the peer our key instead of a preimage.
    SendCoopClose,
}

impl Action {
    pub async fn execute(self, services: &SwapServices, data: &mut SwapData) -> Event {
        let result = match self {
            Action::NoOp => Ok(Event::NoOp),
            Action::NoOpDone => Ok(Event::Done),
            Action::SendMessage => send_staged_message(services, data, false).await,
            Action::SendMessageWithTimeout => send_staged_message(services, data, true).await,
            Action::SendFeeInvoiceAgreement => send_fee_invoice_agreement(services, data).await,
            Action::SendAgreement => send_agreement(services, data).await,
            Action::PayFeeInvoice => pay_fee_invoice(services, data).await,
            Action::CreateAndBroadcastOpeningTx => {
                create_and_broadcast_opening_tx(services, data).await
            }
            Action::SendOpeningTxBroadcasted => send_opening_tx_broadcasted(services, data).await,
            Action::AwaitOpeningTxConfirmation => {
                await_opening_tx_confirmation(services, data).await
            }
            Action::PayClaimInvoice => pay_claim_invoice(services, data).await,
            Action::ClaimPreimage => claim(services, data, ClaimKind::Preimage).await,
            Action::ClaimCsv => claim(services, data, ClaimKind::Csv).await,
            Action::ClaimCoop => claim(services, data, ClaimKind::Coop).await,
            Action::SendCancel => send_cancel(services, data).await,
            Action::SendCoopClose => send_coop_close(services, data).await,
        };

        match result {
            Ok(event) => event,
            Err(error) => {
                tracing::warn!("swap {}: {} failed: {:#}", data.id, self, error);
                data.last_err = Some(format!("{:#}", error));

                Event::ActionFailed
            }
        }
    }
}

async fn send_staged_message(
    services: &SwapServices,
    data: &mut SwapData,
    open_window: bool,
) -> Result<Event> {
    let payload = data
        .next_message
        .clone()
        .ok_or_else(|| anyhow!("no message staged"))?;
    let message_type = data
        .next_message_type
        .ok_or_else(|| anyhow!("no message type staged"))?;

    services
        .messenger
        .send_message(&data.peer_node_id, &payload, message_type)
        .await
        .context("failed to send message to peer")?;

    if open_window {
        services.timeout.arm(data.id);
    }

    Ok(Event::NoOp)
}

async fn send_fee_invoice_agreement(
    services: &SwapServices,
    data: &mut SwapData,
) -> Result<Event> {
    let wallet = services.wallet(data.chain()?)?;
    let fee_sat = wallet
        .estimate_fee_sat()
        .await
        .context("failed to estimate opening fee")?;

    let label = format!("fee_{}", data.id);
    let payreq = services
        .lightning
        .get_payreq(fee_sat * 1000, &Preimage::random(), &label, &label)
        .await
        .context("failed to create fee invoice")?;

    let agreement = SwapOutAgreement {
        protocol_version: PROTOCOL_VERSION,
        swap_id: data.id,
        pubkey: data.pubkey_hex(),
        payreq,
    };
    data.stage_message(&agreement)?;
    data.swap_out_agreement = Some(agreement);

    send_staged_message(services, data, true).await?;

    tracing::info!("swap {}: sent fee invoice over {} sat", data.id, fee_sat);

    Ok(Event::NoOp)
}

async fn send_agreement(services: &SwapServices, data: &mut SwapData) -> Result<Event> {
    let agreement = SwapInAgreement {
        protocol_version: PROTOCOL_VERSION,
        swap_id: data.id,
        pubkey: data.pubkey_hex(),
        premium: services.settings.premium_sat,
    };
    data.stage_message(&agreement)?;
    data.swap_in_agreement = Some(agreement);

    send_staged_message(services, data, true).await?;

    Ok(Event::NoOp)
}

async fn pay_fee_invoice(services: &SwapServices, data: &mut SwapData) -> Result<Event> {
    // Settled before a restart; keep waiting for the opening tx instead of
    // paying twice (or cancelling over an "already paid" rejection).
    if data.fee_preimage.is_some() {
        services.timeout.arm(data.id);
        return Ok(Event::NoOp);
    }

    let agreement = data
        .swap_out_agreement
        .clone()
        .ok_or_else(|| anyhow!("no agreement stored"))?;

    let invoice = services
        .lightning
        .decode_payreq(&agreement.payreq)
        .await
        .context("failed to decode fee invoice")?;
    if invoice.amount_msat > data.amount_sat()? * 1000 {
        return Err(anyhow!(
            "fee invoice over {} msat exceeds the swap amount",
            invoice.amount_msat
        ));
    }

    let fee_preimage = services
        .lightning
        .pay_invoice(&agreement.payreq)
        .await
        .context("failed to pay fee invoice")?;
    data.fee_preimage = Some(fee_preimage);

    services.timeout.arm(data.id);

    Ok(Event::NoOp)
}

async fn create_and_broadcast_opening_tx(
    services: &SwapServices,
    data: &mut SwapData,
) -> Result<Event> {
    // The broadcast result is persisted below, in this very state, the
    // moment the output exists; a record that carries it belongs to a
    // process that died afterwards. Replay the event instead of funding a
    // second output.
    if data.opening_tx_id.is_some() && data.opening_tx_broadcasted.is_some() {
        return Ok(Event::OpeningTxBroadcasted);
    }

    let preimage = Preimage::random();
    let payment_hash = PaymentHash::of(&preimage);
    data.preimage = Some(preimage);
    data.payment_hash = Some(payment_hash);

    let label = format!("claim_{}", data.id);
    let payreq = services
        .lightning
        .get_payreq(claim_invoice_amount_msat(data)?, &preimage, &label, &label)
        .await
        .context("failed to create claim invoice")?;

    let wallet = services.wallet(data.chain()?)?;
    let params = OpeningParams {
        swap_id: data.id,
        amount_sat: data.amount_sat()?,
        payment_hash,
        taker_pubkey: data.peer_pubkey_hex()?,
        maker_pubkey: data.pubkey_hex(),
        csv_blocks: htlc::CSV_BLOCKS,
    };
    let opening = wallet
        .create_opening_tx(&params)
        .await
        .context("failed to fund and broadcast opening tx")?;

    data.opening_tx_hex = Some(opening.tx_hex);
    data.opening_tx_id = Some(opening.tx_id.clone());
    data.opening_tx_vout = Some(opening.vout);
    data.blinding_key = opening.blinding_key.clone();

    let message = OpeningTxBroadcasted {
        swap_id: data.id,
        payreq,
        tx_id: opening.tx_id,
        script_out: opening.vout,
        blinding_key: opening.blinding_key.unwrap_or_default(),
    };
    data.stage_message(&message)?;
    data.opening_tx_broadcasted = Some(message);

    // Funds are on chain; that fact must survive us, whatever happens next.
    // A failure here must not fail the action — the swap IS funded, and the
    // engine persists (fatally, if need be) right after this returns.
    if let Err(error) = services.store.update_data(data).await {
        tracing::error!(
            "swap {}: failed to persist broadcast opening tx: {:#}",
            data.id,
            error
        );
    }

    tracing::info!(
        "swap {}: opening tx {} broadcast",
        data.id,
        data.opening_tx_id.as_deref().unwrap_or_default()
    );

    Ok(Event::OpeningTxBroadcasted)
}

async fn send_opening_tx_broadcasted(
    services: &SwapServices,
    data: &mut SwapData,
) -> Result<Event> {
    let message = data
        .opening_tx_broadcasted
        .clone()
        .ok_or_else(|| anyhow!("no opening tx announcement staged"))?;

    // The CSV watch is our safety net; register it before talking to anyone.
    let watcher = services.watcher(data.chain()?)?;
    watcher
        .watch_csv(data.id, &message.tx_id, message.script_out)
        .await
        .context("failed to register csv watch")?;

    send_staged_message(services, data, false).await?;

    Ok(Event::NoOp)
}

async fn await_opening_tx_confirmation(
    services: &SwapServices,
    data: &mut SwapData,
) -> Result<Event> {
    let message = data
        .opening_tx_broadcasted
        .clone()
        .ok_or_else(|| anyhow!("no opening tx announcement received"))?;

    let invoice = services
        .lightning
        .decode_payreq(&message.payreq)
        .await
        .context("failed to decode claim invoice")?;
    let expected_msat = claim_invoice_amount_msat(data)?;
    if invoice.amount_msat != expected_msat {
        return Err(anyhow!(
            "claim invoice over {} msat, expected {} msat",
            invoice.amount_msat,
            expected_msat
        ));
    }
    data.payment_hash = Some(invoice.payment_hash);

    let script_pubkey = htlc::opening_script_pubkey(
        &invoice.payment_hash,
        &data.pubkey(),
        &parse_pubkey(&data.peer_pubkey_hex()?)?,
        htlc::CSV_BLOCKS,
    );

    let watcher = services.watcher(data.chain()?)?;
    watcher
        .watch_confirmation(
            data.id,
            &message.tx_id,
            message.script_out,
            &hex::encode(script_pubkey.as_bytes()),
        )
        .await
        .context("failed to register confirmation watch")?;

    Ok(Event::NoOp)
}

async fn pay_claim_invoice(services: &SwapServices, data: &mut SwapData) -> Result<Event> {
    if data.preimage.is_some() {
        return Ok(Event::PreimageRevealed);
    }

    let message = data
        .opening_tx_broadcasted
        .clone()
        .ok_or_else(|| anyhow!("no opening tx announcement received"))?;
    let expected_hash = data
        .payment_hash
        .ok_or_else(|| anyhow!("claim invoice was never verified"))?;

    let preimage = services
        .lightning
        .pay_invoice(&message.payreq)
        .await
        .context("failed to pay claim invoice")?;

    if PaymentHash::of(&preimage) != expected_hash {
        return Err(anyhow!("revealed preimage does not match the payment hash"));
    }
    data.preimage = Some(preimage);

    Ok(Event::PreimageRevealed)
}

enum ClaimKind {
    Preimage,
    Csv,
    Coop,
}

async fn claim(services: &SwapServices, data: &mut SwapData, kind: ClaimKind) -> Result<Event> {
    if data.claim_tx_id.is_some() {
        return Ok(Event::Done);
    }

    let path = match kind {
        ClaimKind::Preimage => ClaimPath::Preimage {
            preimage: data
                .preimage
                .ok_or_else(|| anyhow!("no preimage revealed"))?,
        },
        ClaimKind::Csv => ClaimPath::Csv,
        ClaimKind::Coop => ClaimPath::Coop {
            peer_privkey: data
                .coop_close
                .as_ref()
                .map(|coop| coop.privkey.clone())
                .ok_or_else(|| anyhow!("no coop close received"))?,
        },
    };

    let params = claim_params(data)?;
    let wallet = services.wallet(data.chain()?)?;
    let claim_tx_id = wallet
        .create_claim_tx(&params, path)
        .await
        .context("failed to build and broadcast claim tx")?;

    tracing::info!("swap {}: claimed opening output in {}", data.id, claim_tx_id);
    data.claim_tx_id = Some(claim_tx_id);

    Ok(Event::Done)
}

async fn send_cancel(services: &SwapServices, data: &mut SwapData) -> Result<Event> {
    let reason = data
        .cancel_message
        .clone()
        .or_else(|| data.last_err.clone())
        .unwrap_or_else(|| "swap canceled".to_string());

    let message = Cancel {
        swap_id: data.id,
        message: reason,
    };
    data.stage_message(&message)?;

    send_staged_message(services, data, false).await?;

    tracing::info!("swap {}: canceled", data.id);

    Ok(Event::ActionSucceeded)
}

async fn send_coop_close(services: &SwapServices, data: &mut SwapData) -> Result<Event> {
    let reason = data
        .last_err
        .clone()
        .unwrap_or_else(|| "could not pay the claim invoice".to_string());

    let message = CoopClose {
        swap_id: data.id,
        message: reason,
        privkey: hex::encode(data.privkey().secret_bytes()),
    };
    data.stage_message(&message)?;

    send_staged_message(services, data, false).await?;

    tracing::info!("swap {}: gave up our key for a cooperative close", data.id);

    Ok(Event::ActionSucceeded)
}

/// The claim invoice nets out the premium on a swap-in; on a swap-out the fee
/// is a separate invoice and the claim invoice covers the full amount.
fn claim_invoice_amount_msat(data: &SwapData) -> Result<u64> {
    let amount_sat = data.amount_sat()?;
    let net_sat = match data.swap_type {
        SwapType::SwapOut => amount_sat,
        SwapType::SwapIn => amount_sat
            .checked_sub(data.premium_sat())
            .ok_or_else(|| anyhow!("premium exceeds the swap amount"))?,
    };

    Ok(net_sat * 1000)
}

fn claim_params(data: &SwapData) -> Result<ClaimParams> {
    let message = data
        .opening_tx_broadcasted
        .as_ref()
        .ok_or_else(|| anyhow!("no opening tx known"))?;
    let payment_hash = data
        .payment_hash
        .ok_or_else(|| anyhow!("no payment hash known"))?;

    let (taker_pubkey, maker_pubkey) = if data.is_taker() {
        (data.pubkey_hex(), data.peer_pubkey_hex()?)
    } else {
        (data.peer_pubkey_hex()?, data.pubkey_hex())
    };

    Ok(ClaimParams {
        swap_id: data.id,
        opening_tx_id: message.tx_id.clone(),
        opening_tx_vout: message.script_out,
        amount_sat: data.amount_sat()?,
        payment_hash,
        taker_pubkey,
        maker_pubkey,
        csv_blocks: htlc::CSV_BLOCKS,
    })
}

fn parse_pubkey(pubkey: &str) -> Result<PublicKey> {
    let bytes = hex::decode(pubkey).context("pubkey is not hex")?;

    PublicKey::from_slice(&bytes).context("pubkey is not a secp256k1 point")
}
