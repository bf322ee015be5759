//! The taker of a swap-out: requests on-chain coins, pays the maker's fee
//! and claim invoices over Lightning and sweeps the opening output with the
//! revealed preimage.

use crate::swap::{
    machine::{transition, SwapStateMachine, Transitions},
    services::SwapServices,
    SwapData,
};
use std::sync::Arc;

pub(crate) fn from_data(data: SwapData, services: Arc<SwapServices>) -> SwapStateMachine {
    SwapStateMachine::new(data, services, transitions())
}

fn transitions() -> Transitions {
    use crate::swap::{action::Action as A, Event as E, State as S};

    Transitions::new(vec![
        transition(
            S::Created,
            E::SwapOutStarted,
            S::AwaitingAgreement,
            A::SendMessageWithTimeout,
        ),
        transition(
            S::AwaitingAgreement,
            E::FeeInvoiceReceived,
            S::AwaitingOpeningTx,
            A::PayFeeInvoice,
        ),
        transition(S::AwaitingAgreement, E::Timeout, S::SendCancel, A::SendCancel),
        transition(S::AwaitingAgreement, E::CancelReceived, S::Canceled, A::NoOp),
        transition(
            S::AwaitingAgreement,
            E::InvalidMessage,
            S::SendCancel,
            A::SendCancel,
        ),
        transition(
            S::AwaitingOpeningTx,
            E::OpeningTxMessageReceived,
            S::AwaitingConfirmation,
            A::AwaitOpeningTxConfirmation,
        ),
        transition(
            S::AwaitingOpeningTx,
            E::ActionFailed,
            S::SendCancel,
            A::SendCancel,
        ),
        transition(S::AwaitingOpeningTx, E::Timeout, S::SendCancel, A::SendCancel),
        transition(S::AwaitingOpeningTx, E::CancelReceived, S::Canceled, A::NoOp),
        transition(
            S::AwaitingOpeningTx,
            E::InvalidMessage,
            S::SendCancel,
            A::SendCancel,
        ),
        transition(
            S::AwaitingConfirmation,
            E::TxConfirmed,
            S::AwaitingClaim,
            A::PayClaimInvoice,
        ),
        transition(
            S::AwaitingConfirmation,
            E::ActionFailed,
            S::SendCancel,
            A::SendCancel,
        ),
        transition(
            S::AwaitingConfirmation,
            E::CancelReceived,
            S::Canceled,
            A::NoOp,
        ),
        transition(
            S::AwaitingConfirmation,
            E::InvalidMessage,
            S::SendCancel,
            A::SendCancel,
        ),
        transition(
            S::AwaitingClaim,
            E::PreimageRevealed,
            S::ClaimedPreimage,
            A::ClaimPreimage,
        ),
        // Could not pay the claim invoice; give the maker our key back.
        transition(
            S::AwaitingClaim,
            E::ActionFailed,
            S::SendCancel,
            A::SendCoopClose,
        ),
        transition(S::ClaimedPreimage, E::Done, S::Done, A::NoOp),
        transition(S::SendCancel, E::ActionSucceeded, S::Canceled, A::NoOp),
        transition(S::SendCancel, E::ActionFailed, S::Canceled, A::NoOp),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        messages::{MessageType, OpeningTxBroadcasted, SwapOutAgreement, SwapOutRequest},
        swap::{data::SwapType, fakes, Event, State},
        PaymentHash, Preimage, SwapId, PROTOCOL_VERSION,
    };
    use std::sync::atomic::Ordering;

    fn started_machine(world: &fakes::TestWorld) -> SwapStateMachine {
        let id = SwapId::random();
        let mut data = SwapData::new(id, SwapType::SwapOut, "alice", "bob");
        let request = SwapOutRequest {
            protocol_version: PROTOCOL_VERSION,
            swap_id: id,
            asset: String::new(),
            network: "mainnet".to_string(),
            scid: "600000x1x0".to_string(),
            amount: 100_000,
            pubkey: data.pubkey_hex(),
        };
        data.stage_message(&request).unwrap();

        from_data(data.with_swap_out_request(request), world.services.clone())
    }

    fn agreement(id: SwapId, payreq: &str) -> SwapOutAgreement {
        SwapOutAgreement {
            protocol_version: PROTOCOL_VERSION,
            swap_id: id,
            pubkey: fakes::pubkey_hex(9),
            payreq: payreq.to_string(),
        }
    }

    fn opening_message(id: SwapId, payreq: &str) -> OpeningTxBroadcasted {
        OpeningTxBroadcasted {
            swap_id: id,
            payreq: payreq.to_string(),
            tx_id: "cd".repeat(32),
            script_out: 0,
            blinding_key: String::new(),
        }
    }

    #[tokio::test]
    async fn happy_path_ends_claimed_by_preimage() {
        let world = fakes::test_world();
        let machine = started_machine(&world);

        let done = machine.send_event(Event::SwapOutStarted).await.unwrap();
        assert!(!done);
        assert_eq!(
            machine.data().await.current_state,
            State::AwaitingAgreement
        );
        assert_eq!(
            world.messenger.sent_types(),
            vec![MessageType::SwapOutRequest]
        );

        world
            .lightning
            .register_invoice("lnbc_fee", Preimage::random(), 1_000_000);
        let done = machine
            .send_event_with(Event::FeeInvoiceReceived, |data| {
                data.swap_out_agreement = Some(agreement(machine.id, "lnbc_fee"))
            })
            .await
            .unwrap();
        assert!(!done);
        assert_eq!(machine.data().await.current_state, State::AwaitingOpeningTx);
        assert_eq!(*world.lightning.paid.lock().unwrap(), vec!["lnbc_fee"]);

        let maker_preimage = Preimage::random();
        world
            .lightning
            .register_invoice("lnbc_claim", maker_preimage, 100_000_000);
        let done = machine
            .send_event_with(Event::OpeningTxMessageReceived, |data| {
                data.opening_tx_broadcasted = Some(opening_message(machine.id, "lnbc_claim"))
            })
            .await
            .unwrap();
        assert!(!done);
        assert_eq!(
            machine.data().await.current_state,
            State::AwaitingConfirmation
        );
        assert_eq!(world.watcher.confirmation_watches.lock().unwrap().len(), 1);

        let done = machine
            .send_event_with(Event::TxConfirmed, |data| {
                data.opening_tx_hex = Some("020000".to_string())
            })
            .await
            .unwrap();
        assert!(done);

        let data = machine.data().await;
        assert_eq!(data.current_state, State::Done);
        assert_eq!(data.preimage, Some(maker_preimage));
        assert_eq!(data.payment_hash, Some(PaymentHash::of(&maker_preimage)));
        assert!(data.claim_tx_id.is_some());
    }

    #[tokio::test]
    async fn cancel_in_awaiting_agreement_is_terminal() {
        let world = fakes::test_world();
        let machine = started_machine(&world);
        machine.send_event(Event::SwapOutStarted).await.unwrap();

        let done = machine.send_event(Event::CancelReceived).await.unwrap();

        assert!(done);
        assert_eq!(machine.data().await.current_state, State::Canceled);
        // No on-chain activity happened.
        assert!(world.wallet.openings.lock().unwrap().is_empty());
        assert!(world.wallet.claims.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_claim_payment_ends_in_coop_close() {
        let world = fakes::test_world();
        let machine = started_machine(&world);
        machine.send_event(Event::SwapOutStarted).await.unwrap();

        world
            .lightning
            .register_invoice("lnbc_fee", Preimage::random(), 1_000_000);
        machine
            .send_event_with(Event::FeeInvoiceReceived, |data| {
                data.swap_out_agreement = Some(agreement(machine.id, "lnbc_fee"))
            })
            .await
            .unwrap();

        world
            .lightning
            .register_invoice("lnbc_claim", Preimage::random(), 100_000_000);
        machine
            .send_event_with(Event::OpeningTxMessageReceived, |data| {
                data.opening_tx_broadcasted = Some(opening_message(machine.id, "lnbc_claim"))
            })
            .await
            .unwrap();

        world.lightning.fail_payments.store(true, Ordering::SeqCst);
        let done = machine.send_event(Event::TxConfirmed).await.unwrap();

        assert!(done);
        assert_eq!(machine.data().await.current_state, State::Canceled);
        assert!(world
            .messenger
            .sent_types()
            .contains(&MessageType::CoopClose));
    }

    #[tokio::test]
    async fn late_cancel_while_claiming_is_rejected() {
        let world = fakes::test_world();
        let machine = started_machine(&world);
        machine.send_event(Event::SwapOutStarted).await.unwrap();

        world
            .lightning
            .register_invoice("lnbc_fee", Preimage::random(), 1_000_000);
        machine
            .send_event_with(Event::FeeInvoiceReceived, |data| {
                data.swap_out_agreement = Some(agreement(machine.id, "lnbc_fee"))
            })
            .await
            .unwrap();

        let maker_preimage = Preimage::random();
        world
            .lightning
            .register_invoice("lnbc_claim", maker_preimage, 100_000_000);
        machine
            .send_event_with(Event::OpeningTxMessageReceived, |data| {
                data.opening_tx_broadcasted = Some(opening_message(machine.id, "lnbc_claim"))
            })
            .await
            .unwrap();
        machine.send_event(Event::TxConfirmed).await.unwrap();

        let result = machine.send_event(Event::CancelReceived).await;

        assert!(result
            .unwrap_err()
            .downcast_ref::<crate::swap::EventRejected>()
            .is_some());
        assert_eq!(machine.data().await.current_state, State::Done);
    }

    #[tokio::test]
    async fn recovery_does_not_pay_the_fee_invoice_twice() {
        let world = fakes::test_world();
        let machine = started_machine(&world);
        machine.send_event(Event::SwapOutStarted).await.unwrap();

        world
            .lightning
            .register_invoice("lnbc_fee", Preimage::random(), 1_000_000);
        machine
            .send_event_with(Event::FeeInvoiceReceived, |data| {
                data.swap_out_agreement = Some(agreement(machine.id, "lnbc_fee"))
            })
            .await
            .unwrap();
        assert_eq!(*world.lightning.paid.lock().unwrap(), vec!["lnbc_fee"]);

        // The settled payment is on the persisted record.
        let snapshot = machine.data().await;
        assert!(snapshot.fee_preimage.is_some());

        // A restarted node replays the entry action; the fee invoice must
        // not be paid again (the node would reject it as already settled
        // and the swap would wrongly cancel).
        let restarted = fakes::test_world();
        let recovered = from_data(snapshot, restarted.services.clone());
        let done = recovered.recover().await.unwrap();

        assert!(!done);
        assert_eq!(
            recovered.data().await.current_state,
            State::AwaitingOpeningTx
        );
        assert!(restarted.lightning.paid.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_failure_keeps_the_machine_in_place_for_a_resend() {
        let world = fakes::test_world();
        let machine = started_machine(&world);

        world.messenger.fail_sends.store(true, Ordering::SeqCst);
        let done = machine.send_event(Event::SwapOutStarted).await.unwrap();

        assert!(!done);
        let data = machine.data().await;
        assert_eq!(data.current_state, State::AwaitingAgreement);
        assert!(data.last_err.is_some());

        world.messenger.fail_sends.store(false, Ordering::SeqCst);
        machine.resend_last_message().await.unwrap();
        assert_eq!(
            world.messenger.sent_types(),
            vec![MessageType::SwapOutRequest]
        );
    }
}
