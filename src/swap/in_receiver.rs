//! The peer of a swap-in: agrees with its pubkey and premium, waits for the
//! initiator's opening transaction to confirm, pays the claim invoice and
//! sweeps the output with the revealed preimage.

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
            E::SwapInRequestReceived,
            S::AwaitingOpeningTx,
            A::SendAgreement,
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
        // Could not pay the claim invoice; give the initiator our key back.
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
        messages::{MessageType, OpeningTxBroadcasted, SwapInRequest},
        swap::{data::SwapType, fakes, services::ClaimPath, Event, State},
        Preimage, SwapId, PROTOCOL_VERSION,
    };
    use std::sync::atomic::Ordering;

    const AMOUNT_SAT: u64 = 250_000;

    fn machine_from_request(world: &fakes::TestWorld) -> SwapStateMachine {
        let id = SwapId::random();
        let request = SwapInRequest {
            protocol_version: PROTOCOL_VERSION,
            swap_id: id,
            asset: String::new(),
            network: "mainnet".to_string(),
            scid: "700000x2x1".to_string(),
            amount: AMOUNT_SAT,
            pubkey: fakes::pubkey_hex(17),
        };
        let data = SwapData::from_request(id, SwapType::SwapIn, "alice").with_swap_in_request(request);

        from_data(data, world.services.clone())
    }

    fn opening_message(id: SwapId, payreq: &str) -> OpeningTxBroadcasted {
        OpeningTxBroadcasted {
            swap_id: id,
            payreq: payreq.to_string(),
            tx_id: "ef".repeat(32),
            script_out: 1,
            blinding_key: String::new(),
        }
    }

    #[tokio::test]
    async fn happy_path_pays_and_claims() {
        let world = fakes::test_world();
        let machine = machine_from_request(&world);

        let done = machine
            .send_event(Event::SwapInRequestReceived)
            .await
            .unwrap();
        assert!(!done);
        assert_eq!(machine.data().await.current_state, State::AwaitingOpeningTx);
        assert_eq!(
            world.messenger.sent_types(),
            vec![MessageType::SwapInAgreement]
        );

        // The initiator announces its opening tx; premium was zero, so the
        // claim invoice is over the full amount.
        let initiator_preimage = Preimage::random();
        world
            .lightning
            .register_invoice("lnbc_claim", initiator_preimage, AMOUNT_SAT * 1000);
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

        let done = machine.send_event(Event::TxConfirmed).await.unwrap();
        assert!(done);

        let data = machine.data().await;
        assert_eq!(data.current_state, State::Done);
        assert_eq!(data.preimage, Some(initiator_preimage));
        assert!(data.claim_tx_id.is_some());
        let claims = world.wallet.claims.lock().unwrap();
        assert!(matches!(&claims[0].1, ClaimPath::Preimage { preimage } if *preimage == initiator_preimage));
    }

    #[tokio::test]
    async fn mismatched_claim_invoice_amount_cancels() {
        let world = fakes::test_world();
        let machine = machine_from_request(&world);
        machine
            .send_event(Event::SwapInRequestReceived)
            .await
            .unwrap();

        world
            .lightning
            .register_invoice("lnbc_claim", Preimage::random(), AMOUNT_SAT * 1000 + 1);
        let done = machine
            .send_event_with(Event::OpeningTxMessageReceived, |data| {
                data.opening_tx_broadcasted = Some(opening_message(machine.id, "lnbc_claim"))
            })
            .await
            .unwrap();

        assert!(done);
        assert_eq!(machine.data().await.current_state, State::Canceled);
        assert!(world.messenger.sent_types().contains(&MessageType::Cancel));
    }

    #[tokio::test]
    async fn failed_claim_payment_hands_over_our_key() {
        let world = fakes::test_world();
        let machine = machine_from_request(&world);
        machine
            .send_event(Event::SwapInRequestReceived)
            .await
            .unwrap();

        world
            .lightning
            .register_invoice("lnbc_claim", Preimage::random(), AMOUNT_SAT * 1000);
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
}
