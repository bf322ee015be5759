//! The initiator of a swap-in: funds the opening output and gets made whole
//! when the peer pays the claim invoice, netting out the agreed premium.

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
            E::SwapInStarted,
            S::AwaitingAgreement,
            A::SendMessageWithTimeout,
        ),
        transition(
            S::AwaitingAgreement,
            E::AgreementReceived,
            S::AwaitingOpeningTx,
            A::CreateAndBroadcastOpeningTx,
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
            E::OpeningTxBroadcasted,
            S::AwaitingClaimPayment,
            A::SendOpeningTxBroadcasted,
        ),
        transition(
            S::AwaitingOpeningTx,
            E::ActionFailed,
            S::SendCancel,
            A::SendCancel,
        ),
        // Funds are on chain from here on; a peer cancel no longer applies.
        transition(
            S::AwaitingClaimPayment,
            E::ClaimInvoicePaid,
            S::ClaimedPreimage,
            A::NoOpDone,
        ),
        transition(
            S::AwaitingClaimPayment,
            E::CsvPassed,
            S::ClaimedCsv,
            A::ClaimCsv,
        ),
        transition(
            S::AwaitingClaimPayment,
            E::CoopCloseReceived,
            S::ClaimedCoop,
            A::ClaimCoop,
        ),
        transition(S::ClaimedPreimage, E::Done, S::Done, A::NoOp),
        transition(S::ClaimedCsv, E::Done, S::Done, A::NoOp),
        transition(S::ClaimedCoop, E::Done, S::Done, A::NoOp),
        transition(S::SendCancel, E::ActionSucceeded, S::Canceled, A::NoOp),
        transition(S::SendCancel, E::ActionFailed, S::Canceled, A::NoOp),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        messages::{MessageType, SwapInAgreement, SwapInRequest},
        swap::{data::SwapType, fakes, Event, State},
        SwapId, PROTOCOL_VERSION,
    };

    const AMOUNT_SAT: u64 = 250_000;
    const PREMIUM_SAT: u64 = 1_500;

    fn started_machine(world: &fakes::TestWorld) -> SwapStateMachine {
        let id = SwapId::random();
        let mut data = SwapData::new(id, SwapType::SwapIn, "alice", "bob");
        let request = SwapInRequest {
            protocol_version: PROTOCOL_VERSION,
            swap_id: id,
            asset: String::new(),
            network: "mainnet".to_string(),
            scid: "700000x2x1".to_string(),
            amount: AMOUNT_SAT,
            pubkey: data.pubkey_hex(),
        };
        data.stage_message(&request).unwrap();

        from_data(data.with_swap_in_request(request), world.services.clone())
    }

    fn agreement(id: SwapId) -> SwapInAgreement {
        SwapInAgreement {
            protocol_version: PROTOCOL_VERSION,
            swap_id: id,
            pubkey: fakes::pubkey_hex(13),
            premium: PREMIUM_SAT,
        }
    }

    #[tokio::test]
    async fn happy_path_funds_and_gets_paid() {
        let world = fakes::test_world();
        let machine = started_machine(&world);

        let done = machine.send_event(Event::SwapInStarted).await.unwrap();
        assert!(!done);
        assert_eq!(
            world.messenger.sent_types(),
            vec![MessageType::SwapInRequest]
        );

        let done = machine
            .send_event_with(Event::AgreementReceived, |data| {
                data.swap_in_agreement = Some(agreement(machine.id))
            })
            .await
            .unwrap();
        assert!(!done);
        assert_eq!(
            machine.data().await.current_state,
            State::AwaitingClaimPayment
        );

        // The opening output locks the full amount; the claim invoice nets
        // out the premium.
        let openings = world.wallet.openings.lock().unwrap().clone();
        assert_eq!(openings[0].amount_sat, AMOUNT_SAT);
        let data = machine.data().await;
        let payreq = data
            .opening_tx_broadcasted
            .as_ref()
            .unwrap()
            .payreq
            .clone();
        let invoice = world
            .lightning
            .invoices
            .lock()
            .unwrap()
            .get(&payreq)
            .cloned()
            .unwrap();
        assert_eq!(invoice.amount_msat, (AMOUNT_SAT - PREMIUM_SAT) * 1000);
        assert_eq!(world.watcher.csv_watches.lock().unwrap().len(), 1);

        let done = machine.send_event(Event::ClaimInvoicePaid).await.unwrap();
        assert!(done);
        assert_eq!(machine.data().await.current_state, State::Done);
    }

    #[tokio::test]
    async fn timeout_while_awaiting_agreement_cancels() {
        let world = fakes::test_world();
        let machine = started_machine(&world);
        machine.send_event(Event::SwapInStarted).await.unwrap();

        let done = machine.send_event(Event::Timeout).await.unwrap();

        assert!(done);
        assert_eq!(machine.data().await.current_state, State::Canceled);
        assert!(world.messenger.sent_types().contains(&MessageType::Cancel));
    }

    #[tokio::test]
    async fn failed_funding_cancels_the_swap() {
        let world = fakes::test_world();
        let machine = started_machine(&world);
        machine.send_event(Event::SwapInStarted).await.unwrap();

        world
            .wallet
            .fail_opening
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let done = machine
            .send_event_with(Event::AgreementReceived, |data| {
                data.swap_in_agreement = Some(agreement(machine.id))
            })
            .await
            .unwrap();

        assert!(done);
        let data = machine.data().await;
        assert_eq!(data.current_state, State::Canceled);
        assert!(data.last_err.is_some());
        assert!(world.messenger.sent_types().contains(&MessageType::Cancel));
    }

    #[tokio::test]
    async fn csv_reclaims_when_the_peer_never_pays() {
        let world = fakes::test_world();
        let machine = started_machine(&world);
        machine.send_event(Event::SwapInStarted).await.unwrap();
        machine
            .send_event_with(Event::AgreementReceived, |data| {
                data.swap_in_agreement = Some(agreement(machine.id))
            })
            .await
            .unwrap();

        let done = machine.send_event(Event::CsvPassed).await.unwrap();

        assert!(done);
        let data = machine.data().await;
        assert_eq!(data.current_state, State::Done);
        assert!(data.claim_tx_id.is_some());
    }
}
