//! The maker of a swap-out: charges its opening cost up front as a fee
//! invoice, funds the opening output and is made whole when the taker pays
//! the claim invoice. The CSV window is the safety net if the taker never
//! does.

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
            E::SwapOutRequestReceived,
            S::AwaitingFeePayment,
            A::SendFeeInvoiceAgreement,
        ),
        transition(
            S::AwaitingFeePayment,
            E::FeeInvoicePaid,
            S::AwaitingOpeningTx,
            A::CreateAndBroadcastOpeningTx,
        ),
        transition(
            S::AwaitingFeePayment,
            E::ActionFailed,
            S::SendCancel,
            A::SendCancel,
        ),
        transition(S::AwaitingFeePayment, E::Timeout, S::SendCancel, A::SendCancel),
        transition(S::AwaitingFeePayment, E::CancelReceived, S::Canceled, A::NoOp),
        transition(
            S::AwaitingFeePayment,
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
