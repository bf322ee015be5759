use serde::{Deserialize, Serialize};

/// Where a swap currently sits on its way from creation to a terminal
/// disposition. Each role machine walks a subset of these.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
pub enum State {
    Created,
    AwaitingAgreement,
    AwaitingFeePayment,
    AwaitingOpeningTx,
    AwaitingConfirmation,
    AwaitingClaim,
    AwaitingClaimPayment,
    ClaimedPreimage,
    ClaimedCsv,
    ClaimedCoop,
    SendCancel,
    Canceled,
    Done,
}

impl State {
    /// Terminal states never transition again; their records are immutable.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::Canceled)
    }
}
