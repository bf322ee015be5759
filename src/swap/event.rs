/// Everything that can advance a swap machine.
///
/// Events carry no payload; whatever context an event needs is written into
/// the swap's data record before the event is applied, under the same lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum Event {
    SwapOutStarted,
    SwapOutRequestReceived,
    SwapInStarted,
    SwapInRequestReceived,
    AgreementReceived,
    FeeInvoiceReceived,
    FeeInvoicePaid,
    OpeningTxBroadcasted,
    OpeningTxMessageReceived,
    TxConfirmed,
    CsvPassed,
    ClaimInvoicePaid,
    PreimageRevealed,
    CancelReceived,
    CoopCloseReceived,
    InvalidMessage,
    Timeout,
    ActionSucceeded,
    ActionFailed,
    Done,
    NoOp,
}
