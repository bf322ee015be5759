use std::{path::PathBuf, time::Duration};

/// Local policy knobs for the swap engine.
///
/// Everything protocol-level (dust, CSV window, message tags) is fixed by the
/// wire format and lives next to the code that speaks it.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// Requests above this are rejected at admission.
    pub max_swap_amount_sat: u64,
    /// Flat premium charged on top of a swap-in.
    pub premium_sat: u64,
    /// How long to wait for the peer before cancelling a pending stage.
    pub timeout: Duration,
    pub data_dir: PathBuf,
}

impl Settings {
    pub fn new(data_dir: PathBuf) -> Self {
        Settings {
            data_dir,
            ..Default::default()
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            max_swap_amount_sat: 4_000_000,
            premium_sat: 0,
            timeout: Duration::from_secs(10 * 60),
            data_dir: PathBuf::from(".ballast"),
        }
    }
}
