#![warn(
    unused_extern_crates,
    missing_debug_implementations,
    rust_2018_idioms,
    clippy::cast_possible_truncation,
    clippy::fallible_impl_from
)]
#![forbid(unsafe_code)]

pub mod config;
pub mod database;
pub mod htlc;
pub mod messages;
mod secret;
pub mod swap;
mod swap_id;
pub mod timeout;
pub mod trace;

pub use self::{
    secret::{PaymentHash, Preimage},
    swap_id::SwapId,
};

use bitcoin::secp256k1::{All, Secp256k1};
use conquer_once::Lazy;

pub static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

pub const PROTOCOL_VERSION: u64 = 2;
