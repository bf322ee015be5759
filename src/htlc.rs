//! The on-chain leg of a swap: a P2WSH output that pays the taker against the
//! invoice preimage and falls back to the maker after the CSV window.

use crate::PaymentHash;
use bitcoin::{
    blockdata::{
        opcodes,
        script::{Builder, Script},
    },
    hashes::{ripemd160, Hash},
    secp256k1::PublicKey,
};

/// Relative-timelock window after which the maker may reclaim the output.
pub const CSV_BLOCKS: u32 = 1008;

/// The witness script locking the opening output:
///
/// `OP_HASH160 <RIPEMD160(payment_hash)> OP_EQUAL
///  OP_IF <taker_pubkey> OP_ELSE <csv> OP_CSV OP_DROP <maker_pubkey> OP_ENDIF
///  OP_CHECKSIG`
pub fn opening_script(
    payment_hash: &PaymentHash,
    taker_pubkey: &PublicKey,
    maker_pubkey: &PublicKey,
    csv_blocks: u32,
) -> Script {
    let lock = ripemd160::Hash::hash(&payment_hash.as_raw()[..]);

    Builder::new()
        .push_opcode(opcodes::all::OP_HASH160)
        .push_slice(&lock.into_inner())
        .push_opcode(opcodes::all::OP_EQUAL)
        .push_opcode(opcodes::all::OP_IF)
        .push_slice(&taker_pubkey.serialize())
        .push_opcode(opcodes::all::OP_ELSE)
        .push_int(i64::from(csv_blocks))
        .push_opcode(opcodes::all::OP_CSV)
        .push_opcode(opcodes::all::OP_DROP)
        .push_slice(&maker_pubkey.serialize())
        .push_opcode(opcodes::all::OP_ENDIF)
        .push_opcode(opcodes::all::OP_CHECKSIG)
        .into_script()
}

/// The script-pubkey of the opening output.
pub fn opening_script_pubkey(
    payment_hash: &PaymentHash,
    taker_pubkey: &PublicKey,
    maker_pubkey: &PublicKey,
    csv_blocks: u32,
) -> Script {
    opening_script(payment_hash, taker_pubkey, maker_pubkey, csv_blocks).to_v0_p2wsh()
}
