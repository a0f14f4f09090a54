//! Identifier helpers

use bech32::Bech32m;
use uuid7::uuid7;

pub const TRADE_PREFIX: &str = "trade_";
pub const ITEM_PREFIX: &str = "item_";
pub const USER_PREFIX: &str = "user_";
pub const NOTIFICATION_PREFIX: &str = "note_";

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Human readable part of an id produced by [`new_uuid_to_bech32`].
pub fn id_prefix(id: &str) -> Option<String> {
    let (hrp, _) = bech32::decode(id).ok()?;
    Some(hrp.to_lowercase())
}
