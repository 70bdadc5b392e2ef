//! Id construction helpers

use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Fresh ledger record id (`rec_…`). uuid7 keeps ids roughly
/// creation-ordered, which keeps sled key locality sane.
pub fn new_record_id() -> String {
    new_uuid_to_bech32("rec_").expect("static hrp is always valid")
}

/// Fresh actor id (`user_…`).
pub fn new_actor_id() -> String {
    new_uuid_to_bech32("user_").expect("static hrp is always valid")
}

/// Fresh submission-group id (`grp_…`).
pub fn new_group_id() -> String {
    new_uuid_to_bech32("grp_").expect("static hrp is always valid")
}
