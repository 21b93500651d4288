//! Identifier generation and hashing helpers

use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique, time ordered id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Entity prefixes used for every id minted by the core.
pub mod prefix {
    pub const REQUEST: &str = "req_";
    pub const UPDATE: &str = "upd_";
    pub const ITEM: &str = "item_";
    pub const PAYMENT: &str = "pay_";
    pub const INVOICE: &str = "inv_";
    pub const NOTIFICATION: &str = "ntf_";
}

/// Same as [`new_uuid_to_bech32`] but reports failures in the core's error type.
/// Prefixes are fixed by the core, so a failure here is never the caller's.
pub fn new_id(hrp: &str) -> crate::error::CoreResult<String> {
    new_uuid_to_bech32(hrp)
        .map_err(|e| crate::error::CoreError::Unavailable(format!("id generation failed: {e}")))
}

/// Hex sha256 of a CBOR encoded record.
pub fn digest_of<T: minicbor::Encode<()>>(value: &T) -> crate::error::CoreResult<String> {
    let cbor = minicbor::to_vec(value)?;
    Ok(sha256::digest(&cbor))
}
