//! Identifier helpers

use super::case::CaseKind;
use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Case ids read as `ulok1...` or `kplt1...` so the kind is visible in logs
/// and storage keys.
pub fn new_case_id(kind: &CaseKind) -> anyhow::Result<String> {
    new_uuid_to_bech32(kind.id_prefix())
}
