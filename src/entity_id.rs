//! Entity ID codec
//!
//! NGSI-LD entity IDs on the virtual plane carry a URN namespace marker
//! (`urn:ngsi-ld:Sensor1`). The local plane uses the bare name as a topic
//! level (`Sensor1`).
//!
//! `to_long` passes through both the canonical marker and the legacy
//! `urn:ngsi:ld:` spelling, while `to_short` only strips the canonical one.
//! IDs with the legacy spelling therefore keep it in both directions.

/// Canonical NGSI-LD namespace marker
pub const NGSI_LD_MARKER: &str = "urn:ngsi-ld:";

/// Legacy marker spelling accepted on the local-to-virtual path
pub const LEGACY_MARKER: &str = "urn:ngsi:ld:";

/// Convert a virtual-plane entity ID to its local topic level
pub fn to_short(long_id: &str) -> &str {
    long_id.strip_prefix(NGSI_LD_MARKER).unwrap_or(long_id)
}

/// Convert a local topic level back to a virtual-plane entity ID
pub fn to_long(short_id: &str) -> String {
    if has_marker(short_id) {
        short_id.to_string()
    } else {
        format!("{}{}", NGSI_LD_MARKER, short_id)
    }
}

/// Check if an ID already carries a recognized namespace marker
pub fn has_marker(id: &str) -> bool {
    id.starts_with(NGSI_LD_MARKER) || id.starts_with(LEGACY_MARKER)
}
