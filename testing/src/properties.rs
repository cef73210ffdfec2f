//! Proptest strategies for MapRelay inputs.

use proptest::prelude::*;

/// Archive names that pass validation: `{seam}_{sheet}{suffix}.zip`.
///
/// Sheet numbers are generated in both the `XXXXXX` and `XX?XXXX` forms.
pub fn valid_map_name() -> impl Strategy<Value = String> {
    let sheet = prop_oneof![
        "[0-9]{6}",
        ("[0-9]{2}", "[A-Za-z-]", "[0-9]{4}").prop_map(|(a, sep, b)| format!("{a}{sep}{b}")),
    ];
    ("[A-Za-z0-9]{1,8}", sheet, "(_[A-Za-z]{1,4})?")
        .prop_map(|(seam, sheet, suffix)| format!("{seam}_{sheet}{suffix}.zip"))
}

/// Non-empty archive contents.
pub fn archive_bytes() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..256)
}

/// Arbitrary webhook bodies, including empty ones.
pub fn webhook_body() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..512)
}
