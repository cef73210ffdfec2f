//! Archive file name rules.
//!
//! A Map archive is named `[seamId]_[sheetNumber][suffix].zip`. The sheet
//! number is six digits written either `XXXXXX` or `XX?XXXX` (one optional
//! non-digit separator after the first two digits) and must be followed by a
//! non-digit or the end of the name.

use maprelay_core::{RelayError, Result};

const EXPECTED_FORMAT: &str =
    "Expected format: [seamID]_[SheetNumber].zip (e.g. '16516_433857.zip' or '16516_43_3857.zip')";

/// A validated archive name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapFileName {
    /// Sanitized name, as stored
    pub name: String,
    /// Part before the first underscore
    pub seam_id: String,
    /// Six-digit sheet number, separators removed
    pub sheet_number: String,
}

/// Strip any directory components a client may have sent.
#[must_use]
pub fn sanitize(raw: &str) -> String {
    raw.rsplit(['/', '\\']).next().unwrap_or(raw).trim().to_string()
}

/// Sanitize and validate an uploaded file name.
///
/// # Errors
///
/// Returns `RelayError::Validation` describing what is wrong with the name.
///
/// # Examples
///
/// ```
/// use maprelay_jobs::filename::validate;
///
/// let name = validate("uploads/17836_26_9285_UpperHirst.zip").unwrap();
/// assert_eq!(name.name, "17836_26_9285_UpperHirst.zip");
/// assert_eq!(name.sheet_number, "269285");
/// assert!(validate("543858.zip").is_err());
/// ```
pub fn validate(raw: &str) -> Result<MapFileName> {
    let name = sanitize(raw);
    let Some(stem) = strip_zip_extension(&name) else {
        return Err(invalid(&name, "Only .zip archives are accepted."));
    };

    let Some((seam_id, sheet_part)) = stem.split_once('_') else {
        return Err(invalid(&name, "Missing mandatory underscore separator."));
    };
    if seam_id.is_empty() {
        return Err(invalid(&name, "Missing mandatory seam ID before underscore."));
    }
    if sheet_part.is_empty() {
        return Err(invalid(&name, "Missing sheet number after underscore."));
    }

    match sheet_number(sheet_part) {
        Some(sheet_number) => Ok(MapFileName {
            seam_id: seam_id.to_string(),
            sheet_number,
            name,
        }),
        None => Err(invalid(&name, &sheet_number_problem(sheet_part))),
    }
}

fn strip_zip_extension(name: &str) -> Option<&str> {
    let (stem, extension) = name.rsplit_once('.')?;
    extension.eq_ignore_ascii_case("zip").then_some(stem)
}

/// Leading sheet number of `part`, in either accepted layout.
fn sheet_number(part: &str) -> Option<String> {
    let bytes = part.as_bytes();
    let digits = |range: std::ops::Range<usize>| {
        bytes.get(range).is_some_and(|b| b.iter().all(u8::is_ascii_digit))
    };
    let ends_at = |i: usize| bytes.get(i).is_none_or(|b| !b.is_ascii_digit());

    if !digits(0..2) {
        return None;
    }
    // XX?XXXX with a separator
    if bytes.get(2).is_some_and(|b| !b.is_ascii_digit()) && digits(3..7) && ends_at(7) {
        return Some(format!("{}{}", &part[0..2], &part[3..7]));
    }
    // XXXXXX
    if digits(0..6) && ends_at(6) {
        return Some(part[0..6].to_string());
    }
    None
}

fn sheet_number_problem(part: &str) -> String {
    let digit_count = part.bytes().filter(u8::is_ascii_digit).count();
    if digit_count == 0 {
        "No digits found in sheet number part. Sheet number must be exactly 6 digits in format XXXXXX or XX_XXXX.".to_string()
    } else if digit_count != 6 {
        format!("Sheet number must be exactly 6 digits, found {digit_count} digits.")
    } else {
        "Sheet number format is incorrect. Expected 6 digits immediately after first underscore in format XXXXXX or XX_XXXX.".to_string()
    }
}

fn invalid(name: &str, problem: &str) -> RelayError {
    RelayError::Validation(format!(
        "Invalid filename format: '{name}'. {problem} {EXPECTED_FORMAT}"
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use maprelay_testing::properties::valid_map_name;
    use proptest::prelude::*;

    fn problem(raw: &str) -> String {
        validate(raw).unwrap_err().to_string()
    }

    #[test]
    fn accepts_both_sheet_layouts() {
        assert_eq!(validate("17836_26_9285_UpperHirst.zip").unwrap().sheet_number, "269285");
        assert_eq!(validate("16519_453858_.zip").unwrap().sheet_number, "453858");
        assert_eq!(validate("16516_433857.zip").unwrap().sheet_number, "433857");
        assert_eq!(validate("A1_43-3857.ZIP").unwrap().seam_id, "A1");
    }

    #[test]
    fn explains_each_rejection() {
        assert!(problem("543858.zip").contains("underscore separator"));
        assert!(problem("_453858_.zip").contains("seam ID"));
        assert!(problem("453858_.zip").contains("Missing sheet number"));
        assert!(problem("16519_45385_.zip").contains("found 5 digits"));
        assert!(problem("16519_sheet.zip").contains("No digits"));
        assert!(problem("16519_a453858.zip").contains("format is incorrect"));
        assert!(problem("16519_453858.tar").contains(".zip"));
    }

    #[test]
    fn seven_digits_are_not_a_sheet_number() {
        assert!(validate("16519_4538581.zip").is_err());
        assert!(validate("16519_45_38581.zip").is_err());
    }

    #[test]
    fn path_components_are_stripped() {
        assert_eq!(sanitize("../../etc/16516_433857.zip"), "16516_433857.zip");
        assert_eq!(sanitize("C:\\maps\\16516_433857.zip"), "16516_433857.zip");
        assert_eq!(validate("a/b/16516_433857.zip").unwrap().name, "16516_433857.zip");
    }

    proptest! {
        #[test]
        fn generated_names_validate(name in valid_map_name()) {
            prop_assert!(validate(&name).is_ok(), "{}", name);
        }
    }
}
