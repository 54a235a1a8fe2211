//! US phone number normalisation.

use crate::error::DomainError;

/// Normalise a North American number to `(XXX) XXX-XXXX`.
///
/// Non-digits are ignored; an 11-digit number with a leading `1` country code is
/// accepted.
pub fn format_phone_number(raw: &str) -> Result<String, DomainError> {
    let digits = national_digits(raw)?;
    Ok(format!("({}) {}-{}", &digits[0..3], &digits[3..6], &digits[6..10]))
}

/// E.164 form (`+1XXXXXXXXXX`) for dialing.
pub fn to_e164(raw: &str) -> Result<String, DomainError> {
    Ok(format!("+1{}", national_digits(raw)?))
}

fn national_digits(raw: &str) -> Result<String, DomainError> {
    let mut digits: String = raw.chars().filter(char::is_ascii_digit).collect();

    if digits.len() == 11 && digits.starts_with('1') {
        digits.remove(0);
    }

    if digits.len() != 10 {
        return Err(DomainError::validation(format!(
            "invalid phone number: expected 10 digits, got {}",
            digits.len()
        )));
    }
    Ok(digits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_common_inputs() {
        assert_eq!(format_phone_number("425-268-4016").unwrap(), "(425) 268-4016");
        assert_eq!(format_phone_number("+1 (425) 268 4016").unwrap(), "(425) 268-4016");
        assert_eq!(format_phone_number("4252684016").unwrap(), "(425) 268-4016");
    }

    #[test]
    fn rejects_wrong_lengths() {
        assert!(format_phone_number("268-4016").is_err());
        assert!(format_phone_number("2 425 268 4016").is_err());
        assert!(format_phone_number("").is_err());
    }

    #[test]
    fn dials_in_e164() {
        assert_eq!(to_e164("(425) 268-4016").unwrap(), "+14252684016");
    }
}
