//! XOR checksum for H02 messages
//!
//! The checksum covers fields 2..15 of the message split on `,`, `*` and `#`,
//! joined back with commas. The computed XOR is rendered as hex and those
//! hex digits are then read as a decimal number before comparing with the
//! transmitted field 15. The comparison is kept exactly like that for wire
//! compatibility, even though it is not a meaningful check.

/// Index of the transmitted checksum after splitting
const CHECKSUM_FIELD: usize = 15;

/// First field covered by the checksum
const FIRST_SUMMED_FIELD: usize = 2;

/// XOR of all bytes.
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &b| acc ^ b)
}

/// Split a message into the checksummed text and the transmitted value.
///
/// Returns `None` if the message has no checksum field.
pub fn checksummed_fields(raw: &str) -> Option<(String, String)> {
    let fields: Vec<&str> = raw.trim().split([',', '*', '#']).collect();
    if fields.len() <= CHECKSUM_FIELD {
        return None;
    }

    let summed = fields[FIRST_SUMMED_FIELD..CHECKSUM_FIELD].join(",");
    Some((summed, fields[CHECKSUM_FIELD].to_string()))
}

/// Verify the checksum of a raw message.
pub fn verify_checksum(raw: &str) -> bool {
    let Some((summed, transmitted)) = checksummed_fields(raw) else {
        return false;
    };

    let Some(expected) = leading_decimal(&transmitted) else {
        return false;
    };

    let computed = format!("{:x}", xor_checksum(summed.as_bytes()));
    leading_decimal(&computed) == Some(expected)
}

/// Parse the leading run of decimal digits, ignoring anything after it.
fn leading_decimal(s: &str) -> Option<u64> {
    let s = s.trim_start();
    let end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    s[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    // XOR over "4209950057,V1,...,456" is 0x03
    const SIGNED: &str = "*HQ,4209950057,V1,035522,A,1321.1457,N,10351.0798,E,000.00,000,240317,BFFFFBFF,456,3,0,0,6#";

    #[test]
    fn test_xor_checksum() {
        assert_eq!(xor_checksum(b""), 0);
        assert_eq!(xor_checksum(b"A"), 0x41);
        assert_eq!(xor_checksum(b"AA"), 0);
        assert_eq!(xor_checksum(b"AB"), 0x03);
    }

    #[test]
    fn test_checksummed_fields() {
        let (summed, transmitted) =
            checksummed_fields("*HQ,1,V1,a,b,c,d,e,f,g,h,i,j,k,l,m,n,o#").unwrap();
        assert_eq!(summed, "1,V1,a,b,c,d,e,f,g,h,i,j,k");
        assert_eq!(transmitted, "l");
        assert!(checksummed_fields("*HQ,4209950057,#").is_none());
    }

    #[test]
    fn test_valid_checksum_verifies() {
        assert!(verify_checksum(SIGNED));
        assert!(verify_checksum(&format!("  {}\r\n", SIGNED)));
    }

    #[test]
    fn test_flipped_character_fails() {
        // Change a digit inside the checksummed range (the phone number)
        let tampered = SIGNED.replacen("4209950057", "4209950058", 1);
        assert!(!verify_checksum(&tampered));
    }

    #[test]
    fn test_wrong_transmitted_value() {
        let wrong = SIGNED.replacen(",456,3,", ",456,4,", 1);
        assert!(!verify_checksum(&wrong));
    }

    #[test]
    fn test_missing_checksum_field() {
        assert!(!verify_checksum("*HQ,4209950057,#"));
        assert!(!verify_checksum(""));
    }

    #[test]
    fn test_leading_decimal() {
        assert_eq!(leading_decimal("62"), Some(62));
        assert_eq!(leading_decimal("1f"), Some(1));
        assert_eq!(leading_decimal("a3"), None);
        assert_eq!(leading_decimal(""), None);
    }
}
