//! VIN Decoding (ISO 3779)
//!
//! Positions (1-based): 1-3 WMI, 4-8 vehicle descriptor, 9 check digit,
//! 10 model year, 11 plant, 12-17 serial. Checksum failures are reported
//! through [`VinRecord::valid`]; the positional fields are still extracted.

use serde::{Deserialize, Serialize};

/// VIN length
pub const VIN_LENGTH: usize = 17;

/// Position weights for the check digit
const WEIGHTS: [u32; VIN_LENGTH] = [8, 7, 6, 5, 4, 3, 2, 10, 0, 9, 8, 7, 6, 5, 4, 3, 2];

/// Index of the check digit
const CHECK_INDEX: usize = 8;

/// Result of decoding a VIN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VinRecord {
    pub raw: String,
    pub valid: bool,
    /// World manufacturer identifier (positions 1-3)
    pub wmi: String,
    /// Vehicle descriptor section (positions 4-8)
    pub vds: String,
    pub manufacturer: Option<String>,
    pub country: Option<String>,
    pub model_year: Option<u16>,
    pub plant: Option<char>,
    pub serial: String,
    pub error: Option<String>,
}

impl VinRecord {
    fn invalid(raw: String, error: String) -> Self {
        Self {
            raw,
            valid: false,
            wmi: String::new(),
            vds: String::new(),
            manufacturer: None,
            country: None,
            model_year: None,
            plant: None,
            serial: String::new(),
            error: Some(error),
        }
    }
}

/// Numeric value of a VIN character; `None` for I, O, Q and non-alphanumerics
pub fn transliterate(c: char) -> Option<u32> {
    match c {
        '0'..='9' => c.to_digit(10),
        'A' | 'J' => Some(1),
        'B' | 'K' | 'S' => Some(2),
        'C' | 'L' | 'T' => Some(3),
        'D' | 'M' | 'U' => Some(4),
        'E' | 'N' | 'V' => Some(5),
        'F' | 'W' => Some(6),
        'G' | 'P' | 'X' => Some(7),
        'H' | 'Y' => Some(8),
        'R' | 'Z' => Some(9),
        _ => None,
    }
}

/// Expected check character for a 17-character VIN, `None` if it contains
/// characters outside the VIN alphabet
pub fn check_digit(vin: &str) -> Option<char> {
    let chars: Vec<char> = vin.chars().collect();
    if chars.len() != VIN_LENGTH {
        return None;
    }

    let mut sum = 0;
    for (c, weight) in chars.iter().zip(WEIGHTS.iter()) {
        sum += transliterate(*c)? * weight;
    }

    Some(match sum % 11 {
        10 => 'X',
        // remainder < 10
        r => char::from_digit(r, 10).unwrap_or('0'),
    })
}

/// Decode a VIN; never fails, problems are reported in the record
pub fn decode(vin: &str) -> VinRecord {
    let raw = vin.trim().to_ascii_uppercase();
    let chars: Vec<char> = raw.chars().collect();

    if chars.len() != VIN_LENGTH {
        let error = format!("VIN must be {} characters, got {}", VIN_LENGTH, chars.len());
        return VinRecord::invalid(raw, error);
    }

    let wmi: String = chars[..3].iter().collect();
    let vds: String = chars[3..CHECK_INDEX].iter().collect();
    let serial: String = chars[11..].iter().collect();

    let error = match chars.iter().position(|c| transliterate(*c).is_none()) {
        Some(index) => Some(format!(
            "invalid character '{}' at position {}",
            chars[index],
            index + 1
        )),
        None => match check_digit(&raw) {
            Some(expected) if expected == chars[CHECK_INDEX] => None,
            Some(expected) => Some(format!(
                "check digit mismatch: expected '{}', found '{}'",
                expected, chars[CHECK_INDEX]
            )),
            None => Some("check digit could not be computed".to_string()),
        },
    };

    VinRecord {
        valid: error.is_none(),
        manufacturer: manufacturer(&wmi).map(str::to_string),
        country: country(chars[0], chars[1]).map(str::to_string),
        model_year: model_year(chars[9], chars[6]),
        plant: Some(chars[10]),
        wmi,
        vds,
        serial,
        error,
        raw,
    }
}

/// Model year from position 10. Position 7 disambiguates the 30-year cycle:
/// a digit there means 1980-2009, a letter 2010-2039.
pub fn model_year(code: char, position_seven: char) -> Option<u16> {
    const CYCLE: &str = "ABCDEFGHJKLMNPRSTVWXY123456789";
    let offset = CYCLE.chars().position(|c| c == code)? as u16;
    let base = if position_seven.is_ascii_digit() { 1980 } else { 2010 };
    Some(base + offset)
}

fn country(first: char, second: char) -> Option<&'static str> {
    Some(match first {
        '1' | '4' | '5' => "United States",
        '2' => "Canada",
        '3' => "Mexico",
        '6' => "Australia",
        '9' => "Brazil",
        'J' => "Japan",
        'K' => "South Korea",
        'L' => "China",
        'S' => "United Kingdom",
        'T' => match second {
            'A'..='H' => "Switzerland",
            'J'..='P' => "Czech Republic",
            'R'..='V' => "Hungary",
            _ => return None,
        },
        'V' => match second {
            'A'..='E' => "Austria",
            'F'..='R' => "France",
            'S'..='W' => "Spain",
            _ => return None,
        },
        'W' => "Germany",
        'Y' => match second {
            'A'..='E' => "Belgium",
            'F'..='K' => "Finland",
            'S'..='W' => "Sweden",
            _ => return None,
        },
        'Z' => "Italy",
        _ => return None,
    })
}

fn manufacturer(wmi: &str) -> Option<&'static str> {
    let exact = match wmi {
        "1HG" | "2HG" | "JHM" => Some("Honda"),
        "1FA" | "1FT" | "1FM" | "WF0" => Some("Ford"),
        "1G1" => Some("Chevrolet"),
        "1M8" => Some("Motor Coach Industries"),
        "1N4" | "JN1" => Some("Nissan"),
        "4T1" | "JT2" | "JTD" => Some("Toyota"),
        "5YJ" => Some("Tesla"),
        "KMH" => Some("Hyundai"),
        "KNA" => Some("Kia"),
        "SAJ" => Some("Jaguar"),
        "SAL" => Some("Land Rover"),
        "TMB" => Some("Skoda"),
        "VF1" => Some("Renault"),
        "VF3" => Some("Peugeot"),
        "VSS" => Some("SEAT"),
        "W0L" => Some("Opel"),
        "WAU" => Some("Audi"),
        "WBA" | "WBS" => Some("BMW"),
        "WDB" | "WDD" => Some("Mercedes-Benz"),
        "WP0" => Some("Porsche"),
        "3VW" | "WVW" | "WVG" => Some("Volkswagen"),
        "YV1" => Some("Volvo"),
        "ZAR" => Some("Alfa Romeo"),
        "ZFA" => Some("Fiat"),
        _ => None,
    };
    exact.or_else(|| match wmi.get(..2)? {
        "1G" => Some("General Motors"),
        "JT" => Some("Toyota"),
        "WV" => Some("Volkswagen"),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_valid_vin() {
        let record = decode("1HGCM82633A004352");
        assert!(record.valid, "{:?}", record.error);
        assert_eq!(record.wmi, "1HG");
        assert_eq!(record.manufacturer.as_deref(), Some("Honda"));
        assert_eq!(record.country.as_deref(), Some("United States"));
        assert_eq!(record.model_year, Some(2003));
        assert_eq!(record.plant, Some('A'));
        assert_eq!(record.serial, "004352");
    }

    #[test]
    fn test_check_digit_x() {
        let record = decode("1m8gdm9axkp042788");
        assert!(record.valid);
        assert_eq!(record.raw, "1M8GDM9AXKP042788");
        assert_eq!(record.model_year, Some(1989));
    }

    #[test]
    fn test_letter_in_position_seven_selects_newer_cycle() {
        assert_eq!(model_year('H', 'E'), Some(2017));
        assert_eq!(model_year('H', '2'), Some(1987));
        assert_eq!(model_year('U', '2'), None);
    }

    #[test]
    fn test_checksum_mismatch_keeps_fields() {
        let record = decode("1HGCM82643A004352");
        assert!(!record.valid);
        assert!(record.error.as_deref().unwrap().contains("check digit"));
        assert_eq!(record.wmi, "1HG");
        assert_eq!(record.model_year, Some(2003));
        assert_eq!(record.serial, "004352");
    }

    #[test]
    fn test_wrong_length() {
        let record = decode("1HGCM8263");
        assert!(!record.valid);
        assert!(record.wmi.is_empty());
        assert!(record.error.unwrap().contains("17"));
    }

    #[test]
    fn test_disallowed_letters() {
        let record = decode("1HGCM8263IA004352");
        assert!(!record.valid);
        assert!(record.error.unwrap().contains("'I'"));
        assert_eq!(record.manufacturer.as_deref(), Some("Honda"));
    }

    const ALPHABET: &str = "ABCDEFGHJKLMNPRSTUVWXYZ0123456789";

    fn with_check_digit(body: &str) -> String {
        let mut chars: Vec<char> = body.chars().collect();
        chars.insert(CHECK_INDEX, '0');
        let draft: String = chars.iter().collect();
        chars[CHECK_INDEX] = check_digit(&draft).unwrap();
        chars.into_iter().collect()
    }

    fn fields(r: &VinRecord) -> (String, String, Option<u16>, Option<char>, String) {
        (r.wmi.clone(), r.vds.clone(), r.model_year, r.plant, r.serial.clone())
    }

    proptest! {
        #[test]
        fn prop_computed_check_digit_validates(body in "[A-HJ-NPR-Z0-9]{16}") {
            let vin = with_check_digit(&body);
            prop_assert!(decode(&vin).valid);
        }

        #[test]
        fn prop_single_flip_never_valid_and_unchanged(
            body in "[A-HJ-NPR-Z0-9]{16}",
            index in (0usize..VIN_LENGTH).prop_filter("not the check digit", |i| *i != CHECK_INDEX),
            pick in 0usize..ALPHABET.len(),
        ) {
            let vin = with_check_digit(&body);
            let mut chars: Vec<char> = vin.chars().collect();
            let replacement = ALPHABET.chars().nth(pick).unwrap();
            prop_assume!(chars[index] != replacement);
            chars[index] = replacement;
            let flipped: String = chars.into_iter().collect();

            let original = decode(&vin);
            let mutated = decode(&flipped);
            prop_assert!(!(mutated.valid && fields(&mutated) == fields(&original)));
        }
    }
}
