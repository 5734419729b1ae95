//! Response Decoding
//!
//! Matches interpreter output against the acknowledgement expected for a
//! query and extracts the data bytes. Responses may come with or without
//! spaces, with the echo still present, or split over several lines.

use crate::dtc::{self, DtcRecord};
use crate::error::DecodeError;
use crate::pid::{PidCode, PidDefinition, Reading};
use std::collections::BTreeSet;

/// Answers that mean "the ECU had nothing to say"
const NO_DATA_MARKERS: &[&str] = &[
    "NO DATA",
    "STOPPED",
    "UNABLE TO CONNECT",
    "CAN ERROR",
    "BUS ERROR",
    "BUS BUSY",
    "FB ERROR",
    "DATA ERROR",
];

/// Decode a response to a PID query into a reading
pub fn decode(definition: &PidDefinition, raw_response: &str) -> Result<Reading, DecodeError> {
    let bytes = extract_payload(definition.code, definition.expected_bytes, raw_response)?;
    let measured = definition.formula.evaluate(&bytes)?;
    Ok(Reading::new(definition, bytes, measured))
}

/// Pull `expected` data bytes following the acknowledgement of `code`
pub fn extract_payload(
    code: PidCode,
    expected: usize,
    raw_response: &str,
) -> Result<Vec<u8>, DecodeError> {
    let text = normalize(raw_response)?;
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();

    let [ack_mode, ack_pid] = code.ack_prefix();
    let prefix = format!("{:02X}{:02X}", ack_mode, ack_pid);

    let start = find_prefix(&compact, &prefix).ok_or_else(|| {
        if compact.chars().all(|c| c.is_ascii_hexdigit()) {
            DecodeError::Malformed(format!("missing acknowledgement {} in '{}'", prefix, text))
        } else {
            DecodeError::Malformed(format!("non-hex response '{}'", text))
        }
    })?;

    let data = &compact[start + prefix.len()..];
    let wanted = expected * 2;
    let available = data
        .chars()
        .take(wanted)
        .take_while(|c| c.is_ascii_hexdigit())
        .count();

    if available < wanted {
        let had_non_hex = data.chars().take(wanted).any(|c| !c.is_ascii_hexdigit());
        return Err(DecodeError::Malformed(if had_non_hex {
            format!("non-hex data after {} in '{}'", prefix, text)
        } else {
            format!(
                "expected {} data bytes after {}, got {}",
                expected,
                prefix,
                available / 2
            )
        }));
    }

    parse_hex_bytes(&data[..wanted])
}

/// Upper-case, drop `SEARCHING...`, and map interpreter error words
fn normalize(raw_response: &str) -> Result<String, DecodeError> {
    let text = raw_response
        .to_ascii_uppercase()
        .replace("SEARCHING...", " ")
        .replace("BUS INIT: ...OK", " ")
        .trim()
        .to_string();

    if text.is_empty() || NO_DATA_MARKERS.iter().any(|m| text.contains(m)) {
        return Err(DecodeError::NoData);
    }
    if text == "?" {
        return Err(DecodeError::Malformed("command rejected by interpreter".to_string()));
    }
    Ok(text)
}

/// Find `prefix` aligned to a byte boundary of a hex run, falling back to
/// any offset (e.g. when a 3-digit CAN header precedes the data)
fn find_prefix(compact: &str, prefix: &str) -> Option<usize> {
    let bytes = compact.as_bytes();
    let mut run_start = 0;
    for (i, b) in bytes.iter().enumerate() {
        if !b.is_ascii_hexdigit() {
            run_start = i + 1;
            continue;
        }
        if (i - run_start) % 2 == 0 && compact[i..].starts_with(prefix) {
            return Some(i);
        }
    }
    compact.find(prefix)
}

fn parse_hex_bytes(hex: &str) -> Result<Vec<u8>, DecodeError> {
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| DecodeError::Malformed(format!("bad hex pair in '{}'", hex)))
        })
        .collect()
}

/// Bytes of each response line, with CAN segment markers (`0:`) and the
/// leading byte-count line removed
fn line_bytes(lines: &[String]) -> Result<Vec<Vec<u8>>, DecodeError> {
    let mut frames = Vec::new();
    for line in lines {
        let upper = line.trim().to_ascii_uppercase();
        if upper == "SEARCHING..." || upper.starts_with("BUS INIT") {
            continue;
        }
        let text = normalize(line)?;
        let body = match text.split_once(':') {
            Some((marker, rest)) if marker.trim().chars().all(|c| c.is_ascii_hexdigit()) => rest,
            _ => text.as_str(),
        };
        let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();

        // ISO-TP first-frame length header, e.g. "014"
        if frames.is_empty() && compact.len() == 3 && lines.len() > 1 {
            continue;
        }
        if compact.len() % 2 != 0 || !compact.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DecodeError::Malformed(format!("unexpected line '{}'", line)));
        }
        frames.push(parse_hex_bytes(&compact)?);
    }
    if frames.is_empty() {
        return Err(DecodeError::NoData);
    }
    Ok(frames)
}

/// Supported PIDs announced by a `01 xx` bitmap response (`xx` = 00, 20, ...)
/// and whether the next bitmap query is supported too
pub fn decode_supported_bitmap(base: u8, bitmap: &[u8]) -> (BTreeSet<PidCode>, bool) {
    let mut supported = BTreeSet::new();
    let mut next = false;
    for (byte_index, byte) in bitmap.iter().take(4).enumerate() {
        for bit in 0..8 {
            if byte & (0x80 >> bit) == 0 {
                continue;
            }
            let offset = byte_index * 8 + bit + 1;
            if offset == 32 {
                next = true;
            } else {
                supported.insert(PidCode::current(base.wrapping_add(offset as u8)));
            }
        }
    }
    (supported, next)
}

/// Reassemble the VIN from a `0902` response (CAN or legacy layout)
pub fn decode_vin_response(lines: &[String]) -> Result<String, DecodeError> {
    let frames = line_bytes(lines)?;
    let legacy = frames.len() > 1 && frames.iter().all(|f| f.starts_with(&[0x49, 0x02]));

    let payload: Vec<u8> = if legacy {
        // 49 02 <seq> + 4 bytes per frame
        frames
            .iter()
            .flat_map(|f| f.iter().skip(3).copied())
            .collect()
    } else {
        let joined: Vec<u8> = frames.concat();
        let start = joined
            .windows(2)
            .position(|w| w == [0x49, 0x02])
            .ok_or_else(|| DecodeError::Malformed("missing VIN acknowledgement 49 02".into()))?;
        let mut rest = &joined[start + 2..];
        if rest.len() > 17 && rest[0] == 0x01 {
            rest = &rest[1..];
        }
        rest.to_vec()
    };

    let chars: Vec<u8> = payload.into_iter().filter(|b| *b != 0).take(17).collect();
    if chars.len() < 17 {
        return Err(DecodeError::Malformed(format!(
            "VIN response carries {} characters",
            chars.len()
        )));
    }
    String::from_utf8(chars)
        .map_err(|_| DecodeError::Malformed("VIN is not ASCII".to_string()))
}

/// Parse a mode `03` response; a leading count byte (CAN) is detected by
/// the odd payload length
pub fn decode_dtc_response(lines: &[String], mil_active: bool) -> Result<Vec<DtcRecord>, DecodeError> {
    let frames = match line_bytes(lines) {
        Ok(frames) => frames,
        // some ECUs answer NO DATA when no code is stored
        Err(DecodeError::NoData) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut payloads: Vec<Vec<u8>> = Vec::new();
    for frame in frames {
        match frame.split_first() {
            Some((0x43, rest)) => payloads.push(rest.to_vec()),
            // continuation segment of a multi-frame answer
            Some(_) if !payloads.is_empty() => {
                if let Some(last) = payloads.last_mut() {
                    last.extend_from_slice(&frame);
                }
            }
            _ => {
                return Err(DecodeError::Malformed(
                    "missing DTC acknowledgement 43".to_string(),
                ))
            }
        }
    }

    let mut records = Vec::new();
    for payload in payloads {
        let pairs = if payload.len() % 2 == 1 { &payload[1..] } else { &payload[..] };
        for pair in pairs.chunks_exact(2) {
            let hex = format!("{:02X}{:02X}", pair[0], pair[1]);
            if let Some(record) = dtc::decode(&hex, mil_active)? {
                records.push(record);
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pid::PidRegistry;

    fn rpm() -> PidDefinition {
        PidRegistry::standard()
            .get(&PidCode::current(0x0C))
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_decode_with_and_without_spaces() {
        let def = rpm();
        let spaced = decode(&def, "41 0C 1A 2B").unwrap();
        let compact = decode(&def, "410C1A2B").unwrap();
        assert_eq!(spaced.raw_bytes, vec![0x1A, 0x2B]);
        assert_eq!(spaced.value, 1675.0);
        assert_eq!(compact.value, spaced.value);
    }

    #[test]
    fn test_decode_skips_echo_and_searching() {
        let def = rpm();
        let reading = decode(&def, "010C SEARCHING... 41 0C 0F A0").unwrap();
        assert_eq!(reading.value, 1000.0);
    }

    #[test]
    fn test_decode_takes_first_ecu() {
        let def = rpm();
        let reading = decode(&def, "41 0C 0F A0 41 0C 1F 40").unwrap();
        assert_eq!(reading.value, 1000.0);
    }

    #[test]
    fn test_decode_with_can_header() {
        let def = rpm();
        let reading = decode(&def, "7E8 04 41 0C 0F A0").unwrap();
        assert_eq!(reading.value, 1000.0);
    }

    #[test]
    fn test_no_data_variants() {
        let def = rpm();
        assert_eq!(decode(&def, "NO DATA"), Err(DecodeError::NoData));
        assert_eq!(decode(&def, "SEARCHING... STOPPED"), Err(DecodeError::NoData));
        assert_eq!(decode(&def, ""), Err(DecodeError::NoData));
        assert_eq!(decode(&def, "SEARCHING... UNABLE TO CONNECT"), Err(DecodeError::NoData));
    }

    #[test]
    fn test_malformed_variants() {
        let def = rpm();
        assert!(matches!(decode(&def, "41 0D 32"), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode(&def, "41 0C 1A"), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode(&def, "41 0C 1A ZZ"), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode(&def, "?"), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode(&def, "ELM327 v1.5"), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_supported_bitmap() {
        let (pids, next) = decode_supported_bitmap(0x00, &[0xBE, 0x3F, 0xA8, 0x13]);
        assert!(next);
        assert!(pids.contains(&PidCode::current(0x0C)));
        assert!(pids.contains(&PidCode::current(0x1F)));
        assert!(!pids.contains(&PidCode::current(0x02)));
        assert!(!pids.contains(&PidCode::current(0x20)));
        assert_eq!(pids.len(), 17);

        let (pids, next) = decode_supported_bitmap(0x20, &[0x80, 0, 0, 0]);
        assert!(!next);
        assert_eq!(pids.into_iter().collect::<Vec<_>>(), vec![PidCode::current(0x21)]);
    }

    #[test]
    fn test_vin_can_layout() {
        let lines: Vec<String> = [
            "014",
            "0: 49 02 01 31 48 47",
            "1: 43 4D 38 32 36 33 33",
            "2: 41 30 30 34 33 35 32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(decode_vin_response(&lines).unwrap(), "1HGCM82633A004352");
    }

    #[test]
    fn test_vin_legacy_layout() {
        let vin = b"1HGCM82633A004352";
        let mut padded = vec![0u8, 0, 0];
        padded.extend_from_slice(vin);
        let lines: Vec<String> = padded
            .chunks(4)
            .enumerate()
            .map(|(i, chunk)| {
                let data: Vec<String> = chunk.iter().map(|b| format!("{:02X}", b)).collect();
                format!("49 02 {:02X} {}", i + 1, data.join(" "))
            })
            .collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(decode_vin_response(&lines).unwrap(), "1HGCM82633A004352");
    }

    #[test]
    fn test_vin_too_short() {
        let lines = vec!["49 02 01 31 48 47".to_string()];
        assert!(matches!(decode_vin_response(&lines), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_dtc_response_can_layout() {
        let lines = vec!["43 02 01 33 01 71".to_string()];
        let records = decode_dtc_response(&lines, true).unwrap();
        let codes: Vec<_> = records.iter().map(|r| r.code.as_str()).collect();
        assert_eq!(codes, vec!["P0133", "P0171"]);
        assert!(records.iter().all(|r| r.mil_active));
    }

    #[test]
    fn test_dtc_response_legacy_layout_filters_padding() {
        let lines = vec!["43 01 33 42 00 00 00".to_string()];
        let records = decode_dtc_response(&lines, false).unwrap();
        let codes: Vec<_> = records.iter().map(|r| r.code.as_str()).collect();
        assert_eq!(codes, vec!["P0133", "C0200"]);
    }

    #[test]
    fn test_dtc_response_no_codes() {
        assert!(decode_dtc_response(&["43 00".to_string()], false).unwrap().is_empty());
        assert!(decode_dtc_response(&["NO DATA".to_string()], false).unwrap().is_empty());
    }

    async fn framed(reply: Vec<u8>) -> String {
        use crate::framer::Framer;
        use crate::mock::{Reply, ScriptedTransport};
        use std::time::Duration;

        let transport = ScriptedTransport::new(move |_| Reply::Raw(reply.clone()));
        let mut framer = Framer::new(Box::new(transport), Duration::from_millis(200));
        framer.open().await.unwrap();
        framer.send("010D").await.unwrap()
    }

    #[tokio::test]
    async fn test_invalid_utf8_payload_is_malformed() {
        let response = framed(b"41 0D \xFF\xFE".to_vec()).await;
        let speed = PidRegistry::standard()
            .get(&PidCode::current(0x0D))
            .cloned()
            .unwrap();
        assert!(matches!(
            decode(&speed, &response),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_line_noise_before_frame_is_skipped() {
        let response = framed(b"\xC3\x28\xE9 41 0D 32".to_vec()).await;
        let speed = PidRegistry::standard()
            .get(&PidCode::current(0x0D))
            .cloned()
            .unwrap();
        assert_eq!(decode(&speed, &response).unwrap().value, 50.0);
    }

    #[tokio::test]
    async fn test_non_ascii_only_response_is_malformed() {
        let response = framed("température".as_bytes().to_vec()).await;
        assert!(matches!(
            decode(&rpm(), &response),
            Err(DecodeError::Malformed(_))
        ));
    }
}
