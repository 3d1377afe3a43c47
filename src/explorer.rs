//! Offline schema discovery for unrecognised device-record types.
//!
//! Walks a record body in 2-byte steps and decodes every window in all
//! the ways it could plausibly be read (hex, integers, both float
//! endiannesses, epoch timestamp). Nearly all of the output is nonsense;
//! the point is to eyeball it next to a capture and find the columns that
//! make sense, then write a real decoder. Not built into releases.

use std::collections::BTreeMap;

use deku::DekuContainerRead;
use serde::Serialize;

use crate::records::{
    DEVICE_HEADER_LEN, DeviceHeader, RecordError, format_date, format_date_time, format_device_id,
    format_time, hex_data,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ExploredValue {
    Text(String),
    Int(u64),
    Float(f32),
}

/// Decode one device record (header included) into a flat field map keyed
/// by offset and interpretation.
pub fn explore_device(data: &[u8]) -> Result<BTreeMap<String, ExploredValue>, RecordError> {
    if data.len() < DEVICE_HEADER_LEN {
        return Err(RecordError::TruncatedHeader(data.len()));
    }
    let (_, header) = DeviceHeader::from_bytes((&data[..DEVICE_HEADER_LEN], 0))?;
    let dev_len = header.dev_len as usize;
    let remaining = data.len() - DEVICE_HEADER_LEN;
    if dev_len > remaining {
        return Err(RecordError::BodyOverrun {
            se_type: header.se_type,
            dev_len: header.dev_len,
            remaining,
        });
    }
    let body = &data[DEVICE_HEADER_LEN..DEVICE_HEADER_LEN + dev_len];

    let mut fields = BTreeMap::new();
    fields.insert(
        "devType".to_string(),
        ExploredValue::Text(format!("explore_{:#06x}", header.se_type)),
    );
    fields.insert(
        "seId".to_string(),
        ExploredValue::Text(format_device_id(header.se_id)),
    );
    fields.insert("devLen".to_string(), ExploredValue::Int(header.dev_len as u64));
    fields.insert("AllAsHex".to_string(), ExploredValue::Text(hex_data(body)));

    let mut have_date = false;
    for offset in (0..dev_len).step_by(2) {
        explore_at_offset(body, offset, &mut fields, &mut have_date);
    }
    Ok(fields)
}

/// Decode up to 4 bytes at `offset` every way they could be read.
fn explore_at_offset(
    body: &[u8],
    offset: usize,
    fields: &mut BTreeMap<String, ExploredValue>,
    have_date: &mut bool,
) {
    if offset < body.len() {
        fields.insert(
            format!("offset{offset:03}_1_hex1"),
            ExploredValue::Text(hex_data(&body[offset..offset + 1])),
        );
    }
    if offset + 2 <= body.len() {
        let window = &body[offset..offset + 2];
        fields.insert(
            format!("offset{offset:03}_1_hex2"),
            ExploredValue::Text(hex_data(window)),
        );
        fields.insert(
            format!("offset{offset:03}_4_int2"),
            ExploredValue::Int(u16::from_le_bytes([window[0], window[1]]) as u64),
        );
    }
    if offset + 4 <= body.len() {
        let window: [u8; 4] = body[offset..offset + 4].try_into().unwrap();
        fields.insert(
            format!("offset{offset:03}_1_hex4"),
            ExploredValue::Text(hex_data(&window)),
        );
        for (name, value) in [
            ("float_LE", f32::from_le_bytes(window)),
            ("float_BE", f32::from_be_bytes(window)),
        ] {
            // non-finite floats can't survive the JSON sink anyway
            if value.is_finite() {
                fields.insert(
                    format!("offset{offset:03}_3_{name}"),
                    ExploredValue::Float(value),
                );
            }
        }
        let int = u32::from_le_bytes(window);
        fields.insert(format!("offset{offset:03}_4_int4"), ExploredValue::Int(int as u64));
        fields.insert(
            format!("Date_offset{offset:03}"),
            ExploredValue::Text(format_date_time(int)),
        );
        if !*have_date {
            // other tooling expects Date and Time on every record; guess
            // that the first window is the real timestamp
            *have_date = true;
            fields.insert("Date".to_string(), ExploredValue::Text(format_date(int)));
            fields.insert("Time".to_string(), ExploredValue::Text(format_time(int)));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use deku::DekuContainerWrite;

    #[test]
    fn test_explore_unknown_record() {
        let mut data = DeviceHeader {
            se_type: 0x0082,
            se_id: 0x42,
            dev_len: 6,
        }
        .to_bytes()
        .unwrap();
        data.extend(1400000000u32.to_le_bytes());
        data.extend([0xaa, 0xbb]);

        let fields = explore_device(&data).unwrap();
        assert_eq!(
            fields["devType"],
            ExploredValue::Text("explore_0x0082".to_string())
        );
        assert_eq!(fields["seId"], ExploredValue::Text("42".to_string()));
        assert_eq!(fields["offset000_4_int4"], ExploredValue::Int(1400000000));
        assert_eq!(
            fields["offset004_1_hex2"],
            ExploredValue::Text("aa bb".to_string())
        );
        assert!(fields.contains_key("Date"));
        assert!(fields.contains_key("Time"));

        // the whole map survives the JSON sink
        serde_json::to_string(&fields).unwrap();
    }

    #[test]
    fn test_explore_rejects_overrun() {
        let data = DeviceHeader {
            se_type: 0x0082,
            se_id: 1,
            dev_len: 64,
        }
        .to_bytes()
        .unwrap();
        assert!(matches!(
            explore_device(&data),
            Err(RecordError::BodyOverrun { .. })
        ));
    }
}
