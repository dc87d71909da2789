//! ATSC PSIP table decoding: VCT (lineup), EIT (schedule), ETT (descriptions).
//!
//! VCT entries map `(frequency, source_id)` to a virtual channel number;
//! EIT events are persisted under the mapped number when present, otherwise
//! under the raw source id.

use log::{debug, warn};

use crate::channels::ChannelSet;
use crate::epg::parser::SourceMap;
use crate::error::GatewayError;
use crate::store::{ProgramRow, ProgramStore};

/// Seconds between the GPS epoch (1980-01-06) and the Unix epoch.
pub const GPS_UNIX_OFFSET: i64 = 315_964_800;
/// GPS−UTC leap-second adjustment for the current era.
pub const GPS_UTC_LEAP_SECONDS: i64 = 18;

/// Convert ATSC GPS seconds to Unix milliseconds.
pub fn gps_to_unix_ms(gps: u32) -> i64 {
    (gps as i64 + GPS_UNIX_OFFSET - GPS_UTC_LEAP_SECONDS) * 1000
}

fn be16(hi: u8, lo: u8) -> u16 {
    ((hi as u16) << 8) | lo as u16
}

/// Decode the first string of a Multi-String Structure.
///
/// Layout: `num_strings`, then per string a 6-byte header (language, segment
/// count, compression, mode) followed by the byte count and the text.
pub fn decode_mss(data: &[u8]) -> String {
    if data.is_empty() || data[0] == 0 || data.len() < 8 {
        return String::new();
    }
    let len = data[7] as usize;
    let start = 8;
    let end = (start + len).min(data.len());
    let text = String::from_utf8_lossy(&data[start..end]);
    text.chars()
        .filter(|c| !c.is_control() || *c == '\t')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Parse a VCT section (table id 0xC8 terrestrial, 0xC9 cable) and update
/// the source map. Returns the number of entries mapped.
pub fn parse_vct(
    section: &[u8],
    frequency: &str,
    channels: &ChannelSet,
    map: &mut SourceMap,
) -> Result<usize, GatewayError> {
    if section.len() < 10 {
        return Err(GatewayError::Parse("vct section truncated"));
    }
    let num_channels = section[9] as usize;
    let mut offset = 10;
    let mut mapped = 0;

    for _ in 0..num_channels {
        if offset + 32 > section.len() {
            return Err(GatewayError::Parse("vct entry truncated"));
        }
        let entry = &section[offset..offset + 32];

        let major = ((entry[14] as u16 & 0x0F) << 6) | (entry[15] as u16 >> 2);
        let minor = ((entry[15] as u16 & 0x03) << 8) | entry[16] as u16;
        let vchannel = format!("{major}.{minor}");
        let program_number = be16(entry[24], entry[25]);
        let source_id = be16(entry[28], entry[29]);
        let descriptors_length = ((entry[30] as usize & 0x03) << 8) | entry[31] as usize;

        // Prefer an exact channel-collection match on this frequency, then
        // the program number, then a global number match; keep the raw
        // major.minor even when nothing matches.
        let resolved = channels
            .find(frequency, &vchannel)
            .or_else(|| channels.find_by_program(frequency, program_number))
            .or_else(|| channels.get(&vchannel))
            .map(|c| c.number.clone())
            .unwrap_or_else(|| vchannel.clone());

        debug!(
            "vct: {} source {} -> channel {} (program {})",
            frequency, source_id, resolved, program_number
        );
        map.insert((frequency.to_string(), source_id), resolved);
        mapped += 1;

        offset += 32 + descriptors_length;
    }

    Ok(mapped)
}

/// Parse an ATSC EIT section (table id 0xCB) and upsert its events.
/// Returns the number of rows written.
pub fn parse_eit(
    section: &[u8],
    frequency: &str,
    map: &SourceMap,
    store: &dyn ProgramStore,
) -> Result<usize, GatewayError> {
    if section.len() < 10 {
        return Err(GatewayError::Parse("eit section truncated"));
    }
    let source_id = be16(section[3], section[4]);
    let num_events = section[9] as usize;
    let channel = map
        .get(&(frequency.to_string(), source_id))
        .cloned()
        .unwrap_or_else(|| source_id.to_string());

    let mut offset = 10;
    let mut stored = 0;

    for _ in 0..num_events {
        if offset + 10 > section.len() {
            return Err(GatewayError::Parse("eit event truncated"));
        }
        let event_id = ((section[offset] as u16 & 0x3F) << 8) | section[offset + 1] as u16;
        let gps = u32::from_be_bytes([
            section[offset + 2],
            section[offset + 3],
            section[offset + 4],
            section[offset + 5],
        ]);
        let length_secs = ((section[offset + 6] as u32 & 0x0F) << 16)
            | ((section[offset + 7] as u32) << 8)
            | section[offset + 8] as u32;
        let title_length = section[offset + 9] as usize;

        let title_start = offset + 10;
        if title_start + title_length > section.len() {
            return Err(GatewayError::Parse("eit title truncated"));
        }
        let title = decode_mss(&section[title_start..title_start + title_length]);

        let mut pos = title_start + title_length;
        if pos + 2 > section.len() {
            return Err(GatewayError::Parse("eit descriptor length truncated"));
        }
        let descriptors_length =
            ((section[pos] as usize & 0x0F) << 8) | section[pos + 1] as usize;
        pos += 2 + descriptors_length;

        let start_time = gps_to_unix_ms(gps);
        let end_time = start_time + length_secs as i64 * 1000;

        if !title.is_empty() && start_time > 0 && end_time > start_time {
            let row = ProgramRow {
                frequency: frequency.to_string(),
                channel: channel.clone(),
                start_time,
                end_time,
                title,
                description: String::new(),
                event_id: Some(event_id as i64),
                source_id: Some(source_id as i64),
            };
            match store.upsert_program(&row) {
                Ok(()) => stored += 1,
                Err(e) => warn!("eit: upsert failed for {}/{}: {}", channel, start_time, e),
            }
        }

        offset = pos;
    }

    Ok(stored)
}

/// Parse an ATSC ETT section (table id 0xCC) and update the matching row's
/// description. Returns the number of rows updated; an ETT with no matching
/// EIT row is a no-op.
pub fn parse_ett(
    section: &[u8],
    frequency: &str,
    map: &SourceMap,
    store: &dyn ProgramStore,
) -> Result<usize, GatewayError> {
    if section.len() < 17 {
        return Err(GatewayError::Parse("ett section truncated"));
    }
    let etm_id = u32::from_be_bytes([section[9], section[10], section[11], section[12]]);
    let source_id = (etm_id >> 16) as u16;
    let event_id = ((etm_id >> 2) & 0x3FFF) as i64;

    // Channel ETMs (low bits 00) describe the channel itself, not an event.
    if etm_id & 0x03 != 0x02 {
        return Ok(0);
    }

    let body_end = section.len().saturating_sub(4);
    let description = decode_mss(&section[13..body_end]);
    if description.is_empty() {
        return Ok(0);
    }

    let channel = map
        .get(&(frequency.to_string(), source_id))
        .cloned()
        .unwrap_or_else(|| source_id.to_string());

    match store.update_description(frequency, &channel, event_id, &description) {
        Ok(n) => Ok(n),
        Err(e) => {
            warn!("ett: description update failed for {}: {}", channel, e);
            Ok(0)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use std::collections::HashMap;

    pub(crate) fn mss(text: &str) -> Vec<u8> {
        let mut v = vec![1u8];
        v.extend_from_slice(b"eng");
        v.push(1); // segments
        v.push(0); // compression
        v.push(0); // mode
        v.push(text.len() as u8);
        v.extend_from_slice(text.as_bytes());
        v
    }

    fn finish_section(mut s: Vec<u8>) -> Vec<u8> {
        s.extend_from_slice(&[0, 0, 0, 0]); // CRC placeholder
        let section_length = s.len() - 3;
        s[1] = 0xF0 | ((section_length >> 8) as u8 & 0x0F);
        s[2] = section_length as u8;
        s
    }

    pub(crate) fn vct_section(entries: &[(u16, u16, u16, u16)]) -> Vec<u8> {
        let mut s = vec![0xC8, 0, 0, 0x07, 0xE1, 0xC1, 0, 0, 0, entries.len() as u8];
        for &(major, minor, program, source) in entries {
            let mut e = [0xFFu8; 32];
            e[14] = 0xF0 | ((major >> 6) as u8 & 0x0F);
            e[15] = (((major & 0x3F) as u8) << 2) | ((minor >> 8) as u8 & 0x03);
            e[16] = minor as u8;
            e[24] = (program >> 8) as u8;
            e[25] = program as u8;
            e[28] = (source >> 8) as u8;
            e[29] = source as u8;
            e[30] = 0xFC; // no descriptors
            e[31] = 0x00;
            s.extend_from_slice(&e);
        }
        finish_section(s)
    }

    pub(crate) fn eit_section(source_id: u16, events: &[(u16, u32, u32, &str)]) -> Vec<u8> {
        let mut s = vec![
            0xCB,
            0,
            0,
            (source_id >> 8) as u8,
            source_id as u8,
            0xC1,
            0,
            0,
            0,
            events.len() as u8,
        ];
        for &(event_id, gps, duration, title) in events {
            let title_mss = mss(title);
            s.push(0xC0 | ((event_id >> 8) as u8 & 0x3F));
            s.push(event_id as u8);
            s.extend_from_slice(&gps.to_be_bytes());
            s.push(0xF0 | ((duration >> 16) as u8 & 0x0F));
            s.push((duration >> 8) as u8);
            s.push(duration as u8);
            s.push(title_mss.len() as u8);
            s.extend_from_slice(&title_mss);
            s.extend_from_slice(&[0xF0, 0x00]); // empty descriptor loop
        }
        finish_section(s)
    }

    pub(crate) fn ett_section(source_id: u16, event_id: u16, text: &str) -> Vec<u8> {
        let etm_id = ((source_id as u32) << 16) | ((event_id as u32) << 2) | 0x02;
        let mut s = vec![0xCC, 0, 0, 0, 0, 0xC1, 0, 0, 0];
        s.extend_from_slice(&etm_id.to_be_bytes());
        s.extend_from_slice(&mss(text));
        finish_section(s)
    }

    const FREQ: &str = "500000000";

    #[test]
    fn test_gps_round_trip_law() {
        let gps: u32 = 1_400_000_000;
        assert_eq!(gps_to_unix_ms(gps), (gps as i64 + 315_964_800 - 18) * 1000);
    }

    #[test]
    fn test_decode_mss_strips_control_chars() {
        let raw = mss("News\u{0007} at\tTen ");
        assert_eq!(decode_mss(&raw), "News at\tTen");
        assert_eq!(decode_mss(&[]), "");
        assert_eq!(decode_mss(&[0]), "");
    }

    #[test]
    fn test_vct_maps_source_with_channel_preference() {
        let channels = ChannelSet::parse(
            "[KTVU]\nSERVICE_ID = 3\nVCHANNEL = 15.1\nFREQUENCY = 500000000\n",
        );
        let mut map: SourceMap = HashMap::new();

        let section = vct_section(&[(15, 1, 3, 7), (99, 9, 60, 8)]);
        let mapped = parse_vct(&section, FREQ, &channels, &mut map).unwrap();
        assert_eq!(mapped, 2);

        // Known channel resolves to its configured number.
        assert_eq!(map.get(&(FREQ.to_string(), 7)).unwrap(), "15.1");
        // Unknown channel keeps the raw major.minor.
        assert_eq!(map.get(&(FREQ.to_string(), 8)).unwrap(), "99.9");
    }

    #[test]
    fn test_vct_program_number_fallback() {
        // VCHANNEL differs from the broadcast major.minor; the program
        // number match still resolves to the configured number.
        let channels = ChannelSet::parse(
            "[KTVU]\nSERVICE_ID = 3\nVCHANNEL = 2.1\nFREQUENCY = 500000000\n",
        );
        let mut map: SourceMap = HashMap::new();
        parse_vct(&vct_section(&[(15, 1, 3, 7)]), FREQ, &channels, &mut map).unwrap();
        assert_eq!(map.get(&(FREQ.to_string(), 7)).unwrap(), "2.1");
    }

    #[test]
    fn test_eit_event_persisted_under_mapped_channel() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut map: SourceMap = HashMap::new();
        map.insert((FREQ.to_string(), 7), "15.1".to_string());

        let gps: u32 = 1_400_000_000;
        let stored = parse_eit(
            &eit_section(7, &[(0x101, gps, 1800, "News")]),
            FREQ,
            &map,
            &store,
        )
        .unwrap();
        assert_eq!(stored, 1);

        let rows = store.select_active(0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].channel, "15.1");
        assert_eq!(rows[0].title, "News");
        assert_eq!(rows[0].start_time, gps_to_unix_ms(gps));
        assert_eq!(rows[0].end_time, gps_to_unix_ms(gps) + 1_800_000);
        assert_eq!(rows[0].event_id, Some(0x101));
        assert_eq!(rows[0].source_id, Some(7));
    }

    #[test]
    fn test_eit_unmapped_source_uses_raw_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        let map: SourceMap = HashMap::new();
        parse_eit(
            &eit_section(42, &[(1, 1_400_000_000, 600, "Show")]),
            FREQ,
            &map,
            &store,
        )
        .unwrap();
        assert_eq!(store.select_active(0).unwrap()[0].channel, "42");
    }

    #[test]
    fn test_eit_skips_untitled_events() {
        let store = SqliteStore::open_in_memory().unwrap();
        let map: SourceMap = HashMap::new();
        let stored = parse_eit(
            &eit_section(7, &[(1, 1_400_000_000, 600, "")]),
            FREQ,
            &map,
            &store,
        )
        .unwrap();
        assert_eq!(stored, 0);
        assert!(store.select_active(0).unwrap().is_empty());
    }

    #[test]
    fn test_ett_updates_matching_event_only() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut map: SourceMap = HashMap::new();
        map.insert((FREQ.to_string(), 7), "15.1".to_string());

        parse_eit(
            &eit_section(7, &[(0x101, 1_400_000_000, 1800, "News")]),
            FREQ,
            &map,
            &store,
        )
        .unwrap();

        // Matching event gets its description.
        let n = parse_ett(
            &ett_section(7, 0x101, "Local headlines."),
            FREQ,
            &map,
            &store,
        )
        .unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.select_active(0).unwrap()[0].description, "Local headlines.");

        // An ETT for an unknown event is a no-op.
        let n = parse_ett(&ett_section(7, 0x3FF, "orphan"), FREQ, &map, &store).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_truncated_sections_rejected() {
        let channels = ChannelSet::parse("");
        let mut map: SourceMap = HashMap::new();
        let store = SqliteStore::open_in_memory().unwrap();

        assert!(parse_vct(&[0xC8, 0, 0], FREQ, &channels, &mut map).is_err());
        assert!(parse_eit(&[0xCB, 0, 0], FREQ, &map, &store).is_err());
        assert!(parse_ett(&[0xCC, 0, 0], FREQ, &map, &store).is_err());

        // Claimed events beyond the section end.
        let mut bad = vec![0xCB, 0xF0, 0x08, 0, 7, 0xC1, 0, 0, 0, 3];
        bad.extend_from_slice(&[0; 4]);
        assert!(parse_eit(&bad, FREQ, &map, &store).is_err());
    }
}
