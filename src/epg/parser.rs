//! Table dispatch over a captured transport stream.
//!
//! Completed sections are routed by table id to the ATSC and DVB decoders.
//! A section that fails to parse is logged and skipped; the rest of the
//! capture is still processed.

use std::collections::HashMap;

use log::{debug, info};

use crate::channels::ChannelSet;
use crate::epg::section::TsDemux;
use crate::epg::{atsc, dvb};
use crate::store::ProgramStore;

/// `(frequency, source_id)` → virtual channel number, populated only by VCT
/// parsing. Shared across every frequency of a scan run.
pub type SourceMap = HashMap<(String, u16), String>;

/// Aggregate result of parsing one captured buffer.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParseOutcome {
    pub packets: u64,
    pub sections: u64,
    pub programs: usize,
    pub descriptions: usize,
    pub errors: usize,
}

/// Parse a captured byte buffer for one frequency, writing program rows
/// through the store. Parsing is idempotent with respect to the store.
pub fn parse_capture(
    data: &[u8],
    frequency: &str,
    channels: &ChannelSet,
    map: &mut SourceMap,
    store: &dyn ProgramStore,
) -> ParseOutcome {
    let mut demux = TsDemux::new();
    let mut outcome = ParseOutcome::default();

    demux.feed(data, |_pid, section| {
        let table_id = section[0];
        let result = match table_id {
            0xC8 | 0xC9 => atsc::parse_vct(section, frequency, channels, map).map(|_| (0, 0)),
            0xCB => atsc::parse_eit(section, frequency, map, store).map(|n| (n, 0)),
            0xCC => atsc::parse_ett(section, frequency, map, store).map(|n| (0, n)),
            0x4E..=0x6F => dvb::parse_eit(section, frequency, channels, store).map(|n| (n, 0)),
            _ => Ok((0, 0)),
        };
        match result {
            Ok((programs, descriptions)) => {
                outcome.programs += programs;
                outcome.descriptions += descriptions;
            }
            Err(e) => {
                debug!("epg: table 0x{:02X} section skipped: {}", table_id, e);
                outcome.errors += 1;
            }
        }
    });

    outcome.packets = demux.packets;
    outcome.sections = demux.sections;

    info!(
        "epg: {} -> {} packets, {} sections, {} programs, {} descriptions ({} errors)",
        frequency,
        outcome.packets,
        outcome.sections,
        outcome.programs,
        outcome.descriptions,
        outcome.errors
    );
    if !demux.table_counts().is_empty() {
        debug!(
            "epg: {} table counts {:?}, top pids {:?}",
            frequency,
            demux.table_counts(),
            demux.top_pids(5)
        );
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epg::atsc::tests::{eit_section, ett_section, vct_section};
    use crate::epg::dvb::tests::dvb_eit_section;
    use crate::epg::section::{SYNC_BYTE, TS_PACKET_SIZE};
    use crate::store::{ProgramStore, SqliteStore};

    const FREQ: &str = "500000000";
    const EIT_PID: u16 = 0x1DD0;

    fn make_packet(pid: u16, pusi: bool, payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0xFFu8; TS_PACKET_SIZE];
        pkt[0] = SYNC_BYTE;
        pkt[1] = ((pid >> 8) as u8 & 0x1F) | if pusi { 0x40 } else { 0x00 };
        pkt[2] = pid as u8;
        pkt[3] = 0x10;
        pkt[4..4 + payload.len()].copy_from_slice(payload);
        pkt
    }

    /// Wrap a section into one or more TS packets on the given PID.
    fn packetize(pid: u16, section: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let room = TS_PACKET_SIZE - 4 - 1; // pointer byte
        let take = section.len().min(room);
        let mut first = vec![0u8];
        first.extend_from_slice(&section[..take]);
        out.extend_from_slice(&make_packet(pid, true, &first));

        let mut offset = take;
        while offset < section.len() {
            let take = (section.len() - offset).min(TS_PACKET_SIZE - 4);
            out.extend_from_slice(&make_packet(pid, false, &section[offset..offset + take]));
            offset += take;
        }
        out
    }

    fn channels() -> ChannelSet {
        ChannelSet::parse("[KTVU]\nSERVICE_ID = 3\nVCHANNEL = 15.1\nFREQUENCY = 500000000\n")
    }

    #[test]
    fn test_vct_then_eit_maps_channel() {
        let store = SqliteStore::open_in_memory().unwrap();
        let channels = channels();
        let mut map = SourceMap::new();

        let gps: u32 = 1_400_000_000;
        let mut capture = packetize(0x1FFB, &vct_section(&[(15, 1, 3, 7)]));
        capture.extend_from_slice(&packetize(
            EIT_PID,
            &eit_section(7, &[(0x101, gps, 1800, "News")]),
        ));

        let outcome = parse_capture(&capture, FREQ, &channels, &mut map, &store);
        assert_eq!(outcome.programs, 1);
        assert_eq!(outcome.errors, 0);

        let rows = store.select_active(0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].channel, "15.1");
        assert_eq!(rows[0].start_time, atsc::gps_to_unix_ms(gps));
    }

    #[test]
    fn test_ett_after_eit_sets_description() {
        let store = SqliteStore::open_in_memory().unwrap();
        let channels = channels();
        let mut map = SourceMap::new();

        let mut capture = packetize(0x1FFB, &vct_section(&[(15, 1, 3, 7)]));
        capture.extend_from_slice(&packetize(
            EIT_PID,
            &eit_section(7, &[(0x101, 1_400_000_000, 1800, "News")]),
        ));
        capture.extend_from_slice(&packetize(
            0x1DD1,
            &ett_section(7, 0x101, "Local headlines."),
        ));

        let outcome = parse_capture(&capture, FREQ, &channels, &mut map, &store);
        assert_eq!(outcome.programs, 1);
        assert_eq!(outcome.descriptions, 1);
        assert_eq!(store.select_active(0).unwrap()[0].description, "Local headlines.");
    }

    #[test]
    fn test_dvb_sections_dispatched() {
        let store = SqliteStore::open_in_memory().unwrap();
        let channels = ChannelSet::parse("");
        let mut map = SourceMap::new();

        let capture = packetize(
            0x12,
            &dvb_eit_section(1201, 1_772_368_496, 3600, "Panorama", "Current affairs."),
        );
        let outcome = parse_capture(&capture, "618000000", &channels, &mut map, &store);
        assert_eq!(outcome.programs, 1);
        assert_eq!(store.select_active(0).unwrap()[0].title, "Panorama");
    }

    #[test]
    fn test_reparse_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let channels = channels();
        let mut map = SourceMap::new();

        let mut capture = packetize(0x1FFB, &vct_section(&[(15, 1, 3, 7)]));
        capture.extend_from_slice(&packetize(
            EIT_PID,
            &eit_section(7, &[(0x101, 1_400_000_000, 1800, "News")]),
        ));
        capture.extend_from_slice(&packetize(
            0x1DD1,
            &ett_section(7, 0x101, "Local headlines."),
        ));

        parse_capture(&capture, FREQ, &channels, &mut map, &store);
        let first = store.select_active(0).unwrap();

        parse_capture(&capture, FREQ, &channels, &mut map, &store);
        let second = store.select_active(0).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_bad_section_does_not_stop_parsing() {
        let store = SqliteStore::open_in_memory().unwrap();
        let channels = channels();
        let mut map = SourceMap::new();

        // A structurally valid section that claims more events than it has,
        // followed by a good one.
        let mut bad = vec![0xCB, 0xF0, 0x0B, 0x00, 0x07, 0xC1, 0, 0, 0, 9];
        bad.extend_from_slice(&[0, 0, 0, 0]);
        let mut capture = packetize(EIT_PID, &bad);
        capture.extend_from_slice(&packetize(0x1FFB, &vct_section(&[(15, 1, 3, 7)])));
        capture.extend_from_slice(&packetize(
            EIT_PID,
            &eit_section(7, &[(0x101, 1_400_000_000, 1800, "News")]),
        ));

        let outcome = parse_capture(&capture, FREQ, &channels, &mut map, &store);
        assert_eq!(outcome.errors, 1);
        assert_eq!(outcome.programs, 1);
    }

    #[test]
    fn test_source_map_survives_across_buffers() {
        let store = SqliteStore::open_in_memory().unwrap();
        let channels = channels();
        let mut map = SourceMap::new();

        parse_capture(
            &packetize(0x1FFB, &vct_section(&[(15, 1, 3, 7)])),
            FREQ,
            &channels,
            &mut map,
            &store,
        );
        // The EIT arrives in a later capture of the same run.
        parse_capture(
            &packetize(EIT_PID, &eit_section(7, &[(1, 1_400_000_000, 600, "Late")])),
            FREQ,
            &channels,
            &mut map,
            &store,
        );

        assert_eq!(store.select_active(0).unwrap()[0].channel, "15.1");
    }
}
