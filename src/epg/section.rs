//! MPEG-TS packet walking and PSI section reassembly.
//!
//! Layer 1 iterates 188-byte packets, recovering sync where needed and
//! skipping adaptation fields. Layer 2 keeps one partial section per PID and
//! delivers each completed section exactly once.

use std::collections::HashMap;

/// TS packet size in bytes.
pub const TS_PACKET_SIZE: usize = 188;

/// TS sync byte.
pub const SYNC_BYTE: u8 = 0x47;

/// Table-id range counted for diagnostics (ATSC PSIP block).
const DIAG_ATSC_RANGE: std::ops::RangeInclusive<u8> = 0xC7..=0xCF;
/// DVB EIT table-id range.
const DIAG_DVB_RANGE: std::ops::RangeInclusive<u8> = 0x4E..=0x6F;

#[derive(Debug)]
struct PartialSection {
    buf: Vec<u8>,
    /// `section_length + 3`, known once the first three bytes arrived.
    total: Option<usize>,
}

impl PartialSection {
    fn resolve_total(&mut self) {
        if self.total.is_none() && self.buf.len() >= 3 {
            let section_length = ((self.buf[1] as usize & 0x0F) << 8) | self.buf[2] as usize;
            self.total = Some(section_length + 3);
        }
    }
}

/// Demultiplexer turning a raw capture buffer into complete PSI sections.
#[derive(Debug, Default)]
pub struct TsDemux {
    partial: HashMap<u16, PartialSection>,
    /// Packets seen per PID, for diagnostics.
    pid_counts: HashMap<u16, u64>,
    /// Sections seen per interesting table id.
    table_counts: HashMap<u8, u64>,
    pub packets: u64,
    pub sections: u64,
}

impl TsDemux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a buffer of TS packets, invoking `on_section(pid, section)` for
    /// every completed section. The buffer need not start on a packet
    /// boundary; leading garbage is skipped until sync is found.
    pub fn feed<F: FnMut(u16, &[u8])>(&mut self, data: &[u8], mut on_section: F) {
        let mut offset = 0;

        while offset < data.len() && data[offset] != SYNC_BYTE {
            offset += 1;
        }

        while offset + TS_PACKET_SIZE <= data.len() {
            if data[offset] != SYNC_BYTE {
                // Lost sync, hunt for the next sync byte.
                offset += 1;
                while offset < data.len() && data[offset] != SYNC_BYTE {
                    offset += 1;
                }
                continue;
            }

            let packet = &data[offset..offset + TS_PACKET_SIZE];
            self.packets += 1;

            let pid = ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16;
            *self.pid_counts.entry(pid).or_insert(0) += 1;

            let pusi = packet[1] & 0x40 != 0;
            let afc = (packet[3] >> 4) & 0x03;

            let mut payload_start = 4;
            if afc & 0x02 != 0 {
                payload_start = 5 + packet[4] as usize;
            }
            if afc & 0x01 != 0 && payload_start < TS_PACKET_SIZE {
                self.handle_payload(pid, pusi, &packet[payload_start..], &mut on_section);
            }

            offset += TS_PACKET_SIZE;
        }
    }

    fn handle_payload<F: FnMut(u16, &[u8])>(
        &mut self,
        pid: u16,
        pusi: bool,
        payload: &[u8],
        on_section: &mut F,
    ) {
        if pusi {
            // A new unit start discards any partial section on this PID.
            self.partial.remove(&pid);

            if payload.is_empty() {
                return;
            }
            let pointer = payload[0] as usize;
            let start = pointer + 1;
            if start >= payload.len() {
                return;
            }

            let mut section = PartialSection {
                buf: payload[start..].to_vec(),
                total: None,
            };
            section.resolve_total();
            self.finish_or_park(pid, section, on_section);
        } else if let Some(mut section) = self.partial.remove(&pid) {
            section.buf.extend_from_slice(payload);
            section.resolve_total();
            self.finish_or_park(pid, section, on_section);
        }
    }

    fn finish_or_park<F: FnMut(u16, &[u8])>(
        &mut self,
        pid: u16,
        section: PartialSection,
        on_section: &mut F,
    ) {
        match section.total {
            Some(total) if section.buf.len() >= total => {
                let complete = &section.buf[..total];
                let table_id = complete[0];
                if table_id == 0xFF {
                    // Stuffing.
                    return;
                }
                if DIAG_ATSC_RANGE.contains(&table_id) || DIAG_DVB_RANGE.contains(&table_id) {
                    *self.table_counts.entry(table_id).or_insert(0) += 1;
                }
                self.sections += 1;
                on_section(pid, complete);
            }
            _ => {
                self.partial.insert(pid, section);
            }
        }
    }

    /// Most frequent PIDs, for scan diagnostics.
    pub fn top_pids(&self, n: usize) -> Vec<(u16, u64)> {
        let mut counts: Vec<(u16, u64)> = self.pid_counts.iter().map(|(&p, &c)| (p, c)).collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        counts.truncate(n);
        counts
    }

    /// Section counts per diagnostic table id.
    pub fn table_counts(&self) -> &HashMap<u8, u64> {
        &self.table_counts
    }
}
