//! Channels-config parsing and the immutable channel collection.
//!
//! The config file is INI-like: a `[Name]` section per service with
//! `SERVICE_ID`, `VCHANNEL` and `FREQUENCY` keys. Duplicate section names are
//! permitted; the tuning key is always `VCHANNEL`, never the name.

use std::fs;
use std::io;
use std::path::Path;

use log::{info, warn};

/// A tunable virtual service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    /// Stable virtual channel number, e.g. `"55.1"`. This is the tuning key.
    pub number: String,
    /// Human-readable name from the section header. Not unique.
    pub name: String,
    /// Broadcaster service id, canonical decimal string.
    pub service_id: String,
    /// Carrier frequency in Hz, as a string.
    pub frequency: String,
    /// Optional logo URL.
    pub icon: Option<String>,
}

/// The channel collection, loaded once and immutable for the life of a run.
#[derive(Debug, Default)]
pub struct ChannelSet {
    channels: Vec<Channel>,
}

impl ChannelSet {
    /// Load and parse a channels-config file.
    pub fn load(path: &Path) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        let set = Self::parse(&text);
        info!(
            "Loaded {} channel(s) on {} frequency(ies) from {}",
            set.len(),
            set.frequencies().len(),
            path.display()
        );
        Ok(set)
    }

    /// Parse channels-config text.
    pub fn parse(text: &str) -> Self {
        let mut channels: Vec<Channel> = Vec::new();
        let mut current: Option<PendingChannel> = None;

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                flush(&mut channels, current.take());
                current = Some(PendingChannel::new(line[1..line.len() - 1].trim()));
                continue;
            }

            let Some(section) = current.as_mut() else {
                warn!("channels-config: key outside any section: {}", line);
                continue;
            };

            if let Some((key, value)) = line.split_once('=') {
                let value = value.trim();
                match key.trim().to_ascii_uppercase().as_str() {
                    "SERVICE_ID" => section.service_id = canonical_service_id(value),
                    "VCHANNEL" => section.number = value.to_string(),
                    "FREQUENCY" => section.frequency = value.to_string(),
                    "ICON" => section.icon = Some(value.to_string()),
                    _ => {}
                }
            }
        }
        flush(&mut channels, current.take());

        Self { channels }
    }

    /// Resolve a channel by its virtual channel number.
    pub fn get(&self, number: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.number == number)
    }

    /// Resolve a channel by frequency and virtual channel number.
    pub fn find(&self, frequency: &str, number: &str) -> Option<&Channel> {
        self.channels
            .iter()
            .find(|c| c.frequency == frequency && c.number == number)
    }

    /// Resolve a channel by frequency and MPEG program number / service id.
    pub fn find_by_program(&self, frequency: &str, program: u16) -> Option<&Channel> {
        let wanted = program.to_string();
        self.channels
            .iter()
            .find(|c| c.frequency == frequency && c.service_id == wanted)
    }

    /// First channel on a frequency, used as the tuning key for EPG captures.
    pub fn first_on_frequency(&self, frequency: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.frequency == frequency)
    }

    /// Distinct frequencies in first-seen order.
    pub fn frequencies(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for c in &self.channels {
            if !out.iter().any(|f| f == &c.frequency) {
                out.push(c.frequency.clone());
            }
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[derive(Debug)]
struct PendingChannel {
    name: String,
    number: String,
    service_id: String,
    frequency: String,
    icon: Option<String>,
}

impl PendingChannel {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            number: String::new(),
            service_id: String::new(),
            frequency: String::new(),
            icon: None,
        }
    }
}

fn flush(channels: &mut Vec<Channel>, pending: Option<PendingChannel>) {
    let Some(p) = pending else { return };
    if p.number.is_empty() || p.frequency.is_empty() {
        warn!(
            "channels-config: section [{}] missing VCHANNEL or FREQUENCY, skipped",
            p.name
        );
        return;
    }
    channels.push(Channel {
        number: p.number,
        name: p.name,
        service_id: p.service_id,
        frequency: p.frequency,
        icon: p.icon,
    });
}

/// Normalise a service id to its canonical decimal string form.
///
/// Channel configs mix decimal and `0x`-hex notation; program rows and joins
/// rely on exact string equality of the canonical form.
pub fn canonical_service_id(raw: &str) -> String {
    let t = raw.trim();
    if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        if let Ok(v) = u64::from_str_radix(hex, 16) {
            return v.to_string();
        }
    } else if let Ok(v) = t.parse::<u64>() {
        return v.to_string();
    }
    t.to_string()
}
