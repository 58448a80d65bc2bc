use regex::Regex;

use crate::errors::Result;

// CSI and OSC sequences, plus any other two-byte escape or a dangling ESC.
const ANSI: &str = r"\x1b(?:\[[0-?]*[ -/]*[@-~]|\][^\x07\x1b]*(?:\x07|\x1b\\)?|.)?";
const PERCENT: &str = r"(\d{1,3}\.\d{2})%";
const BYTES: &str =
    r"(?i)downloaded\s+([\d,]+)\s+bytes\s*\(\s*([\d,]+)\s+bytes\s+uncompressed\s*\)";
const RAW_BYTES: &str = r"(?i)downloaded\s+([\d,]+)\s+bytes";
const GENERIC_PERCENT: &str = r"(?i)progress:\s*(\d{1,3}(?:\.\d+)?)\s*%";

struct Patterns {
    ansi: Regex,
    percent: Regex,
    bytes: Regex,
    raw_bytes: Regex,
    generic_percent: Regex,
}

impl Patterns {
    fn compile() -> Result<Self> {
        Ok(Self {
            ansi: Regex::new(ANSI)?,
            percent: Regex::new(PERCENT)?,
            bytes: Regex::new(BYTES)?,
            raw_bytes: Regex::new(RAW_BYTES)?,
            generic_percent: Regex::new(GENERIC_PERCENT)?,
        })
    }
}

fn parse_count(raw: &str) -> Option<u64> {
    raw.replace(',', "").parse().ok()
}

#[derive(Debug, Clone, Copy)]
enum Fallback {
    /// `Downloaded N bytes` without the uncompressed part.
    RawBytes,
    /// `Progress: N%`
    GenericPercent,
}

/// Tried in order when the primary byte pattern does not match.
const FALLBACKS: [Fallback; 2] = [Fallback::RawBytes, Fallback::GenericPercent];

/// What a single line contributed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineUpdate {
    /// Set only when the whole-number percentage changed.
    pub percent: Option<u8>,
    pub bytes: Option<ByteTotals>,
}

impl LineUpdate {
    pub fn is_empty(&self) -> bool {
        self.percent.is_none() && self.bytes.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteTotals {
    pub downloaded: u64,
    pub total: u64,
}

/// Pattern-driven parser for depot downloader output.
///
/// Percentages are tracked per unit (reset by [`OutputParser::begin_unit`]); byte counts
/// accumulate over the whole task.
pub struct OutputParser {
    patterns: Patterns,
    last_percent: Option<u8>,
    downloaded: u64,
    uncompressed: u64,
    known_unit_total: u64,
    aggregate_total: u64,
}

impl OutputParser {
    /// `known_unit_total` is the sum of the known per-depot sizes, `aggregate_total` the
    /// game-wide size; either may be zero when unknown.
    pub fn new(known_unit_total: u64, aggregate_total: u64) -> Result<Self> {
        Ok(Self {
            patterns: Patterns::compile()?,
            last_percent: None,
            downloaded: 0,
            uncompressed: 0,
            known_unit_total,
            aggregate_total,
        })
    }

    /// Drop terminal colour/control sequences and carriage returns from a downloader line.
    pub fn strip_ansi(&self, s: &str) -> String {
        self.patterns.ansi.replace_all(s, "").replace('\r', "")
    }

    pub fn begin_unit(&mut self) {
        self.last_percent = None;
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn uncompressed(&self) -> u64 {
        self.uncompressed
    }

    /// Denominator for progress: known depot sizes, else the aggregate size, else what has been
    /// seen so far.
    pub fn total(&self) -> u64 {
        if self.known_unit_total > 0 {
            self.known_unit_total.max(self.downloaded)
        } else if self.aggregate_total > 0 {
            self.aggregate_total.max(self.downloaded)
        } else {
            self.downloaded
        }
    }

    pub fn totals(&self) -> ByteTotals {
        ByteTotals {
            downloaded: self.downloaded,
            total: self.total(),
        }
    }

    pub fn parse_line(&mut self, raw: &str) -> LineUpdate {
        let line = self.strip_ansi(raw);
        let line = line.trim();
        let mut update = LineUpdate::default();
        if line.is_empty() {
            return update;
        }

        let mut percent = self
            .patterns
            .percent
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok());

        let mut bytes_seen = false;
        if let Some(caps) = self.patterns.bytes.captures(line) {
            let downloaded = caps.get(1).and_then(|m| parse_count(m.as_str()));
            let uncompressed = caps.get(2).and_then(|m| parse_count(m.as_str()));
            if let Some(n) = downloaded {
                self.downloaded = self.downloaded.saturating_add(n);
                self.uncompressed = self
                    .uncompressed
                    .saturating_add(uncompressed.unwrap_or(n));
                bytes_seen = true;
            }
        } else {
            for fallback in FALLBACKS {
                match fallback {
                    Fallback::RawBytes => {
                        let n = self
                            .patterns
                            .raw_bytes
                            .captures(line)
                            .and_then(|c| c.get(1))
                            .and_then(|m| parse_count(m.as_str()));
                        if let Some(n) = n {
                            self.downloaded = self.downloaded.saturating_add(n);
                            self.uncompressed = self.uncompressed.saturating_add(n);
                            bytes_seen = true;
                            break;
                        }
                    }
                    Fallback::GenericPercent => {
                        if percent.is_some() {
                            continue;
                        }
                        let p = self
                            .patterns
                            .generic_percent
                            .captures(line)
                            .and_then(|c| c.get(1))
                            .and_then(|m| m.as_str().parse::<f64>().ok());
                        if p.is_some() {
                            percent = p;
                            break;
                        }
                    }
                }
            }
        }

        if let Some(p) = percent.filter(|p| p.is_finite()) {
            let whole = p.clamp(0.0, 100.0).floor() as u8;
            if self.last_percent != Some(whole) {
                self.last_percent = Some(whole);
                update.percent = Some(whole);
            }
        }
        if bytes_seen {
            update.bytes = Some(self.totals());
        }
        update
    }
}
