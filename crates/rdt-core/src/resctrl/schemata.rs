//! resctrl `schemata` file parsing/formatting (spec.md §6, §4.E.1):
//! lines `L3:<id>=<hex>;<id>=<hex>;...`, `L3CODE:...`, `L3DATA:...`,
//! `L2:...`, `L2CODE:...`, `L2DATA:...`, `MB:<id>=<dec>;...`,
//! `SMBA:<id>=<dec>;...`.
//!
//! A set/read-modify-write patches a single resource id's entry in a
//! single recognized line and leaves every other line — including ones
//! this driver doesn't recognize — untouched, byte-for-byte, matching
//! `lib/resctrl_alloc.c`'s per-id patch rather than a from-scratch
//! reconstruction.

use std::collections::BTreeMap;

/// One schemata resource-kind line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Kind {
    L3,
    L3Code,
    L3Data,
    L2,
    L2Code,
    L2Data,
    Mb,
    Smba,
}

impl Kind {
    fn label(self) -> &'static str {
        match self {
            Kind::L3 => "L3",
            Kind::L3Code => "L3CODE",
            Kind::L3Data => "L3DATA",
            Kind::L2 => "L2",
            Kind::L2Code => "L2CODE",
            Kind::L2Data => "L2DATA",
            Kind::Mb => "MB",
            Kind::Smba => "SMBA",
        }
    }

    fn from_label(label: &str) -> Option<Kind> {
        Some(match label {
            "L3" => Kind::L3,
            "L3CODE" => Kind::L3Code,
            "L3DATA" => Kind::L3Data,
            "L2" => Kind::L2,
            "L2CODE" => Kind::L2Code,
            "L2DATA" => Kind::L2Data,
            "MB" => Kind::Mb,
            "SMBA" => Kind::Smba,
            _ => return None,
        })
    }

    /// CAT lines are hex cache-bit-masks; MBA/SMBA lines are decimal
    /// percent (or MB/s under CTRL mode).
    fn is_hex(self) -> bool {
        !matches!(self, Kind::Mb | Kind::Smba)
    }
}

#[derive(Debug, Clone)]
enum Line {
    Recognized { kind: Kind, entries: BTreeMap<u32, u64> },
    Opaque(String),
}

/// A parsed schemata file: an ordered list of lines. Anything this
/// driver doesn't understand — a future kind, a malformed entry — is
/// carried through verbatim rather than dropped.
#[derive(Debug, Clone, Default)]
pub struct Schemata {
    lines: Vec<Line>,
}

impl Schemata {
    pub fn parse(text: &str) -> Self {
        let lines = text
            .lines()
            .filter(|raw| !raw.trim().is_empty())
            .map(|raw| Self::parse_line(raw).unwrap_or_else(|| Line::Opaque(raw.to_string())))
            .collect();
        Schemata { lines }
    }

    fn parse_line(raw: &str) -> Option<Line> {
        let (label, rest) = raw.split_once(':')?;
        let kind = Kind::from_label(label.trim())?;
        let mut entries = BTreeMap::new();
        for part in rest.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (id, val) = part.split_once('=')?;
            let id: u32 = id.trim().parse().ok()?;
            let val: u64 = if kind.is_hex() {
                u64::from_str_radix(val.trim(), 16).ok()?
            } else {
                val.trim().parse().ok()?
            };
            entries.insert(id, val);
        }
        Some(Line::Recognized { kind, entries })
    }

    pub fn format(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Recognized { kind, entries } => {
                    out.push_str(kind.label());
                    out.push(':');
                    let body = entries
                        .iter()
                        .map(|(id, val)| {
                            if kind.is_hex() {
                                format!("{id}={val:x}")
                            } else {
                                format!("{id}={val}")
                            }
                        })
                        .collect::<Vec<_>>()
                        .join(";");
                    out.push_str(&body);
                }
                Line::Opaque(s) => out.push_str(s),
            }
            out.push('\n');
        }
        out
    }

    pub fn get(&self, kind: Kind, id: u32) -> Option<u64> {
        self.lines.iter().find_map(|l| match l {
            Line::Recognized { kind: k, entries } if *k == kind => entries.get(&id).copied(),
            _ => None,
        })
    }

    /// Patch resource id `id` on line `kind` to `value`, preserving
    /// every other entry and line. Appends a new line if `kind` wasn't
    /// present at all.
    pub fn set(&mut self, kind: Kind, id: u32, value: u64) {
        for line in &mut self.lines {
            if let Line::Recognized { kind: k, entries } = line {
                if *k == kind {
                    entries.insert(id, value);
                    return;
                }
            }
        }
        let mut entries = BTreeMap::new();
        entries.insert(id, value);
        self.lines.push(Line::Recognized { kind, entries });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_preserves_other_ids_and_lines() {
        let mut s = Schemata::parse("L3:0=ff;1=0f\nMB:0=100;1=90\n");
        s.set(Kind::L3, 1, 0x03);
        assert_eq!(s.get(Kind::L3, 0), Some(0xff));
        assert_eq!(s.get(Kind::L3, 1), Some(0x03));
        assert_eq!(s.get(Kind::Mb, 0), Some(100));
    }

    #[test]
    fn unrecognized_lines_survive_round_trip() {
        let text = "L3:0=ff\nFUTURE_KIND:0=1;1=2\n";
        let s = Schemata::parse(text);
        assert_eq!(s.format(), text);
    }

    #[test]
    fn cdp_lines_are_independent() {
        let mut s = Schemata::parse("L3CODE:0=f0\nL3DATA:0=0f\n");
        s.set(Kind::L3Code, 1, 0xff);
        assert_eq!(s.get(Kind::L3Code, 0), Some(0xf0));
        assert_eq!(s.get(Kind::L3Code, 1), Some(0xff));
        assert_eq!(s.get(Kind::L3Data, 0), Some(0x0f));
    }

    #[test]
    fn mba_values_are_decimal_not_hex() {
        let mut s = Schemata::parse("MB:0=100\n");
        s.set(Kind::Mb, 1, 55);
        assert_eq!(s.format(), "MB:0=100;1=55\n");
    }
}
