//! C4 — timeline validator.

/// One switch point in a timeline's history: the parent timeline the branch
/// is keyed by, and the LSN at which it diverged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineSwitch {
    pub timeline: u32,
    pub switch_lsn: u64,
}

/// Ordered sequence of timeline switches, youngest last - the parsed form of
/// a `.history` file (`tli\tlsn\treason` lines, `#`-prefixed comments
/// ignored).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimelineHistory {
    pub switches: Vec<TimelineSwitch>,
}

#[derive(Debug, thiserror::Error)]
pub enum TimelineHistoryError {
    #[error("malformed timeline history line: {0:?}")]
    MalformedLine(String),
}

impl TimelineHistory {
    pub fn parse(text: &str) -> Result<Self, TimelineHistoryError> {
        let mut switches = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let timeline = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| TimelineHistoryError::MalformedLine(line.to_string()))?;
            let switch_lsn = fields
                .next()
                .and_then(|f| parse_lsn(f))
                .ok_or_else(|| TimelineHistoryError::MalformedLine(line.to_string()))?;
            switches.push(TimelineSwitch {
                timeline,
                switch_lsn,
            });
        }
        Ok(Self { switches })
    }

    /// "destination redo (tli, lsn) satisfies source history" per §3: the
    /// destination's timeline appears in the source's history at a switch
    /// LSN ≥ the destination's redo LSN, or equals the source's current
    /// timeline.
    pub fn satisfies(&self, dest_timeline: u32, dest_lsn: u64, source_current_timeline: u32) -> bool {
        if dest_timeline == source_current_timeline {
            return true;
        }
        self.switches
            .iter()
            .any(|s| s.timeline == dest_timeline && s.switch_lsn >= dest_lsn)
    }
}

/// Parses a PostgreSQL-style `XXXXXXXX/XXXXXXXX` LSN into a flat `u64`.
pub fn parse_lsn(s: &str) -> Option<u64> {
    let (hi, lo) = s.split_once('/')?;
    let hi = u32::from_str_radix(hi, 16).ok()?;
    let lo = u32::from_str_radix(lo, 16).ok()?;
    Some(((hi as u64) << 32) | lo as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_history_text_ignoring_comments() {
        let text = "# comment\n1\t0/16B3748\tno recovery target specified\n\n2\t0/2000000\tpromoted\n";
        let history = TimelineHistory::parse(text).unwrap();
        assert_eq!(history.switches.len(), 2);
        assert_eq!(history.switches[0].timeline, 1);
        assert_eq!(history.switches[1].timeline, 2);
    }

    #[test]
    fn satisfies_when_timeline_matches_current() {
        let history = TimelineHistory::default();
        assert!(history.satisfies(3, 100, 3));
    }

    #[test]
    fn satisfies_when_switch_lsn_covers_redo_lsn() {
        let history = TimelineHistory {
            switches: vec![TimelineSwitch {
                timeline: 2,
                switch_lsn: 200,
            }],
        };
        assert!(history.satisfies(2, 100, 4));
        assert!(!history.satisfies(2, 300, 4));
    }

    #[test]
    fn rejects_unrelated_timeline() {
        let history = TimelineHistory {
            switches: vec![TimelineSwitch {
                timeline: 2,
                switch_lsn: 200,
            }],
        };
        assert!(!history.satisfies(5, 50, 4));
    }
}
