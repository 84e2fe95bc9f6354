//! Parsing of ftrace `trace_pipe` lines into [`TraceEvent`]s.
//!
//! A record looks like
//!
//! ```text
//!  jbd2/sda3-8-629   [001] .... 64723.852280: block_dirty_buffer: 8,3 sector=38797433 size=4096
//!          cat-21706 [003] .... 46942.324026: block_getrq: 8,0 R 103233032 + 512 [cat]
//! ```
//!
//! The task name may contain spaces, so the record header is located by the
//! `<timestamp>: <event>: ` marker rather than by column position.

use thiserror::Error;

use crate::device::DeviceId;

use super::event::{AddressUnit, TraceEvent};

/// Errors that can occur during line parsing.
///
/// Variants carry no borrowed or owned text, so rejecting a line never
/// allocates. Callers that want context log the line itself.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("not a trace record")]
    NotARecord,

    #[error("missing device")]
    MissingDevice,

    #[error("invalid device")]
    InvalidDevice,

    #[error("no block address")]
    MissingAddress,

    #[error("invalid block address")]
    InvalidAddress,
}

/// Parse one trace_pipe line.
pub fn parse_line(line: &str) -> Result<TraceEvent<'_>, ParseError> {
    let (name, payload) = split_record(line).ok_or(ParseError::NotARecord)?;

    let mut tokens = payload.split_ascii_whitespace();
    let dev_raw = tokens.next().ok_or(ParseError::MissingDevice)?;
    let device = parse_device(dev_raw).ok_or_else(|| {
        // Events like block_plug carry only a task name.
        if dev_raw.starts_with('[') {
            ParseError::MissingDevice
        } else {
            ParseError::InvalidDevice
        }
    })?;

    let (raw, unit) = find_address(tokens).ok_or(ParseError::MissingAddress)?;
    let address = raw
        .parse::<u64>()
        .map_err(|_| ParseError::InvalidAddress)?;

    Ok(TraceEvent {
        name,
        device,
        address,
        unit,
    })
}

/// Locate `<timestamp>: <event>: <payload>` and return `(event, payload)`.
fn split_record(line: &str) -> Option<(&str, &str)> {
    for (idx, _) in line.match_indices(": ") {
        let before = &line[..idx];
        let timestamp = before.rsplit(' ').next()?;
        if timestamp.is_empty() || timestamp.parse::<f64>().is_err() {
            continue;
        }

        let rest = &line[idx + 2..];
        let Some((name, payload)) = rest.split_once(':') else {
            continue;
        };
        if !is_event_name(name) {
            continue;
        }
        return Some((name, payload.trim()));
    }
    None
}

fn is_event_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

fn parse_device(raw: &str) -> Option<DeviceId> {
    let (major, minor) = raw.split_once(',')?;
    Some(DeviceId::new(major.parse().ok()?, minor.parse().ok()?))
}

/// Find the address: `sector=N` wins, otherwise the token before `+`.
fn find_address<'a>(tokens: impl Iterator<Item = &'a str>) -> Option<(&'a str, AddressUnit)> {
    let mut prev: Option<&str> = None;
    let mut range_start: Option<&str> = None;

    for token in tokens {
        if let Some(value) = token.strip_prefix("sector=") {
            return Some((value, AddressUnit::Block));
        }
        if token == "+" && range_start.is_none() {
            range_start = prev;
        }
        prev = Some(token);
    }

    range_start.map(|s| (s, AddressUnit::Sector))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::TracerError;

    #[test]
    fn test_dirty_buffer_line() {
        let line = "      jbd2/sda3-8-629   [001] .... 64723.852280: block_dirty_buffer: 8,3 sector=38797433 size=4096";
        let ev = parse_line(line).expect("parse");
        assert_eq!(ev.name, "block_dirty_buffer");
        assert_eq!(ev.device, DeviceId::new(8, 3));
        assert_eq!(ev.address, 38_797_433);
        assert_eq!(ev.unit, AddressUnit::Block);
    }

    #[test]
    fn test_getrq_line() {
        let line = "         cat-21706 [003] .... 46942.324026: block_getrq: 8,0 R 103233032 + 512 [cat]";
        let ev = parse_line(line).expect("parse");
        assert_eq!(ev.name, "block_getrq");
        assert_eq!(ev.device, DeviceId::new(8, 0));
        assert_eq!(ev.address, 103_233_032);
        assert_eq!(ev.unit, AddressUnit::Sector);
    }

    #[test]
    fn test_rq_issue_with_bytes_and_cmd() {
        let line = "  kworker/u16:2-1234  [002] d..1. 1201.000001: block_rq_issue: 259,0 WS 4096 () 2048 + 8 [kworker/u16:2]";
        let ev = parse_line(line).expect("parse");
        assert_eq!(ev.name, "block_rq_issue");
        assert_eq!(ev.device, DeviceId::new(259, 0));
        assert_eq!(ev.address, 2048);
        assert_eq!(ev.unit, AddressUnit::Sector);
    }

    #[test]
    fn test_rq_complete_with_error_field() {
        let line = "          <idle>-0       [000] ..s1. 1201.000900: block_rq_complete: 8,16 R () 5000 + 16 [0]";
        let ev = parse_line(line).expect("parse");
        assert_eq!(ev.device, DeviceId::new(8, 16));
        assert_eq!(ev.address, 5000);
    }

    #[test]
    fn test_task_name_with_spaces() {
        let line = " Web Content-4242 [000] .... 100.5: block_touch_buffer: 8,1 sector=77 size=4096";
        let ev = parse_line(line).expect("parse");
        assert_eq!(ev.name, "block_touch_buffer");
        assert_eq!(ev.address, 77);
    }

    #[test]
    fn test_task_name_containing_colon_space() {
        let line = " weird: name-1 [000] .... 100.5: block_dirty_buffer: 8,1 sector=5 size=4096";
        let ev = parse_line(line).expect("parse");
        assert_eq!(ev.name, "block_dirty_buffer");
        assert_eq!(ev.address, 5);
    }

    #[test]
    fn test_comment_and_blank_lines() {
        assert_eq!(parse_line(""), Err(ParseError::NotARecord));
        assert_eq!(parse_line("# tracer: nop"), Err(ParseError::NotARecord));
        assert_eq!(
            parse_line("CPU:3 [LOST 120 EVENTS]"),
            Err(ParseError::NotARecord)
        );
    }

    #[test]
    fn test_plug_event_has_no_device() {
        let line = "   kworker/0:1H-200 [000] .... 55.0: block_plug: [kworker/0:1H]";
        assert_eq!(
            parse_line(line),
            Err(ParseError::MissingDevice)
        );
    }

    #[test]
    fn test_invalid_device() {
        let line = "   task-1 [000] .... 55.0: block_dirty_buffer: 8-3 sector=1 size=4096";
        assert_eq!(parse_line(line), Err(ParseError::InvalidDevice));
    }

    #[test]
    fn test_missing_address() {
        let line = "   task-1 [000] .... 55.0: block_unplug: 8,0 [task] 1";
        assert_eq!(parse_line(line), Err(ParseError::MissingAddress));
    }

    #[test]
    fn test_invalid_address() {
        let line = "   task-1 [000] .... 55.0: block_dirty_buffer: 8,3 sector=abc size=4096";
        assert_eq!(
            parse_line(line),
            Err(ParseError::InvalidAddress)
        );
    }

    #[test]
    fn test_parse_error_display() {
        assert_eq!(ParseError::MissingAddress.to_string(), "no block address");
        assert_eq!(
            TracerError::from(ParseError::InvalidDevice).to_string(),
            "parsing trace line: invalid device"
        );
    }
}
