use std::fmt;

use crate::device::DeviceId;

/// Unit of the address carried by a trace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressUnit {
    /// Filesystem block number (buffer-head events print it as `sector=`).
    Block,
    /// 512-byte sector (request and bio events).
    Sector,
}

impl AddressUnit {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Sector => "sector",
        }
    }
}

impl fmt::Display for AddressUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A block tracepoint record parsed from one trace_pipe line.
///
/// Borrows the event name from the line buffer so parsing never allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEvent<'a> {
    /// Tracepoint name, e.g. `block_rq_issue`.
    pub name: &'a str,
    pub device: DeviceId,
    pub address: u64,
    pub unit: AddressUnit,
}
