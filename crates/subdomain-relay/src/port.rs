use std::fmt;
use std::ops::RangeInclusive;

/// Ports a subdomain is allowed to route to.
pub const PORT_RANGE: RangeInclusive<u16> = 10_000..=42_000;

const LABEL_SEPARATOR: char = '.';
const LABEL_DIGITS: usize = 5;

/// A backend port derived from the leading label of a request host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetPort(u16);

impl TargetPort {
    /// Derive the target port from `host`.
    ///
    /// The label before the first `.` must be exactly five ASCII digits shaped as `[1-3]dddd`,
    /// `40ddd`, `41ddd` or `42000`. Whatever follows the separator is ignored. No trimming or case
    /// folding is applied, so `" 23456.example.com"` is rejected.
    pub fn from_host(host: &str) -> Option<Self> {
        let (label, _rest) = host.split_once(LABEL_SEPARATOR)?;
        if !label_has_port_shape(label.as_bytes()) {
            return None;
        }

        let port: u16 = label.parse().ok()?;
        // The shape check above already bounds the value; the range check stays as a second gate.
        PORT_RANGE.contains(&port).then_some(Self(port))
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for TargetPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

fn label_has_port_shape(label: &[u8]) -> bool {
    if label.len() != LABEL_DIGITS || !label.iter().all(u8::is_ascii_digit) {
        return false;
    }
    match label {
        [b'1'..=b'3', ..] => true,
        [b'4', b'0' | b'1', ..] => true,
        b"42000" => true,
        _ => false,
    }
}
