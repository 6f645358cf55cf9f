use anyhow::{bail, Result};
use std::{fmt, str::FromStr};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

/// An L4 restriction from a rule's `ports` list.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PortRestriction {
    pub protocol: Protocol,
    /// `None` matches every port of the protocol.
    pub port: Option<u16>,
    pub end_port: Option<u16>,
}

// === impl Protocol ===

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Sctp => "sctp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("tcp") {
            Ok(Self::Tcp)
        } else if s.eq_ignore_ascii_case("udp") {
            Ok(Self::Udp)
        } else if s.eq_ignore_ascii_case("sctp") {
            Ok(Self::Sctp)
        } else {
            bail!("unsupported protocol: {s}")
        }
    }
}

// === impl PortRestriction ===

impl PortRestriction {
    pub fn new(protocol: Protocol, port: Option<u16>, end_port: Option<u16>) -> Result<Self> {
        if let (Some(start), Some(end)) = (port, end_port) {
            if end < start {
                bail!("endPort {end} is less than port {start}");
            }
        }
        if port.is_none() && end_port.is_some() {
            bail!("endPort requires port");
        }
        Ok(Self {
            protocol,
            port,
            end_port,
        })
    }

    /// Renders the L4 clause, e.g. `tcp && tcp.dst==81`.
    pub fn l4_match(&self) -> String {
        let proto = self.protocol.as_str();
        match (self.port, self.end_port) {
            (None, _) => proto.to_string(),
            (Some(start), Some(end)) if end != start => {
                format!("{proto} && {start}<={proto}.dst<={end}")
            }
            (Some(port), _) => format!("{proto} && {proto}.dst=={port}"),
        }
    }
}
