//! Stream-level address composite.
//!
//! The core has no notion of IP addresses or sockets (dialing the
//! underlying transport is explicitly out of scope); all it can offer a
//! `Stream` caller is the fabric's own configured endpoint label combined
//! with the stream id, rendered as `endpoint(streamid)`.

use std::fmt;

/// `Display`s as `endpoint(streamid)`, e.g. `"fabric-remote(7)"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamAddr {
    pub(crate) endpoint: String,
    pub(crate) stream_id: u16,
}

impl StreamAddr {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }
}

impl fmt::Display for StreamAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.endpoint, self.stream_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_as_endpoint_parens_id() {
        let addr = StreamAddr {
            endpoint: "fabric".into(),
            stream_id: 12,
        };
        assert_eq!(addr.to_string(), "fabric(12)");
    }
}
