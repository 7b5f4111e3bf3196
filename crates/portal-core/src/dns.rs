//! Minimal DNS wire format for answering queries with the portal address.
//!
//! Only the header fields and the raw question section are interpreted; the
//! queried name is never decoded. A redirect answer is the same for every
//! question:
//!
//! ```text
//! header   ID (echoed) | 0x8180 | QDCOUNT (echoed) | ANCOUNT 1 | 0 | 0
//! question copied verbatim from the query
//! answer   C0 0C | TYPE A | CLASS IN | TTL 60 | RDLENGTH 4 | IPv4
//! ```

use crate::error::{PortalError, PortalResult};
use std::net::Ipv4Addr;

/// Largest datagram accepted or produced (classic UDP DNS limit).
pub const MAX_DATAGRAM: usize = 512;

/// Size of the fixed DNS header.
pub const HEADER_LEN: usize = 12;

/// TTL of the synthesized A record, in seconds.
pub const REDIRECT_TTL: u32 = 60;

/// QR=1 (response), RD=1, RA=1, RCODE=0.
const RESPONSE_FLAGS: u16 = 0x8180;
/// Compression pointer to the first question name at offset 12.
const NAME_POINTER: u16 = 0xC00C;
const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;
const QR_BIT: u16 = 0x8000;

/// The parts of an inbound query that a redirect response must echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub transaction_id: u16,
    pub flags: u16,
    pub question_count: u16,
    /// Raw bytes of every question, from offset 12 to the end of the last QCLASS.
    pub question_section: Vec<u8>,
}

impl DnsQuery {
    /// Parse the header and locate the end of the question section.
    ///
    /// Fails on anything a resolver would choke on if echoed back: short
    /// header, responses, zero questions or a truncated question.
    pub fn parse(datagram: &[u8]) -> PortalResult<Self> {
        if datagram.len() < HEADER_LEN {
            return Err(PortalError::Malformed(format!(
                "DNS datagram too short: {} bytes",
                datagram.len()
            )));
        }
        if datagram.len() > MAX_DATAGRAM {
            return Err(PortalError::Malformed(format!(
                "DNS datagram too large: {} bytes",
                datagram.len()
            )));
        }

        let transaction_id = u16::from_be_bytes([datagram[0], datagram[1]]);
        let flags = u16::from_be_bytes([datagram[2], datagram[3]]);
        let question_count = u16::from_be_bytes([datagram[4], datagram[5]]);

        if flags & QR_BIT != 0 {
            return Err(PortalError::Malformed("datagram is a response".into()));
        }
        if question_count == 0 {
            return Err(PortalError::Malformed("query has no questions".into()));
        }

        let mut pos = HEADER_LEN;
        for _ in 0..question_count {
            pos = skip_name(datagram, pos)?;
            // QTYPE + QCLASS
            if pos + 4 > datagram.len() {
                return Err(PortalError::Malformed("truncated question".into()));
            }
            pos += 4;
        }

        Ok(Self {
            transaction_id,
            flags,
            question_count,
            question_section: datagram[HEADER_LEN..pos].to_vec(),
        })
    }

    /// Build the spoofed answer pointing this query at `address`.
    pub fn redirect(&self, address: Ipv4Addr) -> RedirectResponse {
        RedirectResponse {
            transaction_id: self.transaction_id,
            question_count: self.question_count,
            question_section: self.question_section.clone(),
            answer: address,
        }
    }
}

/// Walk a (possibly compressed) name starting at `pos`, returning the offset
/// just past it.
fn skip_name(data: &[u8], mut pos: usize) -> PortalResult<usize> {
    loop {
        let Some(&len) = data.get(pos) else {
            return Err(PortalError::Malformed("unterminated name".into()));
        };
        match len & 0xC0 {
            0x00 if len == 0 => return Ok(pos + 1),
            0x00 => {
                let end = pos + 1 + len as usize;
                if end > data.len() {
                    return Err(PortalError::Malformed("label overruns datagram".into()));
                }
                pos = end;
            }
            0xC0 => {
                if pos + 2 > data.len() {
                    return Err(PortalError::Malformed("truncated name pointer".into()));
                }
                return Ok(pos + 2);
            }
            _ => {
                return Err(PortalError::Malformed(format!(
                    "unsupported label type 0x{len:02x}"
                )))
            }
        }
    }
}

/// A synthesized response carrying a single A record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectResponse {
    pub transaction_id: u16,
    pub question_count: u16,
    pub question_section: Vec<u8>,
    pub answer: Ipv4Addr,
}

impl RedirectResponse {
    /// Serialize to wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.question_section.len() + 16);

        // Header
        out.extend_from_slice(&self.transaction_id.to_be_bytes());
        out.extend_from_slice(&RESPONSE_FLAGS.to_be_bytes());
        out.extend_from_slice(&self.question_count.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes()); // ANCOUNT
        out.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
        out.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

        out.extend_from_slice(&self.question_section);

        // Answer
        out.extend_from_slice(&NAME_POINTER.to_be_bytes());
        out.extend_from_slice(&TYPE_A.to_be_bytes());
        out.extend_from_slice(&CLASS_IN.to_be_bytes());
        out.extend_from_slice(&REDIRECT_TTL.to_be_bytes());
        out.extend_from_slice(&4u16.to_be_bytes());
        out.extend_from_slice(&self.answer.octets());

        out
    }
}

/// Transaction ID of a raw message, if it has a header.
pub fn transaction_id(datagram: &[u8]) -> Option<u16> {
    if datagram.len() < HEADER_LEN {
        return None;
    }
    Some(u16::from_be_bytes([datagram[0], datagram[1]]))
}
