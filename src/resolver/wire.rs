//! RFC1035 wire codec: query construction with name compression, response
//! parsing with decompression.

use std::collections::HashMap;

pub const TYPE_A: u16 = 1;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_TXT: u16 = 16;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_SRV: u16 = 33;
pub const TYPE_OPT: u16 = 41;
pub const QTYPE_ALL: u16 = 255;
pub const CLASS_IN: u16 = 1;

pub const FLAG_QR: u16 = 0x8000;
pub const FLAG_RD: u16 = 0x0100;
pub const RCODE_MASK: u16 = 0x000f;

const SIZE_FLAGS: u8 = 0xc0;
const SF_LABEL: u8 = 0x00;
const SF_POINTER: u8 = 0xc0;

/// Longest presentation-form name we will produce.
pub const MAX_NAME: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl Header {
    pub fn parse(buf: &[u8]) -> Option<Header> {
        if buf.len() < 12 {
            return None;
        }
        let word = |i: usize| (buf[i] as u16) << 8 | buf[i + 1] as u16;
        Some(Header {
            id: word(0),
            flags: word(2),
            qdcount: word(4),
            ancount: word(6),
            nscount: word(8),
            arcount: word(10),
        })
    }

    pub fn rcode(&self) -> u16 {
        self.flags & RCODE_MASK
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }
}

/// One parsed resource record. `rd_start`/`rdlength` index into the raw
/// packet for typed rdata extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rr {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdlength: u16,
    pub rd_start: usize,
}

impl Rr {
    /// Fixed-length rdata view, bounds-checked against the packet.
    pub fn rdata<'a>(&self, raw: &'a [u8], len: usize) -> Option<&'a [u8]> {
        if len > self.rdlength as usize || self.rd_start + len > raw.len() {
            return None;
        }
        Some(&raw[self.rd_start..self.rd_start + len])
    }
}

/// Decompress a name starting at `*pos`, advancing `*pos` past it.
///
/// Pointer chains are bounded by the packet length: every pointer occupies
/// two bytes, so a legitimate chain can never hop more than `len / 2`
/// times. A cycle (pointer to pointer, no labels between) trips the bound
/// and fails the name instead of spinning.
pub fn extract_name(buf: &[u8], pos: &mut usize) -> Option<String> {
    let mut out = String::new();
    let mut cursor = *pos;
    let mut hops = 0usize;
    loop {
        let len_byte = *buf.get(cursor)?;
        if len_byte == 0 {
            if hops == 0 {
                *pos = cursor + 1;
            }
            return Some(out);
        }
        match len_byte & SIZE_FLAGS {
            SF_LABEL => {
                let len = len_byte as usize;
                if cursor + len + 1 >= buf.len() {
                    return None;
                }
                if !out.is_empty() {
                    out.push('.');
                }
                if out.len() + len > MAX_NAME {
                    return None;
                }
                out.push_str(&String::from_utf8_lossy(&buf[cursor + 1..cursor + 1 + len]));
                cursor += len + 1;
            }
            SF_POINTER => {
                if cursor + 1 >= buf.len() {
                    return None;
                }
                hops += 1;
                if hops > buf.len() / 2 {
                    return None;
                }
                if hops == 1 {
                    *pos = cursor + 2;
                }
                cursor = ((len_byte & !SIZE_FLAGS) as usize) << 8 | buf[cursor + 1] as usize;
            }
            _ => return None,
        }
    }
}

/// Skip the question section; returns the offset of the first RR.
fn skip_questions(buf: &[u8], qdcount: u16) -> Option<usize> {
    let mut pos = 12;
    for _ in 0..qdcount {
        // Same hop bound as extract_name; question names may be compressed
        // and are just as attacker-controlled.
        let mut hops = 0usize;
        loop {
            let len_byte = *buf.get(pos)?;
            if len_byte == 0 {
                break;
            }
            match len_byte & SIZE_FLAGS {
                SF_LABEL => pos += len_byte as usize + 1,
                SF_POINTER => {
                    if pos + 1 >= buf.len() {
                        return None;
                    }
                    hops += 1;
                    if hops > buf.len() / 2 {
                        return None;
                    }
                    pos = ((len_byte & !SIZE_FLAGS) as usize) << 8 | buf[pos + 1] as usize;
                    if pos >= buf.len() {
                        return None;
                    }
                }
                _ => return None,
            }
        }
        // Null terminator, qtype, qclass.
        pos += 5;
    }
    Some(pos)
}

/// Parse every RR (answer, authority, additional) of a response.
pub fn parse_records(buf: &[u8], hdr: &Header) -> Option<Vec<Rr>> {
    let mut pos = skip_questions(buf, hdr.qdcount)?;
    let total = hdr.ancount as usize + hdr.nscount as usize + hdr.arcount as usize;
    let mut rrs = Vec::with_capacity(total);
    for _ in 0..total {
        let name = extract_name(buf, &mut pos)?;
        if pos + 10 > buf.len() {
            return None;
        }
        let word = |i: usize| (buf[i] as u16) << 8 | buf[i + 1] as u16;
        let rr = Rr {
            name,
            rtype: word(pos),
            class: word(pos + 2),
            ttl: (buf[pos + 4] as u32) << 24
                | (buf[pos + 5] as u32) << 16
                | (buf[pos + 6] as u32) << 8
                | buf[pos + 7] as u32,
            rdlength: word(pos + 8),
            rd_start: pos + 10,
        };
        pos = rr.rd_start + rr.rdlength as usize;
        if pos > buf.len() {
            return None;
        }
        rrs.push(rr);
    }
    Some(rrs)
}

/// Append `name` to `out` in compressed form, reusing previously-written
/// suffixes via back-pointers.
fn append_name(out: &mut Vec<u8>, name: &str, suffixes: &mut HashMap<String, u16>) -> bool {
    let mut rest = name.trim_end_matches('.');
    while !rest.is_empty() {
        let folded = rest.to_ascii_lowercase();
        if let Some(&ofs) = suffixes.get(&folded) {
            out.push(SF_POINTER | (ofs >> 8) as u8);
            out.push((ofs & 0xff) as u8);
            return true;
        }
        let label = rest.split('.').next().unwrap_or(rest);
        if label.len() > 63 || label.is_empty() {
            return false;
        }
        if out.len() < 0x3fff {
            suffixes.insert(folded, out.len() as u16);
        }
        out.push(SF_LABEL | label.len() as u8);
        out.extend_from_slice(label.as_bytes());
        rest = match rest.split_once('.') {
            Some((_, tail)) => tail,
            None => "",
        };
    }
    out.push(0);
    true
}

/// Build a question packet for `questions`, with an OPT pseudo-RR when
/// `edns0` is nonzero. Returns `None` when a name cannot be encoded.
pub fn build_query(id: u16, questions: &[(&str, u16)], edns0: u16) -> Option<Vec<u8>> {
    let mut out = vec![0u8; 12];
    out[0] = (id >> 8) as u8;
    out[1] = (id & 0xff) as u8;
    out[2] = (FLAG_RD >> 8) as u8;
    out[3] = (FLAG_RD & 0xff) as u8;
    out[4] = (questions.len() >> 8) as u8;
    out[5] = (questions.len() & 0xff) as u8;

    let mut suffixes = HashMap::new();
    for (name, qtype) in questions {
        if !append_name(&mut out, name, &mut suffixes) {
            return None;
        }
        out.extend_from_slice(&qtype.to_be_bytes());
        out.extend_from_slice(&CLASS_IN.to_be_bytes());
    }

    if edns0 != 0 {
        out.push(0); // root name
        out.extend_from_slice(&TYPE_OPT.to_be_bytes());
        out.extend_from_slice(&edns0.to_be_bytes()); // class carries the size
        out.extend_from_slice(&[0, 0, 0, 0]); // extended rcode + version + flags
        out.extend_from_slice(&[0, 0]); // rdlength
        out[11] = 1; // arcount
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_layout_single_question() {
        let pkt = build_query(0x1234, &[("www.example.com", TYPE_A)], 0).unwrap();
        assert_eq!(&pkt[..2], &[0x12, 0x34]);
        assert_eq!(&pkt[2..4], &[0x01, 0x00], "RD set");
        assert_eq!(&pkt[4..6], &[0, 1], "one question");
        // 3www7example3com0 + type + class
        assert_eq!(pkt[12], 3);
        assert_eq!(&pkt[13..16], b"www");
        assert_eq!(pkt[16], 7);
        let mut pos = 12;
        assert_eq!(extract_name(&pkt, &mut pos).unwrap(), "www.example.com");
        assert_eq!(pos, 12 + 17);
    }

    #[test]
    fn query_compresses_shared_suffix() {
        let one = build_query(1, &[("a.example.com", TYPE_A)], 0).unwrap();
        let two = build_query(
            1,
            &[("a.example.com", TYPE_A), ("b.example.com", TYPE_AAAA)],
            0,
        )
        .unwrap();
        // The second name is a 1-byte label plus a 2-byte pointer, far
        // shorter than a full encoding.
        assert!(two.len() < one.len() * 2);
        // The second question starts right where packet one ended.
        let mut pos = one.len();
        let name = extract_name(&two, &mut pos).unwrap();
        assert_eq!(name.to_ascii_lowercase(), "b.example.com");
    }

    #[test]
    fn edns0_appends_opt() {
        let pkt = build_query(7, &[("example.com", TYPE_A)], 1440).unwrap();
        assert_eq!(pkt[11], 1, "arcount");
        let opt = &pkt[pkt.len() - 11..];
        assert_eq!(opt[0], 0, "root name");
        assert_eq!(&opt[1..3], &TYPE_OPT.to_be_bytes());
        assert_eq!(&opt[3..5], &1440u16.to_be_bytes());
    }

    #[test]
    fn name_round_trip() {
        for name in ["example.com", "a.b.c.d.example.org", "x"] {
            let pkt = build_query(1, &[(name, TYPE_A)], 0).unwrap();
            let mut pos = 12;
            assert_eq!(extract_name(&pkt, &mut pos).unwrap(), name);
        }
    }

    #[test]
    fn pointer_loop_terminates() {
        // A packet whose name is a pointer to itself.
        let mut pkt = vec![0u8; 12];
        pkt.extend_from_slice(&[0xc0, 12]);
        let mut pos = 12;
        assert!(extract_name(&pkt, &mut pos).is_none());
    }

    #[test]
    fn pointer_ping_pong_terminates() {
        // Two pointers referencing each other: no labels ever accumulate,
        // so only the hop bound can stop this.
        let mut pkt = vec![0u8; 12];
        pkt.extend_from_slice(&[0xc0, 14, 0xc0, 12]);
        let mut pos = 12;
        assert!(extract_name(&pkt, &mut pos).is_none());

        // The same cycle in the question section must not hang parsing.
        let mut qpkt = vec![0u8; 12];
        qpkt[2] = (FLAG_QR >> 8) as u8;
        qpkt[5] = 1; // qdcount
        qpkt.extend_from_slice(&[0xc0, 14, 0xc0, 12]);
        let hdr = Header::parse(&qpkt).unwrap();
        assert!(parse_records(&qpkt, &hdr).is_none());
    }

    #[test]
    fn legitimate_pointer_chain_still_decodes() {
        // name -> pointer -> pointer -> labels; chains short of the bound
        // keep working.
        let mut pkt = vec![0u8; 12];
        let labels_at = (12 + 4) as u8;
        pkt.extend_from_slice(&[0xc0, 12 + 2]); // 12: pointer to 14
        pkt.extend_from_slice(&[0xc0, labels_at]); // 14: pointer to 16
        pkt.extend_from_slice(&[1, b'a', 3, b'c', b'o', b'm', 0]); // 16: a.com
        let mut pos = 12;
        assert_eq!(extract_name(&pkt, &mut pos).unwrap(), "a.com");
        assert_eq!(pos, 14, "caller position advances past the first pointer");
    }

    #[test]
    fn parse_answer_records() {
        // Hand-built response: one question, one A answer via pointer.
        let mut pkt = build_query(9, &[("example.com", TYPE_A)], 0).unwrap();
        pkt[2] |= (FLAG_QR >> 8) as u8;
        pkt[7] = 1; // ancount
        let name_ofs = 12u16;
        pkt.extend_from_slice(&[0xc0, name_ofs as u8]);
        pkt.extend_from_slice(&TYPE_A.to_be_bytes());
        pkt.extend_from_slice(&CLASS_IN.to_be_bytes());
        pkt.extend_from_slice(&300u32.to_be_bytes());
        pkt.extend_from_slice(&4u16.to_be_bytes());
        pkt.extend_from_slice(&[127, 0, 0, 2]);

        let hdr = Header::parse(&pkt).unwrap();
        assert!(hdr.is_response());
        assert_eq!(hdr.ancount, 1);
        let rrs = parse_records(&pkt, &hdr).unwrap();
        assert_eq!(rrs.len(), 1);
        assert_eq!(rrs[0].name, "example.com");
        assert_eq!(rrs[0].rtype, TYPE_A);
        assert_eq!(rrs[0].rdata(&pkt, 4).unwrap(), &[127, 0, 0, 2]);
    }

    #[test]
    fn truncated_records_are_rejected() {
        let mut pkt = build_query(9, &[("example.com", TYPE_A)], 0).unwrap();
        pkt[2] |= (FLAG_QR >> 8) as u8;
        pkt[7] = 1;
        pkt.extend_from_slice(&[0xc0, 12]);
        pkt.extend_from_slice(&TYPE_A.to_be_bytes());
        pkt.extend_from_slice(&CLASS_IN.to_be_bytes());
        pkt.extend_from_slice(&300u32.to_be_bytes());
        pkt.extend_from_slice(&64u16.to_be_bytes()); // rdlength beyond buffer
        pkt.extend_from_slice(&[1, 2, 3]);
        let hdr = Header::parse(&pkt).unwrap();
        assert!(parse_records(&pkt, &hdr).is_none());
    }
}
