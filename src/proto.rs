//! Recognition of a TLS ClientHello on the first bytes of a read.

/// TLS record content type for handshake records.
pub const TLS_HANDSHAKE_RECORD: u8 = 0x16;
/// Handshake message type of a ClientHello.
pub const CLIENT_HELLO: u8 = 0x01;
/// Record header: type (1), version (2), length (2).
pub const RECORD_HEADER_LEN: usize = 5;
/// Handshake header: type (1), length (3).
pub const HANDSHAKE_HEADER_LEN: usize = 4;

const SIGNATURE_LEN: usize = RECORD_HEADER_LEN + HANDSHAKE_HEADER_LEN;

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Proto {
    Plain,
    Tls,
}

/// Classify the bytes delivered by a single read.
pub fn detect(buf: &[u8]) -> Proto {
    match is_client_hello(buf) {
        true => Proto::Tls,
        false => Proto::Plain,
    }
}

/// Whether `buf` holds exactly one handshake record carrying exactly one
/// ClientHello message.
///
/// Both length fields have to account for every byte of `buf`, so a
/// ClientHello split over several reads, or followed by trailing bytes,
/// is reported as plaintext.
pub fn is_client_hello(buf: &[u8]) -> bool {
    if buf.len() < SIGNATURE_LEN {
        return false;
    }

    if buf[0] != TLS_HANDSHAKE_RECORD || buf[RECORD_HEADER_LEN] != CLIENT_HELLO {
        return false;
    }

    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    let handshake_len = u32::from_be_bytes([0, buf[6], buf[7], buf[8]]) as usize;

    record_len == buf.len() - RECORD_HEADER_LEN && handshake_len == buf.len() - SIGNATURE_LEN
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello(body: &[u8]) -> Vec<u8> {
        let record_len = (body.len() + HANDSHAKE_HEADER_LEN) as u16;
        let handshake_len = (body.len() as u32).to_be_bytes();
        let mut buf = vec![TLS_HANDSHAKE_RECORD, 0x03, 0x01];
        buf.extend_from_slice(&record_len.to_be_bytes());
        buf.push(CLIENT_HELLO);
        buf.extend_from_slice(&handshake_len[1..]);
        buf.extend_from_slice(body);
        buf
    }

    #[test]
    fn accepts_consistent_client_hello() {
        assert_eq!(detect(&hello(&[])), Proto::Tls);
        assert_eq!(detect(&hello(&[0xaa; 300])), Proto::Tls);
    }

    #[test]
    fn rejects_short_reads() {
        let full = hello(&[]);
        for len in 0..full.len() {
            assert_eq!(detect(&full[..len]), Proto::Plain, "len {}", len);
        }
    }

    #[test]
    fn rejects_wrong_types() {
        let mut record = hello(&[1, 2, 3]);
        record[0] = 0x17;
        assert!(!is_client_hello(&record));

        let mut message = hello(&[1, 2, 3]);
        message[5] = 0x02;
        assert!(!is_client_hello(&message));
    }

    #[test]
    fn rejects_fragmented_record() {
        let full = hello(&[0x55; 64]);
        assert!(!is_client_hello(&full[..40]));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut buf = hello(&[0x55; 16]);
        buf.push(0);
        assert!(!is_client_hello(&buf));
    }

    #[test]
    fn rejects_inconsistent_handshake_length() {
        let mut buf = hello(&[0x55; 16]);
        buf[8] += 1;
        assert!(!is_client_hello(&buf));
    }

    #[test]
    fn plaintext_is_plain() {
        assert_eq!(detect(&[0x01, 0x01]), Proto::Plain);
        assert_eq!(detect(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n"), Proto::Plain);
    }
}
