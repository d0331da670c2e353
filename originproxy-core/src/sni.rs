//! TLS ClientHello parsing: pull the SNI `server_name` out of a raw record
//! without needing a full TLS stack. Treated as a black box by the rest of
//! the crate — callers hand it whatever bytes Peek-Conn has buffered so far
//! and get back either a hostname or "not enough bytes yet".

const TLS_HANDSHAKE: u8 = 0x16;
const TLS_VERSION_MAJOR: u8 = 0x03;
const CLIENT_HELLO: u8 = 0x01;
const SNI_EXTENSION: u16 = 0x0000;
const HOST_NAME_TYPE: u8 = 0x00;

#[derive(Debug)]
pub enum SniError {
    InvalidTlsVersion,
    InvalidHandshakeType,
    InvalidClientHello,
    InvalidSniFormat,
    /// Not an error in the usual sense: the caller should read more bytes
    /// and try again.
    MessageTruncated,
}

impl std::fmt::Display for SniError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SniError::InvalidTlsVersion => write!(f, "invalid TLS version"),
            SniError::InvalidHandshakeType => write!(f, "invalid handshake type"),
            SniError::InvalidClientHello => write!(f, "invalid ClientHello"),
            SniError::InvalidSniFormat => write!(f, "invalid SNI format"),
            SniError::MessageTruncated => write!(f, "message truncated"),
        }
    }
}

impl std::error::Error for SniError {}

/// Extracts the SNI `server_name` from a (possibly partial) TLS record.
///
/// Returns `Err(MessageTruncated)` when `record` doesn't yet contain enough
/// bytes to decide; the caller should read more and retry with the extended
/// buffer rather than treating this as a hard failure.
pub fn extract_sni(record: &[u8]) -> Result<String, SniError> {
    if record.len() < 5 {
        return Err(SniError::MessageTruncated);
    }

    if record[0] != TLS_HANDSHAKE {
        return Err(SniError::InvalidHandshakeType);
    }
    if record[1] != TLS_VERSION_MAJOR {
        return Err(SniError::InvalidTlsVersion);
    }

    let record_length = ((record[3] as usize) << 8) | (record[4] as usize);
    if record.len() < record_length + 5 {
        return Err(SniError::MessageTruncated);
    }

    let handshake_start = 5;
    if record.len() < handshake_start + 4 {
        return Err(SniError::MessageTruncated);
    }
    if record[handshake_start] != CLIENT_HELLO {
        return Err(SniError::InvalidClientHello);
    }

    let handshake_length = ((record[handshake_start + 1] as usize) << 16)
        | ((record[handshake_start + 2] as usize) << 8)
        | (record[handshake_start + 3] as usize);
    if record.len() < handshake_start + 4 + handshake_length {
        return Err(SniError::MessageTruncated);
    }

    // Skip client_version (2 bytes) and random (32 bytes).
    let mut pos = handshake_start + 4 + 2 + 32;

    if record.len() < pos + 1 {
        return Err(SniError::MessageTruncated);
    }
    let session_id_length = record[pos] as usize;
    pos += 1 + session_id_length;

    if record.len() < pos + 2 {
        return Err(SniError::MessageTruncated);
    }
    let cipher_suites_length = ((record[pos] as usize) << 8) | (record[pos + 1] as usize);
    pos += 2 + cipher_suites_length;

    if record.len() < pos + 1 {
        return Err(SniError::MessageTruncated);
    }
    let compression_methods_length = record[pos] as usize;
    pos += 1 + compression_methods_length;

    if record.len() < pos + 2 {
        return Err(SniError::MessageTruncated);
    }
    let extensions_length = ((record[pos] as usize) << 8) | (record[pos + 1] as usize);
    pos += 2;

    if record.len() < pos + extensions_length {
        return Err(SniError::MessageTruncated);
    }

    let extensions_end = pos + extensions_length;
    while pos + 4 <= extensions_end {
        let extension_type = ((record[pos] as u16) << 8) | (record[pos + 1] as u16);
        let extension_length = ((record[pos + 2] as usize) << 8) | (record[pos + 3] as usize);
        pos += 4;

        if pos + extension_length > extensions_end {
            return Err(SniError::MessageTruncated);
        }

        if extension_type == SNI_EXTENSION {
            if extension_length < 2 {
                return Err(SniError::InvalidSniFormat);
            }

            let sni_list_length = ((record[pos] as usize) << 8) | (record[pos + 1] as usize);
            let mut name_pos = pos + 2;
            let names_end = pos + extension_length;
            if sni_list_length + 2 > extension_length {
                return Err(SniError::InvalidSniFormat);
            }

            while name_pos + 3 <= names_end {
                let name_type = record[name_pos];
                let name_length =
                    ((record[name_pos + 1] as usize) << 8) | (record[name_pos + 2] as usize);
                name_pos += 3;

                if name_pos + name_length > names_end {
                    return Err(SniError::MessageTruncated);
                }

                if name_type == HOST_NAME_TYPE {
                    return std::str::from_utf8(&record[name_pos..name_pos + name_length])
                        .map(|s| s.to_string())
                        .map_err(|_| SniError::InvalidSniFormat);
                }

                name_pos += name_length;
            }
        }

        pos += extension_length;
    }

    Err(SniError::InvalidSniFormat)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_hello_with_sni(hostname: &[u8]) -> Vec<u8> {
        let mut extension = Vec::new();
        extension.extend_from_slice(&((hostname.len() + 3) as u16).to_be_bytes()); // sni list length
        extension.push(0x00); // name type: host_name
        extension.extend_from_slice(&(hostname.len() as u16).to_be_bytes());
        extension.extend_from_slice(hostname);

        let mut extensions = Vec::new();
        extensions.extend_from_slice(&[0x00, 0x00]); // extension type: SNI
        extensions.extend_from_slice(&(extension.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&extension);

        let mut handshake_body = Vec::new();
        handshake_body.extend_from_slice(&[0x03, 0x03]); // client_version
        handshake_body.extend_from_slice(&[0u8; 32]); // random
        handshake_body.push(0x00); // session id length
        handshake_body.extend_from_slice(&[0x00, 0x02]); // cipher suites length
        handshake_body.extend_from_slice(&[0x00, 0x00]); // cipher suites
        handshake_body.push(0x01); // compression methods length
        handshake_body.push(0x00); // compression methods
        handshake_body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        handshake_body.extend_from_slice(&extensions);

        let mut handshake = Vec::new();
        handshake.push(CLIENT_HELLO);
        let len = handshake_body.len() as u32;
        handshake.extend_from_slice(&len.to_be_bytes()[1..]); // 3-byte length
        handshake.extend_from_slice(&handshake_body);

        let mut record = Vec::new();
        record.push(TLS_HANDSHAKE);
        record.extend_from_slice(&[0x03, 0x01]); // record version
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn extracts_sni_hostname() {
        let record = client_hello_with_sni(b"example.com");
        assert_eq!(extract_sni(&record).unwrap(), "example.com");
    }

    #[test]
    fn truncated_record_is_message_truncated() {
        let record = client_hello_with_sni(b"example.com");
        let err = extract_sni(&record[..10]).unwrap_err();
        assert!(matches!(err, SniError::MessageTruncated));
    }

    #[test]
    fn non_handshake_record_is_rejected() {
        let mut record = client_hello_with_sni(b"example.com");
        record[0] = 0x17; // application_data
        let err = extract_sni(&record).unwrap_err();
        assert!(matches!(err, SniError::InvalidHandshakeType));
    }

    #[test]
    fn missing_sni_extension_is_invalid_format() {
        // A ClientHello with an empty extensions block.
        let mut handshake_body = Vec::new();
        handshake_body.extend_from_slice(&[0x03, 0x03]);
        handshake_body.extend_from_slice(&[0u8; 32]);
        handshake_body.push(0x00);
        handshake_body.extend_from_slice(&[0x00, 0x02]);
        handshake_body.extend_from_slice(&[0x00, 0x00]);
        handshake_body.push(0x01);
        handshake_body.push(0x00);
        handshake_body.extend_from_slice(&[0x00, 0x00]); // zero-length extensions

        let mut handshake = Vec::new();
        handshake.push(CLIENT_HELLO);
        let len = handshake_body.len() as u32;
        handshake.extend_from_slice(&len.to_be_bytes()[1..]);
        handshake.extend_from_slice(&handshake_body);

        let mut record = Vec::new();
        record.push(TLS_HANDSHAKE);
        record.extend_from_slice(&[0x03, 0x01]);
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);

        let err = extract_sni(&record).unwrap_err();
        assert!(matches!(err, SniError::InvalidSniFormat));
    }
}
