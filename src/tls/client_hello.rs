//! ClientHello Key-Algorithm Analyzer
//!
//! Inspects the raw bytes of a TLS ClientHello to decide which server
//! certificate key algorithm (RSA or EC) the client prefers, so the
//! context factory can present a compatible identity.
//!
//! The analyzer is a pure function over a byte slice: it never consumes
//! the stream (callers sniff into a buffer and replay it), and any parse
//! failure yields `Unknown` rather than an error.

use std::fmt;

use crate::tls::KeyAlgorithm;

/// Client or server preference for the certificate key algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithmPreference {
    /// Nothing recognizable was offered.
    Unknown,
    /// Both RSA and ECDSA families were offered.
    Mixed,
    /// Only the RSA family was offered.
    Rsa,
    /// Only the ECDSA family was offered.
    Ecc,
}

impl fmt::Display for KeyAlgorithmPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "UNKNOWN",
            Self::Mixed => "MIXED",
            Self::Rsa => "RSA",
            Self::Ecc => "ECC",
        };
        f.write_str(s)
    }
}

impl KeyAlgorithmPreference {
    /// Combine a client-derived preference with a server-side preference.
    ///
    /// Rows are the client preference, columns the server preference, in
    /// the order UNKNOWN, MIXED, RSA, ECC.
    pub fn combine(self, server: KeyAlgorithmPreference) -> KeyAlgorithmPreference {
        use KeyAlgorithmPreference::*;
        const TABLE: [[KeyAlgorithmPreference; 4]; 4] = [
            // srv:  UNKNOWN  MIXED  RSA  ECC
            /* cli UNKNOWN */ [Unknown, Mixed, Rsa, Ecc],
            /* cli MIXED   */ [Mixed, Mixed, Rsa, Ecc],
            /* cli RSA     */ [Rsa, Rsa, Rsa, Ecc],
            /* cli ECC     */ [Ecc, Ecc, Rsa, Ecc],
        ];
        TABLE[self.index()][server.index()]
    }

    /// Whether an identity with the given key algorithm is acceptable
    /// under this preference. An RSA identity matches unless the
    /// preference is strictly ECC, and vice versa.
    pub fn matches_algorithm(self, algorithm: KeyAlgorithm) -> bool {
        match algorithm {
            KeyAlgorithm::Rsa => self != KeyAlgorithmPreference::Ecc,
            KeyAlgorithm::Ec => self != KeyAlgorithmPreference::Rsa,
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Unknown => 0,
            Self::Mixed => 1,
            Self::Rsa => 2,
            Self::Ecc => 3,
        }
    }

    fn from_families(rsa: bool, ecc: bool) -> Self {
        match (rsa, ecc) {
            (true, true) => Self::Mixed,
            (true, false) => Self::Rsa,
            (false, true) => Self::Ecc,
            (false, false) => Self::Unknown,
        }
    }
}

/// TLS extension number for `signature_algorithms` (RFC 8446 §4.2.3).
const EXT_SIGNATURE_ALGORITHMS: u16 = 0x000d;

/// TLS extension number for `server_name` (RFC 6066).
const EXT_SERVER_NAME: u16 = 0x0000;

/// Determine the client's key-algorithm preference from a raw ClientHello.
///
/// Prefers the `signature_algorithms` extension; falls back to the
/// key-exchange families of the offered cipher suites when the extension
/// is absent or yields `Unknown`. Returns `Unknown` on any parse error.
pub fn determine_preference(client_hello: &[u8]) -> KeyAlgorithmPreference {
    let Some(hello) = parse_client_hello(client_hello) else {
        return KeyAlgorithmPreference::Unknown;
    };

    if let Some(schemes) = hello.signature_schemes {
        let preference = classify_signature_schemes(&schemes);
        if preference != KeyAlgorithmPreference::Unknown {
            return preference;
        }
    }

    classify_cipher_suites(&hello.cipher_suites)
}

/// Extract the SNI hostname from a raw ClientHello, if present.
pub fn extract_sni(client_hello: &[u8]) -> Option<String> {
    parse_client_hello(client_hello)?.server_name
}

struct ParsedHello {
    cipher_suites: Vec<u16>,
    signature_schemes: Option<Vec<u16>>,
    server_name: Option<String>,
}

/// Walk the record, handshake header and ClientHello body. Returns `None`
/// on truncation or anything that is not a ClientHello.
fn parse_client_hello(bytes: &[u8]) -> Option<ParsedHello> {
    let mut cur = Cursor::new(bytes);

    // TLS record header: type 0x16 (handshake), version, length.
    if cur.u8()? != 0x16 {
        return None;
    }
    cur.skip(2)?; // record version
    let record_len = cur.u16()? as usize;
    let mut cur = Cursor::new(cur.take(record_len)?);

    // Handshake header: type 0x01 (ClientHello), 24-bit length.
    if cur.u8()? != 0x01 {
        return None;
    }
    let body_len = cur.u24()? as usize;
    let mut cur = Cursor::new(cur.take(body_len)?);

    cur.skip(2)?; // legacy_version
    cur.skip(32)?; // random
    let session_id_len = cur.u8()? as usize;
    cur.skip(session_id_len)?;

    let cipher_suites_len = cur.u16()? as usize;
    if cipher_suites_len % 2 != 0 {
        return None;
    }
    let suite_bytes = cur.take(cipher_suites_len)?;
    let cipher_suites = suite_bytes
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();

    let compression_len = cur.u8()? as usize;
    cur.skip(compression_len)?;

    let mut signature_schemes = None;
    let mut server_name = None;

    // Extensions block is optional (absent in very old hellos).
    if let Some(ext_len) = cur.u16() {
        let mut ext = Cursor::new(cur.take(ext_len as usize)?);
        while ext.remaining() >= 4 {
            let ext_type = ext.u16()?;
            let ext_data_len = ext.u16()? as usize;
            let data = ext.take(ext_data_len)?;
            match ext_type {
                EXT_SIGNATURE_ALGORITHMS => {
                    signature_schemes = parse_signature_algorithms(data);
                }
                EXT_SERVER_NAME => {
                    server_name = parse_server_name(data);
                }
                _ => {}
            }
        }
    }

    Some(ParsedHello {
        cipher_suites,
        signature_schemes,
        server_name,
    })
}

fn parse_signature_algorithms(data: &[u8]) -> Option<Vec<u16>> {
    let mut cur = Cursor::new(data);
    let list_len = cur.u16()? as usize;
    let list = cur.take(list_len)?;
    if list.len() % 2 != 0 {
        return None;
    }
    Some(
        list.chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect(),
    )
}

fn parse_server_name(data: &[u8]) -> Option<String> {
    let mut cur = Cursor::new(data);
    let list_len = cur.u16()? as usize;
    let mut list = Cursor::new(cur.take(list_len)?);
    while list.remaining() >= 3 {
        let name_type = list.u8()?;
        let name_len = list.u16()? as usize;
        let name = list.take(name_len)?;
        if name_type == 0 {
            return String::from_utf8(name.to_vec()).ok();
        }
    }
    None
}

/// Classify signature schemes (RFC 8446 §4.2.3 values) into families.
fn classify_signature_schemes(schemes: &[u16]) -> KeyAlgorithmPreference {
    let mut rsa = false;
    let mut ecc = false;
    for &scheme in schemes {
        match scheme {
            // rsa_pkcs1_*, rsa_pss_rsae_*, rsa_pss_pss_*
            0x0201 | 0x0401 | 0x0501 | 0x0601 | 0x0804 | 0x0805 | 0x0806 | 0x0809 | 0x080a
            | 0x080b => rsa = true,
            // ecdsa_* and EdDSA
            0x0203 | 0x0403 | 0x0503 | 0x0603 | 0x0807 | 0x0808 => ecc = true,
            _ => {}
        }
    }
    KeyAlgorithmPreference::from_families(rsa, ecc)
}

/// Classify cipher suites by their key-exchange family. RSA, DHE_RSA and
/// DH_RSA count as RSA; ECDH, ECDHE and ECDH_anon count as ECC. TLS 1.3
/// suites carry no key exchange and are ignored.
fn classify_cipher_suites(suites: &[u16]) -> KeyAlgorithmPreference {
    let mut rsa = false;
    let mut ecc = false;
    for &suite in suites {
        match suite {
            // TLS_RSA_* (static RSA key exchange)
            0x0005 | 0x000a | 0x002f | 0x0035 | 0x003c | 0x003d | 0x009c | 0x009d
            // TLS_DHE_RSA_* / TLS_DH_RSA_*
            | 0x0016 | 0x0033 | 0x0039 | 0x0067 | 0x006b | 0x009e | 0x009f => rsa = true,
            // TLS_ECDHE_ECDSA_*, TLS_ECDHE_RSA_*, TLS_ECDH_* (ECDH family)
            0xc007..=0xc014 | 0xc023..=0xc030 | 0xcca8 | 0xcca9
            // TLS_ECDH_anon_*
            | 0xc015..=0xc019 => ecc = true,
            _ => {}
        }
    }
    KeyAlgorithmPreference::from_families(rsa, ecc)
}

/// Bounds-checked byte cursor. Every accessor returns `None` past the end
/// so truncated input degrades to `Unknown` instead of panicking.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn u8(&mut self) -> Option<u8> {
        let b = *self.bytes.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let hi = self.u8()?;
        let lo = self.u8()?;
        Some(u16::from_be_bytes([hi, lo]))
    }

    fn u24(&mut self) -> Option<u32> {
        let a = self.u8()?;
        let b = self.u8()?;
        let c = self.u8()?;
        Some(u32::from_be_bytes([0, a, b, c]))
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.bytes.len() {
            return None;
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Some(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a syntactically valid ClientHello with the given cipher
    /// suites and extensions.
    fn build_client_hello(cipher_suites: &[u16], extensions: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // legacy_version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id

        body.extend_from_slice(&((cipher_suites.len() * 2) as u16).to_be_bytes());
        for suite in cipher_suites {
            body.extend_from_slice(&suite.to_be_bytes());
        }

        body.extend_from_slice(&[1, 0]); // compression: null

        let mut ext_block = Vec::new();
        for (ext_type, data) in extensions {
            ext_block.extend_from_slice(&ext_type.to_be_bytes());
            ext_block.extend_from_slice(&(data.len() as u16).to_be_bytes());
            ext_block.extend_from_slice(data);
        }
        body.extend_from_slice(&(ext_block.len() as u16).to_be_bytes());
        body.extend_from_slice(&ext_block);

        let mut handshake = vec![0x01];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    fn signature_algorithms_ext(schemes: &[u16]) -> (u16, Vec<u8>) {
        let mut data = ((schemes.len() * 2) as u16).to_be_bytes().to_vec();
        for scheme in schemes {
            data.extend_from_slice(&scheme.to_be_bytes());
        }
        (EXT_SIGNATURE_ALGORITHMS, data)
    }

    fn server_name_ext(hostname: &str) -> (u16, Vec<u8>) {
        let name = hostname.as_bytes();
        let mut entry = vec![0u8]; // host_name type
        entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
        entry.extend_from_slice(name);
        let mut data = (entry.len() as u16).to_be_bytes().to_vec();
        data.extend_from_slice(&entry);
        (EXT_SERVER_NAME, data)
    }

    #[test]
    fn ecdsa_only_signature_schemes_yield_ecc() {
        let hello = build_client_hello(
            &[0x1301],
            &[signature_algorithms_ext(&[0x0403, 0x0503, 0x0603])],
        );
        assert_eq!(determine_preference(&hello), KeyAlgorithmPreference::Ecc);
    }

    #[test]
    fn rsa_only_signature_schemes_yield_rsa() {
        let hello = build_client_hello(
            &[0x1301],
            &[signature_algorithms_ext(&[0x0401, 0x0804])],
        );
        assert_eq!(determine_preference(&hello), KeyAlgorithmPreference::Rsa);
    }

    #[test]
    fn mixed_signature_schemes_yield_mixed() {
        let hello = build_client_hello(
            &[0x1301],
            &[signature_algorithms_ext(&[0x0401, 0x0403])],
        );
        assert_eq!(determine_preference(&hello), KeyAlgorithmPreference::Mixed);
    }

    #[test]
    fn unrecognized_signature_schemes_fall_back_to_cipher_suites() {
        // Unknown schemes in the extension, static-RSA cipher suite.
        let hello = build_client_hello(&[0x002f], &[signature_algorithms_ext(&[0xfefe])]);
        assert_eq!(determine_preference(&hello), KeyAlgorithmPreference::Rsa);
    }

    #[test]
    fn cipher_suite_fallback_classifies_ecdh_families_as_ecc() {
        let hello = build_client_hello(&[0xc02b, 0xc02c], &[]);
        assert_eq!(determine_preference(&hello), KeyAlgorithmPreference::Ecc);
    }

    #[test]
    fn mixed_cipher_suites_yield_mixed() {
        let hello = build_client_hello(&[0x002f, 0xc02b], &[]);
        assert_eq!(determine_preference(&hello), KeyAlgorithmPreference::Mixed);
    }

    #[test]
    fn tls13_only_suites_yield_unknown() {
        let hello = build_client_hello(&[0x1301, 0x1302], &[]);
        assert_eq!(determine_preference(&hello), KeyAlgorithmPreference::Unknown);
    }

    #[test]
    fn garbage_input_yields_unknown_without_panicking() {
        assert_eq!(determine_preference(&[]), KeyAlgorithmPreference::Unknown);
        assert_eq!(determine_preference(&[0x16]), KeyAlgorithmPreference::Unknown);
        assert_eq!(
            determine_preference(b"GET / HTTP/1.1\r\n"),
            KeyAlgorithmPreference::Unknown
        );
        // Truncated mid-extension.
        let mut hello = build_client_hello(&[0x002f], &[signature_algorithms_ext(&[0x0401])]);
        hello.truncate(hello.len() - 3);
        assert_eq!(determine_preference(&hello), KeyAlgorithmPreference::Unknown);
    }

    #[test]
    fn combination_table_rows() {
        use KeyAlgorithmPreference::*;
        // ECC client against RSA server resolves to RSA.
        assert_eq!(Ecc.combine(Rsa), Rsa);
        assert_eq!(Unknown.combine(Unknown), Unknown);
        assert_eq!(Unknown.combine(Mixed), Mixed);
        assert_eq!(Mixed.combine(Unknown), Mixed);
        assert_eq!(Mixed.combine(Ecc), Ecc);
        assert_eq!(Rsa.combine(Mixed), Rsa);
        assert_eq!(Rsa.combine(Ecc), Ecc);
        assert_eq!(Ecc.combine(Unknown), Ecc);
        assert_eq!(Ecc.combine(Ecc), Ecc);
    }

    #[test]
    fn preference_matching_is_permissive_except_strict_mismatch() {
        use KeyAlgorithmPreference::*;
        assert!(Unknown.matches_algorithm(KeyAlgorithm::Rsa));
        assert!(Unknown.matches_algorithm(KeyAlgorithm::Ec));
        assert!(Mixed.matches_algorithm(KeyAlgorithm::Rsa));
        assert!(Mixed.matches_algorithm(KeyAlgorithm::Ec));
        assert!(Rsa.matches_algorithm(KeyAlgorithm::Rsa));
        assert!(!Rsa.matches_algorithm(KeyAlgorithm::Ec));
        assert!(Ecc.matches_algorithm(KeyAlgorithm::Ec));
        assert!(!Ecc.matches_algorithm(KeyAlgorithm::Rsa));
    }

    #[test]
    fn sni_extraction() {
        let hello = build_client_hello(&[0x1301], &[server_name_ext("intercepted.example.com")]);
        assert_eq!(
            extract_sni(&hello).as_deref(),
            Some("intercepted.example.com")
        );
        let no_sni = build_client_hello(&[0x1301], &[]);
        assert_eq!(extract_sni(&no_sni), None);
    }
}
