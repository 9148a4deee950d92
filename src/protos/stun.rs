//! STUN packets sending and receiving.

use std::net::SocketAddr;

use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};
use stun_rs::{
    DecoderContextBuilder, MessageDecoderBuilder, MessageEncoderBuilder, StunMessageBuilder,
    attributes::stun::XorMappedAddress,
};
pub use stun_rs::{
    MessageClass, MessageDecoder, TransactionId, attributes::StunAttribute,
    error::StunDecodeError, methods,
};

/// Errors that can occur when handling a STUN packet.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The STUN message could not be parsed or is otherwise invalid.
    #[snafu(display("invalid message"))]
    InvalidMessage {},
    /// STUN request is not a binding request when it should be.
    #[snafu(display("not binding"))]
    NotBinding {},
    /// STUN packet is not a response when it should be.
    #[snafu(display("not success response"))]
    NotSuccessResponse {},
    /// STUN response has malformed attributes.
    #[snafu(display("malformed attributes"))]
    MalformedAttrs {},
    /// STUN request didn't end in fingerprint.
    #[snafu(display("no fingerprint"))]
    NoFingerprint {},
}

/// Size of the buffers used to encode the messages this module produces.
const ENCODE_BUFFER_SIZE: usize = 150;

/// Generates a binding request STUN packet.
#[cfg(test)]
pub(crate) fn request(tx: TransactionId) -> Vec<u8> {
    let fp = stun_rs::attributes::stun::Fingerprint::default();
    let msg = StunMessageBuilder::new(methods::BINDING, MessageClass::Request)
        .with_transaction_id(tx)
        .with_attribute(fp)
        .build();

    let encoder = MessageEncoderBuilder::default().build();
    let mut buffer = vec![0u8; ENCODE_BUFFER_SIZE];
    let size = encoder.encode(&mut buffer, &msg).expect("invalid encoding");
    buffer.truncate(size);
    buffer
}

/// Generates a binding response reflecting `addr` back to the requester.
pub fn response(tx: TransactionId, addr: SocketAddr) -> Vec<u8> {
    let msg = StunMessageBuilder::new(methods::BINDING, MessageClass::SuccessResponse)
        .with_transaction_id(tx)
        .with_attribute(XorMappedAddress::from(addr))
        .build();

    let encoder = MessageEncoderBuilder::default().build();
    let mut buffer = vec![0u8; ENCODE_BUFFER_SIZE];
    let size = encoder.encode(&mut buffer, &msg).expect("invalid encoding");
    buffer.truncate(size);
    buffer
}

// const MAGIC_COOKIE: Cookie = Cookie(0x2112_A442);
const COOKIE: [u8; 4] = 0x2112_A442u32.to_be_bytes();

/// Reports whether b is a STUN message.
pub fn is(b: &[u8]) -> bool {
    b.len() >= stun_rs::MESSAGE_HEADER_SIZE
        && b[0] & 0b1100_0000 == 0 // top two bits must be zero
        && b[4..8] == COOKIE
}

/// Parses a STUN binding request.
pub fn parse_binding_request(b: &[u8]) -> Result<TransactionId, Error> {
    let ctx = DecoderContextBuilder::default()
        .with_validation() // ensure fingerprint is validated
        .build();
    let decoder = MessageDecoderBuilder::default().with_context(ctx).build();
    let (msg, _) = decoder
        .decode(b)
        .map_err(|_| InvalidMessageSnafu.build())?;

    let tx = *msg.transaction_id();
    snafu::ensure!(msg.method() == methods::BINDING, NotBindingSnafu);

    match msg.attributes().last() {
        Some(attr) if attr.is_fingerprint() => Ok(tx),
        _ => Err(NoFingerprintSnafu.build()),
    }
}

/// Parses a successful binding response STUN packet.
///
/// The IP address is extracted from the XOR-MAPPED-ADDRESS attribute, falling back to
/// MAPPED-ADDRESS.
#[cfg(test)]
pub(crate) fn parse_response(b: &[u8]) -> Result<(TransactionId, SocketAddr), Error> {
    let decoder = MessageDecoder::default();
    let (msg, _) = decoder
        .decode(b)
        .map_err(|_| InvalidMessageSnafu.build())?;

    let tx = *msg.transaction_id();
    snafu::ensure!(
        msg.class() == MessageClass::SuccessResponse,
        NotSuccessResponseSnafu
    );

    let mut addr = None;
    let mut fallback_addr = None;
    for attr in msg.attributes() {
        match attr {
            StunAttribute::XorMappedAddress(a) => {
                let mut a = *a.socket_address();
                a.set_ip(a.ip().to_canonical());
                addr = Some(a);
            }
            StunAttribute::MappedAddress(a) => {
                let mut a = *a.socket_address();
                a.set_ip(a.ip().to_canonical());
                fallback_addr = Some(a);
            }
            _ => {}
        }
    }

    addr.or(fallback_addr)
        .map(|addr| (tx, addr))
        .ok_or_else(|| MalformedAttrsSnafu.build())
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    struct ResponseTestCase {
        name: &'static str,
        data: Vec<u8>,
        want_tid: Vec<u8>,
        want_addr: IpAddr,
        want_port: u16,
    }

    #[test]
    fn test_parse_response() {
        let cases = vec![
            ResponseTestCase {
                name: "google-1",
                data: vec![
                    0x01, 0x01, 0x00, 0x0c, 0x21, 0x12, 0xa4, 0x42, 0x23, 0x60, 0xb1, 0x1e, 0x3e,
                    0xc6, 0x8f, 0xfa, 0x93, 0xe0, 0x80, 0x07, 0x00, 0x20, 0x00, 0x08, 0x00, 0x01,
                    0xc7, 0x86, 0x69, 0x57, 0x85, 0x6f,
                ],
                want_tid: vec![
                    0x23, 0x60, 0xb1, 0x1e, 0x3e, 0xc6, 0x8f, 0xfa, 0x93, 0xe0, 0x80, 0x07,
                ],
                want_addr: IpAddr::V4(Ipv4Addr::from([72, 69, 33, 45])),
                want_port: 59028,
            },
            ResponseTestCase {
                name: "stun.powervoip.com:3478",
                data: vec![
                    0x01, 0x01, 0x00, 0x24, 0x21, 0x12, 0xa4, 0x42, 0x7e, 0x57, 0x96, 0x68, 0x29,
                    0xf4, 0x44, 0x60, 0x9d, 0x1d, 0xea, 0xa6, 0x00, 0x01, 0x00, 0x08, 0x00, 0x01,
                    0xe9, 0xd3, 0x48, 0x45, 0x21, 0x2d, 0x00, 0x04, 0x00, 0x08, 0x00, 0x01, 0x0d,
                    0x96, 0x4d, 0x48, 0xa9, 0xd4, 0x00, 0x05, 0x00, 0x08, 0x00, 0x01, 0x0d, 0x97,
                    0x4d, 0x48, 0xa9, 0xd5,
                ],
                want_tid: vec![
                    0x7e, 0x57, 0x96, 0x68, 0x29, 0xf4, 0x44, 0x60, 0x9d, 0x1d, 0xea, 0xa6,
                ],
                want_addr: IpAddr::V4(Ipv4Addr::from([72, 69, 33, 45])),
                want_port: 59859,
            },
            // padding rules, software attribute of length 3 before XorMappedAddress
            ResponseTestCase {
                name: "software-abc",
                data: vec![
                    0x01, 0x01, 0x00, 0x14, 0x21, 0x12, 0xa4, 0x42, 0xeb, 0xc2, 0xd3, 0x6e, 0xf4,
                    0x71, 0x21, 0x7c, 0x4f, 0x3e, 0x30, 0x8e, 0x80, 0x22, 0x00, 0x03, 0x61, 0x62,
                    0x63, 0x00, 0x00, 0x20, 0x00, 0x08, 0x00, 0x01, 0xce, 0x66, 0x5e, 0x12, 0xa4,
                    0x43,
                ],
                want_tid: vec![
                    0xeb, 0xc2, 0xd3, 0x6e, 0xf4, 0x71, 0x21, 0x7c, 0x4f, 0x3e, 0x30, 0x8e,
                ],
                want_addr: IpAddr::V4(Ipv4Addr::from([127, 0, 0, 1])),
                want_port: 61300,
            },
        ];

        for (i, test) in cases.into_iter().enumerate() {
            println!("Case {i}: {}", test.name);
            let (tx, addr_port) = parse_response(&test.data).unwrap();
            assert!(is(&test.data));
            assert_eq!(tx.as_bytes(), &test.want_tid[..]);
            assert_eq!(addr_port.ip(), test.want_addr);
            assert_eq!(addr_port.port(), test.want_port);
        }
    }

    #[test]
    fn test_parse_binding_request() {
        let tx = TransactionId::default();
        let req = request(tx);
        assert!(is(&req));
        let got_tx = parse_binding_request(&req).unwrap();
        assert_eq!(got_tx, tx);
    }

    #[test]
    fn test_binding_request_without_fingerprint() {
        let tx = TransactionId::default();
        let mut req = request(tx);
        // drop the fingerprint attribute and fix up the header length
        req.truncate(stun_rs::MESSAGE_HEADER_SIZE);
        req[2] = 0;
        req[3] = 0;
        assert!(is(&req));
        assert!(parse_binding_request(&req).is_err());
    }

    #[test]
    fn test_not_stun() {
        assert!(!is(b"missing-magic-prefix"));
        assert!(!is(&[0u8; 4]));
        let mut req = request(TransactionId::default());
        req[0] |= 0b1000_0000;
        assert!(!is(&req));
    }

    #[test]
    fn test_response() {
        let txn = |n| TransactionId::from([n; 12]);

        let cases: [(TransactionId, &str, u16); 4] = [
            (txn(1), "1.2.3.4", 254),
            (txn(2), "1.2.3.4", 257),
            (txn(3), "1::4", 254),
            (txn(4), "1::4", 257),
        ];

        for (tx, addr, port) in cases {
            let addr: IpAddr = addr.parse().unwrap();
            let res = response(tx, SocketAddr::new(addr, port));
            assert!(is(&res));
            let (tx2, addr2) = parse_response(&res).unwrap();
            assert_eq!(tx, tx2);
            assert_eq!(addr, addr2.ip());
            assert_eq!(port, addr2.port());
        }
    }
}
