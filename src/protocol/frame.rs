//! Length-prefixed framing.
//!
//! A frame is six ASCII hex digits giving the payload's byte length, followed
//! by exactly that many bytes of printed s-expression.

use std::borrow::Cow;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{error, trace};

use super::constants::{HEADER_LEN, MAX_PAYLOAD};
use super::error::{EncodingError, FramingError, SendError};
use super::sexp::{self, Sexp};
use crate::config::CodingSystem;
use crate::utils::io::{read_full, write_all};

const REX_PREFIX: &str = "(:emacs-rex (";

/// Prefix `payload` with its length header.
pub fn frame_payload(payload: &[u8]) -> Result<Vec<u8>, EncodingError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(EncodingError::PayloadTooLarge {
            size: payload.len(),
        });
    }
    let len = payload.len() as u32;
    let header = hex::encode(&len.to_be_bytes()[1..]);

    let mut framed = Vec::with_capacity(HEADER_LEN + payload.len());
    framed.extend_from_slice(header.as_bytes());
    framed.extend_from_slice(payload);
    Ok(framed)
}

pub fn encode(msg: &Sexp, coding: CodingSystem) -> Result<Vec<u8>, EncodingError> {
    let payload = coding.encode(&msg.to_string())?;
    frame_payload(&payload)
}

/// Parse a six digit hex header; either letter case is accepted.
pub fn parse_header(header: &[u8]) -> Result<usize, FramingError> {
    let invalid = || FramingError::InvalidHeader(String::from_utf8_lossy(header).into_owned());
    if header.len() != HEADER_LEN {
        return Err(invalid());
    }
    let bytes = hex::decode(header).map_err(|_| invalid())?;
    Ok(bytes
        .iter()
        .fold(0usize, |acc, byte| (acc << 8) | usize::from(*byte)))
}

/// Rewrite `(:emacs-rex (pkg:fn` to `(:emacs-rex (pkg/fn`.
///
/// Only the operator of an `:emacs-rex` form is touched; `pkg` must match
/// `[A-Za-z][A-Za-z0-9]+`.
pub fn fix_namespace(text: &str) -> Cow<'_, str> {
    let Some(rest) = text.strip_prefix(REX_PREFIX) else {
        return Cow::Borrowed(text);
    };
    let pkg_len = rest
        .bytes()
        .take_while(|b| b.is_ascii_alphanumeric())
        .count();
    let starts_alpha = rest.bytes().next().is_some_and(|b| b.is_ascii_alphabetic());
    if pkg_len < 2 || !starts_alpha || rest.as_bytes().get(pkg_len) != Some(&b':') {
        return Cow::Borrowed(text);
    }
    let split = REX_PREFIX.len() + pkg_len;
    Cow::Owned(format!("{}/{}", &text[..split], &text[split + 1..]))
}

pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    coding: CodingSystem,
) -> Result<Sexp, FramingError> {
    let mut header = [0u8; HEADER_LEN];
    let got = read_full(reader, &mut header).await?;
    if got == 0 {
        return Err(FramingError::Closed);
    }
    if got < HEADER_LEN {
        error!("Frame header truncated after {} bytes", got);
        return Err(FramingError::Truncated {
            expected: HEADER_LEN,
            received: got,
        });
    }

    let len = parse_header(&header)?;
    let mut payload = vec![0u8; len];
    let got = read_full(reader, &mut payload).await?;
    if got < len {
        error!("Frame payload truncated: expected={}, received={}", len, got);
        return Err(FramingError::Truncated {
            expected: len,
            received: got,
        });
    }

    let text = coding.decode(&payload).ok_or(FramingError::Decoding {
        coding: coding.name(),
    })?;
    let text = fix_namespace(&text);
    trace!("<- {}", text);
    Ok(sexp::parse(&text)?)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Sexp,
    coding: CodingSystem,
) -> Result<(), SendError> {
    let framed = encode(msg, coding)?;
    trace!("-> {}", msg);
    write_all(writer, &framed).await?;
    Ok(())
}

/// Send path of a connection: owns the write half and the coding system.
pub struct FrameWriter<W> {
    writer: W,
    coding: CodingSystem,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W, coding: CodingSystem) -> Self {
        Self { writer, coding }
    }

    pub async fn send(&mut self, msg: &Sexp) -> Result<(), SendError> {
        write_frame(&mut self.writer, msg, self.coding).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::io::AsyncWriteExt;

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(MAX_PAYLOAD)]
    fn header_matches_payload_length(#[case] size: usize) {
        let payload = vec![b'a'; size];
        let framed = frame_payload(&payload).expect("frame payload");
        let len = parse_header(&framed[..HEADER_LEN]).expect("parse header");
        assert_eq!(len, size);
        assert_eq!(framed.len() - HEADER_LEN, size);
    }

    #[test]
    fn header_is_zero_padded_hex() {
        let framed = frame_payload(b"(:ok)").expect("frame payload");
        assert_eq!(&framed[..HEADER_LEN], b"000005");
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let payload = vec![b'a'; MAX_PAYLOAD + 1];
        assert!(matches!(
            frame_payload(&payload),
            Err(EncodingError::PayloadTooLarge { size }) if size == MAX_PAYLOAD + 1
        ));
    }

    #[test]
    fn header_accepts_either_case() {
        assert_eq!(parse_header(b"00001A").expect("upper"), 26);
        assert_eq!(parse_header(b"00001a").expect("lower"), 26);
        assert!(matches!(
            parse_header(b"0000zz"),
            Err(FramingError::InvalidHeader(_))
        ));
    }

    #[tokio::test]
    async fn messages_survive_the_wire() {
        let messages = vec![
            Sexp::list([
                Sexp::keyword("return"),
                Sexp::list([Sexp::keyword("ok"), Sexp::Int(3)]),
                Sexp::Int(1),
            ]),
            Sexp::list([
                Sexp::keyword("write-string"),
                Sexp::string("caf\u{e9} \"quoted\"\n"),
            ]),
            Sexp::list([Sexp::keyword("new-package"), Sexp::string("user"), Sexp::Nil]),
        ];

        let (mut client, mut server) = tokio::io::duplex(4096);
        for msg in &messages {
            write_frame(&mut client, msg, CodingSystem::Utf8Unix)
                .await
                .expect("write frame");
        }
        drop(client);

        for expected in &messages {
            let got = read_frame(&mut server, CodingSystem::Utf8Unix)
                .await
                .expect("read frame");
            assert_eq!(&got, expected);
        }
        assert!(matches!(
            read_frame(&mut server, CodingSystem::Utf8Unix).await,
            Err(FramingError::Closed)
        ));
    }

    #[tokio::test]
    async fn latin1_frames_count_encoded_bytes() {
        let msg = Sexp::string("\u{e9}\u{e9}");
        let framed = encode(&msg, CodingSystem::IsoLatin1Unix).expect("encode");
        assert_eq!(&framed[..HEADER_LEN], b"000004");

        let mut reader = framed.as_slice();
        let got = read_frame(&mut reader, CodingSystem::IsoLatin1Unix)
            .await
            .expect("read frame");
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn truncated_payload_is_a_framing_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"00000a(:ok").await.expect("write");
        drop(client);
        assert!(matches!(
            read_frame(&mut server, CodingSystem::Utf8Unix).await,
            Err(FramingError::Truncated {
                expected: 10,
                received: 4
            })
        ));
    }

    #[tokio::test]
    async fn truncated_header_is_a_framing_error() {
        let mut reader: &[u8] = b"000";
        assert!(matches!(
            read_frame(&mut reader, CodingSystem::Utf8Unix).await,
            Err(FramingError::Truncated {
                expected: HEADER_LEN,
                received: 3
            })
        ));
    }

    #[tokio::test]
    async fn unparsable_payload_is_a_framing_error() {
        let mut reader: &[u8] = b"000003(a ";
        assert!(matches!(
            read_frame(&mut reader, CodingSystem::Utf8Unix).await,
            Err(FramingError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn deeply_nested_payload_is_malformed() {
        let payload = format!("{}{}", "(".repeat(200_000), ")".repeat(200_000));
        let framed = frame_payload(payload.as_bytes()).expect("frame fits");
        let mut reader: &[u8] = &framed;
        assert!(matches!(
            read_frame(&mut reader, CodingSystem::Utf8Unix).await,
            Err(FramingError::Malformed(sexp::SexpError::TooDeep { line: 1 }))
        ));
    }

    #[tokio::test]
    async fn namespace_shim_applies_while_reading() {
        let framed = frame_payload(br#"(:emacs-rex (swank:connection-info) "user" t 1)"#)
            .expect("frame payload");
        let mut reader = framed.as_slice();
        let msg = read_frame(&mut reader, CodingSystem::Utf8Unix)
            .await
            .expect("read frame");
        let form = msg.as_list().expect("list")[1].clone();
        assert_eq!(form, Sexp::list([Sexp::symbol("swank/connection-info")]));
    }

    #[test]
    fn namespace_shim_only_touches_the_operator() {
        assert_eq!(
            fix_namespace(r#"(:emacs-rex (swank:eval "a:b") "user" t 2)"#),
            r#"(:emacs-rex (swank/eval "a:b") "user" t 2)"#
        );
        // Not an :emacs-rex message.
        assert_eq!(fix_namespace("(:foo (swank:bar))"), "(:foo (swank:bar))");
        // Package must be at least two characters and start with a letter.
        assert_eq!(
            fix_namespace("(:emacs-rex (s:x) \"user\" t 3)"),
            "(:emacs-rex (s:x) \"user\" t 3)"
        );
        assert_eq!(
            fix_namespace("(:emacs-rex (1a:x) \"user\" t 3)"),
            "(:emacs-rex (1a:x) \"user\" t 3)"
        );
        // Already qualified with a slash.
        assert!(matches!(
            fix_namespace("(:emacs-rex (swank/x) \"user\" t 4)"),
            Cow::Borrowed(_)
        ));
    }
}
