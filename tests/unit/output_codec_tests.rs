//! Unit tests for the line-buffering output codec.
//!
//! Covers complete-line release, partial-tail reporting without consumption,
//! forced flushing of oversized partial lines, and end-of-stream flushing.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use command_assist::stream::codec::{Frame, OutputCodec};

fn decode_all(codec: &mut OutputCodec, buf: &mut BytesMut) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Some(frame) = codec.decode(buf).expect("decode should not fail") {
        frames.push(frame);
    }
    frames
}

#[test]
fn complete_lines_are_released_together() {
    let mut codec = OutputCodec::new(1024);
    let mut buf = BytesMut::from("alpha\nbeta\n");

    let frames = decode_all(&mut codec, &mut buf);

    assert_eq!(frames, vec![Frame::Lines("alpha\nbeta\n".into())]);
    assert!(buf.is_empty());
}

#[test]
fn partial_tail_is_reported_but_not_consumed() {
    let mut codec = OutputCodec::new(1024);
    let mut buf = BytesMut::from("done\nEnter name: ");

    let frames = decode_all(&mut codec, &mut buf);

    assert_eq!(
        frames,
        vec![
            Frame::Lines("done\n".into()),
            Frame::Partial("Enter name: ".into()),
        ]
    );
    assert_eq!(&buf[..], b"Enter name: ");
}

#[test]
fn unchanged_partial_is_reported_once() {
    let mut codec = OutputCodec::new(1024);
    let mut buf = BytesMut::from("Password:");

    assert_eq!(
        codec.decode(&mut buf).unwrap(),
        Some(Frame::Partial("Password:".into()))
    );
    assert_eq!(codec.decode(&mut buf).unwrap(), None);
    assert_eq!(codec.decode(&mut buf).unwrap(), None);
}

#[test]
fn growing_partial_reports_whole_tail() {
    let mut codec = OutputCodec::new(1024);
    let mut buf = BytesMut::from("Contin");
    assert_eq!(
        codec.decode(&mut buf).unwrap(),
        Some(Frame::Partial("Contin".into()))
    );

    buf.extend_from_slice(b"ue? [y/N] ");
    assert_eq!(
        codec.decode(&mut buf).unwrap(),
        Some(Frame::Partial("Continue? [y/N] ".into()))
    );
}

#[test]
fn held_tail_is_emitted_with_following_newline() {
    let mut codec = OutputCodec::new(1024);
    let mut buf = BytesMut::from("Enter name: ");
    let _ = decode_all(&mut codec, &mut buf);

    buf.extend_from_slice(b"Hello bob\n");
    let frames = decode_all(&mut codec, &mut buf);

    assert_eq!(frames, vec![Frame::Lines("Enter name: Hello bob\n".into())]);
}

#[test]
fn oversized_partial_is_flushed_at_char_boundary() {
    let mut codec = OutputCodec::new(4);
    // "ab€": the euro sign is three bytes, so byte 4 splits it.
    let mut buf = BytesMut::from("ab€");

    let frames = decode_all(&mut codec, &mut buf);

    assert_eq!(
        frames,
        vec![Frame::Lines("ab".into()), Frame::Partial("€".into())]
    );
}

#[test]
fn eof_flushes_trailing_partial_as_lines() {
    let mut codec = OutputCodec::new(1024);
    let mut buf = BytesMut::from("last line without newline");
    let _ = decode_all(&mut codec, &mut buf);

    let frame = codec.decode_eof(&mut buf).unwrap();

    assert_eq!(
        frame,
        Some(Frame::Lines("last line without newline".into()))
    );
    assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
}

#[test]
fn invalid_utf8_is_replaced_not_rejected() {
    let mut codec = OutputCodec::new(1024);
    let mut buf = BytesMut::from(&b"bad \xff byte\n"[..]);

    let frames = decode_all(&mut codec, &mut buf);

    assert_eq!(frames, vec![Frame::Lines("bad \u{fffd} byte\n".into())]);
}
