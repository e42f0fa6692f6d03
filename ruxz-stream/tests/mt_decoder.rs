//! End-to-end tests of the multithreaded Stream decoder.

use ruxz_core::check::CheckKind;
use ruxz_core::error::{Error, Result};
use ruxz_stream::{
    stream_buffer_encode, stream_buffer_encode_opts, Action, MtDecoderOptions, MtStreamDecoder,
    Status, StreamEncodeOptions,
};

/// Drive a decoder over `data`, offering input in `in_chunk`-byte windows
/// and draining output through an `out_chunk`-byte buffer.
fn decode_chunked(
    options: MtDecoderOptions,
    data: &[u8],
    in_chunk: usize,
    out_chunk: usize,
) -> Result<Vec<u8>> {
    let mut decoder = MtStreamDecoder::new(options)?;
    let mut decoded = Vec::new();
    let mut in_pos: usize = 0;
    let mut buf = vec![0u8; out_chunk];

    for _ in 0..1_000_000 {
        let end = in_pos.saturating_add(in_chunk).min(data.len());
        let action = if end == data.len() {
            Action::Finish
        } else {
            Action::Run
        };

        let mut out_pos = 0;
        let status = decoder.code(&data[..end], &mut in_pos, &mut buf, &mut out_pos, action)?;
        decoded.extend_from_slice(&buf[..out_pos]);

        if status == Status::StreamEnd {
            return Ok(decoded);
        }
    }

    panic!("decoder made no forward progress");
}

fn decode_all(options: MtDecoderOptions, data: &[u8]) -> Result<Vec<u8>> {
    decode_chunked(options, data, data.len().max(1), 1 << 16)
}

fn sample_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 131 + i / 71) as u8).collect()
}

#[test]
fn test_minimal_empty_stream() {
    // The smallest possible Stream: header, empty index, footer.
    let input = [
        0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00, 0x00, 0x01, 0x69, 0x22, 0xDE, 0x36, 0x00, 0x00, 0x00,
        0x00, 0x1C, 0xDF, 0x44, 0x21, 0x90, 0x42, 0x99, 0x0D, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01,
        0x59, 0x5A,
    ];

    let mut decoder = MtStreamDecoder::new(MtDecoderOptions::default().threads(4)).unwrap();
    let mut out = [0u8; 16];
    let mut in_pos: usize = 0;
    let mut out_pos = 0;
    let status = decoder
        .code(&input, &mut in_pos, &mut out, &mut out_pos, Action::Finish)
        .unwrap();

    assert_eq!(status, Status::StreamEnd);
    assert_eq!(out_pos, 0);
    assert_eq!(in_pos, input.len());
}

#[test]
fn test_wrong_magic_is_format_error() {
    let mut input = stream_buffer_encode(b"hello", CheckKind::Crc32).unwrap();
    input[0] = 0xFC;

    let err = decode_all(MtDecoderOptions::default(), &input).unwrap_err();
    assert!(matches!(err, Error::Format(_)));
}

#[test]
fn test_single_threaded_equals_multi_threaded() {
    let data = sample_data(200_000);
    let encoded = stream_buffer_encode_opts(
        &data,
        StreamEncodeOptions::default()
            .check(CheckKind::Crc64)
            .block_size(8 << 10),
    )
    .unwrap();

    let reference = decode_all(MtDecoderOptions::default().threads(1), &encoded).unwrap();
    assert_eq!(reference, data);

    for threads in [2, 3, 4, 8, 16, 64] {
        let decoded = decode_all(MtDecoderOptions::default().threads(threads), &encoded).unwrap();
        assert_eq!(decoded, reference, "threads = {threads}");
    }
}

#[test]
fn test_chunked_io_grid() {
    let data = sample_data(40_000);
    let encoded = stream_buffer_encode_opts(
        &data,
        StreamEncodeOptions::default().block_size(4 << 10),
    )
    .unwrap();

    for in_chunk in [1usize, 7, 64, 4096, usize::MAX] {
        for out_chunk in [1usize, 13, 512, 1 << 16] {
            let in_chunk = in_chunk.min(encoded.len());
            let decoded = decode_chunked(
                MtDecoderOptions::default().threads(4),
                &encoded,
                in_chunk,
                out_chunk,
            )
            .unwrap();
            assert_eq!(decoded, data, "in {in_chunk} out {out_chunk}");
        }
    }
}

#[test]
fn test_concatenated_streams() {
    let a = sample_data(10_000);
    let b = b"second stream".to_vec();

    for padding_words in [0usize, 1, 3] {
        let mut input = stream_buffer_encode(&a, CheckKind::Crc32).unwrap();
        input.extend(std::iter::repeat(0x00).take(4 * padding_words));
        input.extend(stream_buffer_encode(&b, CheckKind::Sha256).unwrap());
        input.extend(std::iter::repeat(0x00).take(4 * padding_words));

        let decoded = decode_all(
            MtDecoderOptions::default().threads(4).concatenated(true),
            &input,
        )
        .unwrap();

        let mut expected = a.clone();
        expected.extend_from_slice(&b);
        assert_eq!(decoded, expected, "padding {padding_words}");
    }
}

#[test]
fn test_concatenated_bad_second_magic_is_data_error() {
    let first = stream_buffer_encode(b"Hello", CheckKind::Crc32).unwrap();
    let mut second = stream_buffer_encode(b"World", CheckKind::Crc32).unwrap();
    second[0] = 0xFC;

    let mut input = first;
    let split = input.len();
    input.extend_from_slice(&second);

    let mut decoder = MtStreamDecoder::new(
        MtDecoderOptions::default().threads(2).concatenated(true),
    )
    .unwrap();

    let mut decoded = Vec::new();
    let mut in_pos: usize = 0;
    let mut buf = [0u8; 256];
    let err = loop {
        let mut out_pos = 0;
        match decoder.code(&input, &mut in_pos, &mut buf, &mut out_pos, Action::Finish) {
            Ok(_) => decoded.extend_from_slice(&buf[..out_pos]),
            Err(err) => {
                decoded.extend_from_slice(&buf[..out_pos]);
                break err;
            }
        }
        assert!(in_pos <= input.len());
    };

    // Everything before the corrupt Stream was delivered, and the broken
    // magic of a *later* Stream is corruption, not a foreign format.
    assert_eq!(decoded, b"Hello");
    assert!(matches!(err, Error::Data(_)), "got {err:?}");
    assert!(in_pos >= split);
}

#[test]
fn test_stream_padding_must_be_multiple_of_four() {
    let mut input = stream_buffer_encode(b"pad me", CheckKind::Crc32).unwrap();
    input.extend_from_slice(&[0x00, 0x00]);

    let err = decode_all(
        MtDecoderOptions::default().concatenated(true),
        &input,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Data(_)));
}

#[test]
fn test_tell_no_check_is_informational() {
    let input = stream_buffer_encode(b"unchecked", CheckKind::None).unwrap();

    let mut decoder = MtStreamDecoder::new(
        MtDecoderOptions::default().threads(2).tell_no_check(true),
    )
    .unwrap();

    let mut decoded = Vec::new();
    let mut in_pos: usize = 0;
    let mut buf = [0u8; 64];
    let mut saw_no_check = false;

    loop {
        let mut out_pos = 0;
        let status = decoder
            .code(&input, &mut in_pos, &mut buf, &mut out_pos, Action::Finish)
            .unwrap();
        decoded.extend_from_slice(&buf[..out_pos]);
        match status {
            Status::NoCheck => saw_no_check = true,
            Status::StreamEnd => break,
            _ => {}
        }
    }

    assert!(saw_no_check);
    assert_eq!(decoded, b"unchecked");
    assert_eq!(decoder.get_check(), Some(CheckKind::None));
}

#[test]
fn test_tell_any_check_reports_kind() {
    let input = stream_buffer_encode(b"data", CheckKind::Crc64).unwrap();

    let mut decoder =
        MtStreamDecoder::new(MtDecoderOptions::default().tell_any_check(true)).unwrap();

    let mut in_pos: usize = 0;
    let mut buf = [0u8; 64];
    let mut out_pos = 0;
    let status = decoder
        .code(&input, &mut in_pos, &mut buf, &mut out_pos, Action::Finish)
        .unwrap();
    assert_eq!(status, Status::GetCheck);
    assert_eq!(decoder.get_check(), Some(CheckKind::Crc64));

    loop {
        let mut out_pos = 0;
        if decoder
            .code(&input, &mut in_pos, &mut buf, &mut out_pos, Action::Finish)
            .unwrap()
            == Status::StreamEnd
        {
            break;
        }
    }
}

#[test]
fn test_memlimit_threading_forces_direct_mode() {
    let data = sample_data(16_384);
    let encoded = stream_buffer_encode_opts(
        &data,
        StreamEncodeOptions::default().block_size(4096),
    )
    .unwrap();

    // 100 bytes can never admit a threaded Block; every Block must take
    // the direct path and still decode correctly.
    let options = MtDecoderOptions::default()
        .threads(4)
        .memlimit_threading(100)
        .memlimit_stop(100 << 20);
    let decoded = decode_all(options, &encoded).unwrap();
    assert_eq!(decoded, data);
}

#[test]
fn test_memlimit_stop_is_recoverable() {
    let data = sample_data(4096);
    let encoded = stream_buffer_encode(&data, CheckKind::Crc32).unwrap();

    let mut decoder = MtStreamDecoder::new(
        MtDecoderOptions::default()
            .memlimit_threading(16)
            .memlimit_stop(16),
    )
    .unwrap();

    let mut in_pos: usize = 0;
    let mut buf = vec![0u8; 8192];
    let mut out_pos = 0;

    let err = loop {
        match decoder.code(&encoded, &mut in_pos, &mut buf, &mut out_pos, Action::Finish) {
            Err(err) => break err,
            Ok(Status::StreamEnd) => panic!("decoding should hit the memory cap"),
            Ok(_) => {}
        }
    };
    assert!(matches!(err, Error::Memlimit { .. }));

    // Raising the cap lets the same handle continue where it stopped.
    decoder.memlimit_set(1 << 30).unwrap();
    decoder.memlimit_threading_set(1 << 30);

    let mut decoded = Vec::new();
    loop {
        let mut out_pos = 0;
        let status = decoder
            .code(&encoded, &mut in_pos, &mut buf, &mut out_pos, Action::Finish)
            .unwrap();
        decoded.extend_from_slice(&buf[..out_pos]);
        if status == Status::StreamEnd {
            break;
        }
    }
    assert_eq!(decoded, data);
}

#[test]
fn test_truncated_input_returns_buf_error() {
    let data = sample_data(10 << 10);
    let encoded = stream_buffer_encode(&data, CheckKind::Crc32).unwrap();
    let truncated = &encoded[..64];

    let mut decoder = MtStreamDecoder::new(MtDecoderOptions::default().threads(2)).unwrap();
    let mut in_pos: usize = 0;
    let mut buf = vec![0u8; 1 << 16];

    // Feed the fragment, then keep finishing with no input: the decoder
    // must fail with "no progress" instead of hanging or timing out.
    let err = loop {
        let mut out_pos = 0;
        match decoder.code(truncated, &mut in_pos, &mut buf, &mut out_pos, Action::Finish) {
            Ok(Status::StreamEnd) => panic!("truncated stream cannot end cleanly"),
            Ok(_) => {}
            Err(err) => break err,
        }
    };
    assert!(matches!(err, Error::Buf), "got {err:?}");
}

#[test]
fn test_corrupt_block_check_is_data_error() {
    let data = sample_data(3000);
    let mut encoded = stream_buffer_encode(&data, CheckKind::Crc32).unwrap();

    // The Block check sits right before the Index; the Index for one
    // Block is 4 + 2 VLIs + padding + CRC, and the footer is 12 bytes.
    // Flip a bit well inside the Block's payload checksum by corrupting
    // the uncompressed bytes instead: any payload byte works since the
    // check covers them all.
    let payload_at = 12 + 12 + 10; // header, block header, a few bytes in
    encoded[payload_at] ^= 0x01;

    let err = decode_all(MtDecoderOptions::default().threads(2), &encoded).unwrap_err();
    assert!(matches!(err, Error::Data(_)));
}

#[test]
fn test_ignore_check_skips_verification() {
    let data = sample_data(3000);
    let mut encoded = stream_buffer_encode(&data, CheckKind::Crc32).unwrap();
    let payload_at = 12 + 12 + 10;
    encoded[payload_at] ^= 0x01;

    // With verification off the corrupt byte flows straight through.
    let decoded = decode_all(
        MtDecoderOptions::default().ignore_check(true),
        &encoded,
    )
    .unwrap();
    assert_eq!(decoded.len(), data.len());
    assert_ne!(decoded, data);
}

#[test]
fn test_finish_after_stream_end_is_idempotent() {
    let input = stream_buffer_encode(b"idempotent", CheckKind::Crc32).unwrap();

    let mut decoder = MtStreamDecoder::new(MtDecoderOptions::default().threads(2)).unwrap();
    let mut in_pos: usize = 0;
    let mut buf = [0u8; 64];

    let mut decoded = Vec::new();
    loop {
        let mut out_pos = 0;
        let status = decoder
            .code(&input, &mut in_pos, &mut buf, &mut out_pos, Action::Finish)
            .unwrap();
        decoded.extend_from_slice(&buf[..out_pos]);
        if status == Status::StreamEnd {
            break;
        }
    }
    assert_eq!(decoded, b"idempotent");

    let in_before = in_pos;
    let mut out_pos = 0;
    let status = decoder
        .code(&input, &mut in_pos, &mut buf, &mut out_pos, Action::Finish)
        .unwrap();
    assert_eq!(status, Status::StreamEnd);
    assert_eq!(in_pos, in_before);
    assert_eq!(out_pos, 0);
}

#[test]
fn test_timeout_still_finishes() {
    let data = sample_data(300_000);
    let encoded = stream_buffer_encode_opts(
        &data,
        StreamEncodeOptions::default().block_size(16 << 10),
    )
    .unwrap();

    let mut decoder = MtStreamDecoder::new(
        MtDecoderOptions::default().threads(4).timeout_ms(1),
    )
    .unwrap();

    let mut decoded = Vec::new();
    let mut in_pos: usize = 0;
    let mut buf = vec![0u8; 4096];

    for _ in 0..10_000_000 {
        let mut out_pos = 0;
        let status = decoder
            .code(&encoded, &mut in_pos, &mut buf, &mut out_pos, Action::Finish)
            .unwrap();
        decoded.extend_from_slice(&buf[..out_pos]);
        match status {
            Status::StreamEnd => {
                assert_eq!(decoded, data);
                return;
            }
            Status::TimedOut | Status::Ok => {}
            other => panic!("unexpected status {other:?}"),
        }
    }
    panic!("decoder never finished");
}

#[test]
fn test_progress_counters_are_complete() {
    let data = sample_data(50_000);
    let encoded = stream_buffer_encode_opts(
        &data,
        StreamEncodeOptions::default().block_size(8 << 10),
    )
    .unwrap();

    let mut decoder = MtStreamDecoder::new(MtDecoderOptions::default().threads(4)).unwrap();
    let mut in_pos: usize = 0;
    let mut buf = vec![0u8; 1 << 16];
    let mut decoded = Vec::new();

    loop {
        let mut out_pos = 0;
        let status = decoder
            .code(&encoded, &mut in_pos, &mut buf, &mut out_pos, Action::Finish)
            .unwrap();
        decoded.extend_from_slice(&buf[..out_pos]);
        if status == Status::StreamEnd {
            break;
        }
    }

    let (progress_in, progress_out) = decoder.get_progress();
    assert_eq!(progress_in, encoded.len() as u64);
    assert_eq!(progress_out, data.len() as u64);
    assert_eq!(decoded, data);
}

#[test]
fn test_memory_usage_stays_under_threading_limit() {
    let data = sample_data(120_000);
    let encoded = stream_buffer_encode_opts(
        &data,
        StreamEncodeOptions::default().block_size(4 << 10),
    )
    .unwrap();

    // Generous enough for threaded mode with small blocks.
    let limit = 4u64 << 20;
    let mut decoder = MtStreamDecoder::new(
        MtDecoderOptions::default()
            .threads(4)
            .memlimit_threading(limit)
            .memlimit_stop(1 << 30),
    )
    .unwrap();

    let mut in_pos: usize = 0;
    let mut buf = vec![0u8; 4096];
    let mut decoded = Vec::new();

    loop {
        let mut out_pos = 0;
        let status = decoder
            .code(&encoded, &mut in_pos, &mut buf, &mut out_pos, Action::Finish)
            .unwrap();
        decoded.extend_from_slice(&buf[..out_pos]);
        assert!(
            decoder.memusage() <= limit.max(ruxz_stream::filter::MEMUSAGE_BASE),
            "memory usage exceeded the threading limit"
        );
        if status == Status::StreamEnd {
            break;
        }
    }
    assert_eq!(decoded, data);
}

#[test]
fn test_sync_flush_rejected() {
    let mut decoder = MtStreamDecoder::new(MtDecoderOptions::default()).unwrap();
    let mut in_pos: usize = 0;
    let mut out_pos = 0;
    let err = decoder
        .code(&[], &mut in_pos, &mut [], &mut out_pos, Action::SyncFlush)
        .unwrap_err();
    assert!(matches!(err, Error::Prog(_)));
}

#[test]
fn test_invalid_thread_count_rejected() {
    assert!(MtStreamDecoder::new(MtDecoderOptions::default().threads(0)).is_err());
    assert!(
        MtStreamDecoder::new(MtDecoderOptions::default().threads(ruxz_stream::THREADS_MAX + 1))
            .is_err()
    );
}

#[test]
fn test_empty_blocks_and_single_byte_output() {
    // A zero-length payload still produces a fully framed Stream that
    // reports StreamEnd even through a zero-length output buffer.
    let encoded = stream_buffer_encode(&[], CheckKind::Crc32).unwrap();
    let decoded = decode_chunked(MtDecoderOptions::default().threads(2), &encoded, 1, 1).unwrap();
    assert!(decoded.is_empty());
}
