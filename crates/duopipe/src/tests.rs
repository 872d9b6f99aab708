use std::sync::atomic::Ordering;

use crate::*;

fn unique_base(tag: &str) -> String {
    format!("duopipe-unit-{}-{:016x}", tag, rand::random::<u64>())
}

// ============================================================================
//  NAMES & CONFIG
// ============================================================================

#[test]
fn test_segment_and_signal_names() {
    assert_eq!(segment_name("chan.A", 0), "/chan.A.0");
    assert_eq!(segment_name("chan.A", 12), "/chan.A.12");
    assert_eq!(signal_name("chan.A"), "/chan.A.signal");
}

#[test]
fn test_invalid_base_names() {
    assert!(matches!(validate_base(""), Err(Error::InvalidName(_))));
    assert!(matches!(validate_base("a/b"), Err(Error::InvalidName(_))));
    assert!(matches!(validate_base(&"x".repeat(300)), Err(Error::InvalidName(_))));
    assert!(validate_base("ok-name.A").is_ok());
}

#[test]
fn test_segment_rejects_slash_in_name() {
    assert!(matches!(Segment::create("no-leading-slash", 64), Err(Error::InvalidName(_))));
    assert!(matches!(Segment::create("/a/b", 64), Err(Error::InvalidName(_))));
}

#[test]
fn test_config_clamps_tiny_segments() {
    let config = PipeConfig::new().with_min_segment_size(0);
    assert_eq!(config.min_segment_size, 2 * LENGTH_PREFIX + 1);
    assert_eq!(PipeConfig::default().min_segment_size, MIN_SEGMENT_SIZE);
}

// ============================================================================
//  SEGMENTS
// ============================================================================

#[test]
fn test_segment_create_open_share_bytes() -> Result<()> {
    let name = format!("/{}", unique_base("seg"));
    let created = Segment::create(&name, 128)?;
    let opened = Segment::open(&name)?;

    assert!(created.is_owned());
    assert!(!opened.is_owned());
    assert_eq!(opened.size(), 128);

    created.write(HEADER_LEN, b"shared")?;
    assert_eq!(opened.read(HEADER_LEN, 6)?, b"shared");

    created.sequence().store(7, Ordering::Release);
    assert_eq!(opened.sequence().load(Ordering::Acquire), 7);
    Ok(())
}

#[test]
fn test_segment_bounds_checked() -> Result<()> {
    let name = format!("/{}", unique_base("bounds"));
    let segment = Segment::create(&name, 32)?;
    let err = segment.write(30, &[0; 4]).unwrap_err();
    assert!(matches!(err, Error::OutOfBounds { offset: 30, len: 4, size: 32 }));
    assert!(segment.read(usize::MAX, 2).is_err());
    Ok(())
}

#[test]
fn test_owner_drop_unlinks() -> Result<()> {
    let name = format!("/{}", unique_base("unlink"));
    let created = Segment::create(&name, 64)?;
    drop(created);
    assert!(matches!(Segment::open(&name), Err(Error::NotFound(_))));
    Ok(())
}

#[test]
fn test_create_refuses_taken_name() -> Result<()> {
    let name = format!("/{}", unique_base("taken"));
    let first = Segment::create(&name, 64)?;
    first.write(HEADER_LEN, b"live")?;

    assert!(matches!(Segment::create(&name, 64), Err(Error::AlreadyExists(_))));
    assert_eq!(Segment::open(&name)?.read(HEADER_LEN, 4)?, b"live");
    Ok(())
}

#[test]
fn test_create_replacing_takes_over_stale_name() -> Result<()> {
    let name = format!("/{}", unique_base("stale"));
    let stale = Segment::create(&name, 64)?;
    stale.write(HEADER_LEN, b"old")?;
    std::mem::forget(stale);

    let fresh = Segment::create_replacing(&name, 64)?;
    assert_eq!(fresh.read(HEADER_LEN, 3)?, vec![0; 3]);
    drop(fresh);
    assert!(matches!(Segment::open(&name), Err(Error::NotFound(_))));
    Ok(())
}

#[test]
fn test_open_missing_segment() {
    let name = format!("/{}", unique_base("missing"));
    assert!(matches!(Segment::open(&name), Err(Error::NotFound(_))));
}

// ============================================================================
//  WRITER
// ============================================================================

#[test]
fn test_writer_rejects_empty_payload() -> Result<()> {
    let base = unique_base("empty");
    let mut out = OutPipe::open(&base, true, PipeConfig::default())?;
    assert!(matches!(out.write(&[]), Err(Error::EmptyMessage)));
    assert_eq!(out.messages_written(), 0);
    Ok(())
}

#[test]
fn test_writer_layout_and_sequence() -> Result<()> {
    let base = unique_base("layout");
    let mut out = OutPipe::open(&base, true, PipeConfig::default())?;
    let view = Segment::open(&segment_name(&base, 0))?;

    out.write(b"abc")?;
    out.write(b"de")?;

    assert_eq!(view.sequence().load(Ordering::Acquire), 2);
    assert_eq!(view.read_u32(HEADER_LEN)?, 3);
    assert_eq!(view.read(HEADER_LEN + LENGTH_PREFIX, 3)?, b"abc");
    assert_eq!(view.read_u32(HEADER_LEN + 7)?, 2);
    assert_eq!(view.read(HEADER_LEN + 7 + LENGTH_PREFIX, 2)?, b"de");
    assert_eq!(out.bytes_written(), 5);
    Ok(())
}

#[test]
fn test_writer_continuation_leaves_sentinel() -> Result<()> {
    let base = unique_base("sentinel");
    let config = PipeConfig::new().with_min_segment_size(32);
    let mut out = OutPipe::open(&base, true, config)?;
    let first = Segment::open(&segment_name(&base, 0))?;

    out.write(&[1u8; 20])?;
    assert_eq!(out.segment_index(), 0);

    // 8 header + 24 used; 20 more bytes cannot fit.
    out.write(&[2u8; 20])?;
    assert_eq!(out.segment_index(), 1);
    assert_eq!(first.read_u32(HEADER_LEN + 24)?, 0);
    assert_eq!(first.sequence().load(Ordering::Acquire), 2);

    let second = Segment::open(&segment_name(&base, 1))?;
    assert_eq!(second.size(), HEADER_LEN + 200);
    assert_eq!(second.sequence().load(Ordering::Acquire), 3);
    assert_eq!(second.read(HEADER_LEN + LENGTH_PREFIX, 20)?, vec![2u8; 20]);

    assert_eq!(out.pending_segments(), 1);
    first.consumed().store(1, Ordering::Release);
    assert_eq!(out.pending_segments(), 0);
    Ok(())
}
