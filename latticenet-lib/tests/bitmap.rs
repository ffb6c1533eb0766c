use latticenet_lib::bitmap::{Bitmap, BitmapError};

#[test]
fn rle_merge_golden_serialization() {
    // 192 allocations over 256 bits compress to exactly two runs: six full
    // blocks followed by two empty ones.
    let mut b = Bitmap::new(256);
    for _ in 0..192 {
        b.set_any(false).unwrap();
    }
    let bytes = b.to_bytes();
    let mut expected = Vec::new();
    expected.extend_from_slice(&256u64.to_be_bytes());
    expected.extend_from_slice(&64u64.to_be_bytes());
    expected.extend_from_slice(&0xFFFF_FFFFu32.to_be_bytes());
    expected.extend_from_slice(&6u64.to_be_bytes());
    expected.extend_from_slice(&0u32.to_be_bytes());
    expected.extend_from_slice(&2u64.to_be_bytes());
    assert_eq!(bytes, expected);
}

#[test]
fn full_exhaustion_and_release() {
    let mut b = Bitmap::new(300);
    let mut allocated = Vec::new();
    while let Ok(o) = b.set_any(false) {
        allocated.push(o);
    }
    assert_eq!(allocated.len(), 300);
    assert_eq!(b.unselected(), 0);
    assert_eq!(b.set_any(false), Err(BitmapError::NoBitAvailable));
    assert_eq!(b.set_any_in_range(0, 100, false), Err(BitmapError::NoBitAvailable));

    for o in allocated {
        b.unset(o).unwrap();
    }
    assert_eq!(b.unselected(), 300);
    assert_eq!(b.set_any(false).unwrap(), 0);
}

#[test]
fn round_trip_excludes_serial_cursor() {
    let mut b = Bitmap::new(512);
    for _ in 0..77 {
        b.set_any(true).unwrap();
    }
    b.unset(12).unwrap();

    let restored = Bitmap::from_bytes(&b.to_bytes()).unwrap();
    assert_eq!(restored, b);
    assert_eq!(restored.unselected(), b.unselected());
    // The restored bitmap scans from the beginning again; correctness depends
    // only on the bit state, not the cursor.
    let mut restored = restored;
    assert_eq!(restored.set_any(true).unwrap(), 12);
}

#[test]
fn set_get_unset_agree() {
    let mut b = Bitmap::new(1000);
    for o in (0..1000).step_by(7) {
        b.set(o).unwrap();
    }
    for o in 0..1000 {
        assert_eq!(b.is_set(o), o % 7 == 0, "ordinal {o}");
    }
    for o in (0..1000).step_by(7) {
        b.unset(o).unwrap();
    }
    assert_eq!(b.unselected(), 1000);
}

#[test]
fn alternating_pattern_round_trips() {
    // Worst case for the run-length encoding: no two adjacent blocks equal.
    let mut b = Bitmap::new(32 * 64);
    for block in 0..64u64 {
        if block % 2 == 0 {
            for bit in 0..32 {
                b.set(block * 32 + bit).unwrap();
            }
        }
    }
    let restored = Bitmap::from_bytes(&b.to_bytes()).unwrap();
    assert_eq!(restored, b);
    assert_eq!(restored.unselected(), 32 * 32);
}

#[test]
fn json_round_trip() {
    let mut b = Bitmap::new(4096);
    for o in [0u64, 100, 4095] {
        b.set(o).unwrap();
    }
    let json = serde_json::to_string(&b).unwrap();
    let back: Bitmap = serde_json::from_str(&json).unwrap();
    assert_eq!(back, b);
}
