use latticenet_lib::idm::{IdManager, IdmError};

const VNI_START: u64 = 4096;
const VNI_END: u64 = (1 << 24) - 1;

#[test]
fn vxlan_serial_allocation_moves_the_cursor() {
    let vnis = IdManager::new(VNI_START, VNI_END).unwrap();
    assert_eq!(vnis.get_id(true).unwrap(), 4096);
    vnis.release(4096).unwrap();
    // The cursor moved past the released id.
    assert_eq!(vnis.get_id(true).unwrap(), 4097);
    assert_eq!(vnis.get_id(true).unwrap(), 4098);
    vnis.get_specific_id(5000).unwrap();
    assert_eq!(vnis.get_id(true).unwrap(), 4099);
}

#[test]
fn serial_cursor_wraps_to_released_ids() {
    let ids = IdManager::new(100, 107).unwrap();
    for expected in 100..=107 {
        assert_eq!(ids.get_id(true).unwrap(), expected);
    }
    assert!(matches!(
        ids.get_id(true),
        Err(IdmError::Bitmap(latticenet_lib::BitmapError::NoBitAvailable))
    ));
    ids.release(100).unwrap();
    ids.release(103).unwrap();
    // Past the end of the range the scan wraps to the front.
    assert_eq!(ids.get_id(true).unwrap(), 100);
    assert_eq!(ids.get_id(true).unwrap(), 103);
}

#[test]
fn mixed_serial_and_range_allocation() {
    let ids = IdManager::new(0, 999).unwrap();
    assert_eq!(ids.get_id_in_range(500, 509, false).unwrap(), 500);
    assert_eq!(ids.get_id_in_range(500, 509, false).unwrap(), 501);
    assert_eq!(ids.get_id(false).unwrap(), 0);
    ids.release(500).unwrap();
    assert_eq!(ids.get_id_in_range(500, 509, false).unwrap(), 500);
    assert!(matches!(
        ids.get_id_in_range(990, 1000, false),
        Err(IdmError::OutOfRange { .. })
    ));
}
