//! Property tests for the core invariants: readback equality across
//! arbitrary operation sequences, crash atomicity, and sustained space
//! reclamation.

use proptest::prelude::*;
use tofs_core::{FileName, MountOptions, OpenOptions, TofsError, Volume};
use tofs_device::{FaultDevice, RamDevice};
use tofs_types::Geometry;

fn geo_16k() -> Geometry {
    Geometry::new(10, 16).expect("valid geometry")
}

fn name(s: &str) -> FileName {
    s.parse().expect("valid name")
}

#[derive(Debug, Clone)]
enum Op {
    Write(Vec<u8>),
    ReadOne,
    Bookmark,
    Remount,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => proptest::collection::vec(any::<u8>(), 1..48).prop_map(Op::Write),
        3 => Just(Op::ReadOne),
        1 => Just(Op::Bookmark),
        1 => Just(Op::Remount),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Invariant: the concatenation of reads equals the concatenation of
    /// writes between head and tail, across bookmarks and remounts.
    #[test]
    fn readback_matches_model(ops in proptest::collection::vec(op_strategy(), 1..40)) {
        let file = name("q");
        let mut vol = Volume::mount(RamDevice::new(geo_16k()), MountOptions::default()).unwrap();
        let mut writer = vol.open(&file, &OpenOptions::append()).unwrap();
        let mut reader = vol.open(&file, &OpenOptions::queue()).unwrap();

        // Model: surviving records and how many the reader has consumed.
        let mut records: Vec<Vec<u8>> = Vec::new();
        let mut consumed = 0_usize;

        for op in ops {
            match op {
                Op::Write(data) => {
                    vol.write(writer, &data).unwrap();
                    records.push(data);
                }
                Op::ReadOne => {
                    let mut buf = [0_u8; 64];
                    let n = vol.read(reader, Some(&mut buf)).unwrap();
                    if consumed < records.len() {
                        prop_assert_eq!(&buf[..n], records[consumed].as_slice());
                        consumed += 1;
                    } else {
                        prop_assert_eq!(n, 0);
                    }
                }
                Op::Bookmark => {
                    vol.bookmark(reader).unwrap();
                    records.drain(..consumed);
                    consumed = 0;
                }
                Op::Remount => {
                    let dev = vol.unmount().unwrap();
                    vol = Volume::mount(dev, MountOptions::default()).unwrap();
                    writer = vol.open(&file, &OpenOptions::append()).unwrap();
                    reader = vol.open(&file, &OpenOptions::queue()).unwrap();
                    // A fresh queue handle starts over at the head.
                    consumed = 0;
                }
            }
        }

        // Drain the remainder and compare against the model.
        let mut rest = Vec::new();
        let mut buf = [0_u8; 64];
        loop {
            let n = vol.read(reader, Some(&mut buf)).unwrap();
            if n == 0 {
                break;
            }
            rest.extend_from_slice(&buf[..n]);
        }
        let expected: Vec<u8> = records[consumed..].concat();
        prop_assert_eq!(rest, expected);

        let total: usize = records.iter().map(Vec::len).sum();
        prop_assert_eq!(vol.stat(&file).unwrap().size as usize, total);
    }

    /// Invariant: a crash mid-transaction yields exactly the state of the
    /// longest committed prefix, for any persisted prefix of the adapter
    /// write stream.
    #[test]
    fn crash_recovers_committed_prefix(
        committed in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..32), 0..4),
        staged in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..32), 1..4),
        keep in 0_usize..24,
    ) {
        let file = name("f");
        let mut vol = Volume::mount(FaultDevice::new(geo_16k()), MountOptions::default()).unwrap();
        let h = vol.open(&file, &OpenOptions::append()).unwrap();
        for data in &committed {
            vol.write(h, data).unwrap();
        }

        vol.transaction().unwrap();
        for data in &staged {
            vol.write(h, data).unwrap();
        }
        // No commit: crash with an arbitrary prefix of the unflushed
        // operations persisted.
        let mut dev = vol.into_device();
        let pending = dev.pending_ops();
        dev.crash_after(keep.min(pending));

        let mut vol = Volume::mount(dev, MountOptions::default()).unwrap();
        let expected: Vec<u8> = committed.concat();
        prop_assert_eq!(vol.stat(&file).unwrap().size as usize, expected.len());

        let r = vol.open(&file, &OpenOptions::read()).unwrap();
        let mut got = Vec::new();
        let mut buf = [0_u8; 64];
        loop {
            let n = vol.read(r, Some(&mut buf)).unwrap();
            if n == 0 {
                break;
            }
            got.extend_from_slice(&buf[..n]);
        }
        prop_assert_eq!(got, expected);
    }
}

/// Invariant: cycles of append + bookmark reclaim space indefinitely on a
/// volume far smaller than the total bytes appended.
#[test]
fn sustained_queue_cycles_reclaim_space() {
    let geo = Geometry::new(10, 8).expect("valid geometry"); // 8 KB
    let file = name("q");
    let mut vol = Volume::mount(RamDevice::new(geo), MountOptions::default()).unwrap();
    let w = vol.open(&file, &OpenOptions::append()).unwrap();
    let r = vol.open(&file, &OpenOptions::queue()).unwrap();

    let payload = [0xC3_u8; 256];
    let mut buf = [0_u8; 256];
    let mut total = 0_u64;
    for cycle in 0..200 {
        match vol.write(w, &payload) {
            Ok(()) => {}
            Err(TofsError::NoSpace) => panic!("no space on cycle {cycle} after {total} bytes"),
            Err(err) => panic!("unexpected error: {err}"),
        }
        total += payload.len() as u64;
        assert_eq!(vol.read(r, Some(&mut buf)).unwrap(), 256);
        vol.bookmark(r).unwrap();
    }

    // 50 KB of appends flowed through an 8 KB volume.
    assert!(total > 6 * geo.total_bytes());
    assert_eq!(vol.stat(&file).unwrap().size, 0);
}
