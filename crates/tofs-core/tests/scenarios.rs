//! End-to-end scenarios: queue round-trips, priority eviction, and
//! directory enumeration.

use tofs_core::{FileInfo, FileName, MountOptions, OpenOptions, Priority, TofsError, Volume};
use tofs_device::RamDevice;
use tofs_types::Geometry;

fn geo_8k() -> Geometry {
    Geometry::new(10, 8).expect("valid geometry")
}

fn mount_ram(geo: Geometry) -> Volume<RamDevice> {
    Volume::mount(RamDevice::new(geo), MountOptions::default()).expect("mount")
}

fn name(s: &str) -> FileName {
    s.parse().expect("valid name")
}

fn rec(i: u32, j: u32) -> [u8; 8] {
    let mut out = [0_u8; 8];
    out[..4].copy_from_slice(&i.to_le_bytes());
    out[4..].copy_from_slice(&j.to_le_bytes());
    out
}

#[test]
fn queue_round_trip() {
    let mut vol = mount_ram(geo_8k());
    let q = name("q");

    let h = vol
        .open(&q, &OpenOptions::append().priority(Priority::High))
        .unwrap();
    vol.transaction().unwrap();
    for i in 0..10_u32 {
        vol.write(h, &rec(i, i * 10)).unwrap();
        vol.write(h, &rec(i, 0)).unwrap();
    }
    vol.commit().unwrap();
    vol.close(h).unwrap();

    let r = vol.open(&q, &OpenOptions::queue()).unwrap();
    let mut buf = [0_u8; 8];
    for i in 0..10_u32 {
        assert_eq!(vol.read(r, None).unwrap(), 8, "peek at record {i}");
        assert_eq!(vol.read(r, Some(&mut buf)).unwrap(), 8);
        assert_eq!(buf, rec(i, i * 10));
        assert_eq!(vol.read(r, Some(&mut buf)).unwrap(), 8);
        assert_eq!(buf, rec(i, 0));
        vol.bookmark(r).unwrap();
    }
    assert_eq!(vol.read(r, None).unwrap(), 0);
    assert_eq!(vol.stat(&q).unwrap().size, 0);

    // All consumed content is dead; only block 0's metadata stays live.
    let stats = vol.stats();
    assert_eq!(stats.free_blocks, 7);

    // The state survives a remount.
    let dev = vol.unmount().unwrap();
    let vol = Volume::mount(dev, MountOptions::default()).unwrap();
    assert_eq!(vol.stat(&q).unwrap().size, 0);
}

#[test]
fn priority_eviction_prefers_low_blocks() {
    let mut vol = mount_ram(geo_8k());
    let low = name("low");
    let high = name("high");

    let hl = vol
        .open(&low, &OpenOptions::append().priority(Priority::Low))
        .unwrap();
    let hh = vol
        .open(&high, &OpenOptions::append().priority(Priority::High))
        .unwrap();

    // Fill the volume with LOW data.
    let chunk = [0x5A_u8; 100];
    let mut low_written = 0_u32;
    loop {
        match vol.write(hl, &chunk) {
            Ok(()) => low_written += 100,
            Err(TofsError::NoSpace) => break,
            Err(err) => panic!("unexpected error filling volume: {err}"),
        }
    }
    assert!(low_written > 0);
    assert_eq!(vol.stat(&low).unwrap().size, low_written);

    // A HIGH write evicts a LOW block and succeeds.
    let mut high_payload = Vec::new();
    vol.write(hh, &[0xA5; 100]).unwrap();
    high_payload.extend_from_slice(&[0xA5; 100]);
    let low_after = vol.stat(&low).unwrap();
    assert!(
        low_after.size < low_written,
        "eviction must advance the LOW file's head"
    );
    assert!(low_after.head > 0);

    // Saturate with HIGH data until nothing lower-priority remains.
    loop {
        match vol.write(hh, &[0xA5; 100]) {
            Ok(()) => high_payload.extend_from_slice(&[0xA5; 100]),
            Err(TofsError::NoSpace) => break,
            Err(err) => panic!("unexpected error saturating: {err}"),
        }
    }

    // With only HIGH content left, a LOW append cannot be served.
    assert!(matches!(vol.write(hl, &chunk), Err(TofsError::NoSpace)));

    // Priority monotonicity: every HIGH byte written is still readable.
    let r = vol.open(&high, &OpenOptions::read()).unwrap();
    let mut got = Vec::new();
    let mut buf = [0_u8; 128];
    loop {
        let n = vol.read(r, Some(&mut buf)).unwrap();
        if n == 0 {
            break;
        }
        got.extend_from_slice(&buf[..n]);
    }
    assert_eq!(got, high_payload);
}

#[test]
fn enumeration_lists_files_with_sizes_and_flags() {
    let mut vol = mount_ram(geo_8k());
    for (n, len, prio) in [
        ("a", 3_usize, Priority::Normal),
        ("b", 5, Priority::High),
        ("c", 7, Priority::Low),
    ] {
        let h = vol
            .open(&name(n), &OpenOptions::append().priority(prio))
            .unwrap();
        vol.write(h, &vec![0xEE; len]).unwrap();
        vol.close(h).unwrap();
    }

    let mut out = [FileInfo {
        name: name("x"),
        id: tofs_core::FileId(0),
        flags: tofs_core::FileFlags::default(),
        head: 0,
        tail: 0,
        size: 0,
    }; 8];
    let n = vol.list_into(&mut out);
    assert_eq!(n, 3);
    let listed: Vec<(String, u32, Priority)> = out[..n]
        .iter()
        .map(|f| (f.name.to_string(), f.size, f.flags.priority()))
        .collect();
    assert_eq!(
        listed,
        vec![
            ("a".to_owned(), 3, Priority::Normal),
            ("b".to_owned(), 5, Priority::High),
            ("c".to_owned(), 7, Priority::Low),
        ]
    );

    vol.delete(&name("b")).unwrap();

    let mut seen = Vec::new();
    vol.for_each_file(|f| seen.push(f.name.to_string()));
    assert_eq!(seen, vec!["a".to_owned(), "c".to_owned()]);
    assert_eq!(vol.file_count(), 2);

    // Enumeration order is stable across a remount.
    let dev = vol.unmount().unwrap();
    let vol = Volume::mount(dev, MountOptions::default()).unwrap();
    let mut seen = Vec::new();
    vol.for_each_file(|f| seen.push(f.name.to_string()));
    assert_eq!(seen, vec!["a".to_owned(), "c".to_owned()]);
}

#[test]
fn resume_at_positions_the_cursor() {
    let mut vol = mount_ram(geo_8k());
    let h = vol.open(&name("q"), &OpenOptions::append()).unwrap();
    for i in 0..4_u32 {
        vol.write(h, &rec(i, 0)).unwrap();
    }
    vol.close(h).unwrap();

    let r = vol
        .open(&name("q"), &OpenOptions::queue().resume_at(16))
        .unwrap();
    let mut buf = [0_u8; 8];
    assert_eq!(vol.read(r, Some(&mut buf)).unwrap(), 8);
    assert_eq!(buf, rec(2, 0));
}

#[test]
fn mixed_size_records_peek_correctly() {
    let mut vol = mount_ram(geo_8k());
    let h = vol.open(&name("mix"), &OpenOptions::append()).unwrap();
    vol.write(h, b"ab").unwrap();
    vol.write(h, b"cdefg").unwrap();
    vol.close(h).unwrap();

    let r = vol.open(&name("mix"), &OpenOptions::read()).unwrap();
    assert_eq!(vol.read(r, None).unwrap(), 2);
    // Peeking again is stable.
    assert_eq!(vol.read(r, None).unwrap(), 2);
    let mut buf = [0_u8; 16];
    assert_eq!(vol.read(r, Some(&mut buf)).unwrap(), 2);
    assert_eq!(vol.read(r, None).unwrap(), 5);
    // A short buffer still consumes the whole record.
    let mut small = [0_u8; 3];
    assert_eq!(vol.read(r, Some(&mut small)).unwrap(), 3);
    assert_eq!(&small, b"cde");
    assert_eq!(vol.read(r, None).unwrap(), 0);
}
