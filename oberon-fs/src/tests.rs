use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use crate::bitmap::BitMap;
use crate::layout::{pack_timestamp, unpack_timestamp, DIR_MARK, MAP_MARK};
use crate::{DiskImage, FileSystem, FsError, SECTOR_MULTIPLIER};

const PART_START: u32 = 8; // blocks
const ROOT_OFFSET: u32 = 4; // blocks

/// Builds a scratch image with one primary Oberon partition, a valid
/// boot block and an empty root directory page.
fn mk_image(name: &str, num_sectors: u32) -> PathBuf {
    let path = std::env::temp_dir().join(name);
    fs::remove_file(&path).ok();

    let part_len = ROOT_OFFSET + num_sectors * 4;
    let mut img = vec![0u8; ((PART_START + part_len) * 512) as usize];

    let e = 0x1be;
    img[e + 4] = 0x4f;
    img[e + 8..e + 12].copy_from_slice(&PART_START.to_le_bytes());
    img[e + 12..e + 16].copy_from_slice(&part_len.to_le_bytes());
    img[510] = 0x55;
    img[511] = 0xaa;

    write_boot_block(&mut img, PART_START);
    write_empty_root(&mut img, PART_START);

    fs::write(&path, img).unwrap();
    path
}

/// Same file system, but reached through an extended-partition chain of
/// two boot records: MBR -> EBR at 2 -> EBR at 5 -> Oberon partition.
fn mk_image_extended(name: &str, num_sectors: u32) -> PathBuf {
    let path = std::env::temp_dir().join(name);
    fs::remove_file(&path).ok();

    let part_len = ROOT_OFFSET + num_sectors * 4;
    let mut img = vec![0u8; ((PART_START + part_len) * 512) as usize];

    let e = 0x1be;
    img[e + 4] = 0x05; // extended
    img[e + 8..e + 12].copy_from_slice(&2u32.to_le_bytes());
    img[e + 12..e + 16].copy_from_slice(&(PART_START + part_len - 2).to_le_bytes());
    img[510] = 0x55;
    img[511] = 0xaa;

    // First EBR (block 2): only a link to the next one, 3 blocks past
    // the extended partition's start.
    let b = 2 * 512;
    img[b + e + 4] = 0x05;
    img[b + e + 8..b + e + 12].copy_from_slice(&3u32.to_le_bytes());
    img[b + e + 12..b + e + 16].copy_from_slice(&8u32.to_le_bytes());
    img[b + 510] = 0x55;
    img[b + 511] = 0xaa;

    // Second EBR (block 5): the Oberon partition, 3 blocks past this
    // boot record.
    let b = 5 * 512;
    img[b + e + 4] = 0x4f;
    img[b + e + 8..b + e + 12].copy_from_slice(&(PART_START - 5).to_le_bytes());
    img[b + e + 12..b + e + 16].copy_from_slice(&part_len.to_le_bytes());
    img[b + 510] = 0x55;
    img[b + 511] = 0xaa;

    write_boot_block(&mut img, PART_START);
    write_empty_root(&mut img, PART_START);

    fs::write(&path, img).unwrap();
    path
}

fn write_boot_block(img: &mut [u8], part_start: u32) {
    let b = (part_start * 512) as usize;
    img[b + 3..b + 9].copy_from_slice(b"OBERON");
    img[b + 0x0e..b + 0x10].copy_from_slice(&(ROOT_OFFSET as u16).to_le_bytes());
    img[b + 510] = 0x55;
    img[b + 511] = 0xaa;
}

fn write_empty_root(img: &mut [u8], part_start: u32) {
    let r = ((part_start + ROOT_OFFSET) * 512) as usize;
    img[r..r + 4].copy_from_slice(&DIR_MARK.to_le_bytes());
}

fn open_fs(path: &Path) -> FileSystem {
    FileSystem::open(DiskImage::open(path).unwrap()).unwrap()
}

#[test]
fn bitmap() {
    let mut map = BitMap::new(129);
    assert!(!map.test(5));
    map.set(5);
    assert!(map.test(5));
    assert!(!map.test(4));
    map.set(128);
    assert!(map.test(128));
    map.clear(5);
    assert!(!map.test(5));
    assert!(map.test(128));
}

#[test]
fn timestamp_packing() {
    // 1970-01-01 00:00:00: day 1, month 1, year delta 70.
    assert_eq!(pack_timestamp(UNIX_EPOCH), (1 | 1 << 5 | 70 << 9, 0));
    assert_eq!(unpack_timestamp(1 | 1 << 5 | 70 << 9, 0), UNIX_EPOCH);

    for secs in [446_400_000u64, 1_000_000_007, 1_700_000_000, 2_500_000_001] {
        let t = UNIX_EPOCH + Duration::from_secs(secs);
        let (date, time) = pack_timestamp(t);
        assert_eq!(unpack_timestamp(date, time), t, "secs {secs}");
    }

    // Zeroed headers fall back to the epoch.
    assert_eq!(unpack_timestamp(0, 0), UNIX_EPOCH);
}

#[test]
fn open_empty_image() {
    let path = mk_image("oberon_fs_empty", 64);
    let fs = open_fs(&path);
    assert_eq!(fs.size(), 64 * SECTOR_MULTIPLIER);
    assert!(fs.list(|_| true).unwrap().is_empty());
    assert!(fs.find("Nothing").unwrap().is_none());
    fs.close().unwrap();
}

#[test]
fn open_via_extended_partition_chain() {
    let path = mk_image_extended("oberon_fs_extended", 64);
    let fs = open_fs(&path);
    assert_eq!(fs.size(), 64 * SECTOR_MULTIPLIER);
    assert!(fs.list(|_| true).unwrap().is_empty());
}

#[test]
fn missing_oberon_partition() {
    let path = mk_image("oberon_fs_no_part", 64);
    let mut img = fs::read(&path).unwrap();
    img[0x1be + 4] = 0x83; // call it Linux instead
    fs::write(&path, img).unwrap();
    assert!(matches!(
        DiskImage::open(&path),
        Err(FsError::Corrupted(_))
    ));
}

#[test]
fn lenient_boot_block_signature() {
    let path = mk_image("oberon_fs_lenient_boot", 64);
    let mut img = fs::read(&path).unwrap();
    let b = (PART_START * 512) as usize;
    img[b + 510] = 0;
    img[b + 511] = 0;
    fs::write(&path, img).unwrap();
    // OBERON at offset 3 is enough.
    let fs = open_fs(&path);
    assert_eq!(fs.size(), 64 * SECTOR_MULTIPLIER);
}

#[test]
fn bad_boot_block() {
    let path = mk_image("oberon_fs_bad_boot", 64);
    let mut img = fs::read(&path).unwrap();
    let b = (PART_START * 512) as usize;
    img[b + 3] = b'X';
    fs::write(&path, img).unwrap();
    assert!(matches!(
        DiskImage::open(&path),
        Err(FsError::Corrupted(_))
    ));
}

#[test]
fn sector_address_checks() {
    let path = mk_image("oberon_fs_addr_checks", 64);
    let mut disk = DiskImage::open(&path).unwrap();
    assert!(matches!(
        disk.get_sector(0),
        Err(FsError::InvalidSectorAddress(0))
    ));
    assert!(matches!(
        disk.get_sector(30),
        Err(FsError::InvalidSectorAddress(30))
    ));
    let beyond = 65 * SECTOR_MULTIPLIER;
    assert!(matches!(
        disk.get_sector(beyond),
        Err(FsError::InvalidSectorAddress(_))
    ));
    assert!(matches!(
        disk.put_sector(30, &crate::Sector::new_zeroed()),
        Err(FsError::InvalidSectorAddress(30))
    ));
    // The root page itself reads fine.
    let root = disk.get_sector(29).unwrap();
    assert_eq!(root.read_u32(0), DIR_MARK);
}

#[test]
fn allocator() {
    let path = mk_image("oberon_fs_alloc", 64);
    let fs = open_fs(&path);

    // The root page is reserved, sector 0 illegal.
    assert!(!fs.is_sector_free(29).unwrap());
    assert!(matches!(
        fs.alloc_sector(30),
        Err(FsError::InvalidSectorAddress(30))
    ));

    // Allocation starts right after the hint.
    let addr = fs.alloc_sector(5 * SECTOR_MULTIPLIER).unwrap();
    assert_eq!(addr, 6 * SECTOR_MULTIPLIER);
    assert!(!fs.is_sector_free(addr).unwrap());

    // alloc then free leaves the map unchanged.
    fs.free_sector(addr).unwrap();
    assert!(fs.is_sector_free(addr).unwrap());
}

#[test]
fn disk_full() {
    let path = mk_image("oberon_fs_full", 8);
    let fs = open_fs(&path);
    // 8 sectors, one taken by the root page.
    for _ in 0..7 {
        fs.alloc_sector(0).unwrap();
    }
    assert!(matches!(fs.alloc_sector(0), Err(FsError::DiskFull)));
}

#[test]
fn file_name_rules() {
    let path = mk_image("oberon_fs_names", 64);
    let fs = open_fs(&path);

    for bad in ["1bad", "", ".dot", "has space", "has/slash", "Uml\u{e4}ut"] {
        assert!(
            matches!(fs.create(bad), Err(FsError::InvalidFileName(_))),
            "{bad:?} accepted"
        );
    }
    let long = "A".repeat(32);
    assert!(matches!(fs.create(&long), Err(FsError::InvalidFileName(_))));

    let max = "A".repeat(31);
    fs.create(&max).unwrap();
    fs.create("A.Tool.Bak9").unwrap();
}

#[test]
fn create_write_read_roundtrip() {
    let path = mk_image("oberon_fs_roundtrip", 64);
    {
        let fs = open_fs(&path);
        let mut file = fs.create("A.Tool").unwrap();
        file.write_at(0, b"hello").unwrap();
        file.register().unwrap();
        assert_eq!(file.size(), 5);
        fs.close().unwrap();
    }

    let fs = open_fs(&path);
    let file = fs.find("A.Tool").unwrap().expect("A.Tool vanished");
    assert_eq!(file.size(), 5);
    assert_eq!(file.read_at(0, 5).unwrap(), b"hello");

    // Reads are clipped to the file's end.
    assert_eq!(file.read_at(0, 100).unwrap(), b"hello");
    assert_eq!(file.read_at(3, 100).unwrap(), b"lo");
    assert!(file.read_at(5, 10).unwrap().is_empty());
    assert!(file.read_at(1000, 10).unwrap().is_empty());
}

#[test]
fn register_rejects_duplicates() {
    let path = mk_image("oberon_fs_duplicates", 64);
    let fs = open_fs(&path);

    let file = fs.create("Twice").unwrap();
    file.register().unwrap();
    let again = fs.create("Twice").unwrap();
    assert!(matches!(again.register(), Err(FsError::AlreadyExists(_))));

    assert!(fs.remove("Twice"));
    assert!(!fs.remove("Twice"));
    fs.close().unwrap();

    let fs = open_fs(&path);
    assert!(fs.find("Twice").unwrap().is_none());
}

#[test]
fn unregistered_file_is_invisible() {
    let path = mk_image("oberon_fs_unregistered", 64);
    {
        let fs = open_fs(&path);
        let mut file = fs.create("Ghost").unwrap();
        file.write_at(0, b"boo").unwrap();
        fs.close().unwrap();
    }
    let fs = open_fs(&path);
    assert!(fs.find("Ghost").unwrap().is_none());
}

#[test]
fn write_crosses_header_sector_boundary() {
    let path = mk_image("oberon_fs_boundary", 64);
    {
        let fs = open_fs(&path);
        let mut file = fs.create("Boundary").unwrap();

        // The header sector holds the first 2048 - 352 = 1696 bytes.
        file.write_at(0, &[b'X'; 1696]).unwrap();
        assert_eq!(file.size(), 1696);

        // The next byte lands in sector 1.
        file.write_at(1696, b"abc").unwrap();
        assert_eq!(file.size(), 1699);
        assert_eq!(file.read_at(1694, 5).unwrap(), b"XXabc");

        file.register().unwrap();
        fs.close().unwrap();
    }

    let fs = open_fs(&path);
    let file = fs.find("Boundary").unwrap().unwrap();
    assert_eq!(file.size(), 1699);
    let data = file.read_at(0, 1699).unwrap();
    assert_eq!(&data[..1696], &[b'X'; 1696][..]);
    assert_eq!(&data[1696..], b"abc");
}

#[test]
fn sparse_positioned_writes() {
    let path = mk_image("oberon_fs_positioned", 64);
    let fs = open_fs(&path);
    let mut file = fs.create("Sparse").unwrap();

    // Writing at an offset grows the file to cover it.
    file.write_at(5000, b"tail").unwrap();
    assert_eq!(file.size(), 5004);
    assert_eq!(file.read_at(5000, 4).unwrap(), b"tail");
    assert_eq!(file.read_at(0, 0).unwrap(), b"");

    file.write_at(0, b"head").unwrap();
    assert_eq!(file.size(), 5004);
    assert_eq!(file.read_at(0, 4).unwrap(), b"head");
}

#[test]
fn large_file_uses_extension_blocks() {
    let path = mk_image("oberon_fs_large", 1024);
    let data = vec![0xab_u8; 200_000];
    {
        let fs = open_fs(&path);
        let mut file = fs.create("Big.Blob").unwrap();
        file.write_at(0, &data).unwrap();
        file.register().unwrap();
        assert_eq!(file.size(), 200_000);

        // Byte 130 720 onward lives behind the first index sector.
        assert_eq!(file.read_at(130_000, 1024).unwrap(), vec![0xab_u8; 1024]);
        fs.close().unwrap();
    }

    // The reopen walks the extension table when rebuilding the
    // reservation map.
    let fs = open_fs(&path);
    let file = fs.find("Big.Blob").unwrap().unwrap();
    assert_eq!(file.size(), 200_000);
    assert_eq!(file.read_at(130_000, 1024).unwrap(), vec![0xab_u8; 1024]);
    assert_eq!(file.read_at(0, 16).unwrap(), vec![0xab_u8; 16]);
    assert_eq!(file.read_at(199_999, 10).unwrap(), vec![0xab_u8; 1]);
}

#[test]
fn write_beyond_max_size() {
    let path = mk_image("oberon_fs_too_large", 64);
    let fs = open_fs(&path);
    let mut file = fs.create("Huge").unwrap();
    assert!(matches!(
        file.write_at(crate::MAX_FILE_SIZE, b"x"),
        Err(FsError::FileTooLarge)
    ));
}

#[test]
fn many_files_build_a_deep_tree() {
    let path = mk_image("oberon_fs_many", 1024);
    let names: Vec<String> = (0..200).map(|i| format!("F{i:03}")).collect();
    {
        let fs = open_fs(&path);
        for name in &names {
            fs.create(name).unwrap().register().unwrap();
        }
        fs.close().unwrap();
    }

    let fs = open_fs(&path);
    let listed: Vec<String> = fs.list(|_| true).unwrap().iter().map(|f| f.name()).collect();
    assert_eq!(listed, names); // ascending byte order
    assert!(fs.find("F123").unwrap().is_some());
    assert!(fs.find("F200").unwrap().is_none());
    drop(fs);

    // 200 entries cannot fit one 50-entry page: the root must have
    // descendants.
    let mut disk = DiskImage::open(&path).unwrap();
    let root = disk.get_sector(29).unwrap();
    assert_eq!(root.read_u32(0), DIR_MARK);
    assert_ne!(root.read_u32(8), 0, "root page has no left child");
}

#[test]
fn removing_last_file_leaves_empty_root() {
    let path = mk_image("oberon_fs_empty_again", 64);
    {
        let fs = open_fs(&path);
        fs.create("Lonely").unwrap().register().unwrap();
        fs.close().unwrap();
    }
    {
        let fs = open_fs(&path);
        assert!(fs.remove("Lonely"));
        fs.close().unwrap();
    }

    let fs = open_fs(&path);
    assert!(fs.list(|_| true).unwrap().is_empty());
    drop(fs);

    let mut disk = DiskImage::open(&path).unwrap();
    let root = disk.get_sector(29).unwrap();
    assert_eq!(root.read_u32(0), DIR_MARK);
    assert_eq!(root.read_u16(4), 0);
    assert_eq!(root.read_u32(8), 0);
}

#[test]
fn corrupt_root_mark_fails_open() {
    let path = mk_image("oberon_fs_corrupt", 64);
    let mut img = fs::read(&path).unwrap();
    let r = ((PART_START + ROOT_OFFSET) * 512) as usize;
    img[r] ^= 0xff;
    fs::write(&path, img).unwrap();

    let disk = DiskImage::open(&path).unwrap();
    assert!(matches!(FileSystem::open(disk), Err(FsError::Corrupted(_))));
}

#[test]
fn map_index_is_invalidated_on_open() {
    let path = mk_image("oberon_fs_map_index", 64);
    let last = 64 * SECTOR_MULTIPLIER;
    {
        let mut disk = DiskImage::open(&path).unwrap();
        let mut sec = crate::Sector::new_zeroed();
        sec.write_u32(0, MAP_MARK);
        sec.write_u32(4, 0xdead_beef);
        disk.put_sector(last, &sec).unwrap();
    }

    let fs = open_fs(&path);
    drop(fs);

    let mut disk = DiskImage::open(&path).unwrap();
    let sec = disk.get_sector(last).unwrap();
    assert_eq!(sec.read_u32(0), 0, "map mark survived open");
    assert_eq!(sec.read_u32(4), 0xdead_beef, "payload clobbered");
    drop(disk);

    // The first word is zeroed regardless of its current contents.
    {
        let mut disk = DiskImage::open(&path).unwrap();
        let mut sec = crate::Sector::new_zeroed();
        sec.write_u32(0, 0x1234_5678);
        disk.put_sector(last, &sec).unwrap();
    }
    let fs = open_fs(&path);
    drop(fs);

    let mut disk = DiskImage::open(&path).unwrap();
    assert_eq!(disk.get_sector(last).unwrap().read_u32(0), 0);
}

#[test]
fn set_name_rewrites_the_header() {
    let path = mk_image("oberon_fs_rename", 64);
    let fs = open_fs(&path);
    let mut file = fs.create("Old.Name").unwrap();
    file.write_at(0, b"data").unwrap();

    assert!(matches!(
        file.set_name("1bad"),
        Err(FsError::InvalidFileName(_))
    ));
    file.set_name("New.Name").unwrap();
    assert_eq!(file.name(), "New.Name");

    let reread = fs.file_from_header(file.header_addr()).unwrap();
    assert_eq!(reread.name(), "New.Name");
    assert_eq!(reread.size(), 4);
}
