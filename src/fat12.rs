// The FAT12 storage engine (C2): boot sector/BPB, 12-bit FAT entry packing,
// cluster allocation, 8.3 directory enumeration, and a write-through sector
// cache over `storage::SectorStore`. Byte offsets throughout are the
// standard 1.44 MB floppy layout.

use std::collections::{HashMap, HashSet};

use chrono::{Datelike, Timelike};

use crate::storage::{sector_key, SectorStore, SECTOR_SIZE};

pub const BYTES_PER_SECTOR: u16 = 512;
pub const SECTORS_PER_CLUSTER: u8 = 1;
pub const RESERVED_SECTORS: u16 = 1;
pub const NUM_FATS: u8 = 2;
pub const ROOT_ENTRIES: u16 = 224;
pub const TOTAL_SECTORS: u16 = 2880;
pub const MEDIA_DESCRIPTOR: u8 = 0xF0;
pub const SECTORS_PER_FAT: u16 = 9;
pub const SECTORS_PER_TRACK: u16 = 18;
pub const HEADS: u8 = 2;

const FAT1_START: u32 = RESERVED_SECTORS as u32;
const FAT2_START: u32 = FAT1_START + SECTORS_PER_FAT as u32;
const ROOT_DIR_START: u32 = FAT2_START + SECTORS_PER_FAT as u32;
const ROOT_DIR_SECTORS: u32 = (ROOT_ENTRIES as u32 * 32).div_ceil(BYTES_PER_SECTOR as u32);
const DATA_START: u32 = ROOT_DIR_START + ROOT_DIR_SECTORS;
const MAX_CLUSTER: u32 = (TOTAL_SECTORS as u32 - DATA_START) / SECTORS_PER_CLUSTER as u32 + 2;

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_LABEL: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
const ATTR_LONG_NAME: u8 = 0x0F;

const FREE_CLUSTER: u16 = 0x000;
const END_OF_CHAIN: u16 = 0xFFF;
const MIN_EOC: u16 = 0xFF8;

#[derive(Debug, thiserror::Error)]
pub enum FatError {
    #[error("disk is full")]
    DiskFull,
    #[error("directory is full")]
    DirectoryFull,
    #[error("an entry with this name already exists")]
    AlreadyExists,
    #[error("entry not found")]
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub attributes: u8,
    pub first_cluster: u16,
    pub size: u32,
    pub time: u16,
    pub date: u16,
}

impl DirEntry {
    pub fn is_directory(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DirLocation {
    Root,
    Cluster(u16),
}

struct SectorCache<S: SectorStore> {
    store: S,
    cache: HashMap<u32, [u8; SECTOR_SIZE]>,
    dirty: HashSet<u32>,
}

impl<S: SectorStore> SectorCache<S> {
    fn new(store: S) -> Self {
        SectorCache { store, cache: HashMap::new(), dirty: HashSet::new() }
    }

    fn read(&mut self, sector: u32) -> [u8; SECTOR_SIZE] {
        if let Some(buf) = self.cache.get(&sector) {
            return *buf;
        }
        let mut buf = [0u8; SECTOR_SIZE];
        match self.store.get(&sector_key(sector)) {
            Some(bytes) => {
                let n = bytes.len().min(SECTOR_SIZE);
                buf[..n].copy_from_slice(&bytes[..n]);
            }
            None => log::trace!("sector {sector} unwritten, faulting in as zeroes"),
        }
        self.cache.insert(sector, buf);
        buf
    }

    fn write(&mut self, sector: u32, buf: [u8; SECTOR_SIZE]) {
        self.cache.insert(sector, buf);
        self.dirty.insert(sector);
    }

    fn flush(&mut self) {
        let dirty: Vec<u32> = self.dirty.drain().collect();
        for sector in dirty {
            if let Some(buf) = self.cache.get(&sector) {
                self.store.put(&sector_key(sector), buf);
            }
        }
    }
}

/// Translates named directory paths and 8.3 filenames into linear byte
/// content, backed by a write-through sector cache.
pub struct Fat12<S: SectorStore> {
    cache: SectorCache<S>,
}

impl<S: SectorStore> Fat12<S> {
    pub fn new(store: S) -> Self {
        Fat12 { cache: SectorCache::new(store) }
    }

    pub fn is_formatted(&mut self) -> bool {
        self.cache.read(0)[0] == 0xEB
    }

    pub fn format(&mut self, label: &str) {
        for sector in 0..TOTAL_SECTORS as u32 {
            self.cache.write(sector, [0u8; SECTOR_SIZE]);
        }
        let mut boot = [0u8; SECTOR_SIZE];
        boot[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
        boot[3..11].copy_from_slice(b"EM8086  ");
        boot[11..13].copy_from_slice(&BYTES_PER_SECTOR.to_le_bytes());
        boot[13] = SECTORS_PER_CLUSTER;
        boot[14..16].copy_from_slice(&RESERVED_SECTORS.to_le_bytes());
        boot[16] = NUM_FATS;
        boot[17..19].copy_from_slice(&ROOT_ENTRIES.to_le_bytes());
        boot[19..21].copy_from_slice(&TOTAL_SECTORS.to_le_bytes());
        boot[21] = MEDIA_DESCRIPTOR;
        boot[22..24].copy_from_slice(&SECTORS_PER_FAT.to_le_bytes());
        boot[24..26].copy_from_slice(&SECTORS_PER_TRACK.to_le_bytes());
        boot[26..28].copy_from_slice(&(HEADS as u16).to_le_bytes());
        boot[28..32].copy_from_slice(&0u32.to_le_bytes());
        boot[32..36].copy_from_slice(&0u32.to_le_bytes());
        boot[36] = 0x00;
        boot[38] = 0x29;
        boot[39..43].copy_from_slice(&0x1234_5678u32.to_le_bytes());
        write_padded(&mut boot[43..54], label.as_bytes(), b' ');
        write_padded(&mut boot[54..62], b"FAT12", b' ');
        boot[510] = 0x55;
        boot[511] = 0xAA;
        self.cache.write(0, boot);

        for fat_start in [FAT1_START, FAT2_START] {
            let mut sector = [0u8; SECTOR_SIZE];
            sector[0] = 0xF0;
            sector[1] = 0xFF;
            sector[2] = 0xFF;
            self.cache.write(fat_start, sector);
        }
        self.cache.flush();
    }

    /// Reads one physical 512-byte sector by absolute LBA, for INT 13h's
    /// CHS-addressed disk access. `None` if the LBA is off the end of the
    /// 1.44 MB image.
    pub fn read_raw_sector(&mut self, sector: u32) -> Option<[u8; SECTOR_SIZE]> {
        if sector >= TOTAL_SECTORS as u32 {
            return None;
        }
        Some(self.cache.read(sector))
    }

    pub fn free_clusters(&mut self) -> usize {
        (2..MAX_CLUSTER as u16).filter(|&c| self.get_fat_entry(c) == FREE_CLUSTER).count()
    }

    pub fn list_dir(&mut self, path: &[String]) -> Result<Vec<DirEntry>, FatError> {
        let loc = self.resolve_dir(path)?;
        Ok(self
            .enumerate_dir(loc)
            .into_iter()
            .map(|(_, _, entry)| entry)
            .filter(|entry| entry.attributes & ATTR_VOLUME_LABEL == 0)
            .collect())
    }

    pub fn read_file(&mut self, path: &[String], name: &str) -> Result<Vec<u8>, FatError> {
        let loc = self.resolve_dir(path)?;
        let (_, _, entry) = self.find_entry(loc, name)?;
        let chain = self.cluster_chain(entry.first_cluster);
        let mut bytes = Vec::with_capacity(entry.size as usize);
        for cluster in chain {
            let sector = DATA_START + (cluster as u32 - 2);
            bytes.extend_from_slice(&self.cache.read(sector));
        }
        bytes.truncate(entry.size as usize);
        Ok(bytes)
    }

    pub fn write_file(&mut self, path: &[String], name: &str, bytes: &[u8]) -> Result<(), FatError> {
        let loc = self.resolve_dir(path)?;
        if let Ok((sector, offset, entry)) = self.find_entry(loc, name) {
            self.free_chain(entry.first_cluster);
            self.clear_dir_slot(sector, offset);
        }
        let cluster_size = SECTOR_SIZE * SECTORS_PER_CLUSTER as usize;
        let num_clusters = bytes.len().div_ceil(cluster_size).max(1);
        let mut clusters = Vec::with_capacity(num_clusters);
        for _ in 0..num_clusters {
            match self.allocate_cluster() {
                Some(c) => {
                    self.set_fat_entry(c, END_OF_CHAIN);
                    clusters.push(c);
                }
                None => {
                    log::warn!("write_file({name}): disk full after allocating {} of {num_clusters} clusters", clusters.len());
                    for c in &clusters {
                        self.set_fat_entry(*c, FREE_CLUSTER);
                    }
                    self.cache.flush();
                    return Err(FatError::DiskFull);
                }
            }
        }
        for (i, &cluster) in clusters.iter().enumerate() {
            let next = if i + 1 < clusters.len() { clusters[i + 1] } else { END_OF_CHAIN };
            self.set_fat_entry(cluster, next);
            let start = i * cluster_size;
            let end = (start + cluster_size).min(bytes.len());
            let mut payload = [0u8; SECTOR_SIZE];
            if start < bytes.len() {
                payload[..end - start].copy_from_slice(&bytes[start..end]);
            }
            let sector = DATA_START + (cluster as u32 - 2);
            self.cache.write(sector, payload);
        }
        let (date, time) = current_date_time();
        let entry = DirEntry {
            name: name.to_uppercase(),
            attributes: ATTR_ARCHIVE,
            first_cluster: clusters[0],
            size: bytes.len() as u32,
            time,
            date,
        };
        self.insert_dir_entry(loc, &entry)?;
        self.cache.flush();
        Ok(())
    }

    pub fn mkdir(&mut self, path: &[String], name: &str) -> Result<(), FatError> {
        let loc = self.resolve_dir(path)?;
        if self.find_entry_case_insensitive(loc, name).is_ok() {
            return Err(FatError::AlreadyExists);
        }
        let cluster = self.allocate_cluster().ok_or(FatError::DiskFull)?;
        self.set_fat_entry(cluster, END_OF_CHAIN);
        let sector = DATA_START + (cluster as u32 - 2);
        self.cache.write(sector, [0u8; SECTOR_SIZE]);
        let (date, time) = current_date_time();
        let entry = DirEntry { name: name.to_uppercase(), attributes: ATTR_DIRECTORY, first_cluster: cluster, size: 0, time, date };
        self.insert_dir_entry(loc, &entry)?;
        self.cache.flush();
        Ok(())
    }

    pub fn delete_entry(&mut self, path: &[String], name: &str) -> Result<bool, FatError> {
        let loc = self.resolve_dir(path)?;
        match self.find_entry_case_insensitive(loc, name) {
            Ok((sector, offset, entry)) => {
                self.free_chain(entry.first_cluster);
                self.clear_dir_slot(sector, offset);
                self.cache.flush();
                Ok(true)
            }
            Err(FatError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn rename_entry(&mut self, path: &[String], old_name: &str, new_name: &str) -> Result<(), FatError> {
        let loc = self.resolve_dir(path)?;
        let (sector, offset, _) = self.find_entry_case_insensitive(loc, old_name)?;
        let mut buf = self.cache.read(sector);
        let (raw_name, raw_ext) = pack_name(new_name);
        buf[offset..offset + 8].copy_from_slice(&raw_name);
        buf[offset + 8..offset + 11].copy_from_slice(&raw_ext);
        self.cache.write(sector, buf);
        self.cache.flush();
        Ok(())
    }

    /// Flushes the sector cache and, if the backing store has a real
    /// medium (e.g. a file on disk), writes it out.
    pub fn persist(&mut self) -> std::io::Result<()> {
        self.cache.flush();
        self.cache.store.persist()
    }

    fn resolve_dir(&mut self, path: &[String]) -> Result<DirLocation, FatError> {
        let mut loc = DirLocation::Root;
        for component in path {
            let (_, _, entry) = self.find_entry_case_insensitive(loc, component)?;
            if !entry.is_directory() {
                return Err(FatError::NotFound);
            }
            loc = DirLocation::Cluster(entry.first_cluster);
        }
        Ok(loc)
    }

    fn dir_sectors(&mut self, loc: DirLocation) -> Vec<u32> {
        match loc {
            DirLocation::Root => (0..ROOT_DIR_SECTORS).map(|i| ROOT_DIR_START + i).collect(),
            DirLocation::Cluster(start) => {
                self.cluster_chain(start).into_iter().map(|c| DATA_START + (c as u32 - 2)).collect()
            }
        }
    }

    /// `(sector, byte-offset-within-sector, entry)` for every live slot.
    fn enumerate_dir(&mut self, loc: DirLocation) -> Vec<(u32, usize, DirEntry)> {
        let mut entries = Vec::new();
        'sectors: for sector in self.dir_sectors(loc) {
            let buf = self.cache.read(sector);
            for slot in 0..SECTOR_SIZE / 32 {
                let offset = slot * 32;
                let raw = &buf[offset..offset + 32];
                if raw[0] == 0x00 {
                    break 'sectors;
                }
                if raw[0] == 0xE5 || raw[11] == ATTR_LONG_NAME {
                    continue;
                }
                entries.push((sector, offset, parse_dir_entry(raw)));
            }
        }
        entries
    }

    fn find_entry(&mut self, loc: DirLocation, name: &str) -> Result<(u32, usize, DirEntry), FatError> {
        self.find_entry_case_insensitive(loc, name)
    }

    fn find_entry_case_insensitive(&mut self, loc: DirLocation, name: &str) -> Result<(u32, usize, DirEntry), FatError> {
        let target = name.to_uppercase();
        self.enumerate_dir(loc)
            .into_iter()
            .find(|(_, _, entry)| entry.name == target)
            .ok_or(FatError::NotFound)
    }

    fn insert_dir_entry(&mut self, loc: DirLocation, entry: &DirEntry) -> Result<(), FatError> {
        let sectors = self.dir_sectors(loc);
        for &sector in &sectors {
            let mut buf = self.cache.read(sector);
            for slot in 0..SECTOR_SIZE / 32 {
                let offset = slot * 32;
                if buf[offset] == 0x00 || buf[offset] == 0xE5 {
                    write_dir_entry(&mut buf[offset..offset + 32], entry);
                    self.cache.write(sector, buf);
                    return Ok(());
                }
            }
        }
        if matches!(loc, DirLocation::Root) {
            log::warn!("insert_dir_entry({}): root directory has no free slot", entry.name);
            return Err(FatError::DirectoryFull);
        }
        // Subdirectories grow like files: extend the chain with one more cluster.
        let last_cluster = match loc {
            DirLocation::Cluster(c) => *self.cluster_chain(c).last().unwrap(),
            DirLocation::Root => unreachable!(),
        };
        let new_cluster = self.allocate_cluster().ok_or(FatError::DiskFull)?;
        self.set_fat_entry(last_cluster, new_cluster);
        self.set_fat_entry(new_cluster, END_OF_CHAIN);
        let mut buf = [0u8; SECTOR_SIZE];
        write_dir_entry(&mut buf[0..32], entry);
        let sector = DATA_START + (new_cluster as u32 - 2);
        self.cache.write(sector, buf);
        Ok(())
    }

    fn clear_dir_slot(&mut self, sector: u32, offset: usize) {
        let mut buf = self.cache.read(sector);
        buf[offset] = 0xE5;
        self.cache.write(sector, buf);
    }

    fn cluster_chain(&mut self, start: u16) -> Vec<u16> {
        let mut chain = Vec::new();
        let mut current = start;
        loop {
            chain.push(current);
            let next = self.get_fat_entry(current);
            if next == FREE_CLUSTER || next >= MIN_EOC {
                break;
            }
            current = next;
        }
        chain
    }

    fn free_chain(&mut self, start: u16) {
        for cluster in self.cluster_chain(start) {
            self.set_fat_entry(cluster, FREE_CLUSTER);
        }
    }

    fn allocate_cluster(&mut self) -> Option<u16> {
        (2..MAX_CLUSTER as u16).find(|&c| self.get_fat_entry(c) == FREE_CLUSTER)
    }

    fn fat_raw_word(&mut self, fat_start: u32, byte_offset: usize) -> u16 {
        let sector = fat_start + (byte_offset / SECTOR_SIZE) as u32;
        let in_sector = byte_offset % SECTOR_SIZE;
        let buf = self.cache.read(sector);
        let lo = buf[in_sector] as u16;
        let hi = if in_sector + 1 < SECTOR_SIZE {
            buf[in_sector + 1] as u16
        } else {
            self.cache.read(sector + 1)[0] as u16
        };
        lo | (hi << 8)
    }

    fn set_fat_raw_word(&mut self, fat_start: u32, byte_offset: usize, word: u16) {
        let sector = fat_start + (byte_offset / SECTOR_SIZE) as u32;
        let in_sector = byte_offset % SECTOR_SIZE;
        let mut buf = self.cache.read(sector);
        buf[in_sector] = (word & 0xff) as u8;
        if in_sector + 1 < SECTOR_SIZE {
            buf[in_sector + 1] = (word >> 8) as u8;
            self.cache.write(sector, buf);
        } else {
            self.cache.write(sector, buf);
            let mut next = self.cache.read(sector + 1);
            next[0] = (word >> 8) as u8;
            self.cache.write(sector + 1, next);
        }
    }

    fn get_fat_entry(&mut self, cluster: u16) -> u16 {
        let byte_offset = cluster as usize + (cluster as usize >> 1);
        let word = self.fat_raw_word(FAT1_START, byte_offset);
        if cluster.is_multiple_of(2) {
            word & 0xFFF
        } else {
            word >> 4
        }
    }

    fn set_fat_entry(&mut self, cluster: u16, value: u16) {
        let byte_offset = cluster as usize + (cluster as usize >> 1);
        for fat_start in [FAT1_START, FAT2_START] {
            let word = self.fat_raw_word(fat_start, byte_offset);
            let new_word =
                if cluster.is_multiple_of(2) { (word & 0xF000) | (value & 0xFFF) } else { (word & 0x000F) | ((value & 0xFFF) << 4) };
            self.set_fat_raw_word(fat_start, byte_offset, new_word);
        }
    }
}

fn write_padded(dst: &mut [u8], src: &[u8], pad: u8) {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
    for b in &mut dst[n..] {
        *b = pad;
    }
}

fn pack_name(name: &str) -> ([u8; 8], [u8; 3]) {
    let upper = name.to_uppercase();
    let (base, ext) = upper.split_once('.').unwrap_or((upper.as_str(), ""));
    let mut raw_name = [b' '; 8];
    write_padded(&mut raw_name, base.as_bytes(), b' ');
    let mut raw_ext = [b' '; 3];
    write_padded(&mut raw_ext, ext.as_bytes(), b' ');
    (raw_name, raw_ext)
}

fn unpack_name(raw_name: &[u8], raw_ext: &[u8]) -> String {
    let base = std::str::from_utf8(raw_name).unwrap_or("").trim_end_matches(' ');
    let ext = std::str::from_utf8(raw_ext).unwrap_or("").trim_end_matches(' ');
    if ext.is_empty() {
        base.to_string()
    } else {
        format!("{base}.{ext}")
    }
}

fn parse_dir_entry(raw: &[u8]) -> DirEntry {
    let name = unpack_name(&raw[0..8], &raw[8..11]);
    let attributes = raw[11];
    let time = u16::from_le_bytes([raw[22], raw[23]]);
    let date = u16::from_le_bytes([raw[24], raw[25]]);
    let first_cluster = u16::from_le_bytes([raw[26], raw[27]]);
    let size = u32::from_le_bytes([raw[28], raw[29], raw[30], raw[31]]);
    DirEntry { name, attributes, first_cluster, size, time, date }
}

fn write_dir_entry(raw: &mut [u8], entry: &DirEntry) {
    let (raw_name, raw_ext) = pack_name(&entry.name);
    raw[0..8].copy_from_slice(&raw_name);
    raw[8..11].copy_from_slice(&raw_ext);
    raw[11] = entry.attributes;
    raw[22..24].copy_from_slice(&entry.time.to_le_bytes());
    raw[24..26].copy_from_slice(&entry.date.to_le_bytes());
    raw[26..28].copy_from_slice(&entry.first_cluster.to_le_bytes());
    raw[28..32].copy_from_slice(&entry.size.to_le_bytes());
}

fn current_date_time() -> (u16, u16) {
    let now = chrono::Local::now();
    let date = (((now.year() - 1980).max(0) as u16) << 9) | ((now.month() as u16) << 5) | now.day() as u16;
    let time = ((now.hour() as u16) << 11) | ((now.minute() as u16) << 5) | (now.second() as u16 / 2);
    (date, time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySectorStore;

    fn formatted_fs() -> Fat12<MemorySectorStore> {
        let mut fs = Fat12::new(MemorySectorStore::new());
        fs.format("EM8086VOL");
        fs
    }

    #[test]
    fn fresh_store_is_not_formatted() {
        let mut fs = Fat12::new(MemorySectorStore::new());
        assert!(!fs.is_formatted());
    }

    #[test]
    fn format_writes_boot_jump_and_fat_header() {
        let mut fs = formatted_fs();
        assert!(fs.is_formatted());
        assert_eq!(fs.free_clusters(), (MAX_CLUSTER - 2) as usize);
    }

    #[test]
    fn write_then_list_then_read_round_trips() {
        let mut fs = formatted_fs();
        fs.write_file(&[], "A.TXT", &[0x41, 0x42, 0x43]).unwrap();
        let entries = fs.list_dir(&[]).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "A.TXT");
        assert_eq!(entries[0].attributes, ATTR_ARCHIVE);
        assert_eq!(entries[0].size, 3);
        assert_eq!(entries[0].first_cluster, 2);
        let bytes = fs.read_file(&[], "A.TXT").unwrap();
        assert_eq!(bytes, vec![0x41, 0x42, 0x43]);
    }

    #[test]
    fn write_file_spanning_multiple_clusters() {
        let mut fs = formatted_fs();
        let data: Vec<u8> = (0..1200u32).map(|i| (i % 256) as u8).collect();
        fs.write_file(&[], "BIG.BIN", &data).unwrap();
        let read_back = fs.read_file(&[], "BIG.BIN").unwrap();
        assert_eq!(read_back, data);
        assert_eq!(fs.free_clusters(), (MAX_CLUSTER - 2) as usize - 3);
    }

    #[test]
    fn rewriting_a_file_frees_its_old_chain() {
        let mut fs = formatted_fs();
        fs.write_file(&[], "A.TXT", &vec![0u8; 2000]).unwrap();
        let used_after_first = fs.free_clusters();
        fs.write_file(&[], "A.TXT", &[1, 2, 3]).unwrap();
        assert!(fs.free_clusters() > used_after_first);
        assert_eq!(fs.read_file(&[], "A.TXT").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn mkdir_then_write_file_inside_it() {
        let mut fs = formatted_fs();
        fs.mkdir(&[], "SUBDIR").unwrap();
        let path = vec!["SUBDIR".to_string()];
        fs.write_file(&path, "X.TXT", &[9, 9]).unwrap();
        let entries = fs.list_dir(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "X.TXT");
    }

    #[test]
    fn mkdir_rejects_duplicate_case_insensitive_name() {
        let mut fs = formatted_fs();
        fs.mkdir(&[], "SUBDIR").unwrap();
        assert!(matches!(fs.mkdir(&[], "subdir"), Err(FatError::AlreadyExists)));
    }

    #[test]
    fn delete_entry_frees_cluster_chain_and_marks_slot_deleted() {
        let mut fs = formatted_fs();
        fs.write_file(&[], "A.TXT", &[1, 2, 3]).unwrap();
        let before = fs.free_clusters();
        assert!(fs.delete_entry(&[], "A.TXT").unwrap());
        assert_eq!(fs.free_clusters(), before + 1);
        assert!(fs.list_dir(&[]).unwrap().is_empty());
    }

    #[test]
    fn delete_entry_on_missing_name_returns_false() {
        let mut fs = formatted_fs();
        assert!(!fs.delete_entry(&[], "NOPE.TXT").unwrap());
    }

    #[test]
    fn rename_entry_updates_name_and_keeps_chain() {
        let mut fs = formatted_fs();
        fs.write_file(&[], "A.TXT", &[1, 2, 3]).unwrap();
        fs.rename_entry(&[], "A.TXT", "B.TXT").unwrap();
        assert_eq!(fs.read_file(&[], "B.TXT").unwrap(), vec![1, 2, 3]);
        assert!(fs.read_file(&[], "A.TXT").is_err());
    }

    #[test]
    fn list_dir_on_missing_directory_is_not_found() {
        let mut fs = formatted_fs();
        assert!(matches!(fs.list_dir(&["GHOST".to_string()]), Err(FatError::NotFound)));
    }

    #[test]
    fn directory_full_when_root_has_no_free_slot() {
        let mut fs = formatted_fs();
        for i in 0..ROOT_ENTRIES {
            let name = format!("F{i}.TXT");
            if fs.write_file(&[], &name, &[0]).is_err() {
                break;
            }
        }
        let result = fs.write_file(&[], "OVERFLOW.TXT", &[0]);
        assert!(matches!(result, Err(FatError::DirectoryFull)));
    }
}
