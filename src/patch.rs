use hex_buffer_serde::{Hex as _, HexForm};
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use std::fs;
use std::path::Path;

use crate::error::{
    AddressOverflow, EmptyReplacement, OverlappingEntries, ParseBincodeTable, ParseJsonTable,
    ReadTable, Result, UnknownTableFormat,
};
use crate::layout::Layout;

/// Fixes applied to the Pico boot image, keyed by flash address.
const BOOT_IMAGE_PATCHES: &[(u32, &[u8])] = &[
    (0x1000_003C, &[0x04]),
    (0x1000_011C, &[0x07, 0x0B, 0x8F, 0xD5]),
];

/// Start of XIP flash on the RP2040, where the boot image is linked.
const FLASH_BASE: u32 = 0x1000_0000;

/// A single substitution: write `bytes` at `address`.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Debug)]
pub(crate) struct PatchEntry {
    pub address: u32,
    #[serde(with = "HexForm")]
    pub bytes: Vec<u8>,
}

impl PatchEntry {
    pub fn new(address: u32, bytes: Vec<u8>) -> Self {
        Self { address, bytes }
    }

    /// One past the last address written, widened so it cannot wrap.
    pub fn end(&self) -> u64 {
        u64::from(self.address) + self.bytes.len() as u64
    }
}

/// On-disk form of a patch table. Loaded as-is, then checked by `PatchTable::new`.
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug, Default)]
struct PatchFile {
    entries: Vec<PatchEntry>,
}

/// A validated set of patch entries, sorted by address.
///
/// Entries never share an address and never overlap, so applying them in any order gives the
/// same image.
#[derive(Clone, PartialEq, Eq, Debug)]
pub(crate) struct PatchTable {
    entries: Vec<PatchEntry>,
}

impl PatchTable {
    pub fn new(mut entries: Vec<PatchEntry>) -> Result<Self> {
        entries.sort_by_key(|entry| entry.address);

        for entry in &entries {
            ensure!(
                !entry.bytes.is_empty(),
                EmptyReplacement {
                    address: entry.address
                }
            );
            ensure!(
                entry.end() <= u64::from(u32::MAX) + 1,
                AddressOverflow {
                    address: entry.address,
                    len: entry.bytes.len()
                }
            );
        }

        for pair in entries.windows(2) {
            ensure!(
                pair[0].end() <= u64::from(pair[1].address),
                OverlappingEntries {
                    first: pair[0].address,
                    second: pair[1].address
                }
            );
        }

        Ok(Self { entries })
    }

    /// The built-in table for the boot image, addressed for `layout`.
    ///
    /// A layout without a header address field patches by file offset, so the flash base is
    /// subtracted, giving raw offsets into the binary that the UF2 was built from.
    pub fn boot_image(layout: &Layout) -> Self {
        let base = if layout.address_offset.is_none() {
            FLASH_BASE
        } else {
            0
        };
        let entries = BOOT_IMAGE_PATCHES
            .iter()
            .map(|&(address, bytes)| PatchEntry::new(address - base, bytes.to_vec()))
            .collect();
        Self { entries }
    }

    /// Load a table from `path`: `.json` is read with serde_json, `.rbp` with bincode.
    pub fn load(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);

        let file: PatchFile = match extension.as_deref() {
            Some("json") => {
                let text = fs::read_to_string(path).context(ReadTable { path })?;
                serde_json::from_str(&text).context(ParseJsonTable { path })?
            }
            Some("rbp") => {
                let data = fs::read(path).context(ReadTable { path })?;
                bincode::deserialize(&data).context(ParseBincodeTable { path })?
            }
            _ => return UnknownTableFormat { path }.fail(),
        };

        Self::new(file.entries)
    }

    pub fn entries(&self) -> &[PatchEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Error;
    use crate::image::test::ScratchDir;

    #[test]
    fn test_sorted() -> Result<()> {
        let table = PatchTable::new(vec![
            PatchEntry::new(0x200, vec![1, 2]),
            PatchEntry::new(0x100, vec![3]),
        ])?;
        let addresses: Vec<u32> = table.entries().iter().map(|e| e.address).collect();
        assert_eq!(addresses, [0x100, 0x200]);
        Ok(())
    }

    #[test]
    fn test_rejects_overlap() {
        let result = PatchTable::new(vec![
            PatchEntry::new(0x100, vec![1, 2, 3, 4]),
            PatchEntry::new(0x102, vec![5]),
        ]);
        match result {
            Err(Error::OverlappingEntries { first, second }) => {
                assert_eq!((first, second), (0x100, 0x102));
            }
            other => panic!("unexpected result: {:?}", other),
        }

        // Adjacent entries are fine.
        assert!(PatchTable::new(vec![
            PatchEntry::new(0x100, vec![1, 2, 3, 4]),
            PatchEntry::new(0x104, vec![5]),
        ])
        .is_ok());
    }

    #[test]
    fn test_rejects_duplicate_address() {
        let result = PatchTable::new(vec![
            PatchEntry::new(0x100, vec![1]),
            PatchEntry::new(0x100, vec![1]),
        ]);
        assert!(matches!(result, Err(Error::OverlappingEntries { .. })));
    }

    #[test]
    fn test_rejects_empty_and_overflow() {
        let empty = PatchTable::new(vec![PatchEntry::new(0x100, vec![])]);
        assert!(matches!(
            empty,
            Err(Error::EmptyReplacement { address: 0x100 })
        ));

        let overflow = PatchTable::new(vec![PatchEntry::new(0xFFFF_FFFE, vec![1, 2, 3])]);
        assert!(matches!(overflow, Err(Error::AddressOverflow { .. })));

        assert!(PatchTable::new(vec![PatchEntry::new(0xFFFF_FFFE, vec![1, 2])]).is_ok());
    }

    #[test]
    fn test_boot_image() -> Result<()> {
        let table = PatchTable::boot_image(&Layout::UF2);
        assert_eq!(
            table.entries(),
            [
                PatchEntry::new(0x1000_003C, vec![0x04]),
                PatchEntry::new(0x1000_011C, vec![0x07, 0x0B, 0x8F, 0xD5]),
            ]
        );
        assert_eq!(PatchTable::new(table.entries().to_vec())?, table);

        let raw = PatchTable::boot_image(&Layout::RAW);
        assert_eq!(raw.entries()[0].address, 0x3C);
        assert_eq!(raw.entries()[1].address, 0x11C);
        Ok(())
    }

    #[test]
    fn test_parse_json() -> Result<(), Box<dyn std::error::Error>> {
        let json = r#"{"entries":[{"address":268435740,"bytes":"070b8fd5"}]}"#;
        let file: PatchFile = serde_json::from_str(json)?;
        let table = PatchTable::new(file.entries)?;
        assert_eq!(
            table.entries(),
            [PatchEntry::new(0x1000_011C, vec![0x07, 0x0B, 0x8F, 0xD5])]
        );
        Ok(())
    }

    #[test]
    fn test_load_files() -> Result<(), Box<dyn std::error::Error>> {
        let scratch = ScratchDir::new("table-load")?;
        let dir = scratch.path();

        let file = PatchFile {
            entries: PatchTable::boot_image(&Layout::UF2).entries().to_vec(),
        };

        let json_path = dir.join("table.json");
        fs::write(&json_path, serde_json::to_string(&file)?)?;
        assert_eq!(PatchTable::load(&json_path)?, PatchTable::boot_image(&Layout::UF2));

        let rbp_path = dir.join("table.rbp");
        fs::write(&rbp_path, bincode::serialize(&file)?)?;
        assert_eq!(PatchTable::load(&rbp_path)?, PatchTable::boot_image(&Layout::UF2));

        let txt_path = dir.join("table.txt");
        fs::write(&txt_path, "")?;
        assert!(matches!(
            PatchTable::load(&txt_path),
            Err(Error::UnknownTableFormat { .. })
        ));

        assert!(matches!(
            PatchTable::load(&dir.join("missing.json")),
            Err(Error::ReadTable { .. })
        ));
        Ok(())
    }
}
