//! Block framing of a firmware image.
//!
//! A UF2 image is a sequence of 512-byte blocks. Each block starts with a 32-byte header whose
//! fourth word is the address the payload is flashed to, followed by up to 476 payload bytes and
//! a closing magic word. Only the address word and the payload window matter here: magic numbers,
//! flags, block counts and family IDs are never looked at.
//!
//! A raw binary is the degenerate case of the same framing: one block spanning the whole file,
//! no header and a base address of zero, so that an "address" is just a file offset.

use byteorder::{ByteOrder, LittleEndian};
use log::trace;
use snafu::ensure;
use std::mem::size_of;

use crate::error::{InvalidLayout, MisalignedImage, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Layout {
    /// Size of one block. `None` treats the whole image as a single block.
    pub block_size: Option<usize>,
    /// Bytes at the start of each block that precede the payload.
    pub header_size: usize,
    /// Position of the little-endian u32 target address inside the header. `None` gives every
    /// block a base address of 0.
    pub address_offset: Option<usize>,
    /// Size of the payload window. `None` means everything after the header.
    pub payload_size: Option<usize>,
}

impl Layout {
    pub const UF2: Layout = Layout {
        block_size: Some(512),
        header_size: 32,
        address_offset: Some(12),
        payload_size: Some(476),
    };

    pub const RAW: Layout = Layout {
        block_size: None,
        header_size: 0,
        address_offset: None,
        payload_size: None,
    };

    pub fn validate(&self) -> Result<()> {
        if let Some(block_size) = self.block_size {
            ensure!(
                block_size > 0,
                InvalidLayout {
                    reason: "block size is zero"
                }
            );
            let used = self.header_size + self.payload_size.unwrap_or(0);
            ensure!(
                used <= block_size,
                InvalidLayout {
                    reason: format!(
                        "header ({}) and payload ({}) exceed the {}-byte block",
                        self.header_size,
                        self.payload_size.unwrap_or(0),
                        block_size
                    )
                }
            );
        }

        if let Some(address_offset) = self.address_offset {
            ensure!(
                address_offset + size_of::<u32>() <= self.header_size,
                InvalidLayout {
                    reason: format!(
                        "address field at {} does not fit in the {}-byte header",
                        address_offset, self.header_size
                    )
                }
            );
        }

        Ok(())
    }

    /// Split `image` into its blocks.
    ///
    /// Fails if the image does not consist of whole blocks. A whole-file layout never fails on
    /// length, but an image shorter than its header yields no blocks at all.
    pub fn blocks(&self, image: &[u8]) -> Result<Vec<Block>> {
        let block_size = match self.block_size {
            Some(block_size) => block_size,
            None => image.len(),
        };
        if block_size == 0 {
            return Ok(Vec::new());
        }
        ensure!(
            image.len() % block_size == 0,
            MisalignedImage {
                len: image.len(),
                block_size
            }
        );

        let payload_len = self
            .payload_size
            .unwrap_or_else(|| block_size.saturating_sub(self.header_size));
        if self.header_size + payload_len > block_size {
            // Only reachable for a whole-file layout on an image smaller than its framing.
            return Ok(Vec::new());
        }

        let blocks = image
            .chunks_exact(block_size)
            .enumerate()
            .map(|(index, raw)| {
                let offset = index * block_size;
                let base_address = self
                    .address_offset
                    .map(|pos| LittleEndian::read_u32(&raw[pos..][..size_of::<u32>()]))
                    .unwrap_or(0);
                trace!(
                    "block {} at {:#x}: base address {:#010x}",
                    index,
                    offset,
                    base_address
                );
                Block {
                    index,
                    offset,
                    base_address,
                    payload_offset: offset + self.header_size,
                    payload_len,
                }
            })
            .collect();

        Ok(blocks)
    }
}

/// One block of an image, with its payload window resolved to file offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block {
    pub index: usize,
    pub offset: usize,
    pub base_address: u32,
    pub payload_offset: usize,
    pub payload_len: usize,
}

impl Block {
    fn address_range(&self) -> (u64, u64) {
        let start = u64::from(self.base_address);
        (start, start + self.payload_len as u64)
    }

    /// File offset of `address`, if all `len` bytes from it fall inside this block's payload.
    pub fn locate(&self, address: u32, len: usize) -> Option<usize> {
        let (start, end) = self.address_range();
        let address = u64::from(address);
        if address < start || address + len as u64 > end {
            return None;
        }
        Some(self.payload_offset + (address - start) as usize)
    }

    /// Whether any of the `len` bytes from `address` falls inside this block's payload.
    pub fn overlaps(&self, address: u32, len: usize) -> bool {
        let (start, end) = self.address_range();
        let address = u64::from(address);
        address < end && address + len as u64 > start
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::error::Error;

    pub(crate) fn uf2_block(base_address: u32) -> Vec<u8> {
        let mut block = vec![0u8; 512];
        LittleEndian::write_u32(&mut block[12..16], base_address);
        block
    }

    #[test]
    fn test_uf2_blocks() -> Result<()> {
        let mut image = uf2_block(0x1000_0000);
        image.extend(uf2_block(0x1000_0100));

        let blocks = Layout::UF2.blocks(&image)?;
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].offset, 512);
        assert_eq!(blocks[1].base_address, 0x1000_0100);
        assert_eq!(blocks[1].payload_offset, 544);
        assert_eq!(blocks[1].payload_len, 476);
        Ok(())
    }

    #[test]
    fn test_raw_is_one_block() -> Result<()> {
        let image = vec![0xFFu8; 1000];
        let blocks = Layout::RAW.blocks(&image)?;
        assert_eq!(
            blocks,
            [Block {
                index: 0,
                offset: 0,
                base_address: 0,
                payload_offset: 0,
                payload_len: 1000,
            }]
        );
        assert!(Layout::RAW.blocks(&[])?.is_empty());
        Ok(())
    }

    #[test]
    fn test_misaligned_image() {
        let image = vec![0u8; 700];
        match Layout::UF2.blocks(&image) {
            Err(Error::MisalignedImage { len, block_size }) => {
                assert_eq!((len, block_size), (700, 512));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_validate() {
        assert!(Layout::UF2.validate().is_ok());
        assert!(Layout::RAW.validate().is_ok());

        let oversized = Layout {
            payload_size: Some(481),
            ..Layout::UF2
        };
        assert!(oversized.validate().is_err());

        let address_outside_header = Layout {
            address_offset: Some(30),
            ..Layout::UF2
        };
        assert!(address_outside_header.validate().is_err());

        let empty_blocks = Layout {
            block_size: Some(0),
            header_size: 0,
            address_offset: None,
            payload_size: None,
        };
        assert!(empty_blocks.validate().is_err());
    }

    #[test]
    fn test_locate() {
        let block = Block {
            index: 3,
            offset: 1536,
            base_address: 0x2000_0000,
            payload_offset: 1568,
            payload_len: 476,
        };
        assert_eq!(block.locate(0x2000_0000, 4), Some(1568));
        assert_eq!(block.locate(0x2000_0010, 1), Some(1568 + 0x10));
        assert_eq!(block.locate(0x2000_0000 + 475, 1), Some(1568 + 475));
        assert_eq!(block.locate(0x2000_0000 + 474, 4), None);
        assert_eq!(block.locate(0x1FFF_FFFF, 1), None);

        assert!(block.overlaps(0x2000_0000 + 474, 4));
        assert!(block.overlaps(0x1FFF_FFFE, 4));
        assert!(!block.overlaps(0x1FFF_FFFC, 4));
        assert!(!block.overlaps(0x2000_0000 + 476, 4));
    }

    #[test]
    fn test_locate_top_of_address_space() {
        let block = Block {
            index: 0,
            offset: 0,
            base_address: 0xFFFF_FF00,
            payload_offset: 32,
            payload_len: 476,
        };
        assert_eq!(block.locate(0xFFFF_FFFC, 4), Some(32 + 0xFC));
    }
}
