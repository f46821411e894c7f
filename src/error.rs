use snafu::Snafu;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum Error {
    #[snafu(display("Image file not found: {}", path.display()))]
    MissingFile { path: PathBuf },

    #[snafu(display("Could not read image {}: {}", path.display(), source))]
    ReadImage {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not write image {}: {}", path.display(), source))]
    WriteImage {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not read patch table {}: {}", path.display(), source))]
    ReadTable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Invalid JSON patch table {}: {}", path.display(), source))]
    ParseJsonTable {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("Invalid binary patch table {}: {}", path.display(), source))]
    ParseBincodeTable {
        path: PathBuf,
        source: bincode::Error,
    },

    #[snafu(display(
        "Unknown patch table format for {} (expected .json or .rbp)",
        path.display()
    ))]
    UnknownTableFormat { path: PathBuf },

    #[snafu(display("Invalid block layout: {}", reason))]
    InvalidLayout { reason: String },

    #[snafu(display(
        "Image length {} is not a multiple of the {}-byte block size",
        len,
        block_size
    ))]
    MisalignedImage { len: usize, block_size: usize },

    #[snafu(display("Patch at {:#x} has no replacement bytes", address))]
    EmptyReplacement { address: u32 },

    #[snafu(display(
        "Patch at {:#x} ({} bytes) runs past the end of the address space",
        address,
        len
    ))]
    AddressOverflow { address: u32, len: usize },

    #[snafu(display("Patches at {:#x} and {:#x} overlap", first, second))]
    OverlappingEntries { first: u32, second: u32 },

    #[snafu(display(
        "Patch at {:#x} ({} bytes) cannot fit in a {}-byte payload region",
        address,
        len,
        payload_size
    ))]
    EntryTooLarge {
        address: u32,
        len: usize,
        payload_size: usize,
    },
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;
