//! Resolving patch addresses to file offsets and rewriting the bytes there.

use log::{debug, info, warn};
use snafu::ensure;
use std::fmt;
use std::path::Path;

use crate::error::{EntryTooLarge, Result};
use crate::image;
use crate::layout::Layout;
use crate::patch::{PatchEntry, PatchTable};

/// Whether `Patcher::patch_file` may write the image back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Write the image back when anything changed.
    Patch,
    /// Report only; the image is never written.
    Check,
}

/// What happened at one file location an entry resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Hit {
    Patched { offset: usize, old: Vec<u8> },
    AlreadyPatched { offset: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Patched,
    AlreadyPatched,
    Unmatched,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EntryReport {
    pub entry: PatchEntry,
    pub hits: Vec<Hit>,
    /// Set when the entry partially overlapped some block's payload. Such entries are never
    /// written.
    pub crosses_boundary: bool,
}

impl EntryReport {
    pub fn status(&self) -> Status {
        if self.hits.is_empty() {
            Status::Unmatched
        } else if self
            .hits
            .iter()
            .any(|hit| matches!(hit, Hit::Patched { .. }))
        {
            Status::Patched
        } else {
            Status::AlreadyPatched
        }
    }
}

impl fmt::Display for EntryReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}: ", self.entry.address)?;
        if self.hits.is_empty() {
            write!(f, "unmatched")?;
            if self.crosses_boundary {
                write!(f, " (crosses a block boundary)")?;
            }
            return Ok(());
        }

        for (i, hit) in self.hits.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match hit {
                Hit::Patched { offset, old } => write!(
                    f,
                    "{} -> {} at {:#x}",
                    hex(old),
                    hex(&self.entry.bytes),
                    offset
                )?,
                Hit::AlreadyPatched { offset } => write!(
                    f,
                    "already patched ({}) at {:#x}",
                    hex(&self.entry.bytes),
                    offset
                )?,
            }
        }
        Ok(())
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// At least one location was rewritten.
    Modified,
    /// Every matched location already held its replacement.
    Unchanged,
    /// No entry matched any block. The table probably belongs to a different build.
    NoMatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Report {
    pub entries: Vec<EntryReport>,
}

impl Report {
    pub fn outcome(&self) -> Outcome {
        let statuses: Vec<Status> = self.entries.iter().map(EntryReport::status).collect();
        if statuses.contains(&Status::Patched) {
            Outcome::Modified
        } else if statuses.contains(&Status::AlreadyPatched) {
            Outcome::Unchanged
        } else {
            Outcome::NoMatch
        }
    }

    /// Number of locations rewritten.
    pub fn patched(&self) -> usize {
        self.hits()
            .filter(|hit| matches!(hit, Hit::Patched { .. }))
            .count()
    }

    /// Number of locations that already held their replacement.
    pub fn already_patched(&self) -> usize {
        self.hits()
            .filter(|hit| matches!(hit, Hit::AlreadyPatched { .. }))
            .count()
    }

    pub fn bytes_changed(&self) -> usize {
        self.entries
            .iter()
            .map(|report| {
                report
                    .hits
                    .iter()
                    .map(|hit| match hit {
                        Hit::Patched { old, .. } => old
                            .iter()
                            .zip(&report.entry.bytes)
                            .filter(|(a, b)| a != b)
                            .count(),
                        Hit::AlreadyPatched { .. } => 0,
                    })
                    .sum::<usize>()
            })
            .sum()
    }

    fn hits(&self) -> impl Iterator<Item = &Hit> {
        self.entries.iter().flat_map(|report| report.hits.iter())
    }
}

pub(crate) struct Patcher {
    layout: Layout,
    table: PatchTable,
}

impl Patcher {
    /// Fails if the layout is inconsistent, or if an entry is longer than a payload region and
    /// could therefore never be applied.
    pub fn new(layout: Layout, table: PatchTable) -> Result<Self> {
        layout.validate()?;

        if let Some(payload_size) = layout.payload_size {
            for entry in table.entries() {
                ensure!(
                    entry.bytes.len() <= payload_size,
                    EntryTooLarge {
                        address: entry.address,
                        len: entry.bytes.len(),
                        payload_size
                    }
                );
            }
        }

        Ok(Self { layout, table })
    }

    /// Apply every entry to `image` in place.
    ///
    /// An entry is written into each block whose payload holds its whole address range. Entries
    /// straddling two blocks are left alone and flagged in the report.
    pub fn apply(&self, image: &mut [u8]) -> Result<Report> {
        let blocks = self.layout.blocks(image)?;
        debug!("Scanning {} block(s)", blocks.len());

        let mut reports: Vec<EntryReport> = self
            .table
            .entries()
            .iter()
            .map(|entry| EntryReport {
                entry: entry.clone(),
                hits: Vec::new(),
                crosses_boundary: false,
            })
            .collect();

        for block in &blocks {
            for report in reports.iter_mut() {
                let entry = &report.entry;
                let len = entry.bytes.len();

                let offset = match block.locate(entry.address, len) {
                    Some(offset) => offset,
                    None => {
                        if block.overlaps(entry.address, len) {
                            warn!(
                                "Patch at {:#x} crosses the payload boundary of block {}; skipping",
                                entry.address, block.index
                            );
                            report.crosses_boundary = true;
                        }
                        continue;
                    }
                };

                let target = &mut image[offset..offset + len];
                if *target == entry.bytes[..] {
                    debug!(
                        "{:#x}: already patched in block {} at {:#x}",
                        entry.address, block.index, offset
                    );
                    report.hits.push(Hit::AlreadyPatched { offset });
                } else {
                    debug!(
                        "{:#x}: patching block {} at {:#x}",
                        entry.address, block.index, offset
                    );
                    let old = target.to_vec();
                    target.copy_from_slice(&entry.bytes);
                    report.hits.push(Hit::Patched { offset, old });
                }
            }
        }

        Ok(Report { entries: reports })
    }

    /// Load the image at `path`, apply the table, and in `Mode::Patch` write it back if anything
    /// changed.
    pub fn patch_file(&self, path: &Path, mode: Mode) -> Result<Report> {
        let mut data = image::load(path)?;
        let report = self.apply(&mut data)?;

        match (report.outcome(), mode) {
            (Outcome::Modified, Mode::Patch) => {
                image::save(path, &data)?;
                info!(
                    "Patched {} location(s) in {}",
                    report.patched(),
                    path.display()
                );
            }
            (Outcome::Modified, Mode::Check) => {
                info!("{} needs patching; left untouched", path.display());
            }
            (Outcome::Unchanged, _) => {
                info!("{} is already patched", path.display());
            }
            (Outcome::NoMatch, _) => {
                warn!("No patch address matched any block of {}", path.display());
            }
        }

        Ok(report)
    }
}
