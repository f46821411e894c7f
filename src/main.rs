use clap::arg_enum;
use log::debug;
use std::path::{Path, PathBuf};
use std::process;
use structopt::StructOpt;

mod error;
mod image;
mod layout;
mod patch;
mod patcher;

use error::{Error, Result};
use layout::Layout;
use patch::PatchTable;
use patcher::{Mode, Outcome, Patcher, Report};

const EXIT_FAILURE: i32 = 1;
const EXIT_NO_MATCH: i32 = 2;
const EXIT_NEEDS_PATCH: i32 = 3;

arg_enum! {
    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Action {
        Patch,
        Check
    }
}

impl From<Action> for Mode {
    fn from(action: Action) -> Self {
        match action {
            Action::Patch => Mode::Patch,
            Action::Check => Mode::Check,
        }
    }
}

arg_enum! {
    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Format {
        Uf2,
        Raw
    }
}

#[derive(Debug, StructOpt)]
#[structopt(name = "boot-patcher", about = "Apply fixed byte patches to a firmware boot image")]
struct Options {
    /// `Check` reports what would change without writing the image
    #[structopt(
        short,
        long,
        possible_values = &Action::variants(),
        case_insensitive = true,
        default_value = "Patch"
    )]
    mode: Action,
    /// `Raw` treats patch addresses as plain file offsets
    #[structopt(
        short,
        long,
        possible_values = &Format::variants(),
        case_insensitive = true,
        default_value = "Uf2"
    )]
    layout: Format,
    /// Patch table (.json or .rbp); defaults to the built-in boot image table
    #[structopt(short, long, parse(from_os_str))]
    table: Option<PathBuf>,
    #[structopt(index = 1, required = true, name = "IMAGE", parse(from_os_str))]
    image: PathBuf,
}

fn main() {
    pretty_env_logger::init();

    let opt = Options::from_args();
    debug!("{:?}", opt);

    let mode = Mode::from(opt.mode);
    let result = run(&opt, mode);
    if let Err(e) = &result {
        eprintln!("[boot-patcher] {}", e);
    }
    process::exit(exit_code(result.as_ref().map(Report::outcome), mode));
}

fn run(opt: &Options, mode: Mode) -> Result<Report> {
    let layout = match opt.layout {
        Format::Uf2 => Layout::UF2,
        Format::Raw => Layout::RAW,
    };
    let table = match &opt.table {
        Some(path) => PatchTable::load(path)?,
        None => PatchTable::boot_image(&layout),
    };

    let patcher = Patcher::new(layout, table)?;
    let report = patcher.patch_file(&opt.image, mode)?;
    print_summary(&opt.image, mode, &report);
    Ok(report)
}

/// Process exit status for a run, so scripts can tell a stale table apart from success.
fn exit_code(outcome: Result<Outcome, &Error>, mode: Mode) -> i32 {
    match (outcome, mode) {
        (Err(_), _) => EXIT_FAILURE,
        (Ok(Outcome::NoMatch), _) => EXIT_NO_MATCH,
        (Ok(Outcome::Modified), Mode::Check) => EXIT_NEEDS_PATCH,
        (Ok(_), _) => 0,
    }
}

fn print_summary(image: &Path, mode: Mode, report: &Report) {
    for entry in &report.entries {
        println!("[boot-patcher] {}", entry);
    }

    let path = image.display();
    match (report.outcome(), mode) {
        (Outcome::Modified, Mode::Patch) => println!(
            "[boot-patcher] Patched {} location(s), {} byte(s) changed in {}",
            report.patched(),
            report.bytes_changed(),
            path
        ),
        (Outcome::Modified, Mode::Check) => println!(
            "[boot-patcher] {} location(s) in {} need patching",
            report.patched(),
            path
        ),
        (Outcome::Unchanged, _) => println!(
            "[boot-patcher] No changes needed, {} location(s) already patched.",
            report.already_patched()
        ),
        (Outcome::NoMatch, _) => {
            eprintln!("[boot-patcher] WARNING: No matching addresses found in {}!", path)
        }
    }
}
