use std::fs::File;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context};
use clap::Parser;

use dexopt::oat::{
    build, read_art_image_info, BuildConfig, DexInput, DumpOptions, InstructionSet, OatFile,
    OatVersion, ParseStatus,
};

/// Build and dump ahead-of-time (OAT) containers for dex bytecode.
#[derive(Parser, Debug)]
#[command(name = "oat-tool", version, about)]
struct Cli {
    /// Dump an existing OAT file.
    #[arg(long, conflicts_with = "build")]
    dump: bool,

    /// Build a new OAT file.
    #[arg(long)]
    build: bool,

    /// Output path when building, input path when dumping.
    #[arg(long)]
    oat: Option<PathBuf>,

    /// Dex file to embed (repeatable).
    #[arg(long = "dex")]
    dex: Vec<PathBuf>,

    /// Location string for the matching --dex (repeatable, same count).
    #[arg(long = "dex-location")]
    dex_location: Vec<String>,

    /// Container version to build: 045, 064, 079 or 088.
    #[arg(long = "oat-version")]
    oat_version: Option<String>,

    /// Target architecture.
    #[arg(long, default_value = "none")]
    arch: String,

    /// Wrap the OAT payload in an ELF container.
    #[arg(long = "write-elf")]
    write_elf: bool,

    /// Boot image location recorded in the header and key-value store.
    #[arg(long = "art-image-location", default_value = "")]
    art_image_location: String,

    /// Dump per-class status tables (dump only).
    #[arg(long = "dump-classes")]
    dump_classes: bool,

    /// Dump type lookup tables (dump only).
    #[arg(long = "dump-tables")]
    dump_tables: bool,

    /// Report how much of the file the parser consumed (dump only).
    #[arg(long = "dump-memory-usage")]
    dump_memory_usage: bool,

    /// List classes below verified status (dump only).
    #[arg(long = "print-unverified-classes")]
    print_unverified_classes: bool,

    /// Enable debug logging.
    #[arg(long, short)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .format_target(false)
        .init();

    if !cli.dump && cli.print_unverified_classes {
        bail!("--print-unverified-classes can only be used with --dump");
    }

    if cli.dump {
        dump(&cli)
    } else if cli.build {
        build_oat(&cli)
    } else {
        bail!("Please specify --dump or --build");
    }
}

fn dump(cli: &Cli) -> anyhow::Result<()> {
    let path = cli.oat.as_ref().context("--oat is required")?;
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    // Containers can be large; map instead of reading into memory.
    let mapped = unsafe { memmap2::Mmap::map(&file) }
        .with_context(|| format!("failed to map {}", path.display()))?;

    let oat = OatFile::parse(&mapped).context("failed to parse oat file")?;
    let opts = DumpOptions {
        dump_classes: cli.dump_classes,
        dump_tables: cli.dump_tables,
        print_unverified_classes: cli.print_unverified_classes,
    };
    let mut stdout = std::io::stdout().lock();
    oat.dump(&mut stdout, &opts)?;

    if cli.dump_memory_usage {
        println!("file size: {} bytes", mapped.len());
        let exec_offset = oat.common_header();
        log::debug!("common header: {exec_offset:?}");
    }

    if oat.status() != ParseStatus::Success {
        oat.expect_success()?;
    }
    Ok(())
}

fn build_oat(cli: &Cli) -> anyhow::Result<()> {
    let path = cli.oat.as_ref().context("--oat is required")?;
    if cli.dex.is_empty() {
        bail!("one or more --dex arguments are required");
    }
    let version_str = cli
        .oat_version
        .as_ref()
        .context("--oat-version is required (045, 064, 079 or 088)")?;
    let version = OatVersion::from_str(version_str)
        .map_err(|_| anyhow::anyhow!("unsupported oat version {version_str}"))?;
    let isa = InstructionSet::from_str(&cli.arch)
        .map_err(|_| anyhow::anyhow!("unknown architecture {}", cli.arch))?;

    if !cli.dex_location.is_empty() && cli.dex_location.len() != cli.dex.len() {
        bail!("the number of --dex-location arguments must match the number of --dex arguments");
    }

    let mut inputs = Vec::with_capacity(cli.dex.len());
    for (idx, dex_path) in cli.dex.iter().enumerate() {
        let data = std::fs::read(dex_path)
            .with_context(|| format!("failed to read {}", dex_path.display()))?;
        let location = cli
            .dex_location
            .get(idx)
            .cloned()
            .unwrap_or_else(|| dex_path.display().to_string());
        inputs.push(DexInput { data, location });
    }

    // V064 headers carry boot-image facts pulled from the .art file.
    let image_info = if version == OatVersion::V064 && !cli.art_image_location.is_empty() {
        std::fs::read(&cli.art_image_location)
            .ok()
            .as_deref()
            .and_then(read_art_image_info)
    } else {
        None
    };

    let config = BuildConfig {
        version,
        isa,
        write_elf: cli.write_elf,
        art_image_location: cli.art_image_location.clone(),
        image_info,
    };
    let mut out = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    build(&mut out, &inputs, &config).context("failed to build oat file")?;
    log::info!("wrote {}", path.display());
    Ok(())
}
