//
// cli.rs
// Dicom-Prep-rs
//
// Defines the CLI surface with Clap and dispatches user-selected commands to the corresponding modules.
//
// Thales Matheus Mendonça Santos - November 2025

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::warn;

use crate::alias::{AliasStore, DEFAULT_STORE_FILE};
use crate::augment::{self, AugmentConfig};
use crate::convert::{self, Converter, PngExportOptions};
use crate::decompress::{self, Decompressor};
use crate::preprocess::{self, Layout, PreprocessOptions};
use crate::scan::{self, FileKind};
use crate::{anonymize, metadata};

/// Command-line interface glue code: defines the available verbs and dispatches to modules.
#[derive(Parser)]
#[command(name = "dicom-prep")]
#[command(about = "Prepare DICOM collections for machine-learning datasets", long_about = None)]
pub struct Cli {
    /// Debug-level logging (and every tag for `info`)
    #[arg(short, long, global = true)]
    pub verbose: bool,
    /// Directory for conversion logs, alias tables and failure lists
    #[arg(long, global = true, default_value = "logs")]
    pub log_dir: PathBuf,
    /// Alias store file (defaults to <log-dir>/anonymizer_dictionary.bin)
    #[arg(long, global = true)]
    pub aliases: Option<PathBuf>,
    /// External decompression tool, called as `<tool> --raw <in> <out>`
    #[arg(long, global = true, default_value = decompress::DEFAULT_TOOL)]
    pub tool: String,
    /// Decode compressed pixel data in process instead of running the tool
    #[arg(long, global = true)]
    pub native: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Clone, Debug)]
pub struct LayoutArgs {
    /// Per-patient directory receiving the converted sequence
    #[arg(long, default_value = "1.MRI")]
    pub sequence_dir: String,
    /// Per-patient directory holding the single images
    #[arg(long, default_value = "0.DaT")]
    pub singles_dir: String,
}

impl From<LayoutArgs> for Layout {
    fn from(args: LayoutArgs) -> Self {
        Layout {
            sequence_dir: args.sequence_dir,
            singles_dir: args.singles_dir,
            ..Layout::default()
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum KindFilter {
    Dicom,
    Dicomdir,
    Png,
}

impl KindFilter {
    fn matches(self, kind: FileKind) -> bool {
        matches!(
            (self, kind),
            (KindFilter::Dicom, FileKind::DicomImage)
                | (KindFilter::Dicomdir, FileKind::DicomDir)
                | (KindFilter::Png, FileKind::Png)
        )
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// List DICOM images, DICOMDIRs and PNGs under a directory
    Scan {
        root: PathBuf,
        #[arg(short, long, value_enum)]
        kind: Option<KindFilter>,
    },
    /// Print the metadata of a DICOM file
    Info { file: PathBuf },
    /// Decompress every compressed DICOM image under a directory
    Decompress {
        root: PathBuf,
        /// Overwrite the originals instead of writing `<name><modifier>` beside them
        #[arg(long)]
        replace: bool,
        #[arg(long, default_value = decompress::DEFAULT_MODIFIER)]
        modifier: String,
    },
    /// Anonymize a DICOM file, or rename the patient directories under a directory
    Anonymize {
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Treat INPUT as a parent of patient directories named by their real identifiers
        #[arg(long)]
        directories: bool,
    },
    /// Show the alias store
    Aliases {
        /// Also write the plain-text alias table here
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Convert DICOM images to PNG
    ToPng {
        root: PathBuf,
        /// Keep the source file names
        #[arg(long)]
        same_name: bool,
        /// Delete each DICOM file after a successful conversion
        #[arg(long)]
        cleanup: bool,
    },
    /// Report structural issues of a patient tree
    Check {
        root: PathBuf,
        #[command(flatten)]
        layout: LayoutArgs,
    },
    /// Repair the fixable structural issues of a patient tree
    Fix {
        root: PathBuf,
        #[command(flatten)]
        layout: LayoutArgs,
    },
    /// Check, fix, anonymize, convert and restructure a patient tree
    Preprocess {
        root: PathBuf,
        #[arg(long, default_value = "selection")]
        selection: PathBuf,
        #[arg(long, default_value = preprocess::DEFAULT_MARKER)]
        marker: String,
        #[command(flatten)]
        layout: LayoutArgs,
    },
    /// Copy the marked sequence images into a selection tree
    Select {
        root: PathBuf,
        #[arg(short, long, default_value = "selection")]
        destination: PathBuf,
        #[arg(long, default_value = preprocess::DEFAULT_MARKER)]
        marker: String,
        #[command(flatten)]
        layout: LayoutArgs,
    },
    /// Build train/test pairings from a preprocessed tree (`<group>/<subject>/{1.MRI,0.DaT}`)
    Augment {
        root: PathBuf,
        #[arg(long, default_value = "NPD")]
        negative: String,
        #[arg(long, default_value = "PD")]
        positive: String,
        #[arg(short, long, default_value_t = 3)]
        window: usize,
        #[arg(long, default_value_t = 0.75)]
        ratio: f64,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Only sequence images whose name contains this
        #[arg(long)]
        marker: Option<String>,
        /// Where train.txt, test.txt and summary.json go (defaults to ROOT)
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        layout: LayoutArgs,
    },
}

pub fn run(cli: Cli) -> anyhow::Result<()> {
    let decompressor = if cli.native {
        Decompressor::native()
    } else {
        Decompressor::new(cli.tool.as_str())
    };
    let store_path = cli
        .aliases
        .clone()
        .unwrap_or_else(|| cli.log_dir.join(DEFAULT_STORE_FILE));

    match cli.command {
        Commands::Scan { root, kind } => scan_tree(&root, kind),
        Commands::Info { file } => metadata::print_info(&file, cli.verbose)?,
        Commands::Decompress {
            root,
            replace,
            modifier,
        } => {
            let report = decompressor.decompress_tree(&root, replace, &modifier)?;
            println!("{:<40} {}", "DICOM images examined:", report.examined);
            println!("{:<40} {}", "Images decompressed:", report.decompressed);
            println!("{:<40} {}", "Already uncompressed:", report.already_native);
            if report.failed > 0 {
                println!("{:<40} {}", "Failed:", report.failed);
            }
        }
        Commands::Anonymize {
            input,
            output,
            directories,
        } => {
            let mut store = AliasStore::load(&store_path)?;
            if directories {
                for (real, alias) in anonymize::anonymize_directories(&input, &mut store)? {
                    println!("{:<40} {}", real, alias);
                }
            } else {
                let written = anonymize::anonymize_file(&input, output, &mut store)?;
                println!("Anonymized file saved to {:?}", written);
            }
            store.flush()?;
        }
        Commands::Aliases { export } => {
            let store = AliasStore::load(&store_path)?;
            println!("{}", store.render_table());
            if let Some(path) = export {
                store.write_alias_table(&path)?;
            }
        }
        Commands::ToPng {
            root,
            same_name,
            cleanup,
        } => {
            let mut store = AliasStore::load(&store_path)?;
            let converter = Converter::new(
                PngExportOptions {
                    same_name,
                    cleanup,
                    log_dir: Some(cli.log_dir.clone()),
                },
                decompressor,
            );
            let report = converter.convert_tree(&root, &mut store)?;
            store.flush()?;
            convert::print_report(&report, cleanup);
        }
        Commands::Check { root, layout } => {
            let issues = preprocess::check(&root, &layout.into())?;
            preprocess::print_issues(&issues);
        }
        Commands::Fix { root, layout } => {
            let options = PreprocessOptions {
                layout: layout.into(),
                log_dir: cli.log_dir.clone(),
                decompressor,
                ..PreprocessOptions::default()
            };
            let issues = preprocess::check(&root, &options.layout)?;
            let remaining = preprocess::fix(&root, issues, &options)?;
            if !remaining.is_empty() {
                println!("Issues left for manual intervention:");
            }
            preprocess::print_issues(&remaining);
        }
        Commands::Preprocess {
            root,
            selection,
            marker,
            layout,
        } => {
            let options = PreprocessOptions {
                layout: layout.into(),
                log_dir: cli.log_dir.clone(),
                selection_dir: selection,
                marker,
                decompressor,
            };
            let mut store = AliasStore::load(&store_path)?;
            let report = preprocess::run(&root, &mut store, &options)?;
            preprocess::print_report(&report);
        }
        Commands::Select {
            root,
            destination,
            marker,
            layout,
        } => {
            let copied = preprocess::select(&root, &marker, &destination, &layout.into())?;
            println!("{:<40} {}", "Images copied:", copied);
        }
        Commands::Augment {
            root,
            negative,
            positive,
            window,
            ratio,
            seed,
            marker,
            output,
            layout,
        } => {
            let config = AugmentConfig {
                window,
                ratio,
                seed,
            };
            config.validate()?;
            let groups = augment::discover(
                &root,
                &negative,
                &positive,
                &layout.into(),
                marker.as_deref(),
            )
            .with_context(|| format!("Failed to read subjects under {:?}", root))?;
            let dataset = augment::augment(&groups, &config)?;
            augment::write_dataset(&dataset, output.as_deref().unwrap_or(&root))?;
            augment::print_summary(&dataset.summary());
        }
    }

    Ok(())
}

fn scan_tree(root: &Path, kind: Option<KindFilter>) {
    let mut counts = [0usize; 3];
    for item in scan::scan(root) {
        match item {
            Ok(entry) => {
                if kind.map_or(true, |k| k.matches(entry.kind)) {
                    println!("{:<12} {}", format!("{:?}", entry.kind), entry.path.display());
                    counts[entry.kind as usize] += 1;
                }
            }
            Err(e) => warn!("{}", e),
        }
    }
    println!(
        "\n{} DICOM images, {} DICOMDIRs, {} PNGs",
        counts[FileKind::DicomImage as usize],
        counts[FileKind::DicomDir as usize],
        counts[FileKind::Png as usize]
    );
}
