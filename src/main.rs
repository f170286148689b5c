use clap::{Parser, Subcommand};
use image_mill::config;
use image_mill::imaging::Engine;
use image_mill::paths::PathMapper;
use image_mill::rewrite::Rewriter;
use image_mill::rules::RuleSet;
use image_mill::summary::BuildSummary;
use image_mill::tags::{ExifToolCopier, TagCopier};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

fn version_string() -> &'static str {
    let on_tag = env!("ON_RELEASE_TAG");
    if on_tag == "true" {
        env!("CARGO_PKG_VERSION")
    } else {
        let hash = env!("GIT_HASH");
        if hash.is_empty() {
            "dev@unknown"
        } else {
            // Leaked once at startup — trivial, called exactly once
            Box::leak(format!("dev@{hash}").into_boxed_str())
        }
    }
}

#[derive(Parser)]
#[command(name = "image-mill")]
#[command(about = "Build-time image derivation and HTML rewriting for static sites")]
#[command(long_about = "\
Build-time image derivation and HTML rewriting for static sites

Mark an image in your generated HTML with a class token and image-mill
does the rest: it derives resized, cropped or filtered copies next to
the source image and rewrites the element to use them.

  <img class=\"image-process-thumb\" src=\"photo.jpg\">

With a config.toml rule named \"thumb\", the src is repointed at the
derivative and width/height attributes are set:

  <img src=\"derivatives/thumb/photo.jpg\" width=\"200\" height=\"133\">

Three rule types cover the common cases:

  image             one transformed copy, swapped into src
  responsive-image  a srcset of candidates plus a fallback src
  picture           generated <source> elements inside a <picture>

Derivatives are cached by modification time, so rerunning over a built
site only touches what changed.

Run 'image-mill gen-config' to print a documented config.toml.")]
#[command(version = version_string())]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rewrite a built site's HTML, deriving images as needed
    Process {
        /// Root of the built site (HTML documents and images)
        #[arg(long, default_value = ".")]
        site: PathBuf,
        /// Config file (defaults to config.toml inside the site root)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Re-derive every image even when the destination is fresh
        #[arg(long)]
        force: bool,
    },
    /// Load and validate a config file without touching anything
    Check {
        /// Config file to validate
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Print a stock config.toml with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Process {
            site,
            config,
            force,
        } => {
            let config_path = config.unwrap_or_else(|| site.join("config.toml"));
            let settings = config::load_settings(&config_path)?;
            let rules = RuleSet::from_config(&settings.rules)?;
            if rules.is_empty() {
                warn!("no rules defined in {}", config_path.display());
            }
            if !settings.encoding.eq_ignore_ascii_case("utf-8") {
                warn!(
                    "encoding {:?} requested; documents are read as UTF-8",
                    settings.encoding
                );
            }

            let copier = if settings.copy_metadata {
                ExifToolCopier::detect()
            } else {
                None
            };
            let engine = Engine::new(
                settings.force || force,
                copier.as_ref().map(|c| c as &dyn TagCopier),
            );
            let mapper = PathMapper::new(&site);
            let rewriter = Rewriter::new(&settings, &rules, &engine, &mapper);

            let mut summary = BuildSummary {
                rules_loaded: rules.len(),
                ..Default::default()
            };
            for doc in html_documents(&site) {
                match process_document(&rewriter, &doc) {
                    Ok(report) => {
                        summary.documents += 1;
                        report.merge_into(&mut summary);
                    }
                    Err(err) => {
                        summary.documents += 1;
                        error!("{}: {}", doc.display(), err);
                    }
                }
            }
            println!("{}", summary);
        }
        Command::Check {
            config: config_path,
        } => {
            let settings = config::load_settings(&config_path)?;
            let rules = RuleSet::from_config(&settings.rules)?;
            println!("{}: OK, {} rules", config_path.display(), rules.len());
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

/// All HTML documents under the site root, in a stable order.
fn html_documents(site: &Path) -> Vec<PathBuf> {
    WalkDir::new(site)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            matches!(
                entry
                    .path()
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(str::to_ascii_lowercase)
                    .as_deref(),
                Some("html" | "htm")
            )
        })
        .map(|entry| entry.into_path())
        .collect()
}

/// Rewrite a single document in place, skipping the write when nothing
/// in it changed.
fn process_document(
    rewriter: &Rewriter,
    doc: &Path,
) -> Result<image_mill::rewrite::DocumentReport, Box<dyn std::error::Error>> {
    let html = std::fs::read_to_string(doc)?;
    let (rewritten, report) = rewriter.rewrite_document(&html, doc)?;
    if rewritten != html {
        std::fs::write(doc, &rewritten)?;
        info!("rewrote {}", doc.display());
    }
    Ok(report)
}
