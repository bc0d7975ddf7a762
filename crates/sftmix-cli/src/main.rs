#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use sftmix_core::profile::Profile;
use sftmix_core::source::SourceLocator;
use sftmix_pipeline::manifest::RunManifest;
use sftmix_pipeline::ops::{
    build_profile, merge_all, rebalance, recategorize, resolve_profile, BuildProfileConfig,
    MergeAllConfig, OpError, RebalanceConfig, RecategorizeConfig,
};
use sftmix_pipeline::provider::{DatasetProvider, NoDatasetProvider};

#[derive(Debug, Parser)]
#[command(
    name = "sftmix",
    version,
    about = "Assemble instruction-tuning corpora: normalize, classify, dedup, mix"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build a weighted, persona-balanced corpus from a profile definition.
    BuildProfile {
        /// Profile name (under --profiles-dir) or a direct path to a profile
        /// JSON document.
        #[arg(long, env = "SFTMIX_PROFILE")]
        profile: String,

        #[arg(long, env = "SFTMIX_OUTPUT")]
        output: PathBuf,

        /// Total record budget for the mix.
        #[arg(long, env = "SFTMIX_MAX_TOTAL")]
        max_total: u64,

        /// Deterministic run seed; defaults to a value derived from the
        /// profile hash.
        #[arg(long, env = "SFTMIX_SEED")]
        seed: Option<u64>,

        /// Persistent dedup store shared across runs and profiles.
        #[arg(long, env = "SFTMIX_GLOBAL_CACHE")]
        global_cache: Option<PathBuf>,

        /// Delete the dedup store before the run.
        #[arg(long, default_value_t = false)]
        reset_global_cache: bool,

        #[arg(long, env = "SFTMIX_PROFILES_DIR", default_value = "profiles")]
        profiles_dir: PathBuf,

        /// Per-bucket in-memory pool cap before spilling to disk.
        #[arg(long, env = "SFTMIX_POOL_MEM_CAP", default_value_t = 1_000_000)]
        pool_mem_cap: usize,

        /// Override the hub rows API base URL.
        #[arg(long, env = "SFTMIX_HUB_BASE_URL")]
        hub_base_url: Option<String>,
    },

    /// Merge every JSONL/JSON file under a directory tree into one
    /// deduplicated corpus.
    MergeAll {
        #[arg(long, env = "SFTMIX_INPUT_DIR")]
        input_dir: PathBuf,

        #[arg(long, env = "SFTMIX_OUTPUT")]
        output: PathBuf,

        #[arg(long, env = "SFTMIX_GLOBAL_CACHE")]
        global_cache: Option<PathBuf>,
    },

    /// Rework an existing consolidated corpus: drop sources, override
    /// personas, mix in injection corpora.
    Rebalance {
        #[arg(long)]
        base: PathBuf,

        #[arg(long)]
        output: PathBuf,

        #[arg(long)]
        manifest: PathBuf,

        /// Source label to drop; repeatable.
        #[arg(long = "exclude-source")]
        exclude_source: Vec<String>,

        /// Injection corpus path; repeatable.
        #[arg(long = "inject")]
        inject: Vec<PathBuf>,

        /// Persona override as `label=persona`; repeatable.
        #[arg(long = "persona-override", value_name = "LABEL=PERSONA")]
        persona_override: Vec<String>,

        #[arg(long, env = "SFTMIX_GLOBAL_CACHE")]
        global_cache: Option<PathBuf>,
    },

    /// Rewrite `_category` in place using the current classifier; never
    /// adds, removes, or reorders records.
    Recategorize {
        #[arg(long)]
        input: PathBuf,

        #[arg(long)]
        output: PathBuf,
    },
}

fn main() {
    sftmix_observe::logging::init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(manifest) => {
            let duplicates = manifest
                .drop_reasons
                .get("duplicate")
                .copied()
                .unwrap_or(0);
            println!(
                "written={} duplicates={} output={}",
                manifest.written, duplicates, manifest.output
            );
        }
        Err(OpError::ZeroOutput) => {
            eprintln!("error: operation would write zero records");
            std::process::exit(2);
        }
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<RunManifest, OpError> {
    match cli.command {
        Command::BuildProfile {
            profile,
            output,
            max_total,
            seed,
            global_cache,
            reset_global_cache,
            profiles_dir,
            pool_mem_cap,
            hub_base_url,
        } => {
            let profile = resolve_profile(&profile, &profiles_dir)?;
            let provider = make_provider(hub_base_url, &profile)?;
            build_profile(
                &BuildProfileConfig {
                    profile,
                    output,
                    max_total,
                    seed,
                    global_cache,
                    reset_global_cache,
                    pool_mem_cap,
                },
                provider.as_ref(),
            )
        }
        Command::MergeAll {
            input_dir,
            output,
            global_cache,
        } => merge_all(&MergeAllConfig {
            input_dir,
            output,
            global_cache,
        }),
        Command::Rebalance {
            base,
            output,
            manifest,
            exclude_source,
            inject,
            persona_override,
            global_cache,
        } => rebalance(&RebalanceConfig {
            base,
            output,
            manifest_path: manifest,
            exclude_sources: exclude_source,
            inject,
            persona_overrides: parse_persona_overrides(&persona_override)?,
            global_cache,
        }),
        Command::Recategorize { input, output } => {
            recategorize(&RecategorizeConfig { input, output })
        }
    }
}

fn parse_persona_overrides(items: &[String]) -> Result<BTreeMap<String, String>, OpError> {
    let mut out = BTreeMap::new();
    for item in items {
        let Some((label, persona)) = item.split_once('=') else {
            return Err(OpError::Config(format!(
                "--persona-override expects label=persona, got {item:?}"
            )));
        };
        out.insert(label.trim().to_string(), persona.trim().to_string());
    }
    Ok(out)
}

/// Only build the HTTP-backed provider when the profile actually references
/// hub datasets.
fn make_provider(
    hub_base_url: Option<String>,
    profile: &Profile,
) -> Result<Box<dyn DatasetProvider>, OpError> {
    let needs_hub = profile
        .sources
        .iter()
        .any(|d| matches!(d.locator, SourceLocator::Dataset { .. }));
    if !needs_hub {
        return Ok(Box::new(NoDatasetProvider));
    }

    #[cfg(feature = "hub")]
    {
        use sftmix_pipeline::provider::HubProvider;
        let provider = match hub_base_url {
            Some(url) => HubProvider::with_base_url(url),
            None => HubProvider::new(),
        }
        .map_err(OpError::Other)?;
        Ok(Box::new(provider))
    }

    #[cfg(not(feature = "hub"))]
    {
        let _ = hub_base_url;
        Err(OpError::Config(
            "built without feature 'hub'; hub dataset sources are unavailable".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persona_override_parsing() {
        let parsed =
            parse_persona_overrides(&["alpha=sage".to_string(), "beta = warden".to_string()])
                .unwrap();
        assert_eq!(parsed.get("alpha").map(String::as_str), Some("sage"));
        assert_eq!(parsed.get("beta").map(String::as_str), Some("warden"));

        assert!(parse_persona_overrides(&["broken".to_string()]).is_err());
    }
}
