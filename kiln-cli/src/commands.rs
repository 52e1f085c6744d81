//! Subcommand handlers.

use anyhow::Context;
use kiln_core::KilnConfig;
use kiln_train::checkpoint::CheckpointEntry;
use kiln_train::{
    BackendRegistry, CheckpointManager, DataManager, InMemoryDataset, ReferenceBackend, Trainer,
    TrainingSummary,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Train a linear model on a synthetic regression dataset
    Train(TrainArgs),
    /// List the checkpoints in a save location
    Checkpoints {
        /// Save location (defaults to checkpoint.save_dir)
        dir: Option<PathBuf>,
        /// Backend whose checkpoint format to read
        #[arg(long)]
        backend: Option<String>,
        /// Print the manifest as JSON
        #[arg(long)]
        json: bool,
    },
    /// List available backends
    Backends,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug)]
pub struct TrainArgs {
    /// Number of epochs (overrides training.num_epochs)
    #[arg(short, long)]
    epochs: Option<usize>,

    /// Save location (overrides checkpoint.save_dir)
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Backend id (overrides training.backend)
    #[arg(long)]
    backend: Option<String>,

    /// Accelerator ids, comma separated (overrides training.accelerator_ids)
    #[arg(long, value_delimiter = ',')]
    accelerators: Option<Vec<usize>>,

    /// Expose this many virtual accelerators on the reference backend
    #[arg(long)]
    virtual_accelerators: Option<usize>,

    /// Number of synthetic samples
    #[arg(long, default_value_t = 512)]
    samples: usize,

    /// Input features per sample
    #[arg(long, default_value_t = 4)]
    features: usize,

    /// Label noise amplitude
    #[arg(long, default_value_t = 0.05)]
    noise: f64,

    /// Fraction of samples held out for validation
    #[arg(long, default_value_t = 0.2)]
    val_fraction: f64,
}

#[derive(clap::Subcommand, Debug)]
pub enum ConfigAction {
    /// Create a default configuration file
    Init,
    /// Show current configuration
    Show,
}

pub fn handle_command(
    command: Commands,
    workspace: &Path,
    config: KilnConfig,
) -> anyhow::Result<()> {
    match command {
        Commands::Train(args) => handle_train(args, workspace, config),
        Commands::Checkpoints { dir, backend, json } => {
            let dir = dir.unwrap_or_else(|| resolve(workspace, &config.checkpoint.save_dir));
            let backend = backend.unwrap_or(config.training.backend);
            handle_checkpoints(&dir, &backend, json)
        }
        Commands::Backends => handle_backends(),
        Commands::Config { action } => handle_config(action, workspace, &config),
    }
}

fn resolve(workspace: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

fn handle_train(args: TrainArgs, workspace: &Path, mut config: KilnConfig) -> anyhow::Result<()> {
    if let Some(epochs) = args.epochs {
        config.training.num_epochs = epochs;
    }
    if let Some(backend) = args.backend {
        config.training.backend = backend;
    }
    if let Some(ids) = args.accelerators {
        config.training.accelerator_ids = ids;
    }
    if let Some(dir) = args.save_dir {
        config.checkpoint.save_dir = dir;
    }
    if !(0.0..1.0).contains(&args.val_fraction) {
        anyhow::bail!("--val-fraction must be in [0, 1)");
    }

    let mut registry = BackendRegistry::with_defaults();
    if let Some(count) = args.virtual_accelerators {
        registry.replace(Arc::new(ReferenceBackend::with_virtual_accelerators(count)));
    }
    let backend = registry.get(&config.training.backend)?;

    let seed = config.training.seed;
    let dataset =
        InMemoryDataset::linear_regression(args.samples, args.features, 1, args.noise, seed)?;
    let val_len = (args.samples as f64 * args.val_fraction).round() as usize;
    let (train_set, val_set) = dataset.split_at(args.samples - val_len)?;
    let mut train_data = DataManager::from_config(Arc::new(train_set), &config.data, seed);
    let mut val_data = DataManager::new(Arc::new(val_set), config.data.batch_size);

    let save_dir = resolve(workspace, &config.checkpoint.save_dir);
    let network = ReferenceBackend::linear(args.features, 1, seed);
    let num_epochs = config.training.num_epochs;
    let mut trainer = Trainer::new(network, backend, config.training, &save_dir)
        .context("Failed to set up trainer")?;

    let summary = if val_len == 0 {
        trainer.train(num_epochs, &mut train_data, None)?
    } else {
        trainer.train(num_epochs, &mut train_data, Some(&mut val_data))?
    };
    print_summary(&summary, &save_dir);
    Ok(())
}

fn print_summary(summary: &TrainingSummary, save_dir: &Path) {
    let history = &summary.history;
    match summary.last_epoch {
        Some(last) => println!("Trained epochs {}..={}", summary.first_epoch, last),
        None => println!("No epochs run"),
    }
    if let Some(record) = history.epochs.last() {
        for (key, value) in &record.train {
            println!("  train {key}: {value:.6}");
        }
        if let Some(validation) = &record.validation {
            for (key, value) in validation {
                println!("  val   {key}: {value:.6}");
            }
        }
    }
    if let (Some(epoch), Some(score)) = (history.best_epoch, history.best_score) {
        println!("Best epoch {epoch} (score {score:.6})");
    }
    if history.stopped_early {
        println!("Stopped early");
    }
    println!(
        "Checkpoints in {} ({:.2}s total)",
        save_dir.display(),
        history.total_training_time_secs
    );
}

fn format_entry(entry: &CheckpointEntry) -> String {
    let score = entry
        .score
        .map_or_else(|| "-".to_string(), |s| format!("{s:.6}"));
    format!(
        "{:<9} {:>6} {:>12} {:>10} {} {}",
        format!("{:?}", entry.kind).to_lowercase(),
        entry.epoch,
        score,
        entry.size_bytes,
        entry.created_at.format("%Y-%m-%d %H:%M:%S"),
        entry.file
    )
}

fn handle_checkpoints(dir: &Path, backend: &str, json: bool) -> anyhow::Result<()> {
    let registry = BackendRegistry::with_defaults();
    let backend = registry.get(backend)?;
    let manager = CheckpointManager::for_backend(dir, backend.as_ref())?;

    let entries = manager
        .manifest()
        .with_context(|| format!("Failed to read manifest in {}", dir.display()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        let scanned = manager.scan()?;
        if scanned.is_empty() {
            println!("No checkpoints in {}", dir.display());
            return Ok(());
        }
        println!("No manifest; found by name:");
        for (epoch, path) in scanned {
            println!("  epoch {epoch:>6}  {}", path.display());
        }
        return Ok(());
    }

    println!(
        "{:<9} {:>6} {:>12} {:>10} {:<19} file",
        "kind", "epoch", "score", "bytes", "created"
    );
    for entry in &entries {
        println!("{}", format_entry(entry));
    }
    if let Some((epoch, _)) = manager.latest_resumable()? {
        println!("Resume would start from epoch {epoch}");
    }
    Ok(())
}

fn handle_backends() -> anyhow::Result<()> {
    let registry = BackendRegistry::with_defaults();
    for id in registry.ids() {
        let backend = registry.get(&id)?;
        let accelerators = match backend.probe_accelerators() {
            Ok(n) => format!("{n} accelerator(s)"),
            Err(e) => format!("no accelerators ({e})"),
        };
        println!(
            "{id}: extensions [{}], {accelerators}",
            backend.extensions().join(", ")
        );
    }
    Ok(())
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config: &KilnConfig,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".kiln");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&KilnConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Cli;
    use clap::{CommandFactory, Parser};
    use kiln_train::checkpoint::CheckpointKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_train_args() {
        let cli = Cli::try_parse_from([
            "kiln",
            "-vv",
            "train",
            "--epochs",
            "3",
            "--accelerators",
            "0,1",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Train(args) => {
                assert_eq!(args.epochs, Some(3));
                assert_eq!(args.accelerators, Some(vec![0, 1]));
                assert_eq!(args.samples, 512);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_train_writes_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = KilnConfig::default();
        config.training.num_epochs = 2;
        config.data.batch_size = 16;
        let args = TrainArgs {
            epochs: None,
            save_dir: Some(PathBuf::from("ckpts")),
            backend: None,
            accelerators: None,
            virtual_accelerators: None,
            samples: 64,
            features: 2,
            noise: 0.0,
            val_fraction: 0.25,
        };
        handle_train(args, dir.path(), config).unwrap();
        let ckpts = dir.path().join("ckpts");
        assert!(ckpts.join("checkpoint_epoch_0.ckpt").exists());
        assert!(ckpts.join("checkpoint_epoch_2.ckpt").exists());
        assert!(ckpts.join("checkpoints.json").exists());
    }

    #[test]
    fn test_format_entry() {
        let entry = CheckpointEntry {
            id: "id".into(),
            kind: CheckpointKind::Best,
            epoch: 12,
            file: "checkpoint_best.ckpt".into(),
            score: Some(0.5),
            sha256: String::new(),
            size_bytes: 2048,
            created_at: "2024-01-02T03:04:05Z".parse().unwrap(),
        };
        let line = format_entry(&entry);
        assert!(line.starts_with("best"));
        assert!(line.contains("0.500000"));
        assert!(line.ends_with("2024-01-02 03:04:05 checkpoint_best.ckpt"));
    }
}
