//! Command-line entrypoint: resolve a device profile, then mount.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use molasses::{fs, parse_configs, DeviceConfig, Scheduler};

#[derive(Parser)]
#[command(
    name = "molasses",
    about = "Mount a directory through a simulated slow disk"
)]
struct Cli {
    /// Directory to use as storage.
    #[arg(long)]
    backing_dir: PathBuf,

    /// Directory to mount at.
    #[arg(long)]
    mount_dir: PathBuf,

    /// Path to a JSON file listing device profiles.
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Which profile to use (built-ins: hdd7200rpm).
    #[arg(long, default_value = "hdd7200rpm")]
    config_name: String,

    /// Allow other users to access the mount.
    #[arg(long)]
    allow_other: bool,

    // Per-field profile overrides. All strings (even the durations) so an
    // unset flag is distinguishable from one set to the default value.
    /// Override the seek window (e.g. "4KiB").
    #[arg(long)]
    seek_window: Option<String>,

    /// Override the seek time (e.g. "10ms").
    #[arg(long)]
    seek_time: Option<String>,

    /// Override the read throughput (e.g. "100MiB").
    #[arg(long)]
    read_bytes_per_second: Option<String>,

    /// Override the write throughput (e.g. "100MiB").
    #[arg(long)]
    write_bytes_per_second: Option<String>,

    /// Override the allocation throughput (e.g. "400GiB").
    #[arg(long)]
    allocate_bytes_per_second: Option<String>,

    /// Override the reorder window (e.g. "100us").
    #[arg(long)]
    request_reorder_max_delay: Option<String>,

    /// Override the fsync strategy: none/no, dumb, writebackcache/wbc.
    #[arg(long)]
    fsync_strategy: Option<String>,

    /// Override the write strategy: fast, simulate.
    #[arg(long)]
    write_strategy: Option<String>,

    /// Override the metadata op time (e.g. "10ms").
    #[arg(long)]
    metadata_op_time: Option<String>,
}

impl Cli {
    /// Apply the override flags on top of the selected profile. Every bad
    /// flag is reported before giving up.
    fn apply_overrides(&self, config: &mut DeviceConfig) -> Result<(), ()> {
        let mut had_error = false;

        macro_rules! apply {
            ($flag:ident, $field:ident, $parse:expr) => {
                if let Some(value) = &self.$flag {
                    match $parse(value.as_str()) {
                        Ok(parsed) => config.$field = parsed,
                        Err(err) => {
                            error!("flag {}: {}", stringify!($flag).replace('_', "-"), err);
                            had_error = true;
                        }
                    }
                }
            };
        }

        apply!(seek_window, seek_window, molasses::units::parse_bytes);
        apply!(seek_time, seek_time, molasses::units::parse_duration);
        apply!(
            read_bytes_per_second,
            read_bytes_per_second,
            molasses::units::parse_bytes
        );
        apply!(
            write_bytes_per_second,
            write_bytes_per_second,
            molasses::units::parse_bytes
        );
        apply!(
            allocate_bytes_per_second,
            allocate_bytes_per_second,
            molasses::units::parse_bytes
        );
        apply!(
            request_reorder_max_delay,
            request_reorder_max_delay,
            molasses::units::parse_duration
        );
        apply!(fsync_strategy, fsync_strategy, str::parse);
        apply!(write_strategy, write_strategy, str::parse);
        apply!(metadata_op_time, metadata_op_time, molasses::units::parse_duration);

        if had_error {
            Err(())
        } else {
            Ok(())
        }
    }
}

fn resolve_config(cli: &Cli) -> Result<DeviceConfig, ()> {
    let mut profiles: HashMap<String, DeviceConfig> = HashMap::new();
    let builtin = DeviceConfig::hdd7200rpm();
    profiles.insert(builtin.name.clone(), builtin);

    if let Some(config_file) = &cli.config_file {
        let data = std::fs::read_to_string(config_file).map_err(|err| {
            error!("couldn't read config file {}: {}", config_file.display(), err);
        })?;
        let configs = parse_configs(&data).map_err(|err| {
            error!(
                "couldn't parse config file {}: {}",
                config_file.display(),
                err
            );
        })?;
        for config in configs {
            if profiles.contains_key(&config.name) {
                error!("duplicate device config with name '{}'", config.name);
                return Err(());
            }
            profiles.insert(config.name.clone(), config);
        }
    }

    let mut config = profiles.remove(&cli.config_name).ok_or_else(|| {
        error!("unknown config {}", cli.config_name);
    })?;

    cli.apply_overrides(&mut config)?;

    config.validate().map_err(|err| {
        error!("error validating config: {}", err);
    })?;

    Ok(config)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let backing_dir = match cli.backing_dir.canonicalize() {
        Ok(dir) => dir,
        Err(err) => {
            error!("invalid backing-dir {}: {}", cli.backing_dir.display(), err);
            return ExitCode::FAILURE;
        }
    };
    let mount_dir = match cli.mount_dir.canonicalize() {
        Ok(dir) => dir,
        Err(err) => {
            error!("invalid mount-dir {}: {}", cli.mount_dir.display(), err);
            return ExitCode::FAILURE;
        }
    };

    if backing_dir == mount_dir {
        error!("backing directory may not be the same as mount directory");
        return ExitCode::FAILURE;
    }

    let Ok(config) = resolve_config(&cli) else {
        return ExitCode::FAILURE;
    };

    println!("using config: {config}");

    // The scheduler's event loop runs on the runtime; FUSE dispatch happens
    // on this thread and talks to it through blocking channel sends.
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("couldn't start runtime: {}", err);
            return ExitCode::FAILURE;
        }
    };
    let scheduler = {
        let _guard = runtime.enter();
        Scheduler::new(config)
    };

    let options = fs::MountOptions {
        allow_other: cli.allow_other,
        ..Default::default()
    };

    if let Err(err) = fs::mount(backing_dir, &mount_dir, scheduler, &options) {
        error!("mount failed: {}", err);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
