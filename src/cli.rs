use clap::Parser;
use std::path::PathBuf;

/// Default cgroup parent for containers this daemon supervises.
pub const DEFAULT_CGROUP_PARENT: &str = "session_manager_containers";

#[derive(Parser, Clone, Debug)]
#[command(version, about = "Inspect and drive sessiond-managed jobs", long_about = None)]
pub struct Args {
    /// Set the log level to one of trace, debug, info, warn, or error.
    /// `-v` is shorthand for enabling verbose (trace) logging.
    #[arg(short = 'v',
        long,
        global = true,
        default_missing_value = "trace",
        num_args = 0..=1,
        require_equals = true,
        value_parser = parse_log_level
    )]
    pub log_level: Option<log::LevelFilter>,

    /// Formats action output as a JSON blob.
    #[arg(long, global = true, action = clap::ArgAction::SetTrue)]
    pub json: bool,

    #[command(subcommand)]
    pub action: Action,
}

#[derive(clap::Subcommand, Clone, Debug)]
#[command(subcommand_help_heading = "Actions")]
pub enum Action {
    /// Compile a container's config.json/runtime.json pair against the
    /// live mount table and print the resulting configuration.
    CheckConfig {
        /// Directory holding the container's two config documents
        #[arg(value_name = "CONTAINER_DIR")]
        container_dir: PathBuf,

        /// Container name; defaults to the directory's file name
        #[arg(long)]
        name: Option<String>,

        /// Parent cgroup the container is placed under
        #[arg(long, default_value = DEFAULT_CGROUP_PARENT)]
        cgroup_parent: String,
    },

    /// Start a container image inside the VM via the external launcher.
    VmStart {
        /// Path to the container image
        #[arg(value_name = "CONTAINER_PATH")]
        container_path: PathBuf,

        /// Name to run the container under
        #[arg(value_name = "NAME")]
        name: String,

        /// Mount the container image writable
        #[arg(long, action = clap::ArgAction::SetTrue)]
        writable: bool,
    },

    /// Stop a named VM container via the external launcher.
    VmStop {
        /// Name of the container to stop
        #[arg(value_name = "NAME")]
        name: String,
    },
}

fn parse_log_level(s: &str) -> Result<log::LevelFilter, String> {
    s.parse::<log::LevelFilter>().map_err(|e| e.to_string())
}
