use clap::{Parser, Subcommand};

use kapsule::ColorMode;

#[derive(Parser, Debug)]
#[command(
    name = "kapsule",
    version,
    about = "Create and enter Incus containers that integrate with the host desktop."
)]
pub struct Cli {
    /// Print debug logs and pipeline stages
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Colorize output: auto|always|never
    #[arg(long = "color", value_enum, global = true)]
    pub color: Option<ColorMode>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create a new container
    Create {
        /// Name of the container to create
        name: String,
        /// Base image (e.g. images:ubuntu/24.04); defaults to the configured image
        #[arg(long, short = 'i')]
        image: Option<String>,
        /// Give the container its own user session and D-Bus session bus
        #[arg(long, short = 's')]
        session: bool,
        /// Route D-Bus calls between host and container buses (implies --session)
        #[arg(long = "dbus-mux", short = 'm')]
        dbus_mux: bool,
        /// Set a create option, e.g. -o gpu=false or -o custom_mounts=/srv/data
        #[arg(long = "option", short = 'o', value_name = "KEY=VALUE")]
        options: Vec<String>,
    },

    /// Remove a container
    Rm {
        name: String,
        /// Remove even if the container is running
        #[arg(long, short = 'f')]
        force: bool,
    },

    /// Start a stopped container
    Start { name: String },

    /// Stop a running container
    Stop {
        name: String,
        #[arg(long, short = 'f')]
        force: bool,
    },

    /// Mount your home and create your account in a container
    SetupUser { container: String },

    /// Enter a container (the default one is created on first use)
    Enter {
        /// Print the command instead of running it
        #[arg(long)]
        print: bool,
        /// Container to enter (default: from config)
        name: Option<String>,
        /// Command to run instead of a login shell
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// List containers
    List {
        /// Include stopped containers
        #[arg(long, short = 'a')]
        all: bool,
    },

    /// Show one container
    Info { name: String },

    /// Show configuration (default_container, default_image)
    Config { key: Option<String> },

    /// Print the create-options schema as JSON
    Schema,

    /// Create or update the base Incus profile
    Init,

    /// Run diagnostics to check environment and configuration
    Doctor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_collects_repeated_options() {
        let cli = Cli::parse_from([
            "kapsule", "create", "dev", "-o", "gpu=false", "-o", "custom_mounts=/srv", "--session",
        ]);
        match cli.command {
            Command::Create {
                name,
                options,
                session,
                image,
                ..
            } => {
                assert_eq!(name, "dev");
                assert_eq!(options, vec!["gpu=false", "custom_mounts=/srv"]);
                assert!(session);
                assert!(image.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn enter_splits_name_and_command() {
        let cli = Cli::parse_from(["kapsule", "enter", "dev", "--", "ls", "-la"]);
        match cli.command {
            Command::Enter { name, command, print } => {
                assert!(!print);
                assert_eq!(name.as_deref(), Some("dev"));
                assert_eq!(command, vec!["ls", "-la"]);
            }
            other => panic!("unexpected {other:?}"),
        }

        let cli = Cli::parse_from(["kapsule", "enter", "--", "htop"]);
        match cli.command {
            Command::Enter { name, command, .. } => {
                assert_eq!(name, None);
                assert_eq!(command, vec!["htop"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
