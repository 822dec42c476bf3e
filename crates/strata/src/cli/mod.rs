//! CLI command definitions and handlers.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use strata_common::LayerId;

use crate::driver::{Driver, DriverConfig};
use crate::filesystem::IdMap;

/// Strata - aufs layer driver
#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Root directory of the driver
    #[arg(
        long,
        global = true,
        env = "STRATA_ROOT",
        default_value = "/var/lib/strata/aufs"
    )]
    pub root: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// UID mapping for container root (container:host:size)
    #[arg(long = "uid-map", global = true, value_name = "MAP")]
    pub uid_maps: Vec<IdMap>,

    /// GID mapping for container root (container:host:size)
    #[arg(long = "gid-map", global = true, value_name = "MAP")]
    pub gid_maps: Vec<IdMap>,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Driver commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Create a layer
    Create {
        /// Layer ID (random if omitted)
        id: Option<String>,

        /// Parent layer ID
        #[arg(short, long, default_value = "")]
        parent: String,

        /// Storage option (key=value); aufs supports none
        #[arg(long = "storage-opt", value_parser = parse_key_val)]
        storage_opts: Vec<(String, String)>,

        /// Create the writable layer of a container
        #[arg(long)]
        read_write: bool,
    },

    /// Mount a layer and print its content path
    Get {
        /// Layer ID
        id: String,

        /// SELinux mount label
        #[arg(long, default_value = "")]
        mount_label: String,
    },

    /// Unmount a layer
    Put {
        /// Layer ID
        id: String,
    },

    /// Remove a layer and its content
    Remove {
        /// Layer ID
        id: String,
    },

    /// Check whether a layer exists
    Exists {
        /// Layer ID
        id: String,
    },

    /// Print the ancestors of a layer, nearest first
    Parents {
        /// Layer ID
        id: String,
    },

    /// Show driver status
    Status,

    /// Export the content of a layer as a tar archive
    Diff {
        /// Layer ID
        id: String,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Extract a tar archive into a layer
    ApplyDiff {
        /// Layer ID
        id: String,

        /// Input file (stdin if omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// List changes of a layer relative to its ancestors
    Changes {
        /// Layer ID
        id: String,
    },

    /// Print the size of a layer's content in bytes
    DiffSize {
        /// Layer ID
        id: String,
    },

    /// Unmount all layers and release the driver root
    Cleanup,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("invalid storage option {s:?}, expected key=value"))
}

impl Cli {
    /// Execute the CLI command.
    pub fn execute(self) -> Result<()> {
        let config = DriverConfig::default()
            .with_root(&self.root)
            .with_uid_maps(self.uid_maps)
            .with_gid_maps(self.gid_maps);

        let driver = Driver::init(config)
            .wrap_err_with(|| format!("Failed to initialize driver at {}", self.root.display()))?;

        match self.command {
            Commands::Create {
                id,
                parent,
                storage_opts,
                read_write,
            } => {
                let id = id.unwrap_or_else(|| LayerId::generate().to_string());
                let opts: HashMap<String, String> = storage_opts.into_iter().collect();

                if read_write {
                    driver.create_read_write(&id, &parent, &opts)?;
                } else {
                    driver.create(&id, &parent, &opts)?;
                }
                println!("{id}");
                Ok(())
            }

            Commands::Get { id, mount_label } => {
                let path = driver.get(&id, &mount_label)?;
                println!("{}", path.display());
                Ok(())
            }

            Commands::Put { id } => {
                driver.put(&id)?;
                Ok(())
            }

            Commands::Remove { id } => {
                driver.remove(&id)?;
                println!("Layer {id} removed");
                Ok(())
            }

            Commands::Exists { id } => {
                if driver.exists(&id) {
                    println!("true");
                    Ok(())
                } else {
                    Err(eyre!("Layer {id} does not exist"))
                }
            }

            Commands::Parents { id } => {
                for ancestor in driver.parent_chain(&id)?.ids() {
                    println!("{ancestor}");
                }
                Ok(())
            }

            Commands::Status => {
                println!("Storage Driver: {driver}");
                for (key, value) in driver.status() {
                    println!(" {key}: {value}");
                }
                Ok(())
            }

            Commands::Diff { id, output } => {
                let writer: Box<dyn Write> = match output {
                    Some(path) => Box::new(BufWriter::new(File::create(&path)?)),
                    None => Box::new(BufWriter::new(io::stdout().lock())),
                };
                driver.diff(&id, writer)?.flush()?;
                Ok(())
            }

            Commands::ApplyDiff { id, input } => {
                let size = match input {
                    Some(path) => driver.apply_diff(&id, File::open(&path)?)?,
                    None => driver.apply_diff(&id, io::stdin().lock())?,
                };
                println!("{size}");
                Ok(())
            }

            Commands::Changes { id } => {
                let changes = driver.changes(&id)?;
                println!("{}", serde_json::to_string_pretty(&changes)?);
                Ok(())
            }

            Commands::DiffSize { id } => {
                println!("{}", driver.diff_size(&id)?);
                Ok(())
            }

            Commands::Cleanup => {
                driver.cleanup()?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_id_maps_and_storage_opts() {
        let cli = Cli::try_parse_from([
            "strata",
            "--root",
            "/tmp/strata",
            "--uid-map",
            "0:100000:65536",
            "create",
            "layer-1",
            "--parent",
            "base",
            "--storage-opt",
            "size=10G",
        ])
        .unwrap();

        assert_eq!(cli.root, PathBuf::from("/tmp/strata"));
        assert_eq!(cli.uid_maps, vec![IdMap::new(0, 100_000, 65536)]);
        match cli.command {
            Commands::Create {
                id,
                parent,
                storage_opts,
                read_write,
            } => {
                assert_eq!(id.as_deref(), Some("layer-1"));
                assert_eq!(parent, "base");
                assert_eq!(storage_opts, vec![("size".to_string(), "10G".to_string())]);
                assert!(!read_write);
            }
            _ => panic!("expected create"),
        }
    }

    #[test]
    fn rejects_malformed_id_map() {
        assert!(Cli::try_parse_from(["strata", "--uid-map", "0:1", "status"]).is_err());
    }
}
