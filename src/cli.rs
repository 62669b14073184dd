use crate::config::Config;
use crate::store::DirStore;
use crate::tpm::pcr::{composite_digest, parse_pcr_selection, PcrSelection};
use crate::tpm::{self, TpmSession};
use crate::vault::Vault;
use crate::wire::{DuplicateBlob, KeyBlob};
use clap::{Parser, Subcommand};
use eyre::{eyre, Result, WrapErr};
use std::fs;
use std::path::{Path, PathBuf};

const TPM_ENV_VAR: &str = "TCTI";
const CONFIG_ENV_VAR: &str = "TPM_ENVELOPE_CONFIG";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TPM device specified in TCTI format [default: device:/dev/tpmrm0]
    #[arg(short = 'T', long, env = TPM_ENV_VAR)]
    tcti: Option<String>,

    /// YAML config file
    #[arg(short, long, value_name = "FILE", env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// Directory holding encrypted files and the key blobs
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// PCRs new file keys are bound to, e.g. `sha256:0,7`
    #[arg(short, long, value_name = "PCR List", value_parser = parse_pcr_selection)]
    pcrs: Option<PcrSelection>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the primary and storage parent keys if they don't exist yet
    Init,
    /// Encrypt a file into the vault
    Encrypt {
        #[arg(value_name = "path")]
        path: PathBuf,
    },
    /// Decrypt a file from the vault
    Decrypt {
        /// Stored (secure) name, as shown by `list`
        #[arg(value_name = "name")]
        name: String,
        /// Where to write the plaintext, defaults to the original file name
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// List stored files
    List,
    /// Show PCR digest for current running system
    Digest,
    /// Write the public area of this installation's primary key, the
    /// target for a `backup` on another installation
    ExportParent {
        #[arg(value_name = "out")]
        out: PathBuf,
    },
    /// Duplicate the storage parent for another installation's primary key
    Backup {
        /// Output of `export-parent` on the other installation
        #[arg(value_name = "parent-public")]
        parent_public: PathBuf,
        #[arg(value_name = "out")]
        out: PathBuf,
    },
    /// Import a duplicated storage parent and use it from now on
    Restore {
        #[arg(value_name = "duplicate")]
        duplicate: PathBuf,
    },
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .ok_or_else(|| eyre!("`{}` has no file name", path.display()))
}

fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).wrap_err_with(|| format!("failed to read `{}`", path.display()))
}

fn write(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes).wrap_err_with(|| format!("failed to write `{}`", path.display()))
}

impl Cli {
    pub fn new() -> Self {
        Cli::parse()
    }

    pub fn config(&self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;
        if let Some(tcti) = &self.tcti {
            config.tcti = tcti.clone();
        }
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(pcrs) = &self.pcrs {
            config.pcrs = Some(pcrs.to_string());
        }
        Ok(config)
    }

    /// Connects the TPM, runs the command and always disconnects again.
    pub fn run(&self) -> Result<&Self> {
        log::debug!("{:?}", self);
        let config = self.config()?;
        tpm::init(&config.tcti)?;
        let result = tpm::with_device(|tpm| self.dispatch(tpm, &config));
        let shutdown = tpm::shutdown();
        result?;
        shutdown?;
        Ok(self)
    }

    fn dispatch(&self, tpm: &mut TpmSession, config: &Config) -> Result<()> {
        if let Commands::Digest = &self.command {
            return self.show_pcr_digest(tpm, config);
        }

        let store = DirStore::open(&config.data_dir)?;
        let mut vault = Vault::open(tpm, store, config)?;
        match &self.command {
            Commands::Init => {
                println!("Vault ready in {}", config.data_dir.display());
            }
            Commands::Encrypt { path } => {
                let bytes = read(path)?;
                let name = vault.encrypt(tpm, &file_name(path)?, &bytes)?;
                println!("{}", name);
            }
            Commands::Decrypt { name, out } => {
                let (mapping, plaintext) = vault.decrypt(tpm, name)?;
                let out = out
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(&mapping.original_name));
                write(&out, &plaintext)?;
                println!("{}", out.display());
            }
            Commands::List => {
                for mapping in vault.list()? {
                    println!("{}\t{}", mapping.secure_name, mapping.original_name);
                }
            }
            Commands::ExportParent { out } => {
                write(out, &vault.export_parent()?.to_json()?)?;
            }
            Commands::Backup { parent_public, out } => {
                let target = KeyBlob::from_json(&read(parent_public)?)?.to_wrapper()?;
                let duplicate = vault.backup(tpm, target.public())?;
                write(out, &DuplicateBlob::from_duplicate(&duplicate)?.to_json()?)?;
            }
            Commands::Restore { duplicate } => {
                let duplicate = DuplicateBlob::from_json(&read(duplicate)?)?.to_duplicate()?;
                vault.restore(tpm, &duplicate)?;
            }
            Commands::Digest => {}
        }
        Ok(())
    }

    fn show_pcr_digest(&self, tpm: &mut TpmSession, config: &Config) -> Result<()> {
        let selection = config
            .pcr_policy()?
            .unwrap_or_default()
            .selection;
        let digest = composite_digest(tpm, &selection)?;
        println!("Current PCR Digest ({}): {}", selection, hex::encode(digest));
        Ok(())
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_config() -> Result<()> {
        let cli = Cli::try_parse_from([
            "tpm-envelope",
            "--tcti",
            "mssim:host=localhost,port=2321",
            "--data-dir",
            "/tmp/vault",
            "--pcrs",
            "sha256:7,0",
            "list",
        ])?;
        let config = cli.config()?;
        assert_eq!(config.tcti, "mssim:host=localhost,port=2321");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/vault"));
        assert_eq!(config.pcrs.as_deref(), Some("sha256:0,7"));
        Ok(())
    }

    #[test]
    fn decrypt_takes_optional_output() -> Result<()> {
        let cli = Cli::try_parse_from(["tpm-envelope", "decrypt", "abc", "--out", "x.txt"])?;
        match cli.command {
            Commands::Decrypt { name, out } => {
                assert_eq!(name, "abc");
                assert_eq!(out, Some(PathBuf::from("x.txt")));
            }
            other => panic!("unexpected command {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn rejects_bad_pcrs() {
        assert!(Cli::try_parse_from(["tpm-envelope", "--pcrs", "sha256:99", "digest"]).is_err());
    }

    #[test]
    fn file_name_of_path() -> Result<()> {
        assert_eq!(file_name(Path::new("/some/dir/report.pdf"))?, "report.pdf");
        assert!(file_name(Path::new("/")).is_err());
        Ok(())
    }
}
