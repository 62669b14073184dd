use crate::tpm::hierarchy::DEFAULT_PRIMARY_SLOT;
use crate::tpm::pcr::{parse_pcr_selection, PcrError, PcrPolicyOptions};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tss_esapi::handles::PersistentTpmHandle;

pub const DEFAULT_TCTI: &str = "device:/dev/tpmrm0";
pub const DEFAULT_DATA_DIR: &str = ".tpm-envelope";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config `{path}`")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid persistent handle {0:#010x}")]
    InvalidSlot(u32),
    #[error(transparent)]
    Pcr(#[from] PcrError),
}

pub type Result<T, E = ConfigError> = core::result::Result<T, E>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// TPM in TCTI format
    pub tcti: String,
    pub data_dir: PathBuf,
    #[serde(with = "slot")]
    pub primary_slot: u32,
    /// PCRs that per-file keys are bound to, e.g. `sha256:0,7`
    pub pcrs: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tcti: DEFAULT_TCTI.to_owned(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            primary_slot: DEFAULT_PRIMARY_SLOT,
            pcrs: None,
        }
    }
}

impl Config {
    /// Reads `path`, or returns the defaults when there is no config file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_owned(),
                    source,
                })?;
                let config = Self::from_yaml(&text)?;
                log::debug!("Loaded config from {}", path.display());
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.primary_handle()?;
        config.pcr_policy()?;
        Ok(config)
    }

    pub fn primary_handle(&self) -> Result<PersistentTpmHandle> {
        PersistentTpmHandle::new(self.primary_slot)
            .map_err(|_| ConfigError::InvalidSlot(self.primary_slot))
    }

    pub fn pcr_policy(&self) -> Result<Option<PcrPolicyOptions>> {
        Ok(match &self.pcrs {
            Some(pcrs) => Some(PcrPolicyOptions::new(parse_pcr_selection(pcrs)?)),
            None => None,
        })
    }
}

/// Persistent handles read better in hex; plain integers are accepted too.
mod slot {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Int(u32),
        Text(String),
    }

    pub fn serialize<S: Serializer>(slot: &u32, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{:#010x}", slot))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        match Repr::deserialize(d)? {
            Repr::Int(slot) => Ok(slot),
            Repr::Text(text) => {
                let digits = text
                    .strip_prefix("0x")
                    .or_else(|| text.strip_prefix("0X"))
                    .unwrap_or(&text);
                u32::from_str_radix(digits, 16).map_err(serde::de::Error::custom)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm::pcr::PcrBank;
    use eyre::Result;
    use std::io::Write;

    #[test]
    fn defaults() -> Result<()> {
        let config = Config::load(None)?;
        assert_eq!(config, Config::default());
        assert_eq!(u32::from(config.primary_handle()?), 0x8100_0001);
        assert!(config.pcr_policy()?.is_none());
        Ok(())
    }

    #[test]
    fn partial_yaml_keeps_defaults() -> Result<()> {
        let config = Config::from_yaml("primary_slot: \"0x81000010\"\npcrs: sha256:0,7\n")?;
        assert_eq!(config.primary_slot, 0x8100_0010);
        assert_eq!(config.tcti, DEFAULT_TCTI);
        let policy = config.pcr_policy()?.ok_or_else(|| eyre::eyre!("no PCR policy"))?;
        assert_eq!(policy.selection.bank(), PcrBank::Sha256);
        assert!(policy.digest.is_none());
        Ok(())
    }

    #[test]
    fn slot_as_integer() -> Result<()> {
        let config = Config::from_yaml("primary_slot: 2164260865\n")?;
        assert_eq!(config.primary_slot, 0x8100_0001);
        Ok(())
    }

    #[test]
    fn rejects_bad_values() {
        // a transient, not a persistent handle
        assert!(matches!(
            Config::from_yaml("primary_slot: \"0x80000001\"\n"),
            Err(ConfigError::InvalidSlot(0x8000_0001))
        ));
        assert!(matches!(
            Config::from_yaml("pcrs: md5:1\n"),
            Err(ConfigError::Pcr(PcrError::InvalidPcrBank(_)))
        ));
        assert!(matches!(
            Config::from_yaml("primary_slot: \"zz\"\n"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn load_from_file() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "tcti: mssim:host=localhost,port=2321")?;
        writeln!(file, "data_dir: /var/lib/vault")?;
        let config = Config::load(Some(file.path()))?;
        assert_eq!(config.tcti, "mssim:host=localhost,port=2321");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/vault"));

        let written = serde_yaml::to_string(&config)?;
        assert!(written.contains("0x81000001"));
        assert_eq!(Config::from_yaml(&written)?, config);
        Ok(())
    }
}
