use crate::cipher::{self, CipherError};
use crate::config::{Config, ConfigError};
use crate::store::{FileNameMapping, FileStore, MasterList, StoreError};
use crate::tpm::hierarchy::{
    create_storage_parent, get_or_create_primary, load, load_external, load_storage_parent,
};
use crate::tpm::key::{KeyDuplicate, KeyWrapper};
use crate::tpm::policy::{PolicySession, PolicyTree};
use crate::tpm::sealed::{self, SealedTemplate};
use crate::tpm::{migration, TpmError, TpmSession};
use crate::wire::{FileEncryptionData, KeyBlob, WireError};
use thiserror::Error;
use tss_esapi::structures::Public;

/// Blob of the storage parent, loadable under the primary key.
pub const STORAGE_PARENT_FILE: &str = "storage_parent";

#[derive(Error, Debug)]
pub enum VaultError {
    #[error(transparent)]
    Tpm(#[from] TpmError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("`{0}` is not in the master list")]
    UnknownFile(String),
}

pub type Result<T, E = VaultError> = core::result::Result<T, E>;

/// Files encrypted under keys sealed by one storage parent.
pub struct Vault<S: FileStore> {
    store: S,
    primary: KeyWrapper,
    storage_parent: KeyWrapper,
    unseal_policy: PolicyTree,
    template: SealedTemplate,
}

impl<S: FileStore> Vault<S> {
    /// Loads the key hierarchy, creating whatever part of it is missing.
    pub fn open(tpm: &mut TpmSession, store: S, config: &Config) -> Result<Self> {
        let primary = get_or_create_primary(tpm, config.primary_handle()?)?;
        let storage_parent = if store.exists(STORAGE_PARENT_FILE)? {
            let blob = KeyBlob::from_json(&store.read_bytes(STORAGE_PARENT_FILE)?)?;
            load_storage_parent(tpm, &primary, &blob.to_wrapper()?)?
        } else {
            let digest = PolicyTree::duplication().digest()?;
            let parent = create_storage_parent(tpm, &primary, &digest)?;
            store.write_bytes(STORAGE_PARENT_FILE, &KeyBlob::from_wrapper(&parent)?.to_json()?)?;
            parent
        };

        Ok(Self {
            store,
            primary,
            storage_parent,
            unseal_policy: PolicyTree::unseal(config.pcr_policy()?),
            template: SealedTemplate::standard()?,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn primary(&self) -> &KeyWrapper {
        &self.primary
    }

    pub fn storage_parent(&self) -> &KeyWrapper {
        &self.storage_parent
    }

    pub fn list(&self) -> Result<Vec<FileNameMapping>> {
        Ok(MasterList::load(&self.store)?.mappings().to_vec())
    }

    /// Encrypts `bytes` under a new sealed key and returns the name it is
    /// stored under. Nothing is written unless every step succeeds.
    pub fn encrypt(&self, tpm: &mut TpmSession, original_name: &str, bytes: &[u8]) -> Result<String> {
        let mut list = MasterList::load(&self.store)?;
        let secure_name = list.random_name(&self.store, |len| {
            Ok::<_, VaultError>(tpm.get_random(len)?.to_vec())
        })?;

        let envelope = tpm.scoped(|tpm| {
            let (sealed, key) = sealed::create(
                tpm,
                &self.storage_parent,
                &self.unseal_policy,
                None,
                &self.template,
            )?;
            let (data, iv) = cipher::encrypt(&key, bytes)?;
            Ok::<_, VaultError>(FileEncryptionData::new(
                data,
                KeyBlob::from_wrapper(&sealed)?,
                iv,
            ))
        })?;

        self.store.write_bytes(&secure_name, &envelope.to_json()?)?;
        list.push(FileNameMapping::new(original_name, secure_name.clone()));
        list.save(&self.store)?;
        log::info!("Stored `{}` as `{}`", original_name, secure_name);
        Ok(secure_name)
    }

    fn open_envelope(&self, tpm: &mut TpmSession, envelope: &FileEncryptionData) -> Result<Vec<u8>> {
        let sealed = envelope.sealed_key()?.to_wrapper()?;
        tpm.scoped(|tpm| {
            let sealed = load(tpm, &self.storage_parent, &sealed)?;
            let session = PolicySession::start(tpm, &self.unseal_policy)?;
            let key = sealed::unseal(session, &sealed)?;
            Ok(cipher::decrypt(&key, &envelope.data, &envelope.iv)?)
        })
    }

    /// Decrypts the file stored as `secure_name`.
    ///
    /// A load failure is retried once after reloading the storage parent.
    pub fn decrypt(
        &mut self,
        tpm: &mut TpmSession,
        secure_name: &str,
    ) -> Result<(FileNameMapping, Vec<u8>)> {
        let mapping = MasterList::load(&self.store)?
            .resolve(secure_name)
            .cloned()
            .ok_or_else(|| VaultError::UnknownFile(secure_name.to_owned()))?;
        let envelope = FileEncryptionData::from_json(&self.store.read_bytes(secure_name)?)?;

        let plaintext = match self.open_envelope(tpm, &envelope) {
            Err(VaultError::Tpm(err)) if err.is_object_load() => {
                log::warn!("{}, reloading storage parent and retrying", err);
                self.reload_storage_parent(tpm)?;
                self.open_envelope(tpm, &envelope)?
            }
            result => result?,
        };
        Ok((mapping, plaintext))
    }

    fn reload_storage_parent(&mut self, tpm: &mut TpmSession) -> Result<()> {
        if let Some(handle) = self.storage_parent.handle() {
            if let Err(err) = tpm.flush(handle) {
                log::debug!("storage parent was already released: {}", err);
            }
        }
        self.storage_parent = load_storage_parent(tpm, &self.primary, &self.storage_parent.unloaded())?;
        Ok(())
    }

    /// Public area of the primary key, for use as a backup target by
    /// another installation.
    pub fn export_parent(&self) -> Result<KeyBlob> {
        Ok(KeyBlob::from_public(self.primary.public())?)
    }

    /// Wraps the storage parent for the storage key whose public area is
    /// `new_parent`.
    pub fn backup(&self, tpm: &mut TpmSession, new_parent: &Public) -> Result<KeyDuplicate> {
        tpm.scoped(|tpm| {
            let target = load_external(tpm, new_parent)?;
            let session = PolicySession::start(tpm, &PolicyTree::duplication())?;
            Ok(migration::duplicate(session, &self.storage_parent, &target, None)?)
        })
    }

    /// Imports a backed up storage parent under this installation's primary
    /// key and makes it the storage parent.
    pub fn restore(&mut self, tpm: &mut TpmSession, duplicate: &KeyDuplicate) -> Result<()> {
        let imported = migration::import(tpm, &self.primary, duplicate, None)?;
        let blob = KeyBlob::from_wrapper(&imported)?;
        if let Err(err) = self.store.write_bytes(STORAGE_PARENT_FILE, &blob.to_json()?) {
            if let Some(handle) = imported.handle() {
                tpm.flush(handle).ok();
            }
            return Err(err.into());
        }
        if let Some(handle) = self.storage_parent.handle() {
            tpm.flush(handle).ok();
        }
        self.storage_parent = imported;
        log::info!("Restored storage parent");
        Ok(())
    }
}
