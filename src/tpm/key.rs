use super::handles::ObjectRef;
use super::{Result, TpmError, TpmSession};
use tss_esapi::handles::KeyHandle;
use tss_esapi::structures::{Data, EncryptedSecret, Private, Public};

/// A TPM object as seen by this crate: its public area, its private area
/// when it has one, and the handle it is loaded under, if any.
///
/// A load never mutates a wrapper, it produces a new loaded one.
#[derive(Debug, Clone)]
pub struct KeyWrapper {
    handle: Option<ObjectRef>,
    public: Public,
    private: Option<Private>,
}

impl KeyWrapper {
    /// An object that has been read back from storage but not loaded.
    pub fn new(public: Public, private: Option<Private>) -> Self {
        Self {
            handle: None,
            public,
            private,
        }
    }

    pub(crate) fn loaded(handle: ObjectRef, public: Public, private: Option<Private>) -> Self {
        Self {
            handle: Some(handle),
            public,
            private,
        }
    }

    pub fn handle(&self) -> Option<ObjectRef> {
        self.handle
    }

    pub fn public(&self) -> &Public {
        &self.public
    }

    pub fn private(&self) -> Option<&Private> {
        self.private.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.handle.is_some()
    }

    /// Drops the handle, e.g. after the object has been flushed.
    pub fn unloaded(&self) -> Self {
        Self::new(self.public.clone(), self.private.clone())
    }

    pub(crate) fn private_area(&self, operation: &'static str) -> Result<Private> {
        self.private
            .clone()
            .ok_or(TpmError::MissingPrivateArea { operation })
    }

    pub(crate) fn key_handle(&self, tpm: &TpmSession, operation: &'static str) -> Result<KeyHandle> {
        let object = self.handle.ok_or(TpmError::ObjectNotLoaded { operation })?;
        Ok(tpm.resolve(operation, object)?.into())
    }
}

/// Output of `TPM2_Duplicate`: everything a new parent needs to import
/// the object.
#[derive(Debug, Clone)]
pub struct KeyDuplicate {
    /// Inner wrapper key, empty when no inner wrap was applied
    pub encryption_key: Data,
    pub seed: EncryptedSecret,
    pub private: Private,
    pub public: Public,
}

impl KeyDuplicate {
    pub fn has_inner_wrap(&self) -> bool {
        !self.encryption_key.value().is_empty() && !self.seed.value().is_empty()
    }
}
