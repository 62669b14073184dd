use super::handles::Residency;
use super::key::KeyWrapper;
use super::policy::{PolicySession, PolicyTree};
use super::{Result, TpmError, TpmResultExt, TpmSession};
use tss_esapi::attributes::ObjectAttributes;
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
use tss_esapi::interface_types::session_handles::AuthSession;
use tss_esapi::structures::{
    CreateKeyResult, Digest, KeyedHashScheme, Public, PublicKeyedHashParameters, SensitiveData,
};
use zeroize::Zeroizing;

/// Length of the key material sealed for each file.
pub const SEALED_KEY_LEN: usize = 16;

// TPMA_OBJECT bits that must follow the parent when fixedParent is set
const FIXED_TPM: u32 = 1 << 1;
const ENCRYPTED_DUPLICATION: u32 = 1 << 11;

/// Object attributes for a sealed data object.
#[derive(Debug, Clone, Copy)]
pub struct SealedTemplate {
    attributes: ObjectAttributes,
}

impl SealedTemplate {
    /// Rejects attributes that would turn the object into a usable key.
    pub fn new(attributes: ObjectAttributes) -> Result<Self> {
        if attributes.decrypt() {
            return Err(TpmError::InvalidTemplate("sealed objects must not decrypt"));
        }
        if attributes.sign_encrypt() {
            return Err(TpmError::InvalidTemplate("sealed objects must not sign or encrypt"));
        }
        if attributes.restricted() {
            return Err(TpmError::InvalidTemplate("sealed objects must not be restricted"));
        }
        if attributes.sensitive_data_origin() {
            return Err(TpmError::InvalidTemplate(
                "sealed data comes from outside the TPM",
            ));
        }
        Ok(Self { attributes })
    }

    /// Only releasable through a policy session.
    pub fn standard() -> Result<Self> {
        let attributes = ObjectAttributes::builder()
            .with_fixed_parent(true)
            .with_user_with_auth(false)
            .with_admin_with_policy(true)
            .build()
            .during("sealed_attributes")?;
        Self::new(attributes)
    }

    pub fn attributes(&self) -> ObjectAttributes {
        self.attributes
    }

    fn for_parent(&self, parent: &Public) -> ObjectAttributes {
        let mut bits = u32::from(self.attributes);
        if self.attributes.fixed_parent() {
            let inherited = u32::from(parent.object_attributes()) & (FIXED_TPM | ENCRYPTED_DUPLICATION);
            bits = (bits & !(FIXED_TPM | ENCRYPTED_DUPLICATION)) | inherited;
        }
        ObjectAttributes::from(bits)
    }

    fn public(&self, parent: &Public, policy_digest: Digest) -> Result<Public> {
        Public::builder()
            .with_public_algorithm(PublicAlgorithm::KeyedHash)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(self.for_parent(parent))
            .with_auth_policy(policy_digest)
            .with_keyed_hash_parameters(PublicKeyedHashParameters::new(KeyedHashScheme::Null))
            .with_keyed_hash_unique_identifier(Digest::default())
            .build()
            .during("sealed_template")
    }
}

/// Seals `data`, or [`SEALED_KEY_LEN`] fresh TPM random bytes, under
/// `storage_parent`. The object is returned loaded, along with the raw
/// bytes, which the TPM will only hand out again through [`unseal`].
pub fn create(
    tpm: &mut TpmSession,
    storage_parent: &KeyWrapper,
    policy: &PolicyTree,
    data: Option<&[u8]>,
    template: &SealedTemplate,
) -> Result<(KeyWrapper, Zeroizing<Vec<u8>>)> {
    let parent_handle = storage_parent.key_handle(tpm, "create_sealed")?;
    let raw = match data {
        Some(data) => Zeroizing::new(data.to_vec()),
        None => tpm.get_random(SEALED_KEY_LEN)?,
    };
    let policy_digest = policy.resolve(tpm)?.digest()?;
    let public = template.public(storage_parent.public(), policy_digest)?;
    let sensitive = SensitiveData::try_from(raw.to_vec()).during("sensitive_data")?;

    let (handle, public, private) = tpm.execute_with_session(Some(AuthSession::Password), |ctx| {
        let CreateKeyResult {
            out_private,
            out_public,
            ..
        } = ctx
            .create(parent_handle, public, None, Some(sensitive), None, None)
            .during("create_sealed")?;
        let handle = ctx
            .load(parent_handle, out_private.clone(), out_public.clone())
            .during("load")?;
        Ok::<_, TpmError>((handle, out_public, out_private))
    })?;
    let object = tpm.track(handle.into(), Residency::Transient);
    log::debug!("Sealed {} bytes as {}", raw.len(), object);
    Ok((KeyWrapper::loaded(object, public, Some(private)), raw))
}

/// Releases the sealed bytes; `session` is consumed whether or not the
/// unseal succeeds.
pub fn unseal(session: PolicySession<'_>, sealed: &KeyWrapper) -> Result<Zeroizing<Vec<u8>>> {
    let handle = sealed.key_handle(&session, "unseal")?;
    let data = session.authorize("unseal", |ctx| ctx.unseal(handle.into()))?;
    Ok(Zeroizing::new(data.value().to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher;
    use crate::tpm::hierarchy::load;
    use crate::tpm::pcr::PcrPolicyOptions;
    use crate::tpm::policy::{GatedCommand, PolicyAssertion};
    use crate::tpm::testing;
    use crate::wire::{FileEncryptionData, KeyBlob};
    use eyre::Result;

    #[test]
    fn template_rejects_key_attributes() -> Result<()> {
        let base = u32::from(SealedTemplate::standard()?.attributes());
        // restricted, decrypt, sign/encrypt, sensitiveDataOrigin
        for bit in [16, 17, 18, 5] {
            let attributes = ObjectAttributes::from(base | 1 << bit);
            assert!(matches!(
                SealedTemplate::new(attributes),
                Err(TpmError::InvalidTemplate(_))
            ));
        }
        Ok(())
    }

    #[test]
    fn standard_template_is_policy_only() -> Result<()> {
        let attributes = SealedTemplate::standard()?.attributes();
        assert!(!attributes.user_with_auth());
        assert!(attributes.admin_with_policy());
        assert!(attributes.fixed_parent());
        Ok(())
    }

    #[test]
    #[ignore = "requires a TPM, set TCTI"]
    fn sealed_bytes_round_trip() -> Result<()> {
        let mut tpm = testing::connect()?;
        let (_, parent) = testing::hierarchy(&mut tpm)?;
        let policy = PolicyTree::unseal(None);
        let template = SealedTemplate::standard()?;

        let (sealed, raw) = create(&mut tpm, &parent, &policy, None, &template)?;
        assert_eq!(raw.len(), SEALED_KEY_LEN);
        let unsealed = unseal(PolicySession::start(&mut tpm, &policy)?, &sealed)?;
        assert_eq!(unsealed, raw);

        let chosen = b"chosen key bytes";
        let (sealed, _) = create(&mut tpm, &parent, &policy, Some(&chosen[..]), &template)?;
        let unsealed = unseal(PolicySession::start(&mut tpm, &policy)?, &sealed)?;
        assert_eq!(unsealed.as_slice(), chosen);
        tpm.dispose()?;
        Ok(())
    }

    #[test]
    #[ignore = "requires a TPM, set TCTI"]
    fn unseal_needs_the_policy_it_was_sealed_with() -> Result<()> {
        let mut tpm = testing::connect()?;
        let (_, parent) = testing::hierarchy(&mut tpm)?;
        let template = SealedTemplate::standard()?;
        let (sealed, _) = create(&mut tpm, &parent, &PolicyTree::unseal(None), None, &template)?;

        let other = PolicyTree::unseal(Some(PcrPolicyOptions::default()));
        let result = unseal(PolicySession::start(&mut tpm, &other)?, &sealed);
        assert!(matches!(result, Err(TpmError::PolicyNotSatisfied { .. })));

        let other = PolicyTree::new()
            .with(PolicyAssertion::CommandCode(GatedCommand::Unseal))
            .with(PolicyAssertion::Locality(0x01));
        let result = unseal(PolicySession::start(&mut tpm, &other)?, &sealed);
        assert!(matches!(result, Err(TpmError::PolicyNotSatisfied { .. })));
        tpm.dispose()?;
        Ok(())
    }

    #[test]
    #[ignore = "requires a TPM, set TCTI"]
    fn unloaded_object_cannot_be_unsealed() -> Result<()> {
        let mut tpm = testing::connect()?;
        let (_, parent) = testing::hierarchy(&mut tpm)?;
        let policy = PolicyTree::unseal(None);
        let (sealed, _) = create(&mut tpm, &parent, &policy, None, &SealedTemplate::standard()?)?;
        let result = unseal(PolicySession::start(&mut tpm, &policy)?, &sealed.unloaded());
        assert!(matches!(result, Err(TpmError::ObjectNotLoaded { .. })));
        tpm.dispose()?;
        Ok(())
    }

    #[test]
    #[ignore = "requires a TPM, set TCTI"]
    fn scoped_work_releases_its_transients() -> Result<()> {
        let mut tpm = testing::connect()?;
        let (_, parent) = testing::hierarchy(&mut tpm)?;
        let before = tpm.loaded_transients()?;
        let policy = PolicyTree::unseal(None);

        tpm.scoped(|tpm| {
            let (sealed, raw) = create(tpm, &parent, &policy, None, &SealedTemplate::standard()?)?;
            assert_eq!(unseal(PolicySession::start(tpm, &policy)?, &sealed)?, raw);
            Ok::<_, eyre::Report>(())
        })?;
        assert_eq!(tpm.loaded_transients()?, before);

        // failures release as well
        let failed = tpm.scoped(|tpm| {
            let (sealed, _) = create(tpm, &parent, &policy, None, &SealedTemplate::standard()?)?;
            let other = PolicyTree::unseal(Some(PcrPolicyOptions::default()));
            unseal(PolicySession::start(tpm, &other)?, &sealed)
        });
        assert!(failed.is_err());
        assert_eq!(tpm.loaded_transients()?, before);
        tpm.dispose()?;
        Ok(())
    }

    #[test]
    #[ignore = "requires a TPM, set TCTI"]
    fn repeated_cycles_keep_transient_slots_free() -> Result<()> {
        let mut tpm = testing::connect()?;
        let (_, parent) = testing::hierarchy(&mut tpm)?;
        let slots = tpm.available_transient_slots()?;
        let tracked = tpm.tracked();
        let policy = PolicyTree::unseal(None);
        let other = PolicyTree::unseal(Some(PcrPolicyOptions::default()));

        for cycle in 0..8 {
            let result = tpm.scoped(|tpm| {
                let (sealed, raw) =
                    create(tpm, &parent, &policy, None, &SealedTemplate::standard()?)?;
                let reloaded = load(tpm, &parent, &sealed.unloaded())?;
                // every third cycle unseals under the wrong policy
                let tree = if cycle % 3 == 2 { &other } else { &policy };
                let unsealed = unseal(PolicySession::start(tpm, tree)?, &reloaded)?;
                assert_eq!(unsealed, raw);
                Ok::<_, TpmError>(())
            });
            assert_eq!(result.is_err(), cycle % 3 == 2);
            assert_eq!(tpm.tracked(), tracked);
            assert_eq!(tpm.available_transient_slots()?, slots);
        }
        tpm.dispose()?;
        Ok(())
    }

    #[test]
    #[ignore = "requires a TPM, set TCTI"]
    fn encrypt_test_message_and_recover_it_from_the_envelope() -> Result<()> {
        let mut tpm = testing::connect()?;
        let (_, parent) = testing::hierarchy(&mut tpm)?;
        let policy = PolicyTree::unseal(None);
        let (sealed, raw) = create(&mut tpm, &parent, &policy, None, &SealedTemplate::standard()?)?;
        let (data, iv) = cipher::encrypt(&raw, b"test")?;
        assert_eq!(data.len(), 16);

        let envelope = FileEncryptionData::new(data, KeyBlob::from_wrapper(&sealed)?, iv).to_json()?;
        tpm.flush(sealed.handle().ok_or_else(|| eyre::eyre!("not loaded"))?)?;

        let envelope = FileEncryptionData::from_json(&envelope)?;
        let reloaded = load(&mut tpm, &parent, &envelope.sealed_key()?.to_wrapper()?)?;
        let key = unseal(PolicySession::start(&mut tpm, &policy)?, &reloaded)?;
        assert_eq!(cipher::decrypt(&key, &envelope.data, &envelope.iv)?, b"test");
        tpm.dispose()?;
        Ok(())
    }
}
