use super::handles::Residency;
use super::key::KeyWrapper;
use super::{Result, TpmResultExt, TpmSession};
use tss_esapi::attributes::ObjectAttributes;
use tss_esapi::handles::{KeyHandle, PersistentTpmHandle, TpmHandle};
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
use tss_esapi::interface_types::dynamic_handles::Persistent;
use tss_esapi::interface_types::key_bits::RsaKeyBits;
use tss_esapi::interface_types::resource_handles::{Hierarchy, Provision};
use tss_esapi::interface_types::session_handles::AuthSession;
use tss_esapi::structures::{
    CreateKeyResult, CreatePrimaryKeyResult, Digest, Public, PublicKeyRsa,
    PublicRsaParametersBuilder, RsaExponent, SymmetricCipherParameters,
    SymmetricDefinitionObject,
};

/// Default persistent slot of the primary storage key.
pub const DEFAULT_PRIMARY_SLOT: u32 = 0x8100_0001;

fn rsa_storage_template(object_attributes: ObjectAttributes) -> Result<Public> {
    let parameters = PublicRsaParametersBuilder::new_restricted_decryption_key(
        SymmetricDefinitionObject::AES_128_CFB,
        RsaKeyBits::Rsa2048,
        RsaExponent::default(),
    )
    .build()
    .during("rsa_parameters")?;

    Public::builder()
        .with_public_algorithm(PublicAlgorithm::Rsa)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(object_attributes)
        .with_rsa_parameters(parameters)
        .with_rsa_unique_identifier(PublicKeyRsa::default())
        .build()
        .during("rsa_template")
}

fn primary_template() -> Result<Public> {
    let object_attributes = ObjectAttributes::builder()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_decrypt(true)
        .with_sign_encrypt(false)
        .with_restricted(true)
        .build()
        .during("primary_attributes")?;
    rsa_storage_template(object_attributes)
}

fn storage_parent_template(policy_digest: &Digest) -> Result<Public> {
    let object_attributes = ObjectAttributes::builder()
        .with_fixed_tpm(false)
        .with_fixed_parent(false)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_admin_with_policy(true)
        .with_encrypted_duplication(true)
        .with_decrypt(true)
        .with_restricted(true)
        .build()
        .during("storage_parent_attributes")?;

    Public::builder()
        .with_public_algorithm(PublicAlgorithm::SymCipher)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(object_attributes)
        .with_auth_policy(policy_digest.clone())
        .with_symmetric_cipher_parameters(SymmetricCipherParameters::new(
            SymmetricDefinitionObject::AES_128_CFB,
        ))
        .with_symmetric_cipher_unique_identifier(Digest::default())
        .build()
        .during("storage_parent_template")
}

/// Removes whatever object lives at `slot`. Returns whether one was evicted.
pub fn evict_persistent(tpm: &mut TpmSession, slot: PersistentTpmHandle) -> bool {
    tpm.execute_without_session(|ctx| ctx.tr_from_tpm_public(TpmHandle::Persistent(slot)))
        .ok()
        .and_then(|retrieved| {
            // eviction needs owner authorization
            tpm.execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.evict_control(Provision::Owner, retrieved, Persistent::Persistent(slot))
            })
            .ok()
        })
        .is_some()
}

/// Reads the primary storage key at `slot`, creating and persisting it
/// first if the slot is empty.
pub fn get_or_create_primary(tpm: &mut TpmSession, slot: PersistentTpmHandle) -> Result<KeyWrapper> {
    let existing = tpm.execute_without_session(|ctx| ctx.tr_from_tpm_public(TpmHandle::Persistent(slot)));
    if let Ok(object) = existing {
        let read = tpm.read_public(KeyHandle::from(object)).during("read_public");
        let object = tpm.track(object, Residency::Persistent);
        let (public, _, _) = read?;
        log::debug!("Found primary key at {:#010x}", u32::from(slot));
        return Ok(KeyWrapper::loaded(object, public, None));
    }

    let template = primary_template()?;
    let CreatePrimaryKeyResult { key_handle, .. } = tpm
        .execute_with_nullauth_session(|ctx| {
            ctx.create_primary(Hierarchy::Owner, template, None, None, None, None)
        })
        .during("create_primary")?;

    if evict_persistent(tpm, slot) {
        log::warn!("Evicted unreadable object at {:#010x}", u32::from(slot));
    }
    let persisted = tpm
        .execute_with_session(Some(AuthSession::Password), |ctx| {
            ctx.evict_control(Provision::Owner, key_handle.into(), Persistent::Persistent(slot))
        })
        .during("evict_control");
    // the persistent copy is all that is needed from here on
    if let Err(err) = tpm.flush_context(key_handle.into()) {
        log::warn!("failed to flush transient primary key: {}", err);
    }
    let persisted = persisted?;

    let object = tpm.track(persisted, Residency::Persistent);
    let (public, _, _) = tpm
        .read_public(KeyHandle::from(persisted))
        .during("read_public")?;
    log::info!("Created primary key at {:#010x}", u32::from(slot));
    Ok(KeyWrapper::loaded(object, public, None))
}

fn create_under(
    tpm: &mut TpmSession,
    parent: &KeyWrapper,
    template: Public,
    operation: &'static str,
) -> Result<KeyWrapper> {
    let parent_handle = parent.key_handle(tpm, operation)?;
    let (handle, public, private) = tpm.execute_with_session(Some(AuthSession::Password), |ctx| {
        let CreateKeyResult {
            out_private,
            out_public,
            ..
        } = ctx
            .create(parent_handle, template, None, None, None, None)
            .during(operation)?;
        let handle = ctx
            .load(parent_handle, out_private.clone(), out_public.clone())
            .during("load")?;
        Ok::<_, super::TpmError>((handle, out_public, out_private))
    })?;
    let object = tpm.track(handle.into(), Residency::Transient);
    Ok(KeyWrapper::loaded(object, public, Some(private)))
}

/// Creates the duplicatable storage parent under `primary`; duplicating
/// and administering it requires satisfying `policy_digest`.
pub fn create_storage_parent(
    tpm: &mut TpmSession,
    primary: &KeyWrapper,
    policy_digest: &Digest,
) -> Result<KeyWrapper> {
    let template = storage_parent_template(policy_digest)?;
    let parent = create_under(tpm, primary, template, "create_storage_parent")?;
    log::info!("Created storage parent key");
    Ok(parent)
}

/// Loads a previously created object under `parent`.
pub fn load(tpm: &mut TpmSession, parent: &KeyWrapper, object: &KeyWrapper) -> Result<KeyWrapper> {
    load_as(tpm, parent, object, "load")
}

fn load_as(
    tpm: &mut TpmSession,
    parent: &KeyWrapper,
    object: &KeyWrapper,
    operation: &'static str,
) -> Result<KeyWrapper> {
    let parent_handle = parent.key_handle(tpm, operation)?;
    let private = object.private_area(operation)?;
    let public = object.public().clone();
    let handle = tpm
        .execute_with_session(Some(AuthSession::Password), |ctx| {
            ctx.load(parent_handle, private.clone(), public.clone())
        })
        .during(operation)?;
    let handle = tpm.track(handle.into(), Residency::Transient);
    Ok(KeyWrapper::loaded(handle, public, Some(private)))
}

pub fn load_storage_parent(
    tpm: &mut TpmSession,
    primary: &KeyWrapper,
    storage_parent: &KeyWrapper,
) -> Result<KeyWrapper> {
    load_as(tpm, primary, storage_parent, "load_storage_parent")
}

/// Loads only the public area of a key, e.g. a duplication target
/// belonging to another TPM.
pub fn load_external(tpm: &mut TpmSession, public: &Public) -> Result<KeyWrapper> {
    let handle = tpm
        .execute_without_session(|ctx| ctx.load_external_public(public.clone(), Hierarchy::Null))
        .during("load_external_public")?;
    let handle = tpm.track(handle.into(), Residency::Transient);
    Ok(KeyWrapper::loaded(handle, public.clone(), None))
}

/// Creates an RSA storage key under `parent`, usable as the new parent of
/// a duplicated object.
pub fn create_storage_key(tpm: &mut TpmSession, parent: &KeyWrapper) -> Result<KeyWrapper> {
    let inherited = parent.public().object_attributes();
    let object_attributes = ObjectAttributes::builder()
        .with_fixed_tpm(inherited.fixed_tpm())
        .with_fixed_parent(true)
        .with_encrypted_duplication(inherited.encrypted_duplication())
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_decrypt(true)
        .with_restricted(true)
        .build()
        .during("storage_key_attributes")?;
    create_under(tpm, parent, rsa_storage_template(object_attributes)?, "create_storage_key")
}

pub fn read_public(tpm: &mut TpmSession, object: &KeyWrapper) -> Result<Public> {
    let handle = object.key_handle(tpm, "read_public")?;
    let (public, _, _) = tpm.read_public(handle).during("read_public")?;
    Ok(public)
}
