use super::handles::Residency;
use super::key::{KeyDuplicate, KeyWrapper};
use super::policy::PolicySession;
use super::{Result, TpmResultExt, TpmSession};
use tss_esapi::interface_types::session_handles::AuthSession;
use tss_esapi::structures::{Public, SymmetricDefinitionObject};

fn inner_wrap_for(public: &Public) -> SymmetricDefinitionObject {
    if public.object_attributes().encrypted_duplication() {
        SymmetricDefinitionObject::AES_128_CFB
    } else {
        SymmetricDefinitionObject::Null
    }
}

/// Wraps `child` for `new_parent`. `session` must satisfy the child's
/// duplication policy and is flushed afterwards.
///
/// Without `sym` an AES-128-CFB inner wrap is applied only when the child
/// requires encrypted duplication.
pub fn duplicate(
    session: PolicySession<'_>,
    child: &KeyWrapper,
    new_parent: &KeyWrapper,
    sym: Option<SymmetricDefinitionObject>,
) -> Result<KeyDuplicate> {
    let child_handle = child.key_handle(&session, "duplicate")?;
    let parent_handle = new_parent.key_handle(&session, "duplicate")?;
    let sym = sym.unwrap_or_else(|| inner_wrap_for(child.public()));

    let (encryption_key, private, seed) = session.authorize("duplicate", |ctx| {
        ctx.duplicate(child_handle.into(), parent_handle.into(), None, sym)
    })?;
    log::debug!(
        "Duplicated object, inner wrap {}",
        if encryption_key.value().is_empty() { "none" } else { "AES-128-CFB" }
    );
    Ok(KeyDuplicate {
        encryption_key,
        seed,
        private,
        public: child.public().clone(),
    })
}

/// Imports `duplicate` under `new_parent` and loads the result.
///
/// Without `sym` the inner wrap is assumed present only when both the seed
/// and the encryption key are non-empty.
pub fn import(
    tpm: &mut TpmSession,
    new_parent: &KeyWrapper,
    duplicate: &KeyDuplicate,
    sym: Option<SymmetricDefinitionObject>,
) -> Result<KeyWrapper> {
    let parent_handle = new_parent.key_handle(tpm, "import")?;
    let inner_wrapped = duplicate.has_inner_wrap();
    let sym = sym.unwrap_or(if inner_wrapped {
        SymmetricDefinitionObject::AES_128_CFB
    } else {
        SymmetricDefinitionObject::Null
    });
    let encryption_key = if duplicate.encryption_key.value().is_empty() {
        None
    } else {
        Some(duplicate.encryption_key.clone())
    };

    let public = duplicate.public.clone();
    let handle = tpm.execute_with_session(Some(AuthSession::Password), |ctx| {
        let private = ctx
            .import(
                parent_handle.into(),
                encryption_key,
                public.clone(),
                duplicate.private.clone(),
                duplicate.seed.clone(),
                sym,
            )
            .during("import")?;
        let handle = ctx
            .load(parent_handle, private.clone(), public.clone())
            .during("load")?;
        Ok::<_, super::TpmError>((handle, private))
    });
    let (handle, private) = handle?;
    let object = tpm.track(handle.into(), Residency::Transient);
    log::info!("Imported object as {}", object);
    Ok(KeyWrapper::loaded(object, public, Some(private)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm::hierarchy::{create_storage_key, load, read_public};
    use crate::tpm::policy::PolicyTree;
    use crate::tpm::sealed::{self, SealedTemplate};
    use crate::tpm::testing;
    use crate::tpm::TpmError;
    use eyre::Result;

    #[test]
    #[ignore = "requires a TPM, set TCTI"]
    fn import_inverts_duplicate() -> Result<()> {
        let mut tpm = testing::connect()?;
        let (primary, parent) = testing::hierarchy(&mut tpm)?;
        let target = create_storage_key(&mut tpm, &primary)?;

        let unseal_policy = PolicyTree::unseal(None);
        let (sealed, raw) = sealed::create(
            &mut tpm,
            &parent,
            &unseal_policy,
            None,
            &SealedTemplate::standard()?,
        )?;

        let session = PolicySession::start(&mut tpm, &PolicyTree::duplication())?;
        let duplicated = duplicate(session, &parent, &target, None)?;
        assert!(duplicated.has_inner_wrap());

        let imported = import(&mut tpm, &target, &duplicated, None)?;
        assert_eq!(imported.public(), parent.public());
        assert_eq!(read_public(&mut tpm, &imported)?, *parent.public());

        // keys sealed under the original parent open under the copy
        let reloaded = load(&mut tpm, &imported, &sealed.unloaded())?;
        let unsealed = sealed::unseal(PolicySession::start(&mut tpm, &unseal_policy)?, &reloaded)?;
        assert_eq!(unsealed, raw);
        tpm.dispose()?;
        Ok(())
    }

    #[test]
    #[ignore = "requires a TPM, set TCTI"]
    fn duplicate_requires_duplication_policy() -> Result<()> {
        let mut tpm = testing::connect()?;
        let (primary, parent) = testing::hierarchy(&mut tpm)?;
        let target = create_storage_key(&mut tpm, &primary)?;

        let session = PolicySession::start(&mut tpm, &PolicyTree::import())?;
        let result = duplicate(session, &parent, &target, None);
        assert!(matches!(result, Err(TpmError::PolicyNotSatisfied { .. })));
        tpm.dispose()?;
        Ok(())
    }
}
