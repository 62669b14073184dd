use super::pcr::{composite_digest, PcrPolicyOptions};
use super::{Result, ResponseClass, TpmError, TpmResultExt, TpmSession};
use sha2::{Digest as _, Sha256};
use std::ops::{Deref, DerefMut};
use tss_esapi::attributes::LocalityAttributes;
use tss_esapi::constants::{CommandCode, SessionType};
use tss_esapi::interface_types::session_handles::{AuthSession, PolicySession as TpmPolicySession};
use tss_esapi::structures::Digest;

const TPM_CC_POLICY_COMMAND_CODE: u32 = 0x0000_016C;
const TPM_CC_POLICY_LOCALITY: u32 = 0x0000_016F;
const TPM_CC_POLICY_PCR: u32 = 0x0000_017F;
const POLICY_DIGEST_LEN: usize = 32;

/// Commands a policy can be restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatedCommand {
    Duplicate,
    Import,
    Unseal,
    EncryptDecrypt,
    EncryptDecrypt2,
}

impl GatedCommand {
    /// TPM_CC value
    pub fn code(&self) -> u32 {
        match self {
            GatedCommand::Duplicate => 0x0000_014B,
            GatedCommand::Import => 0x0000_0156,
            GatedCommand::Unseal => 0x0000_015E,
            GatedCommand::EncryptDecrypt => 0x0000_0164,
            GatedCommand::EncryptDecrypt2 => 0x0000_0193,
        }
    }

    fn command_code(&self) -> CommandCode {
        match self {
            GatedCommand::Duplicate => CommandCode::Duplicate,
            GatedCommand::Import => CommandCode::Import,
            GatedCommand::Unseal => CommandCode::Unseal,
            GatedCommand::EncryptDecrypt => CommandCode::EncryptDecrypt,
            GatedCommand::EncryptDecrypt2 => CommandCode::EncryptDecrypt2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyAssertion {
    /// TPM2_PolicyCommandCode
    CommandCode(GatedCommand),
    /// TPM2_PolicyPCR
    Pcr(PcrPolicyOptions),
    /// TPM2_PolicyLocality, `mask` is a TPMA_LOCALITY
    Locality(u8),
}

impl PolicyAssertion {
    /// Extends `digest` the way the TPM does when the assertion is applied.
    fn extend(&self, digest: &[u8]) -> Result<Vec<u8>> {
        let mut hasher = Sha256::new();
        hasher.update(digest);
        match self {
            PolicyAssertion::CommandCode(command) => {
                hasher.update(TPM_CC_POLICY_COMMAND_CODE.to_be_bytes());
                hasher.update(command.code().to_be_bytes());
            }
            PolicyAssertion::Pcr(options) => {
                let pcr_digest = options.digest.as_ref().ok_or(TpmError::UnresolvedPcrDigest)?;
                hasher.update(TPM_CC_POLICY_PCR.to_be_bytes());
                hasher.update(options.selection.marshall());
                hasher.update(pcr_digest);
            }
            PolicyAssertion::Locality(mask) => {
                hasher.update(TPM_CC_POLICY_LOCALITY.to_be_bytes());
                hasher.update([*mask]);
            }
        }
        Ok(hasher.finalize().to_vec())
    }

    fn apply(&self, tpm: &mut TpmSession, session: TpmPolicySession) -> Result<()> {
        match self {
            PolicyAssertion::CommandCode(command) => tpm
                .policy_command_code(session, command.command_code())
                .during("policy_command_code"),
            PolicyAssertion::Pcr(options) => {
                let pcr_digest = options.digest.clone().ok_or(TpmError::UnresolvedPcrDigest)?;
                let pcr_digest = Digest::try_from(pcr_digest).during("policy_pcr")?;
                let selection = options.selection.selection_list()?;
                // the TPM answers a stale expected digest with TPM_RC_VALUE
                tpm.policy_pcr(session, pcr_digest, selection)
                    .map_err(|source| match ResponseClass::of(&source) {
                        ResponseClass::Value => TpmError::PolicyNotSatisfied {
                            operation: "policy_pcr",
                            source,
                        },
                        _ => TpmError::from_tss("policy_pcr", source),
                    })
            }
            PolicyAssertion::Locality(mask) => tpm
                .policy_locality(session, LocalityAttributes::from(*mask))
                .during("policy_locality"),
        }
    }
}

/// Ordered list of assertions; its digest is what a gated object carries
/// as its auth policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyTree {
    assertions: Vec<PolicyAssertion>,
}

impl PolicyTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, assertion: PolicyAssertion) -> Self {
        self.assertions.push(assertion);
        self
    }

    pub fn assertions(&self) -> &[PolicyAssertion] {
        &self.assertions
    }

    pub fn duplication() -> Self {
        Self::new().with(PolicyAssertion::CommandCode(GatedCommand::Duplicate))
    }

    pub fn import() -> Self {
        Self::new().with(PolicyAssertion::CommandCode(GatedCommand::Import))
    }

    /// Policy for sealed file keys: optionally bound to PCR state, and
    /// usable only for unsealing.
    pub fn unseal(pcr: Option<PcrPolicyOptions>) -> Self {
        let tree = match pcr {
            Some(options) => Self::new().with(PolicyAssertion::Pcr(options)),
            None => Self::new(),
        };
        tree.with(PolicyAssertion::CommandCode(GatedCommand::Unseal))
    }

    /// Fills in every PCR assertion lacking an expected digest with the
    /// current PCR values.
    pub fn resolve(&self, tpm: &mut TpmSession) -> Result<Self> {
        let mut resolved = self.clone();
        for assertion in resolved.assertions.iter_mut() {
            if let PolicyAssertion::Pcr(options) = assertion {
                if options.digest.is_none() {
                    options.digest = Some(composite_digest(tpm, &options.selection)?);
                }
            }
        }
        Ok(resolved)
    }

    /// Policy digest computed without the TPM. PCR assertions must carry
    /// their expected digest.
    pub fn digest(&self) -> Result<Digest> {
        let digest = self
            .assertions
            .iter()
            .try_fold(vec![0u8; POLICY_DIGEST_LEN], |digest, assertion| {
                assertion.extend(&digest)
            })?;
        Digest::try_from(digest).during("policy_digest")
    }

    /// Policy digest as computed by the TPM in a trial session.
    pub fn trial_digest(&self, tpm: &mut TpmSession) -> Result<Digest> {
        let resolved = self.resolve(tpm)?;
        let session = tpm.start_session(SessionType::Trial)?;
        let digest = apply_all(tpm, session, &resolved)
            .and_then(|policy| tpm.policy_get_digest(policy).during("policy_get_digest"));
        tpm.flush_session(session)?;
        digest
    }
}

fn apply_all(tpm: &mut TpmSession, session: AuthSession, tree: &PolicyTree) -> Result<TpmPolicySession> {
    let policy: TpmPolicySession = session.try_into().during("policy_session")?;
    for assertion in tree.assertions() {
        log::trace!("applying {:?}", assertion);
        assertion.apply(tpm, policy)?;
    }
    Ok(policy)
}

/// A satisfied policy session, good for exactly one gated command.
///
/// The session is flushed when the guard is dropped, whether or not it
/// was used.
pub struct PolicySession<'a> {
    tpm: &'a mut TpmSession,
    session: AuthSession,
    tree: PolicyTree,
    digest: Digest,
}

impl<'a> PolicySession<'a> {
    pub fn start(tpm: &'a mut TpmSession, tree: &PolicyTree) -> Result<Self> {
        let tree = tree.resolve(tpm)?;
        let expected = tree.digest()?;
        let session = tpm.start_session(SessionType::Policy)?;
        // from here on drop flushes the session
        let mut guard = Self {
            tpm,
            session,
            tree,
            digest: expected,
        };

        let policy = apply_all(guard.tpm, guard.session, &guard.tree)?;
        let actual = guard
            .tpm
            .policy_get_digest(policy)
            .during("policy_get_digest")?;
        if actual != guard.digest {
            return Err(TpmError::PolicyDigestMismatch {
                expected: hex::encode(guard.digest.value()),
                actual: hex::encode(actual.value()),
            });
        }
        log::debug!("policy session satisfied, digest {}", hex::encode(actual.value()));
        Ok(guard)
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn tree(&self) -> &PolicyTree {
        &self.tree
    }

    /// Runs the one command this session authorizes, then flushes it.
    pub(crate) fn authorize<T, F>(self, operation: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut tss_esapi::Context) -> tss_esapi::Result<T>,
    {
        let session = self.session;
        let mut guard = self;
        let result = guard
            .tpm
            .execute_with_session(Some(session), f)
            .during(operation);
        drop(guard);
        result
    }
}

impl Deref for PolicySession<'_> {
    type Target = TpmSession;
    fn deref(&self) -> &Self::Target {
        self.tpm
    }
}

impl DerefMut for PolicySession<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.tpm
    }
}

impl Drop for PolicySession<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.tpm.flush_session(self.session) {
            log::debug!("policy session already gone: {}", err);
        }
    }
}
