use self::handles::{HandleError, HandleTable, ObjectRef, Residency};
use self::pcr::PcrError;
use once_cell::sync::Lazy;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tss_esapi::attributes::SessionAttributes;
use tss_esapi::constants::{CapabilityType, PropertyTag, SessionType, StartupType};
use tss_esapi::handles::{ObjectHandle, TpmHandle};
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::interface_types::session_handles::{AuthSession, HmacSession, PolicySession};
use tss_esapi::structures::{CapabilityData, SymmetricDefinition};
use tss_esapi::tcti_ldr::TctiNameConf;
use zeroize::Zeroizing;

pub mod handles;
pub mod hierarchy;
pub mod key;
pub mod migration;
pub mod pcr;
pub mod policy;
pub mod sealed;

const TRANSIENT_FIRST: u32 = 0x8000_0000;
const MAX_HANDLES_PER_QUERY: u32 = 80;
// GetRandom never returns more than the largest digest the TPM supports
const MAX_RANDOM_PASS: usize = 32;

#[derive(Error, Debug)]
pub enum TpmError {
    #[error("failed to connect to TPM at `{endpoint}`")]
    DeviceConnection {
        endpoint: String,
        #[source]
        source: tss_esapi::Error,
    },
    #[error("TPM device is not connected")]
    NotConnected,
    #[error("failed to create auth session")]
    AuthSessionCreate,
    #[error("{operation}: object failed to load")]
    ObjectLoad {
        operation: &'static str,
        #[source]
        source: tss_esapi::Error,
    },
    #[error("{operation}: stale handle")]
    StaleHandle {
        operation: &'static str,
        #[source]
        source: HandleError,
    },
    #[error("{operation}: object has not been loaded under a parent")]
    ObjectNotLoaded { operation: &'static str },
    #[error("{operation}: object has no private area")]
    MissingPrivateArea { operation: &'static str },
    #[error("{operation}: policy not satisfied")]
    PolicyNotSatisfied {
        operation: &'static str,
        #[source]
        source: tss_esapi::Error,
    },
    #[error("policy digest mismatch, expected {expected} but the TPM computed {actual}")]
    PolicyDigestMismatch { expected: String, actual: String },
    #[error("PCR assertion has no digest, resolve the policy against the TPM first")]
    UnresolvedPcrDigest,
    #[error("invalid template: {0}")]
    InvalidTemplate(&'static str),
    #[error("{operation}: TPM is out of object or session slots")]
    ResourceExhausted {
        operation: &'static str,
        #[source]
        source: tss_esapi::Error,
    },
    #[error("TPM returned no random bytes")]
    RandomExhausted,
    #[error(transparent)]
    Pcr(#[from] PcrError),
    #[error("{operation} failed")]
    Command {
        operation: &'static str,
        #[source]
        source: tss_esapi::Error,
    },
}

impl TpmError {
    fn from_tss(operation: &'static str, source: tss_esapi::Error) -> Self {
        match ResponseClass::of(&source) {
            ResponseClass::PolicyFailure => TpmError::PolicyNotSatisfied { operation, source },
            ResponseClass::LoadFailure => TpmError::ObjectLoad { operation, source },
            ResponseClass::Exhausted => TpmError::ResourceExhausted { operation, source },
            ResponseClass::Initialize | ResponseClass::Value | ResponseClass::Other => {
                TpmError::Command { operation, source }
            }
        }
    }

    /// Errors that a reload of the parent key followed by one retry may cure.
    pub fn is_object_load(&self) -> bool {
        matches!(self, TpmError::ObjectLoad { .. } | TpmError::StaleHandle { .. })
    }
}

pub type Result<T, E = TpmError> = core::result::Result<T, E>;

pub(crate) trait TpmResultExt<T> {
    /// Attaches the operation name and classifies the TPM response code.
    fn during(self, operation: &'static str) -> Result<T>;
}

impl<T> TpmResultExt<T> for core::result::Result<T, tss_esapi::Error> {
    fn during(self, operation: &'static str) -> Result<T> {
        self.map_err(|source| TpmError::from_tss(operation, source))
    }
}

/// Coarse grouping of TPM response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseClass {
    PolicyFailure,
    LoadFailure,
    Exhausted,
    Initialize,
    Value,
    Other,
}

impl ResponseClass {
    const LAYER_MASK: u32 = 0x00FF_0000;
    const FMT1: u32 = 0x080;
    const FMT1_ERROR_MASK: u32 = 0x03F;
    const FMT0_MASK: u32 = 0xFFF;

    pub(crate) fn of(err: &tss_esapi::Error) -> Self {
        match err {
            tss_esapi::Error::TssError(rc) => Self::from_code((*rc).into()),
            _ => ResponseClass::Other,
        }
    }

    pub(crate) fn from_code(rc: u32) -> Self {
        // only codes produced by the TPM itself, not by the ESYS/SYS/TCTI layers
        if rc & Self::LAYER_MASK != 0 {
            return ResponseClass::Other;
        }
        if rc & Self::FMT1 != 0 {
            return match rc & Self::FMT1_ERROR_MASK {
                0x04 => ResponseClass::Value,
                // TPM_RC_POLICY_FAIL, TPM_RC_POLICY_CC
                0x19 | 0x24 => ResponseClass::PolicyFailure,
                // TPM_RC_HANDLE, TPM_RC_INTEGRITY, TPM_RC_BINDING
                0x0B | 0x1F | 0x25 => ResponseClass::LoadFailure,
                _ => ResponseClass::Other,
            };
        }
        match rc & Self::FMT0_MASK {
            0x100 => ResponseClass::Initialize,
            // TPM_RC_POLICY, TPM_RC_PCR_CHANGED
            0x126 | 0x128 => ResponseClass::PolicyFailure,
            // TPM_RC_OBJECT_MEMORY ..= TPM_RC_OBJECT_HANDLES
            0x902..=0x906 => ResponseClass::Exhausted,
            // TPM_RC_REFERENCE_H0 ..= TPM_RC_REFERENCE_H6, the object is gone
            0x910..=0x916 => ResponseClass::LoadFailure,
            _ => ResponseClass::Other,
        }
    }
}

/// A live connection to the TPM.
///
/// Every transient object loaded through the session is recorded in a
/// handle table and flushed by [`TpmSession::flush`], by the end of a
/// [`TpmSession::scoped`] block, by [`TpmSession::dispose`], or on drop.
pub struct TpmSession {
    ctx: tss_esapi::Context,
    handles: HandleTable<ObjectHandle>,
    endpoint: String,
}

impl Deref for TpmSession {
    type Target = tss_esapi::Context;
    fn deref(&self) -> &Self::Target {
        &self.ctx
    }
}

impl DerefMut for TpmSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.ctx
    }
}

impl Drop for TpmSession {
    fn drop(&mut self) {
        if let Err(err) = self.flush_tracked() {
            log::warn!("failed to release TPM handles on drop: {}", err);
        }
    }
}

impl TpmSession {
    /// Opens a TCTI connection, e.g. `device:/dev/tpmrm0` or
    /// `mssim:host=localhost,port=2321`, and starts the TPM.
    pub fn connect(endpoint: &str) -> Result<Self> {
        let connection_error = |source: tss_esapi::Error| TpmError::DeviceConnection {
            endpoint: endpoint.to_owned(),
            source,
        };

        let conf = TctiNameConf::from_str(endpoint).map_err(connection_error)?;
        log::debug!("TCTI config {:?}", conf);
        let mut ctx = tss_esapi::Context::new(conf).map_err(connection_error)?;

        match ctx.startup(StartupType::Clear) {
            Ok(()) => {}
            Err(err) if ResponseClass::of(&err) == ResponseClass::Initialize => {
                log::debug!("TPM at `{}` was already started", endpoint);
            }
            Err(err) => return Err(connection_error(err)),
        }

        let mut session = Self {
            ctx,
            handles: HandleTable::new(),
            endpoint: endpoint.to_owned(),
        };
        if let Err(err) = session.sweep() {
            log::debug!("could not sweep transient objects: {}", err);
        }
        log::info!(
            "Connected to TPM at `{}` ({})",
            endpoint,
            session.handles.connection()
        );
        Ok(session)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn revision(&mut self) -> Result<Option<u32>> {
        self.ctx
            .get_tpm_property(PropertyTag::Revision)
            .during("get_tpm_property")
    }

    pub(crate) fn track(&mut self, handle: ObjectHandle, residency: Residency) -> ObjectRef {
        let object = self.handles.insert(handle, residency);
        log::trace!("tracking {:?} as {}", handle, object);
        object
    }

    pub(crate) fn resolve(&self, operation: &'static str, object: ObjectRef) -> Result<ObjectHandle> {
        self.handles
            .get(object)
            .map(|(handle, _)| handle)
            .map_err(|source| TpmError::StaleHandle { operation, source })
    }

    fn release(&mut self, handle: ObjectHandle, residency: Residency) -> Result<()> {
        match residency {
            Residency::Transient => self.ctx.flush_context(handle).during("flush_context"),
            Residency::Persistent => {
                let mut handle = handle;
                self.ctx.tr_close(&mut handle).during("tr_close")
            }
        }
    }

    /// Releases one object loaded through this session.
    pub fn flush(&mut self, object: ObjectRef) -> Result<()> {
        let (handle, residency) = self
            .handles
            .remove(object)
            .map_err(|source| TpmError::StaleHandle {
                operation: "flush",
                source,
            })?;
        self.release(handle, residency)
    }

    fn flush_tracked(&mut self) -> Result<()> {
        let mut first_error = None;
        for (handle, residency) in self.handles.drain() {
            if let Err(err) = self.release(handle, residency) {
                log::warn!("failed to release {:?}: {}", handle, err);
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Flushes everything this session loaded and closes the connection.
    pub fn dispose(mut self) -> Result<()> {
        self.flush_tracked()?;
        log::debug!("Disconnected from TPM at `{}`", self.endpoint);
        Ok(())
    }

    /// Runs `f`, then releases every object it loaded, whether it
    /// succeeded or not.
    pub fn scoped<T, E, F>(&mut self, f: F) -> core::result::Result<T, E>
    where
        F: FnOnce(&mut Self) -> core::result::Result<T, E>,
    {
        let mark = self.handles.mark();
        let result = f(self);
        for (handle, residency) in self.handles.drain_since(mark) {
            if let Err(err) = self.release(handle, residency) {
                log::warn!("failed to release {:?}: {}", handle, err);
            }
        }
        result
    }

    /// Number of objects loaded through this session and not yet released.
    pub fn tracked(&self) -> usize {
        self.handles.live()
    }

    /// Random bytes from the TPM, gathered in as many passes as needed.
    pub fn get_random(&mut self, len: usize) -> Result<Zeroizing<Vec<u8>>> {
        let mut bytes = Zeroizing::new(Vec::with_capacity(len));
        while bytes.len() < len {
            let pass = (len - bytes.len()).min(MAX_RANDOM_PASS);
            let random = self.ctx.get_random(pass).during("get_random")?;
            if random.value().is_empty() {
                return Err(TpmError::RandomExhausted);
            }
            bytes.extend_from_slice(random.value());
        }
        bytes.truncate(len);
        Ok(bytes)
    }

    pub fn available_transient_slots(&mut self) -> Result<Option<u32>> {
        self.ctx
            .get_tpm_property(PropertyTag::HrTransientAvail)
            .during("get_tpm_property")
    }

    fn transient_handles(&mut self) -> Result<Vec<TpmHandle>> {
        let (capabilities, _) = self
            .ctx
            .get_capability(CapabilityType::Handles, TRANSIENT_FIRST, MAX_HANDLES_PER_QUERY)
            .during("get_capability")?;
        Ok(match capabilities {
            CapabilityData::Handles(handles) => handles
                .into_inner()
                .into_iter()
                .filter(|h| matches!(h, TpmHandle::Transient(_)))
                .collect(),
            _ => Vec::new(),
        })
    }

    /// Number of transient objects the TPM reports as loaded.
    pub fn loaded_transients(&mut self) -> Result<usize> {
        Ok(self.transient_handles()?.len())
    }

    /// Flushes every transient object the TPM reports, e.g. left behind by
    /// a crashed process on a shared simulator. Only run before anything is
    /// tracked.
    fn sweep(&mut self) -> Result<usize> {
        let mut swept = 0;
        for handle in self.transient_handles()? {
            let object = self
                .ctx
                .execute_without_session(|ctx| ctx.tr_from_tpm_public(handle));
            if let Ok(object) = object {
                if self.ctx.flush_context(object).is_ok() {
                    swept += 1;
                }
            }
        }
        if swept > 0 {
            log::info!("Flushed {} stray transient objects", swept);
        }
        Ok(swept)
    }

    pub(crate) fn start_session(&mut self, t: SessionType) -> Result<AuthSession> {
        let session = self
            .ctx
            .start_auth_session(
                None,
                None,
                None,
                t,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )
            .during("start_auth_session")?
            .ok_or(TpmError::AuthSessionCreate)?;
        let (session_attributes, session_attributes_mask) = SessionAttributes::builder()
            .with_decrypt(true)
            .with_encrypt(true)
            .build();
        let configured = self
            .ctx
            .tr_sess_set_attributes(session, session_attributes, session_attributes_mask)
            .during("tr_sess_set_attributes");
        if let Err(err) = configured {
            self.flush_session(session).ok();
            return Err(err);
        }
        Ok(session)
    }

    pub(crate) fn flush_session(&mut self, session: AuthSession) -> Result<()> {
        let handle: Option<ObjectHandle> = match session {
            AuthSession::HmacSession(session) => match session {
                HmacSession::HmacSession { session_handle, .. } => Some(session_handle.into()),
            },
            AuthSession::PolicySession(session) => match session {
                PolicySession::PolicySession { session_handle, .. } => Some(session_handle.into()),
            },
            _ => None,
        };
        if let Some(handle) = handle {
            self.ctx.flush_context(handle).during("flush_session")?;
        }
        Ok(())
    }
}

static DEVICE: Lazy<Mutex<Option<TpmSession>>> = Lazy::new(|| Mutex::new(None));

fn device() -> MutexGuard<'static, Option<TpmSession>> {
    DEVICE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connects the process-wide TPM session, replacing any previous one.
pub fn init(endpoint: &str) -> Result<()> {
    let mut device = device();
    if let Some(previous) = device.take() {
        previous.dispose()?;
    }
    *device = Some(TpmSession::connect(endpoint)?);
    Ok(())
}

/// Runs `f` with exclusive use of the process-wide TPM session. No other
/// caller's commands interleave with those issued inside `f`.
pub fn with_device<T, E, F>(f: F) -> core::result::Result<T, E>
where
    F: FnOnce(&mut TpmSession) -> core::result::Result<T, E>,
    E: From<TpmError>,
{
    let mut device = device();
    let session = device.as_mut().ok_or(TpmError::NotConnected)?;
    f(session)
}

/// Flushes everything and disconnects the process-wide TPM session.
pub fn shutdown() -> Result<()> {
    match device().take() {
        Some(session) => session.dispose(),
        None => Ok(()),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn classify_policy_failures() {
        // TPM_RC_POLICY_FAIL reported against session 1
        assert_eq!(ResponseClass::from_code(0x0000_0999), ResponseClass::PolicyFailure);
        assert_eq!(ResponseClass::from_code(0x0000_0099), ResponseClass::PolicyFailure);
        // TPM_RC_POLICY_CC
        assert_eq!(ResponseClass::from_code(0x0000_00A4), ResponseClass::PolicyFailure);
        assert_eq!(ResponseClass::from_code(0x0000_0128), ResponseClass::PolicyFailure);
    }

    #[test]
    fn classify_load_and_resource_failures() {
        // TPM_RC_INTEGRITY against parameter 1
        assert_eq!(ResponseClass::from_code(0x0000_01DF), ResponseClass::LoadFailure);
        assert_eq!(ResponseClass::from_code(0x0000_0902), ResponseClass::Exhausted);
        assert_eq!(ResponseClass::from_code(0x0000_0903), ResponseClass::Exhausted);
        assert_eq!(ResponseClass::from_code(0x0000_0100), ResponseClass::Initialize);
        // TPM_RC_VALUE against parameter 1
        assert_eq!(ResponseClass::from_code(0x0000_01C4), ResponseClass::Value);
    }

    #[test]
    fn classify_missing_objects_as_load_failures() {
        // TPM_RC_REFERENCE_H0 and TPM_RC_REFERENCE_H6
        assert_eq!(ResponseClass::from_code(0x0000_0910), ResponseClass::LoadFailure);
        assert_eq!(ResponseClass::from_code(0x0000_0916), ResponseClass::LoadFailure);
        assert_eq!(ResponseClass::from_code(0x0000_0917), ResponseClass::Other);
        // TPM_RC_HANDLE against handle 1
        assert_eq!(ResponseClass::from_code(0x0000_018B), ResponseClass::LoadFailure);
    }

    #[test]
    fn codes_from_other_layers_are_not_tpm_failures() {
        // ESYS layer code whose low bits look like TPM_RC_POLICY_FAIL
        assert_eq!(ResponseClass::from_code(0x0007_0099), ResponseClass::Other);
        assert_eq!(ResponseClass::from_code(0x000A_0902), ResponseClass::Other);
    }

    #[test]
    fn device_must_be_connected() {
        let result = with_device(|_| Ok::<_, TpmError>(()));
        assert!(matches!(result, Err(TpmError::NotConnected)));
    }

    #[test]
    #[ignore = "requires a TPM, set TCTI"]
    fn get_revision() -> Result<()> {
        let endpoint = std::env::var("TCTI")?;
        let mut session = TpmSession::connect(&endpoint)?;
        assert!(session.revision()?.is_some());
        session.dispose()?;
        Ok(())
    }

    #[test]
    #[ignore = "requires a TPM, set TCTI"]
    fn random_bytes_span_several_passes() -> Result<()> {
        let endpoint = std::env::var("TCTI")?;
        let mut session = TpmSession::connect(&endpoint)?;
        assert_eq!(session.get_random(16)?.len(), 16);
        assert_eq!(session.get_random(MAX_RANDOM_PASS * 3 + 5)?.len(), 101);
        assert!(session.get_random(0)?.is_empty());
        Ok(())
    }
}
