use super::{TpmResultExt, TpmSession};
use sha2::{Digest as _, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::structures::{PcrSelectionList, PcrSlot};

/// Highest PCR index addressable with a three octet selection bitmap.
pub const MAX_PCR_INDEX: u8 = 23;
const SIZE_OF_SELECT: u8 = 3;
// TPM2_PCR_Read reports at most eight digests per call
const PCRS_PER_READ: usize = 8;

#[derive(Error, Debug, PartialEq)]
pub enum PcrError {
    #[error("empty PCR selection list, expected at least one selection")]
    EmptyPcrSelectionList,
    #[error("invalid PCR selection list specification `{0}`")]
    InvalidPcrSelectionString(String),
    #[error("invalid PCR bank `{0}`")]
    InvalidPcrBank(String),
    #[error("invalid PCR slot `{0}`")]
    InvalidPcrSlot(String),
    #[error("TPM returned {returned} PCR values for {requested} selected PCRs")]
    IncompleteRead { requested: usize, returned: usize },
    #[error(transparent)]
    TssEsapi(#[from] tss_esapi::Error),
}

pub type Result<T, E = PcrError> = core::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcrBank {
    Sha1,
    Sha256,
    Sha384,
}

impl PcrBank {
    pub fn hashing_algorithm(&self) -> HashingAlgorithm {
        match self {
            PcrBank::Sha1 => HashingAlgorithm::Sha1,
            PcrBank::Sha256 => HashingAlgorithm::Sha256,
            PcrBank::Sha384 => HashingAlgorithm::Sha384,
        }
    }

    /// TPM_ALG_ID of the bank
    fn algorithm_id(&self) -> u16 {
        match self {
            PcrBank::Sha1 => 0x0004,
            PcrBank::Sha256 => 0x000B,
            PcrBank::Sha384 => 0x000C,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            PcrBank::Sha1 => "sha1",
            PcrBank::Sha256 => "sha256",
            PcrBank::Sha384 => "sha384",
        }
    }
}

fn parse_pcr_bank(bank: &str) -> Result<PcrBank> {
    match bank {
        "sha1" => Ok(PcrBank::Sha1),
        "sha256" => Ok(PcrBank::Sha256),
        "sha384" => Ok(PcrBank::Sha384),
        _ => Err(PcrError::InvalidPcrBank(bank.to_string())),
    }
}

fn parse_slot(slot: &str) -> Result<u8> {
    slot.trim()
        .parse::<u8>()
        .ok()
        .filter(|index| *index <= MAX_PCR_INDEX)
        .ok_or_else(|| PcrError::InvalidPcrSlot(slot.to_string()))
}

fn parse_slots(slots: &str) -> Result<BTreeSet<u8>> {
    if slots.trim().is_empty() {
        return Err(PcrError::EmptyPcrSelectionList);
    }
    slots.split(',').map(parse_slot).collect()
}

/// A single-bank PCR selection, written as `bank:slot,slot`, e.g. `sha256:0,7`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrSelection {
    bank: PcrBank,
    slots: BTreeSet<u8>,
}

impl PcrSelection {
    pub fn new(bank: PcrBank, slots: &[u8]) -> Result<Self> {
        if slots.is_empty() {
            return Err(PcrError::EmptyPcrSelectionList);
        }
        if let Some(slot) = slots.iter().find(|slot| **slot > MAX_PCR_INDEX) {
            return Err(PcrError::InvalidPcrSlot(slot.to_string()));
        }
        Ok(Self {
            bank,
            slots: slots.iter().copied().collect(),
        })
    }

    pub fn bank(&self) -> PcrBank {
        self.bank
    }

    pub fn slots(&self) -> impl Iterator<Item = u8> + '_ {
        self.slots.iter().copied()
    }

    fn slot_list(&self, slots: &[u8]) -> Result<PcrSelectionList> {
        let slots = slots
            .iter()
            .map(|index| {
                PcrSlot::try_from(1u32 << index)
                    .map_err(|_| PcrError::InvalidPcrSlot(index.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(PcrSelectionList::builder()
            .with_selection(self.bank.hashing_algorithm(), &slots)
            .build()?)
    }

    pub fn selection_list(&self) -> Result<PcrSelectionList> {
        self.slot_list(&self.slots().collect::<Vec<_>>())
    }

    /// TPML_PCR_SELECTION encoding, as hashed into a PolicyPCR digest.
    pub fn marshall(&self) -> Vec<u8> {
        let mut bitmap = [0u8; SIZE_OF_SELECT as usize];
        for slot in self.slots() {
            bitmap[usize::from(slot / 8)] |= 1 << (slot % 8);
        }

        let mut out = Vec::with_capacity(10);
        out.extend_from_slice(&1u32.to_be_bytes());
        out.extend_from_slice(&self.bank.algorithm_id().to_be_bytes());
        out.push(SIZE_OF_SELECT);
        out.extend_from_slice(&bitmap);
        out
    }
}

impl FromStr for PcrSelection {
    type Err = PcrError;

    fn from_str(expression: &str) -> Result<Self> {
        parse_pcr_selection(expression)
    }
}

impl fmt::Display for PcrSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self
            .slots()
            .map(|slot| slot.to_string())
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "{}:{}", self.bank.name(), slots)
    }
}

pub fn parse_pcr_selection(expression: &str) -> Result<PcrSelection> {
    let (bank, slots) = expression
        .split_once(':')
        .ok_or_else(|| PcrError::InvalidPcrSelectionString(expression.to_owned()))?;
    let bank = parse_pcr_bank(bank)?;
    let slots = parse_slots(slots)?;
    Ok(PcrSelection { bank, slots })
}

/// PCR state a policy is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrPolicyOptions {
    /// Expected composite digest; read from the TPM when absent
    pub digest: Option<Vec<u8>>,
    pub selection: PcrSelection,
}

impl PcrPolicyOptions {
    pub fn new(selection: PcrSelection) -> Self {
        Self {
            digest: None,
            selection,
        }
    }

    pub fn with_digest(mut self, digest: Vec<u8>) -> Self {
        self.digest = Some(digest);
        self
    }
}

impl Default for PcrPolicyOptions {
    fn default() -> Self {
        Self::new(PcrSelection {
            bank: PcrBank::Sha256,
            slots: [0, 7].into_iter().collect(),
        })
    }
}

/// SHA-256 over the concatenated current values of the selected PCRs.
///
/// The hash is always SHA-256, matching the policy session, whichever bank
/// the PCRs are read from.
pub fn composite_digest(tpm: &mut TpmSession, selection: &PcrSelection) -> super::Result<Vec<u8>> {
    let slots = selection.slots().collect::<Vec<_>>();
    let mut hasher = Sha256::new();
    for chunk in slots.chunks(PCRS_PER_READ) {
        let list = selection.slot_list(chunk)?;
        let (_update_counter, _selection_list, digest_list) = tpm
            .execute_without_session(|ctx| ctx.pcr_read(list))
            .during("pcr_read")?;
        if digest_list.value().len() != chunk.len() {
            return Err(PcrError::IncompleteRead {
                requested: chunk.len(),
                returned: digest_list.value().len(),
            }
            .into());
        }
        for digest in digest_list.value() {
            hasher.update(digest.value());
        }
    }
    Ok(hasher.finalize().to_vec())
}
