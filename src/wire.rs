//! JSON forms of everything written to disk or handed between machines.
//! Byte fields are base64.

use crate::tpm::key::{KeyDuplicate, KeyWrapper};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tss_esapi::structures::{Data, EncryptedSecret, Private, Public};
use tss_esapi::traits::{Marshall, UnMarshall};

#[derive(Error, Debug)]
pub enum WireError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("invalid {field}")]
    Tpm {
        field: &'static str,
        #[source]
        source: tss_esapi::Error,
    },
    #[error("key has no private area to serialize")]
    MissingPrivateArea,
    #[error("envelope carries an RSA-wrapped key, not a sealed one")]
    LegacyEnvelope,
}

pub type Result<T, E = WireError> = core::result::Result<T, E>;

trait FieldResultExt<T> {
    fn field(self, field: &'static str) -> Result<T>;
}

impl<T> FieldResultExt<T> for core::result::Result<T, tss_esapi::Error> {
    fn field(self, field: &'static str) -> Result<T> {
        self.map_err(|source| WireError::Tpm { field, source })
    }
}

mod base64_serde {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(value)?)
}

/// Public and private area of a TPM object. The private area is absent
/// for objects that only travel as public keys.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeyBlob {
    #[serde(with = "base64_serde")]
    pub public_area: Vec<u8>,
    #[serde(with = "base64_serde", default, skip_serializing_if = "Vec::is_empty")]
    pub private_area: Vec<u8>,
}

impl KeyBlob {
    pub fn from_wrapper(key: &KeyWrapper) -> Result<Self> {
        let private = key.private().ok_or(WireError::MissingPrivateArea)?;
        Ok(Self {
            public_area: key.public().marshall().field("publicArea")?,
            private_area: private.value().to_vec(),
        })
    }

    pub fn from_public(public: &Public) -> Result<Self> {
        Ok(Self {
            public_area: public.marshall().field("publicArea")?,
            private_area: Vec::new(),
        })
    }

    /// An unloaded wrapper; load it under its parent before use.
    pub fn to_wrapper(&self) -> Result<KeyWrapper> {
        let public = Public::unmarshall(&self.public_area).field("publicArea")?;
        let private = if self.private_area.is_empty() {
            None
        } else {
            Some(Private::try_from(self.private_area.clone()).field("privateArea")?)
        };
        Ok(KeyWrapper::new(public, private))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        to_json(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// An encrypted file: ciphertext, the sealed key that opens it, and the IV.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(from = "EnvelopeRepr")]
pub struct FileEncryptionData {
    #[serde(with = "base64_serde")]
    pub data: Vec<u8>,
    pub key: KeyBlob,
    #[serde(with = "base64_serde")]
    pub iv: Vec<u8>,
    /// Read from the `keyPrivate`/`keyPublic` layout
    #[serde(skip)]
    pub legacy: bool,
}

// envelopes written before keys were sealed carry the key areas inline
#[derive(Deserialize)]
#[serde(untagged)]
enum EnvelopeRepr {
    Sealed {
        #[serde(with = "base64_serde")]
        data: Vec<u8>,
        key: KeyBlob,
        #[serde(with = "base64_serde")]
        iv: Vec<u8>,
    },
    #[serde(rename_all = "camelCase")]
    Legacy {
        #[serde(with = "base64_serde")]
        data: Vec<u8>,
        #[serde(with = "base64_serde")]
        key_private: Vec<u8>,
        #[serde(with = "base64_serde")]
        key_public: Vec<u8>,
        #[serde(with = "base64_serde")]
        iv: Vec<u8>,
    },
}

impl From<EnvelopeRepr> for FileEncryptionData {
    fn from(repr: EnvelopeRepr) -> Self {
        match repr {
            EnvelopeRepr::Sealed { data, key, iv } => Self::new(data, key, iv),
            EnvelopeRepr::Legacy {
                data,
                key_private,
                key_public,
                iv,
            } => Self {
                data,
                key: KeyBlob {
                    public_area: key_public,
                    private_area: key_private,
                },
                iv,
                legacy: true,
            },
        }
    }
}

impl FileEncryptionData {
    pub fn new(data: Vec<u8>, key: KeyBlob, iv: Vec<u8>) -> Self {
        Self {
            data,
            key,
            iv,
            legacy: false,
        }
    }

    /// The sealed key that opens `data`. Legacy envelopes wrap their key
    /// with RSA instead and cannot be opened through an unseal.
    pub fn sealed_key(&self) -> Result<&KeyBlob> {
        if self.legacy {
            return Err(WireError::LegacyEnvelope);
        }
        Ok(&self.key)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        to_json(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Transport form of a [`KeyDuplicate`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateBlob {
    #[serde(with = "base64_serde")]
    pub encryption_key: Vec<u8>,
    #[serde(with = "base64_serde")]
    pub seed: Vec<u8>,
    #[serde(with = "base64_serde")]
    pub private_area: Vec<u8>,
    #[serde(with = "base64_serde")]
    pub public_area: Vec<u8>,
}

impl DuplicateBlob {
    pub fn from_duplicate(duplicate: &KeyDuplicate) -> Result<Self> {
        Ok(Self {
            encryption_key: duplicate.encryption_key.value().to_vec(),
            seed: duplicate.seed.value().to_vec(),
            private_area: duplicate.private.value().to_vec(),
            public_area: duplicate.public.marshall().field("publicArea")?,
        })
    }

    pub fn to_duplicate(&self) -> Result<KeyDuplicate> {
        Ok(KeyDuplicate {
            encryption_key: Data::try_from(self.encryption_key.clone()).field("encryptionKey")?,
            seed: EncryptedSecret::try_from(self.seed.clone()).field("seed")?,
            private: Private::try_from(self.private_area.clone()).field("privateArea")?,
            public: Public::unmarshall(&self.public_area).field("publicArea")?,
        })
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        to_json(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;
    use serde_json::{json, Value};
    use tss_esapi::attributes::ObjectAttributes;
    use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
    use tss_esapi::structures::{Digest, KeyedHashScheme, PublicKeyedHashParameters};

    fn sealed_public() -> Result<Public> {
        Ok(Public::builder()
            .with_public_algorithm(PublicAlgorithm::KeyedHash)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(
                ObjectAttributes::builder()
                    .with_fixed_parent(true)
                    .with_admin_with_policy(true)
                    .build()?,
            )
            .with_keyed_hash_parameters(PublicKeyedHashParameters::new(KeyedHashScheme::Null))
            .with_keyed_hash_unique_identifier(Digest::default())
            .build()?)
    }

    #[test]
    fn envelope_field_names() -> Result<()> {
        let envelope = FileEncryptionData::new(
            vec![1, 2, 3],
            KeyBlob {
                public_area: vec![4],
                private_area: vec![5, 6],
            },
            vec![0; 16],
        );
        let value: Value = serde_json::from_slice(&envelope.to_json()?)?;
        assert_eq!(
            value,
            json!({
                "data": "AQID",
                "key": {"publicArea": "BA==", "privateArea": "BQY="},
                "iv": "AAAAAAAAAAAAAAAAAAAAAA==",
            })
        );
        let read = FileEncryptionData::from_json(&envelope.to_json()?)?;
        assert_eq!(read, envelope);
        assert_eq!(read.sealed_key()?, &envelope.key);
        Ok(())
    }

    #[test]
    fn legacy_envelope_is_normalized() -> Result<()> {
        let legacy = json!({
            "data": "AQID",
            "keyPrivate": "BQY=",
            "keyPublic": "BA==",
            "iv": "AAAAAAAAAAAAAAAAAAAAAA==",
        });
        let envelope = FileEncryptionData::from_json(&serde_json::to_vec(&legacy)?)?;
        assert_eq!(envelope.data, vec![1, 2, 3]);
        assert_eq!(envelope.key.public_area, vec![4]);
        assert_eq!(envelope.key.private_area, vec![5, 6]);
        assert!(envelope.legacy);
        assert!(matches!(envelope.sealed_key(), Err(WireError::LegacyEnvelope)));

        // written back in the current layout
        let value: Value = serde_json::from_slice(&envelope.to_json()?)?;
        assert!(value.get("keyPrivate").is_none());
        assert_eq!(value["key"]["privateArea"], "BQY=");
        Ok(())
    }

    #[test]
    fn malformed_envelope_is_rejected() {
        assert!(FileEncryptionData::from_json(br#"{"data": "AQID"}"#).is_err());
        assert!(FileEncryptionData::from_json(br#"{"data": "!!", "key": {"publicArea": ""}, "iv": ""}"#).is_err());
    }

    #[test]
    fn public_only_blob() -> Result<()> {
        let public = sealed_public()?;
        let blob = KeyBlob::from_public(&public)?;
        let value: Value = serde_json::from_slice(&blob.to_json()?)?;
        assert!(value.get("privateArea").is_none());

        let wrapper = KeyBlob::from_json(&blob.to_json()?)?.to_wrapper()?;
        assert_eq!(wrapper.public(), &public);
        assert!(wrapper.private().is_none());
        assert!(!wrapper.is_loaded());
        Ok(())
    }

    #[test]
    fn key_blob_restores_both_areas() -> Result<()> {
        let public = sealed_public()?;
        let private = Private::try_from(vec![0xA5; 48])?;
        let blob = KeyBlob::from_wrapper(&KeyWrapper::new(public.clone(), Some(private.clone())))?;
        let wrapper = blob.to_wrapper()?;
        assert_eq!(wrapper.public(), &public);
        assert_eq!(wrapper.private(), Some(&private));

        let missing = KeyBlob::from_wrapper(&KeyWrapper::new(public, None));
        assert!(matches!(missing, Err(WireError::MissingPrivateArea)));
        Ok(())
    }

    #[test]
    fn duplicate_without_inner_wrap() -> Result<()> {
        let blob = DuplicateBlob {
            encryption_key: Vec::new(),
            seed: vec![9; 32],
            private_area: vec![1; 40],
            public_area: KeyBlob::from_public(&sealed_public()?)?.public_area,
        };
        let duplicate = DuplicateBlob::from_json(&blob.to_json()?)?.to_duplicate()?;
        assert!(!duplicate.has_inner_wrap());
        assert_eq!(DuplicateBlob::from_duplicate(&duplicate)?, blob);
        Ok(())
    }
}
