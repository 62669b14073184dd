//! Envelope encryption of files with keys sealed in a TPM 2.0.
//!
//! Each file is encrypted under its own random key. The key is sealed in
//! the TPM under a duplicatable storage parent, which in turn lives under a
//! persistent primary key, and is only released through a policy session.
//! The storage parent can be duplicated to another TPM for backup.
//!
//! # Get Started
//!
//! Against a TPM simulator:
//! ```bash
//! export TCTI=mssim:host=localhost,port=2321
//! tpm-envelope init
//! tpm-envelope encrypt notes.txt
//! tpm-envelope list
//! ```

pub mod cipher;
pub mod cli;
pub mod config;
pub mod store;
pub mod tpm;
pub mod vault;
pub mod wire;
