// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Hook point for partition authentication and decryption.
// Author: Lukas Bower

//! Secure partition hook.
//!
//! Partitions whose header marks them encrypted or authenticated are read
//! whole and handed to a [`PartitionSecurity`] implementation before their
//! plaintext is copied or executed. Cryptography itself lives outside this
//! crate.

use pdi_format::PartitionHeader;
use thiserror::Error;

/// Failure reported by the authentication/decryption hook.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityError {
    /// Signature or tag verification failed.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// Decryption failed.
    #[error("decryption failed: {0}")]
    Decryption(String),
}

/// Authenticate and decrypt one partition payload.
pub trait PartitionSecurity {
    /// Return the plaintext for `header`'s payload `data`.
    fn authenticate_and_decrypt(
        &mut self,
        header: &PartitionHeader,
        data: &[u8],
    ) -> Result<Vec<u8>, SecurityError>;
}
