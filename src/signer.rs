// SPDX-FileCopyrightText: © 2024 Matt Williams <matt.williams@bristol.ac.uk>
// SPDX-License-Identifier: MIT

use std::time::{Duration, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use rand_core::{CryptoRngCore, OsRng};
use ssh_key::{
    certificate::{Builder, CertType},
    Certificate, PrivateKey, PublicKey,
};

use crate::{
    auth::Principal,
    clock::{self, Clock},
};

pub const DEFAULT_CERT_VALIDITY: Duration = Duration::from_secs(30 * 60);

/// Issues SSH user certificates.
pub trait CertificateSigner: Send + Sync {
    fn sign_user_key(&self, user_key: &PublicKey, principals: &[Principal])
        -> Result<Certificate>;

    /// The public half of the CA key, if one is loaded.
    fn ca_public_key(&self) -> Option<&PublicKey>;
}

/// Signs user keys with an in-memory CA key.
///
/// The serial number is the signing time in nanoseconds, so the clock is
/// injectable. The randomness source only feeds the certificate nonce and is
/// cloned for every signature.
pub struct SshSigner<R = OsRng> {
    ca_key: Option<PrivateKey>,
    validity: Duration,
    extensions: Vec<String>,
    clock: Clock,
    rng: R,
}

impl SshSigner {
    pub fn new(ca_key: Option<PrivateKey>) -> Self {
        Self {
            ca_key,
            validity: DEFAULT_CERT_VALIDITY,
            extensions: Vec::new(),
            clock: clock::system_clock(),
            rng: OsRng,
        }
    }
}

impl<R> SshSigner<R> {
    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    /// Extensions (e.g. `permit-pty`) granted on every certificate.
    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_rng<T>(self, rng: T) -> SshSigner<T> {
        SshSigner {
            ca_key: self.ca_key,
            validity: self.validity,
            extensions: self.extensions,
            clock: self.clock,
            rng,
        }
    }
}

impl<R> CertificateSigner for SshSigner<R>
where
    R: CryptoRngCore + Clone + Send + Sync,
{
    fn sign_user_key(
        &self,
        user_key: &PublicKey,
        principals: &[Principal],
    ) -> Result<Certificate> {
        let Some(ca_key) = &self.ca_key else {
            bail!("CA signer not configured");
        };
        if principals.is_empty() {
            bail!("No principals to sign the certificate for.");
        }

        let since_epoch = (self.clock)()
            .duration_since(UNIX_EPOCH)
            .context("System clock is set before the UNIX epoch.")?;
        let valid_after = since_epoch.as_secs();
        let valid_before = (since_epoch + self.validity).as_secs();

        let mut rng = self.rng.clone();
        let mut cert_builder =
            Builder::new_with_random_nonce(&mut rng, user_key, valid_after, valid_before)
                .context("Could not create SSH certificate builder.")?;
        cert_builder
            .cert_type(CertType::User)
            .context("Could not set certificate type.")?;
        cert_builder
            .serial(since_epoch.as_nanos() as u64)
            .context("Could not set serial number.")?;
        for principal in principals {
            cert_builder
                .valid_principal(principal.as_str())
                .context("Could not set valid principal.")?;
        }
        for extension in &self.extensions {
            cert_builder
                .extension(extension.as_str(), "")
                .context("Could not set extension.")?;
        }
        Ok(cert_builder.sign(ca_key)?)
    }

    fn ca_public_key(&self) -> Option<&PublicKey> {
        self.ca_key.as_ref().map(PrivateKey::public_key)
    }
}
