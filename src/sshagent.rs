//! In-process ssh agent for key-file ssh sources.
//!
//! Speaks the subset of the ssh-agent protocol a build step needs: listing
//! identities and signing with them. Every other request is answered with
//! `SSH_AGENT_FAILURE`, including attempts to add or remove keys.
//!
//! ```text
//!   uint32  length
//!   byte    message type
//!   byte[]  contents
//! ```

use crate::constants::MAX_AGENT_MESSAGE;
use crate::error::{Error, Result};
use signature::Signer;
use ssh_key::{PrivateKey, Signature};
use std::io::{self, Read, Write};
use std::path::Path;

const AGENT_FAILURE: u8 = 5;
const AGENTC_REQUEST_IDENTITIES: u8 = 11;
const AGENT_IDENTITIES_ANSWER: u8 = 12;
const AGENTC_SIGN_REQUEST: u8 = 13;
const AGENT_SIGN_RESPONSE: u8 = 14;

struct LoadedKey {
    key: PrivateKey,
    blob: Vec<u8>,
}

/// Private keys loaded from an ssh source's key files.
pub struct KeyRing {
    keys: Vec<LoadedKey>,
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRing").field("keys", &self.keys.len()).finish()
    }
}

impl KeyRing {
    /// Loads OpenSSH private keys. Passphrase-protected keys are rejected.
    pub fn load<P: AsRef<Path>>(id: &str, paths: &[P]) -> Result<Self> {
        let mut keys = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let key = PrivateKey::read_openssh_file(path).map_err(|e| {
                Error::Config(format!("ssh source '{id}': cannot load key {}: {e}", path.display()))
            })?;
            if key.is_encrypted() {
                return Err(Error::Config(format!(
                    "ssh source '{id}': key {} is passphrase protected",
                    path.display()
                )));
            }
            let blob = key
                .public_key()
                .to_bytes()
                .map_err(|e| Error::Config(format!("ssh source '{id}': cannot encode key {}: {e}", path.display())))?;
            keys.push(LoadedKey { key, blob });
        }
        Ok(Self { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Answers requests on `conn` until the client hangs up.
    pub fn serve<S: Read + Write>(&self, mut conn: S) -> io::Result<()> {
        loop {
            let mut len = [0u8; 4];
            match conn.read_exact(&mut len) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            }
            let len = u32::from_be_bytes(len) as usize;
            if len == 0 || len > MAX_AGENT_MESSAGE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("ssh agent request of {len} bytes"),
                ));
            }
            let mut request = vec![0u8; len];
            conn.read_exact(&mut request)?;

            let reply = self.answer(&request);
            let mut framed = Vec::with_capacity(reply.len() + 4);
            put_string(&mut framed, &reply);
            conn.write_all(&framed)?;
        }
    }

    fn answer(&self, request: &[u8]) -> Vec<u8> {
        match request.split_first() {
            Some((&AGENTC_REQUEST_IDENTITIES, _)) => self.identities(),
            Some((&AGENTC_SIGN_REQUEST, body)) => self.sign(body).unwrap_or_else(|| vec![AGENT_FAILURE]),
            Some((kind, _)) => {
                tracing::debug!(kind, "unsupported ssh agent request");
                vec![AGENT_FAILURE]
            }
            None => vec![AGENT_FAILURE],
        }
    }

    fn identities(&self) -> Vec<u8> {
        let mut out = vec![AGENT_IDENTITIES_ANSWER];
        out.extend_from_slice(&(self.keys.len() as u32).to_be_bytes());
        for loaded in &self.keys {
            put_string(&mut out, &loaded.blob);
            put_string(&mut out, loaded.key.comment().as_bytes());
        }
        out
    }

    fn sign(&self, mut body: &[u8]) -> Option<Vec<u8>> {
        let blob = take_string(&mut body)?;
        let data = take_string(&mut body)?;
        let loaded = self.keys.iter().find(|k| k.blob == blob)?;
        let signature: Signature = match loaded.key.try_sign(data) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::warn!(error = %e, "ssh agent signing failed");
                return None;
            }
        };

        let mut encoded = Vec::new();
        put_string(&mut encoded, signature.algorithm().as_str().as_bytes());
        put_string(&mut encoded, signature.as_bytes());
        let mut out = vec![AGENT_SIGN_RESPONSE];
        put_string(&mut out, &encoded);
        Some(out)
    }
}

fn put_string(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn take_string<'a>(input: &mut &'a [u8]) -> Option<&'a [u8]> {
    let (len, rest) = input.split_first_chunk::<4>()?;
    let len = u32::from_be_bytes(*len) as usize;
    if rest.len() < len {
        return None;
    }
    let (value, rest) = rest.split_at(len);
    *input = rest;
    Some(value)
}
