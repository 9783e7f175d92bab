use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::{Map, Value};

use crate::manifest::SignatureSpec;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

pub fn keygen(out_dir: &Path) -> Result<(PathBuf, PathBuf)> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create key directory '{}'", out_dir.display()))?;
    let mut rng = OsRng;
    let mut secret = [0_u8; 32];
    rng.fill_bytes(&mut secret);
    let signing = SigningKey::from_bytes(&secret);
    let verifying = signing.verifying_key();
    let priv_path = out_dir.join("ed25519-private.b64");
    let pub_path = out_dir.join("ed25519-public.b64");
    fs::write(&priv_path, B64.encode(signing.to_bytes()))
        .with_context(|| format!("failed to write '{}'", priv_path.display()))?;
    fs::write(&pub_path, B64.encode(verifying.to_bytes()))
        .with_context(|| format!("failed to write '{}'", pub_path.display()))?;
    Ok((priv_path, pub_path))
}

/// Sign a control manifest in place (or to `out`) with an Ed25519 private key.
///
/// The signed bytes are the manifest JSON with the top-level `signature`
/// field removed and object keys sorted, so re-signing or editing signature
/// metadata never changes what is signed.
pub fn sign_file(
    path: &Path,
    private_key_path: &Path,
    key_id: &str,
    out: Option<&Path>,
) -> Result<PathBuf> {
    let mut doc = load_json(path)?;
    let signing = load_signing_key(private_key_path)?;
    let bytes = canonical_bytes(&doc)?;
    let sig = signing.sign(&bytes);
    let signature = SignatureSpec {
        alg: "ed25519".to_string(),
        key_id: key_id.to_string(),
        public_key_b64: Some(B64.encode(signing.verifying_key().to_bytes())),
        sig_b64: B64.encode(sig.to_bytes()),
    };

    let map = doc
        .as_object_mut()
        .ok_or_else(|| anyhow!("top-level manifest JSON must be an object"))?;
    map.insert(
        "signature".to_string(),
        serde_json::to_value(signature).context("failed to encode signature")?,
    );

    let out_path = out
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| path.to_path_buf());
    let json = serde_json::to_vec_pretty(&doc).context("failed to serialize signed manifest")?;
    fs::write(&out_path, json)
        .with_context(|| format!("failed to write '{}'", out_path.display()))?;
    Ok(out_path)
}

/// Verify a signed manifest file against `public_key_path`, or against the
/// embedded `signature.public_key_b64` when no key is given.
pub fn verify_file(path: &Path, public_key_path: Option<&Path>) -> Result<()> {
    let raw = fs::read(path).with_context(|| format!("failed to read '{}'", path.display()))?;
    let trusted = match public_key_path {
        Some(p) => Some(load_verifying_key(p)?),
        None => None,
    };
    verify_bytes(&raw, trusted.as_ref())
}

/// Verify raw manifest bytes against a trusted base64 public key.
pub fn verify_manifest_bytes(raw: &[u8], public_key_b64: &str) -> Result<()> {
    let key = decode_verifying_key_b64(public_key_b64.trim())?;
    verify_bytes(raw, Some(&key))
}

/// Security model:
/// - only `ed25519` is accepted
/// - with a trusted key the embedded public key is ignored
/// - without one, only integrity is checked, not who signed
fn verify_bytes(raw: &[u8], trusted: Option<&VerifyingKey>) -> Result<()> {
    let doc: Value = serde_json::from_slice(raw).context("manifest is not valid JSON")?;
    let sig_value = doc
        .get("signature")
        .cloned()
        .ok_or_else(|| anyhow!("manifest is unsigned"))?;
    let sig: SignatureSpec =
        serde_json::from_value(sig_value).context("malformed manifest signature")?;
    if !sig.alg.trim().eq_ignore_ascii_case("ed25519") {
        return Err(anyhow!(
            "unsupported signature alg '{}' (expected ed25519)",
            sig.alg
        ));
    }

    let embedded;
    let public: &VerifyingKey = match trusted {
        Some(key) => key,
        None => {
            let b64 = sig
                .public_key_b64
                .as_deref()
                .ok_or_else(|| anyhow!("signature.public_key_b64 missing and no --key provided"))?;
            embedded = decode_verifying_key_b64(b64)?;
            &embedded
        }
    };

    let bytes = canonical_bytes(&doc)?;
    let sig_bytes = B64
        .decode(sig.sig_b64.as_bytes())
        .context("invalid signature.sig_b64 base64")?;
    let signature = Signature::from_slice(&sig_bytes).context("invalid ed25519 signature bytes")?;
    public
        .verify(&bytes, &signature)
        .map_err(|err| anyhow!("signature verification failed: {err}"))?;
    Ok(())
}

/// Deterministic bytes for signing: top-level `signature` stripped, keys
/// sorted recursively, compact encoding.
pub fn canonical_bytes(doc: &Value) -> Result<Vec<u8>> {
    let mut unsigned = doc.clone();
    if let Some(map) = unsigned.as_object_mut() {
        map.remove("signature");
    }
    sort_value(&mut unsigned);
    serde_json::to_vec(&unsigned).context("failed to serialize canonical manifest")
}

fn sort_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let mut sorted = BTreeMap::new();
            for (k, mut v) in std::mem::take(map) {
                sort_value(&mut v);
                sorted.insert(k, v);
            }
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            *map = out;
        }
        Value::Array(items) => {
            for item in items {
                sort_value(item);
            }
        }
        _ => {}
    }
}

fn load_json(path: &Path) -> Result<Value> {
    let raw = fs::read(path).with_context(|| format!("failed to read '{}'", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("failed to parse '{}'", path.display()))
}

fn load_signing_key(path: &Path) -> Result<SigningKey> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read private key '{}'", path.display()))?;
    let bytes = B64
        .decode(raw.trim().as_bytes())
        .with_context(|| format!("invalid base64 private key '{}'", path.display()))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow!("private key must be exactly 32 bytes"))?;
    Ok(SigningKey::from_bytes(&arr))
}

fn load_verifying_key(path: &Path) -> Result<VerifyingKey> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read public key '{}'", path.display()))?;
    decode_verifying_key_b64(raw.trim())
}

fn decode_verifying_key_b64(raw_b64: &str) -> Result<VerifyingKey> {
    let bytes = B64
        .decode(raw_b64.as_bytes())
        .context("invalid base64 public key")?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow!("public key must be exactly 32 bytes"))?;
    VerifyingKey::from_bytes(&arr).context("invalid ed25519 public key")
}
