use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signer, SigningKey};
use rust_decimal::Decimal;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::abi::encode_execute_payout;
use super::LedgerClient;
use crate::error::{AppError, AppResult, LedgerError};

/// Compensation transfer for one policy
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementRequest {
    pub holder: String,
    pub policy_ref: i64,
    pub amount: Decimal,
    pub detection_ref: String,
}

/// Envelope accepted by the relayer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedSettlement {
    pub contract: String,
    /// Hex ed25519 public key
    pub signer: String,
    pub nonce: u64,
    pub holder: String,
    pub policy_ref: i64,
    /// 0x-prefixed `executePayout` calldata
    pub calldata: String,
    /// sha256(contract || nonce || calldata)
    pub digest: String,
    /// Base64 ed25519 signature over the digest
    pub signature: String,
}

/// Operator key plus the cached signer nonce.
///
/// SECURITY: nonce lookup, signing and submission happen under one lock, so two
/// settlements for this signer can never be in flight with the same nonce.
pub struct SettlementSigner {
    signing_key: SigningKey,
    public_key: String,
    nonce: Mutex<Option<u64>>,
}

impl SettlementSigner {
    pub fn from_hex_seed(seed: &str) -> AppResult<Self> {
        let bytes = hex::decode(seed.trim().trim_start_matches("0x"))
            .map_err(|_| AppError::Config("SIGNER_KEY is not valid hex".to_string()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AppError::Config("SIGNER_KEY must be 32 bytes".to_string()))?;

        let signing_key = SigningKey::from_bytes(&seed);
        let public_key = hex::encode(signing_key.verifying_key().to_bytes());

        Ok(Self {
            signing_key,
            public_key,
            nonce: Mutex::new(None),
        })
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    fn sign(
        &self,
        contract: &str,
        nonce: u64,
        request: &SettlementRequest,
    ) -> Result<SignedSettlement, LedgerError> {
        let calldata =
            encode_execute_payout(&request.holder, request.policy_ref, &request.detection_ref)
                .map_err(|e| LedgerError::Signing(e.to_string()))?;

        let contract = contract.to_lowercase();
        let mut hasher = Sha256::new();
        hasher.update(contract.as_bytes());
        hasher.update(nonce.to_be_bytes());
        hasher.update(&calldata);
        let digest = hasher.finalize();

        let signature = self.signing_key.sign(&digest);

        Ok(SignedSettlement {
            contract,
            signer: self.public_key.clone(),
            nonce,
            holder: request.holder.to_lowercase(),
            policy_ref: request.policy_ref,
            calldata: format!("0x{}", hex::encode(&calldata)),
            digest: format!("0x{}", hex::encode(digest)),
            signature: BASE64.encode(signature.to_bytes()),
        })
    }

    /// Sign and submit one settlement, returning the ledger's settlement reference.
    pub async fn submit(
        &self,
        ledger: &dyn LedgerClient,
        request: &SettlementRequest,
    ) -> AppResult<String> {
        let mut cached = self.nonce.lock().await;

        let nonce = match *cached {
            Some(nonce) => nonce,
            None => ledger.signer_nonce(&self.public_key).await?,
        };

        let signed = self.sign(ledger.contract_id(), nonce, request)?;
        debug!(nonce, policy_ref = request.policy_ref, amount = %request.amount, "Submitting signed settlement");

        match ledger.submit_settlement(&signed).await {
            Ok(settlement_ref) => {
                *cached = Some(nonce + 1);
                Ok(settlement_ref)
            }
            Err(e) => {
                // Ledger may or may not have consumed the nonce
                warn!(nonce, error = %e, "Settlement submission failed, dropping cached nonce");
                *cached = None;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedLedger;
    use ed25519_dalek::{Signature, Verifier};
    use rust_decimal_macros::dec;

    const SEED: &str = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";
    const HOLDER: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";

    fn request(policy_ref: i64) -> SettlementRequest {
        SettlementRequest {
            holder: HOLDER.to_string(),
            policy_ref,
            amount: dec!(100),
            detection_ref: "wick-1-20240101000000".to_string(),
        }
    }

    #[test]
    fn test_signature_verifies_against_digest() {
        let signer = SettlementSigner::from_hex_seed(SEED).unwrap();
        let signed = signer.sign("0xPool", 4, &request(1)).unwrap();

        assert_eq!(signed.contract, "0xpool");
        assert_eq!(signed.nonce, 4);

        let digest = hex::decode(signed.digest.trim_start_matches("0x")).unwrap();
        let sig_bytes: [u8; 64] = BASE64.decode(&signed.signature).unwrap().try_into().unwrap();
        signer
            .signing_key
            .verifying_key()
            .verify(&digest, &Signature::from_bytes(&sig_bytes))
            .unwrap();
    }

    #[test]
    fn test_rejects_bad_seed() {
        assert!(SettlementSigner::from_hex_seed("zz").is_err());
        assert!(SettlementSigner::from_hex_seed("abcd").is_err());
    }

    #[tokio::test]
    async fn test_nonce_advances_and_resets_on_failure() {
        let signer = SettlementSigner::from_hex_seed(SEED).unwrap();
        let ledger = ScriptedLedger::new(100);
        ledger.set_next_nonce(7);

        signer.submit(&ledger, &request(1)).await.unwrap();
        signer.submit(&ledger, &request(2)).await.unwrap();
        assert_eq!(ledger.submitted_nonces(), vec![7, 8]);

        ledger.fail_next_submission();
        assert!(signer.submit(&ledger, &request(3)).await.is_err());

        // Cache dropped: the ledger is asked again
        ledger.set_next_nonce(20);
        signer.submit(&ledger, &request(3)).await.unwrap();
        assert_eq!(ledger.submitted_nonces(), vec![7, 8, 20]);
    }
}
