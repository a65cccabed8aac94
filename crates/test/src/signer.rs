//! A local signer with the double-sign guard real deployments get from
//! their remote signer or key management service.

use std::sync::Mutex;

use async_trait::async_trait;

use tenderbft_core_types::{
    Height, PrivValidator, PrivateKey, Proposal, PublicKey, Round, Signature, SignerError, Vote,
    VoteType,
};

// Sign steps, ordered: a proposal comes before prevotes, prevotes before
// precommits.
const STEP_PROPOSAL: u8 = 0;
const STEP_PREVOTE: u8 = 1;
const STEP_PRECOMMIT: u8 = 2;

#[derive(Clone)]
struct LastSignState {
    height: Height,
    round: Round,
    step: u8,
    sign_bytes: Vec<u8>,
    signature: Signature,
    extension_signature: Option<Signature>,
}

/// A [`PrivValidator`] holding its key in memory.
///
/// Tracks the last signed message and refuses to sign a conflicting one at
/// the same or an earlier (height, round, step). Re-signing the identical
/// message returns the cached signature, which is what makes WAL replay
/// safe.
pub struct LocalSigner {
    key: PrivateKey,
    last: Mutex<Option<LastSignState>>,
}

impl LocalSigner {
    /// Create a signer over the given key.
    pub fn new(key: PrivateKey) -> Self {
        Self {
            key,
            last: Mutex::new(None),
        }
    }

    /// The signer's public key.
    pub fn public_key(&self) -> PublicKey {
        self.key.public_key()
    }

    fn check_and_sign(
        &self,
        height: Height,
        round: Round,
        step: u8,
        sign_bytes: Vec<u8>,
        extension_sign_bytes: Option<Vec<u8>>,
    ) -> Result<(Signature, Option<Signature>), SignerError> {
        let mut last = self.last.lock().unwrap();

        if let Some(state) = last.as_ref() {
            let previous = (state.height, state.round, state.step);
            let current = (height, round, step);

            if current < previous {
                return Err(SignerError::Refused(format!(
                    "sign request for {height}/{round}/{step} regresses behind {}/{}/{}",
                    state.height, state.round, state.step
                )));
            }

            if current == previous {
                if state.sign_bytes == sign_bytes {
                    return Ok((state.signature, state.extension_signature));
                }

                return Err(SignerError::Refused(format!(
                    "conflicting sign request at {height}/{round}/{step}"
                )));
            }
        }

        let signature = self.key.sign(&sign_bytes);
        let extension_signature = extension_sign_bytes.map(|bytes| self.key.sign(&bytes));

        *last = Some(LastSignState {
            height,
            round,
            step,
            sign_bytes,
            signature,
            extension_signature,
        });

        Ok((signature, extension_signature))
    }
}

#[async_trait]
impl PrivValidator for LocalSigner {
    async fn get_pub_key(&self) -> Result<PublicKey, SignerError> {
        Ok(self.key.public_key())
    }

    async fn sign_vote(
        &self,
        chain_id: &str,
        vote: &Vote,
    ) -> Result<(Signature, Option<Signature>), SignerError> {
        let step = match vote.vote_type {
            VoteType::Prevote => STEP_PREVOTE,
            VoteType::Precommit => STEP_PRECOMMIT,
        };

        let extension_sign_bytes =
            (!vote.extension.is_empty()).then(|| vote.extension_sign_bytes(chain_id));

        self.check_and_sign(
            vote.height,
            vote.round,
            step,
            vote.sign_bytes(chain_id),
            extension_sign_bytes,
        )
    }

    async fn sign_proposal(
        &self,
        chain_id: &str,
        proposal: &Proposal,
    ) -> Result<Signature, SignerError> {
        let (signature, _) = self.check_and_sign(
            proposal.height,
            proposal.round,
            STEP_PROPOSAL,
            proposal.sign_bytes(chain_id),
            None,
        )?;

        Ok(signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenderbft_core_types::BlockId;

    fn prevote(round: u32, block_id: BlockId) -> Vote {
        let key = PrivateKey::from([9; 32]);
        Vote::new_prevote(
            Height::new(1),
            Round::new(round),
            block_id,
            key.public_key().address(),
            0,
        )
    }

    #[tokio::test]
    async fn identical_resign_returns_cached_signature() {
        let signer = LocalSigner::new(PrivateKey::from([9; 32]));
        let vote = prevote(0, BlockId::nil());

        let (first, _) = signer.sign_vote("chain", &vote).await.unwrap();
        let (second, _) = signer.sign_vote("chain", &vote).await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn conflicting_sign_request_is_refused() {
        let signer = LocalSigner::new(PrivateKey::from([9; 32]));

        let nil = prevote(0, BlockId::nil());
        signer.sign_vote("chain", &nil).await.unwrap();

        let other = prevote(
            0,
            BlockId::new(
                tenderbft_core_types::Hash::digest([1]),
                tenderbft_core_types::PartSetHeader::new(1, tenderbft_core_types::Hash::digest([1])),
            ),
        );

        assert!(matches!(
            signer.sign_vote("chain", &other).await,
            Err(SignerError::Refused(_))
        ));
    }

    #[tokio::test]
    async fn later_rounds_sign_fresh() {
        let signer = LocalSigner::new(PrivateKey::from([9; 32]));

        signer.sign_vote("chain", &prevote(0, BlockId::nil())).await.unwrap();
        signer.sign_vote("chain", &prevote(1, BlockId::nil())).await.unwrap();

        // Going back is refused.
        assert!(matches!(
            signer.sign_vote("chain", &prevote(0, BlockId::nil())).await,
            Err(SignerError::Refused(_))
        ));
    }
}
