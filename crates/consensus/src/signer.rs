//! Serialized access to the private validator.
//!
//! All signing goes through this gateway, on the driver task, after the
//! write-ahead log has been fsynced with the input justifying the
//! signature. Sign calls carry a deadline derived from the current step's
//! timeout; refusals abandon the vote or proposal for the round.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use tenderbft_core_types::{
    Address, BlockStore, PrivValidator, Proposal, PublicKey, Signature, SignerError, Vote,
};

use crate::error::ConsensusError;

/// Gateway wrapping the [`PrivValidator`], caching its public key.
pub struct SignerGateway {
    signer: Arc<dyn PrivValidator>,
    chain_id: String,
    pub_key: PublicKey,
}

impl SignerGateway {
    /// Create the gateway, fetching the signer's public key.
    pub async fn new(
        signer: Arc<dyn PrivValidator>,
        chain_id: String,
    ) -> Result<Self, SignerError> {
        let pub_key = signer.get_pub_key().await?;

        Ok(Self {
            signer,
            chain_id,
            pub_key,
        })
    }

    /// Our validator address.
    pub fn address(&self) -> Address {
        self.pub_key.address()
    }

    /// Our public key as last fetched.
    pub fn pub_key(&self) -> &PublicKey {
        &self.pub_key
    }

    /// Re-fetch the public key. Called after every commit, since keys may
    /// rotate between heights.
    pub async fn refresh_pub_key(&mut self) -> Result<(), SignerError> {
        self.pub_key = self.signer.get_pub_key().await?;
        Ok(())
    }

    /// Sign a vote, bounded by `deadline`. Returns the vote signature and
    /// the extension signature when the vote carries extension data.
    pub async fn sign_vote(
        &self,
        vote: &Vote,
        deadline: Duration,
    ) -> Result<(Signature, Option<Signature>), SignerError> {
        tokio::time::timeout(deadline, self.signer.sign_vote(&self.chain_id, vote))
            .await
            .map_err(|_| SignerError::Timeout)?
    }

    /// Sign a proposal, bounded by `deadline`.
    pub async fn sign_proposal(
        &self,
        proposal: &Proposal,
        deadline: Duration,
    ) -> Result<Signature, SignerError> {
        tokio::time::timeout(deadline, self.signer.sign_proposal(&self.chain_id, proposal))
            .await
            .map_err(|_| SignerError::Timeout)?
    }

    /// Startup double-sign check: walk back up to `check_height` blocks and
    /// refuse to start if any of their commits carries a signature from our
    /// current key. A hit means this key was validating recently, possibly
    /// on another node.
    pub fn double_sign_check(
        &self,
        block_store: &dyn BlockStore,
        check_height: u64,
    ) -> Result<(), ConsensusError> {
        if check_height == 0 {
            return Ok(());
        }

        let address = self.address();
        let tip = block_store.height();
        let base = block_store.base();

        let mut height = tip;
        for _ in 0..check_height {
            if height.as_u64() == 0 || height < base {
                break;
            }

            let commit = if height == tip {
                block_store.load_seen_commit()
            } else {
                block_store.load_block_commit(height)
            };

            if let Some(commit) = commit {
                let signed_by_us = commit
                    .signatures
                    .iter()
                    .any(|sig| sig.validator_address == address && sig.is_present());

                if signed_by_us {
                    return Err(ConsensusError::DoubleSignRisk { height, address });
                }
            } else {
                debug!(%height, "No commit found during double-sign check");
            }

            match height.decrement() {
                Some(h) => height = h,
                None => break,
            }
        }

        Ok(())
    }
}
