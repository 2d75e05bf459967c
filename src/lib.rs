//! Federated Threshold Signing Engine
//!
//! Lets a federation of guardians jointly control one secp256k1 key and
//! authorize actions by threshold consensus. Two strategies produce the
//! final BIP-340 signature:
//!
//! - **FROST**: two guardian rounds (nonce commitment, partial signature);
//!   the private key is never reconstructed.
//! - **SSS**: guardians hand over Shamir shares; the key is interpolated in
//!   memory for one signature and wiped.
//!
//! The [`service::UnifiedSigningService`] picks the strategy per use case
//! and hands the signed result to the event publisher.
//!
//! # Usage
//!
//! ## Generate a development federation
//! ```bash
//! federation-signer generate-test-federation --threshold 3 --total 5
//! ```
//!
//! ## Start the signer
//! ```bash
//! FEDSIGN_FEDERATION_ID=family federation-signer run
//! ```

pub mod clock;
pub mod config;
pub mod crypto;
pub mod dealer;
pub mod error;
pub mod frost;
pub mod guardian;
mod lifecycle;
pub mod logging;
pub mod publisher;
pub mod registry;
pub mod server;
pub mod service;
pub mod shamir;
pub mod shares;
pub mod sss;
pub mod storage;
pub mod types;

pub use config::SignerConfig;
pub use error::{Result, SigningError};
pub use frost::FrostSessionManager;
pub use guardian::GuardianSigner;
pub use server::{create_router, AppState};
pub use service::{recommend_method, select_method, UnifiedSigningService};
pub use sss::{ReconstructedKey, SssReconstructionManager};
pub use types::*;
