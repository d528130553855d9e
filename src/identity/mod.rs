// Identity module - WHO IS TALKING
// Ed25519 keys identify nodes; signatures bind envelopes and channel records to them

mod keypair;
mod signer;

pub use keypair::{Keypair, KeypairError, PublicKey};
pub use signer::{Signature, SignatureError, SigningDomain};
