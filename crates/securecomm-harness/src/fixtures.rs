//! Ready-made session fixtures.

use securecomm_core::{Ratchet, RatchetConfig, Result, Role};
use securecomm_crypto::SymmetricKey;

use crate::SimEnv;

/// Root key used by fixtures, standing in for an out-of-band agreement.
pub const ROOT_KEY: [u8; 32] = [0x42; 32];

/// Session id used by [`ratchet_pair`].
pub const SESSION_ID: &[u8] = b"fixture-session";

/// Initiator and responder ratchets sharing [`ROOT_KEY`], drawing keys from
/// one environment seeded with `seed`.
pub fn ratchet_pair(
    seed: u64,
    config: RatchetConfig,
) -> Result<(Ratchet<SimEnv>, Ratchet<SimEnv>)> {
    let env = SimEnv::with_seed(seed);
    let root = SymmetricKey::from_bytes(ROOT_KEY);

    let mut initiator = Ratchet::new(env.clone(), config);
    let mut responder = Ratchet::new(env, config);
    initiator.initialize(&root, SESSION_ID, Role::Initiator)?;
    responder.initialize(&root, SESSION_ID, Role::Responder)?;
    Ok((initiator, responder))
}
