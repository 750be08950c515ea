use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use peerlog_transport::PublicKey;

use crate::ProtocolError;

/// Gate for inbound connection requests.
///
/// Called once per authenticated inbound signal, with the verified sender.
/// `Ok(false)` and `Err(_)` both drop the signal.
#[async_trait]
pub trait ConnectPolicy: Send + Sync + 'static {
    async fn should_connect(&self, peer: &PublicKey) -> Result<bool, ProtocolError>;
}

/// Accept every authenticated peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl ConnectPolicy for AcceptAll {
    async fn should_connect(&self, _peer: &PublicKey) -> Result<bool, ProtocolError> {
        Ok(true)
    }
}

/// Accept only keys on a mutable allow list.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    keys: Arc<RwLock<HashSet<PublicKey>>>,
}

impl AllowList {
    pub fn new(keys: impl IntoIterator<Item = PublicKey>) -> Self {
        Self {
            keys: Arc::new(RwLock::new(keys.into_iter().collect())),
        }
    }

    pub fn allow(&self, key: PublicKey) {
        if let Ok(mut keys) = self.keys.write() {
            keys.insert(key);
        }
    }

    pub fn revoke(&self, key: &PublicKey) {
        if let Ok(mut keys) = self.keys.write() {
            keys.remove(key);
        }
    }
}

#[async_trait]
impl ConnectPolicy for AllowList {
    async fn should_connect(&self, peer: &PublicKey) -> Result<bool, ProtocolError> {
        self.keys
            .read()
            .map(|keys| keys.contains(peer))
            .map_err(|_| ProtocolError::Policy("allow list poisoned".into()))
    }
}

/// Policy backed by a plain predicate.
pub struct PolicyFn<F>(F);

/// Wrap a synchronous predicate as a [`ConnectPolicy`].
pub fn policy_fn<F>(f: F) -> PolicyFn<F>
where
    F: Fn(&PublicKey) -> bool + Send + Sync + 'static,
{
    PolicyFn(f)
}

#[async_trait]
impl<F> ConnectPolicy for PolicyFn<F>
where
    F: Fn(&PublicKey) -> bool + Send + Sync + 'static,
{
    async fn should_connect(&self, peer: &PublicKey) -> Result<bool, ProtocolError> {
        Ok((self.0)(peer))
    }
}

/// Evaluate `policy`, folding an error into a denial.
pub(crate) async fn admits(policy: &dyn ConnectPolicy, peer: &PublicKey) -> bool {
    match policy.should_connect(peer).await {
        Ok(allowed) => allowed,
        Err(e) => {
            tracing::warn!(peer = ?peer, "connect policy failed, denying: {e}");
            false
        }
    }
}
